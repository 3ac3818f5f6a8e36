use crate::{
  internal::*,
  scalar::Real,
  parameter::Parameter,
  gradient::{ Gradient, RGradient, RVector },
  state::{ State, StateGrad, RState, RStateGrad },
  block::{ Block, BlockOutput, BlockROutput, Upstream, Downstream, RUpstream, RDownstream, check_lanes },
};


/// Runs several [Block]s side by side on the same input.
///
/// Outputs get concatenated per lane in block order, while the state
/// is a composite holding one sub-state per block.

pub struct ParallelBlock<T: Real> {
  blocks: Vec<Box<dyn Block<T>>>,
}

impl<T: Real> ParallelBlock<T> {
  pub fn new(blocks: Vec<Box<dyn Block<T>>>) -> Self {
    assert!(!blocks.is_empty(), "Cannot use an empty ParallelBlock");
    Self { blocks }
  }

  pub fn blocks(&self) -> &[Box<dyn Block<T>>] {
    &self.blocks
  }

  fn sub_states<S: Clone>(&self, lanes: Vec<Vec<S>>) -> Vec<Vec<S>> {
    let mut per_block: Vec<Vec<S>> = vec![Vec::with_capacity(lanes.len()); self.blocks.len()];
    for parts in lanes {
      assert_eq!(parts.len(), self.blocks.len(), "ParallelBlock state must have one part per block");
      for (block, part) in per_block.iter_mut().zip(parts) {
        block.push(part);
      }
    }
    per_block
  }
}


// Split each lane's upstream gradient into the segments produced by each block
fn split_outputs<T: Real>(upstream: Vec<Vec<T>>, widths: &[Vec<usize>]) -> Vec<Vec<Vec<T>>> {
  let mut per_block = vec![Vec::with_capacity(upstream.len()); widths.len()];
  for (lane, grad) in upstream.into_iter().enumerate() {
    let total: usize = widths.iter().map(|w| w[lane] ).sum();
    assert_eq!(grad.len(), total, "Upstream gradient does not match concatenated output");
    let mut offset = 0;
    for (block, w) in per_block.iter_mut().zip(widths) {
      block.push(grad[offset..offset + w[lane]].to_vec());
      offset += w[lane];
    }
  }
  per_block
}

fn sum_inputs<T: Real>(per_block: Vec<Vec<Vec<T>>>) -> Vec<Vec<T>> {
  let mut blocks = per_block.into_iter();
  let mut sum = blocks.next().unwrap_or_default();
  for grads in blocks {
    for (total, grad) in sum.iter_mut().zip(&grads) {
      add_into(total, grad);
    }
  }
  sum
}

fn widths<'s, T: Real + 's>(outputs: impl Iterator<Item = &'s [Vec<T>]>) -> Vec<Vec<usize>> {
  outputs.map(|rows| rows.iter().map(|row| row.len() ).collect() ).collect()
}


impl<T: Real> Block<T> for ParallelBlock<T> {
  fn state_size(&self) -> usize {
    self.blocks.iter().map(|block| block.state_size() ).sum()
  }

  fn start_state(&self) -> State<T> {
    State::Composite(self.blocks.iter().map(|block| block.start_state() ).collect())
  }

  fn start_rstate(&self, rv: &RVector<T>) -> RState<T> {
    RState::Composite(self.blocks.iter().map(|block| block.start_rstate(rv) ).collect())
  }

  fn propagate_start(&self, upstream: &[StateGrad<T>], g: &mut Gradient<T>) {
    let lanes = upstream.iter().map(|grad| grad.parts().to_vec() ).collect();
    for (block, grads) in self.blocks.iter().zip(self.sub_states(lanes)) {
      block.propagate_start(&grads, g);
    }
  }

  fn propagate_start_r(&self, upstream: &[RStateGrad<T>], rg: &mut RGradient<T>, g: &mut Gradient<T>) {
    let lanes = upstream.iter().map(|grad| grad.parts().to_vec() ).collect();
    for (block, grads) in self.blocks.iter().zip(self.sub_states(lanes)) {
      block.propagate_start_r(&grads, rg, g);
    }
  }

  fn batch<'a>(&'a self, states: &[State<T>], inputs: &[Vec<T>]) -> Box<dyn BlockOutput<T> + 'a> {
    check_lanes(states.len(), inputs.len());
    let lanes = states.iter().map(|state| state.parts().to_vec() ).collect();
    let results: Vec<_> = self.blocks.iter().zip(self.sub_states(lanes))
      .map(|(block, states)| block.batch(&states, inputs) )
      .collect();
    let outputs = (0..inputs.len())
      .map(|lane| results.iter().flat_map(|result| result.outputs()[lane].iter().copied() ).collect() )
      .collect();
    let states = (0..inputs.len())
      .map(|lane| State::Composite(results.iter().map(|result| result.states()[lane].clone() ).collect()) )
      .collect();
    Box::new(ParallelOutput { results, outputs, states })
  }

  fn batch_r<'a>(&'a self, rv: &RVector<T>, states: &[RState<T>], inputs: &[Vec<T>], rinputs: &[Vec<T>]) -> Box<dyn BlockROutput<T> + 'a> {
    check_lanes(states.len(), inputs.len());
    let lanes = states.iter().map(|state| state.parts().to_vec() ).collect();
    let results: Vec<_> = self.blocks.iter().zip(self.sub_states(lanes))
      .map(|(block, states)| block.batch_r(rv, &states, inputs, rinputs) )
      .collect();
    let outputs = (0..inputs.len())
      .map(|lane| results.iter().flat_map(|result| result.outputs()[lane].iter().copied() ).collect() )
      .collect();
    let routputs = (0..inputs.len())
      .map(|lane| results.iter().flat_map(|result| result.routputs()[lane].iter().copied() ).collect() )
      .collect();
    let states = (0..inputs.len())
      .map(|lane| RState::Composite(results.iter().map(|result| result.states()[lane].clone() ).collect()) )
      .collect();
    Box::new(ParallelROutput { results, outputs, routputs, states })
  }

  fn parameters(&self) -> Vec<&Parameter<T>> {
    self.blocks.iter().flat_map(|block| block.parameters() ).collect()
  }

  fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
    self.blocks.iter_mut().flat_map(|block| block.parameters_mut() ).collect()
  }
}


struct ParallelOutput<'a, T: Real> {
  results: Vec<Box<dyn BlockOutput<T> + 'a>>,
  outputs: Vec<Vec<T>>,
  states: Vec<State<T>>,
}

impl<'a, T: Real> BlockOutput<T> for ParallelOutput<'a, T> {
  fn outputs(&self) -> &[Vec<T>] {
    &self.outputs
  }

  fn states(&self) -> &[State<T>] {
    &self.states
  }

  fn propagate_gradient(&self, upstream: Upstream<T>, g: &mut Gradient<T>) -> Downstream<T> {
    let n = self.results.len();
    let widths = widths(self.results.iter().map(|result| result.outputs() ));
    let mut outputs: Vec<Option<Vec<Vec<T>>>> = match upstream.outputs {
      Some(grads) => split_outputs(grads, &widths).into_iter().map(Some).collect(),
      None => vec![None; n],
    };
    let mut states: Vec<Option<Vec<StateGrad<T>>>> = match upstream.states {
      Some(grads) => {
        let lanes = grads.into_iter().map(State::into_parts).collect::<Vec<_>>();
        let mut per_block: Vec<Vec<StateGrad<T>>> = vec![vec![]; n];
        for parts in lanes {
          for (block, part) in per_block.iter_mut().zip(parts) {
            block.push(part);
          }
        }
        per_block.into_iter().map(Some).collect()
      },
      None => vec![None; n],
    };

    let (inputs, state_grads): (Vec<_>, Vec<_>) = self.results.iter().enumerate().map(|(i, result)| {
      let down = result.propagate_gradient(Upstream { outputs: outputs[i].take(), states: states[i].take() }, g);
      (down.inputs, down.states)
    }).unzip();

    Downstream {
      inputs: sum_inputs(inputs),
      states: (0..self.states.len())
        .map(|lane| State::Composite(state_grads.iter().map(|grads| grads[lane].clone() ).collect()) )
        .collect(),
    }
  }
}


struct ParallelROutput<'a, T: Real> {
  results: Vec<Box<dyn BlockROutput<T> + 'a>>,
  outputs: Vec<Vec<T>>,
  routputs: Vec<Vec<T>>,
  states: Vec<RState<T>>,
}

impl<'a, T: Real> BlockROutput<T> for ParallelROutput<'a, T> {
  fn outputs(&self) -> &[Vec<T>] {
    &self.outputs
  }

  fn routputs(&self) -> &[Vec<T>] {
    &self.routputs
  }

  fn states(&self) -> &[RState<T>] {
    &self.states
  }

  fn propagate_gradient(&self, upstream: RUpstream<T>, rg: &mut RGradient<T>, g: &mut Gradient<T>) -> RDownstream<T> {
    let n = self.results.len();
    let widths = widths(self.results.iter().map(|result| result.outputs() ));
    let mut outputs: Vec<Option<Vec<Vec<T>>>> = match upstream.outputs {
      Some(grads) => split_outputs(grads, &widths).into_iter().map(Some).collect(),
      None => vec![None; n],
    };
    let mut routputs: Vec<Option<Vec<Vec<T>>>> = match upstream.routputs {
      Some(grads) => split_outputs(grads, &widths).into_iter().map(Some).collect(),
      None => vec![None; n],
    };
    let mut states: Vec<Option<Vec<RStateGrad<T>>>> = match upstream.states {
      Some(grads) => {
        let mut per_block: Vec<Vec<RStateGrad<T>>> = vec![vec![]; n];
        for parts in grads.into_iter().map(RState::into_parts) {
          for (block, part) in per_block.iter_mut().zip(parts) {
            block.push(part);
          }
        }
        per_block.into_iter().map(Some).collect()
      },
      None => vec![None; n],
    };

    let mut inputs = Vec::with_capacity(n);
    let mut rinputs = Vec::with_capacity(n);
    let mut state_grads = Vec::with_capacity(n);
    for (i, result) in self.results.iter().enumerate() {
      let down = result.propagate_gradient(RUpstream {
        outputs: outputs[i].take(),
        routputs: routputs[i].take(),
        states: states[i].take(),
      }, rg, g);
      inputs.push(down.inputs);
      rinputs.push(down.rinputs);
      state_grads.push(down.states);
    }

    RDownstream {
      inputs: sum_inputs(inputs),
      rinputs: sum_inputs(rinputs),
      states: (0..self.states.len())
        .map(|lane| RState::Composite(state_grads.iter().map(|grads: &Vec<RStateGrad<T>>| grads[lane].clone() ).collect()) )
        .collect(),
    }
  }
}
