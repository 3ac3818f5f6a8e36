use crate::{
  scalar::Real,
  parameter::Parameter,
  gradient::{ Gradient, RGradient, RVector },
  state::{ State, StateGrad, RState, RStateGrad },
  block::{ Block, BlockOutput, BlockROutput, Upstream, Downstream, RUpstream, RDownstream, check_lanes },
};


/// Depth-wise composition of [Block]s.
///
/// Every block after the first receives the previous block's output as
/// input. The overall output is the last block's output, while the
/// carried state is the concatenation of all (flattened) sub-states.

pub struct StackedBlock<T: Real> {
  blocks: Vec<Box<dyn Block<T>>>,
}

impl<T: Real> StackedBlock<T> {
  pub fn new(blocks: Vec<Box<dyn Block<T>>>) -> Self {
    assert!(!blocks.is_empty(), "Cannot use an empty StackedBlock");
    Self { blocks }
  }

  pub fn blocks(&self) -> &[Box<dyn Block<T>>] {
    &self.blocks
  }

  fn templates(&self) -> Vec<State<T>> {
    self.blocks.iter().map(|block| block.start_state() ).collect()
  }
}


// Split a concatenated state into sub-states shaped like `templates`
fn split<T: Real>(flat: &[T], templates: &[State<T>]) -> Vec<State<T>> {
  let total: usize = templates.iter().map(|template| template.size() ).sum();
  assert_eq!(flat.len(), total, "Stacked state has {} components but sub-blocks expect {total}", flat.len());
  let mut offset = 0;
  templates.iter().map(|template| {
    let size = template.size();
    let state = State::unflatten(template, &flat[offset..offset + size]);
    offset += size;
    state
  }).collect()
}

fn split_r<T: Real>(state: &RState<T>, templates: &[State<T>]) -> Vec<RState<T>> {
  let (value, rvalue) = state.vector();
  split(value, templates).iter()
    .zip(split(rvalue, templates).iter())
    .map(|(value, rvalue)| RState::from_parts(value, rvalue) )
    .collect()
}

fn concat<'s, T: Real + 's>(parts: impl Iterator<Item = &'s State<T>>) -> State<T> {
  State::Vector(parts.flat_map(|part| part.flatten() ).collect())
}

fn concat_r<'s, T: Real + 's>(parts: impl Iterator<Item = &'s RState<T>>) -> RState<T> {
  let (value, rvalue): (Vec<Vec<T>>, Vec<Vec<T>>) = parts
    .map(|part| (part.value().flatten(), part.rvalue().flatten()) )
    .unzip();
  RState::Vector { value: value.concat(), rvalue: rvalue.concat() }
}

// Regroup per-lane lists of sub-states into per-block lists of lanes
fn transpose<S>(lanes: Vec<Vec<S>>, num_blocks: usize) -> Vec<Vec<S>> {
  let mut per_block: Vec<Vec<S>> = (0..num_blocks).map(|_| Vec::with_capacity(lanes.len()) ).collect();
  for lane in lanes {
    for (block, state) in per_block.iter_mut().zip(lane) {
      block.push(state);
    }
  }
  per_block
}


impl<T: Real> Block<T> for StackedBlock<T> {
  fn state_size(&self) -> usize {
    self.blocks.iter().map(|block| block.state_size() ).sum()
  }

  fn start_state(&self) -> State<T> {
    concat(self.templates().iter())
  }

  fn start_rstate(&self, rv: &RVector<T>) -> RState<T> {
    let starts: Vec<RState<T>> = self.blocks.iter().map(|block| block.start_rstate(rv) ).collect();
    concat_r(starts.iter())
  }

  fn propagate_start(&self, upstream: &[StateGrad<T>], g: &mut Gradient<T>) {
    let templates = self.templates();
    let lanes = upstream.iter().map(|grad| split(grad.vector(), &templates) ).collect();
    for (block, grads) in self.blocks.iter().zip(transpose(lanes, self.blocks.len())) {
      block.propagate_start(&grads, g);
    }
  }

  fn propagate_start_r(&self, upstream: &[RStateGrad<T>], rg: &mut RGradient<T>, g: &mut Gradient<T>) {
    let templates = self.templates();
    let lanes = upstream.iter().map(|grad| split_r(grad, &templates) ).collect();
    for (block, grads) in self.blocks.iter().zip(transpose(lanes, self.blocks.len())) {
      block.propagate_start_r(&grads, rg, g);
    }
  }

  fn batch<'a>(&'a self, states: &[State<T>], inputs: &[Vec<T>]) -> Box<dyn BlockOutput<T> + 'a> {
    check_lanes(states.len(), inputs.len());
    let templates = self.templates();
    let lanes = states.iter().map(|state| split(state.vector(), &templates) ).collect();
    let sub_states = transpose(lanes, self.blocks.len());

    let mut results: Vec<Box<dyn BlockOutput<T> + 'a>> = Vec::with_capacity(self.blocks.len());
    for (block, states) in self.blocks.iter().zip(&sub_states) {
      let result = match results.last() {
        Some(previous) => block.batch(states, previous.outputs()),
        None => block.batch(states, inputs),
      };
      results.push(result);
    }

    let states = (0..inputs.len())
      .map(|lane| concat(results.iter().map(|result| &result.states()[lane] )) )
      .collect();
    Box::new(StackedOutput { templates, results, states })
  }

  fn batch_r<'a>(&'a self, rv: &RVector<T>, states: &[RState<T>], inputs: &[Vec<T>], rinputs: &[Vec<T>]) -> Box<dyn BlockROutput<T> + 'a> {
    check_lanes(states.len(), inputs.len());
    let templates = self.templates();
    let lanes = states.iter().map(|state| split_r(state, &templates) ).collect();
    let sub_states = transpose(lanes, self.blocks.len());

    let mut results: Vec<Box<dyn BlockROutput<T> + 'a>> = Vec::with_capacity(self.blocks.len());
    for (block, states) in self.blocks.iter().zip(&sub_states) {
      let result = match results.last() {
        Some(previous) => block.batch_r(rv, states, previous.outputs(), previous.routputs()),
        None => block.batch_r(rv, states, inputs, rinputs),
      };
      results.push(result);
    }

    let states = (0..inputs.len())
      .map(|lane| concat_r(results.iter().map(|result| &result.states()[lane] )) )
      .collect();
    Box::new(StackedROutput { templates, results, states })
  }

  fn parameters(&self) -> Vec<&Parameter<T>> {
    self.blocks.iter().flat_map(|block| block.parameters() ).collect()
  }

  fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
    self.blocks.iter_mut().flat_map(|block| block.parameters_mut() ).collect()
  }
}


struct StackedOutput<'a, T: Real> {
  templates: Vec<State<T>>,
  results: Vec<Box<dyn BlockOutput<T> + 'a>>,
  states: Vec<State<T>>,
}

impl<'a, T: Real> BlockOutput<T> for StackedOutput<'a, T> {
  fn outputs(&self) -> &[Vec<T>] {
    self.results.last().map_or(&[][..], |result| result.outputs() )
  }

  fn states(&self) -> &[State<T>] {
    &self.states
  }

  fn propagate_gradient(&self, upstream: Upstream<T>, g: &mut Gradient<T>) -> Downstream<T> {
    let num_blocks = self.results.len();
    let mut state_upstream: Vec<Option<Vec<StateGrad<T>>>> = match upstream.states {
      Some(states) => {
        let lanes = states.iter().map(|grad| split(grad.vector(), &self.templates) ).collect();
        transpose(lanes, num_blocks).into_iter().map(Some).collect()
      },
      None => vec![None; num_blocks],
    };

    let mut output_upstream = upstream.outputs;
    let mut state_grads = Vec::with_capacity(num_blocks);
    for (result, states) in self.results.iter().zip(state_upstream.iter_mut()).rev() {
      let down = result.propagate_gradient(Upstream { outputs: output_upstream, states: states.take() }, g);
      output_upstream = Some(down.inputs);
      state_grads.push(down.states);
    }
    state_grads.reverse();

    let lanes = self.states.len();
    Downstream {
      inputs: output_upstream.unwrap_or_default(),
      states: (0..lanes)
        .map(|lane| concat(state_grads.iter().map(|grads| &grads[lane] )) )
        .collect(),
    }
  }
}


struct StackedROutput<'a, T: Real> {
  templates: Vec<State<T>>,
  results: Vec<Box<dyn BlockROutput<T> + 'a>>,
  states: Vec<RState<T>>,
}

impl<'a, T: Real> BlockROutput<T> for StackedROutput<'a, T> {
  fn outputs(&self) -> &[Vec<T>] {
    self.results.last().map_or(&[][..], |result| result.outputs() )
  }

  fn routputs(&self) -> &[Vec<T>] {
    self.results.last().map_or(&[][..], |result| result.routputs() )
  }

  fn states(&self) -> &[RState<T>] {
    &self.states
  }

  fn propagate_gradient(&self, upstream: RUpstream<T>, rg: &mut RGradient<T>, g: &mut Gradient<T>) -> RDownstream<T> {
    let num_blocks = self.results.len();
    let mut state_upstream: Vec<Option<Vec<RStateGrad<T>>>> = match upstream.states {
      Some(states) => {
        let lanes = states.iter().map(|grad| split_r(grad, &self.templates) ).collect();
        transpose(lanes, num_blocks).into_iter().map(Some).collect()
      },
      None => vec![None; num_blocks],
    };

    let mut output_upstream = upstream.outputs;
    let mut routput_upstream = upstream.routputs;
    let mut state_grads = Vec::with_capacity(num_blocks);
    for (result, states) in self.results.iter().zip(state_upstream.iter_mut()).rev() {
      let down = result.propagate_gradient(RUpstream {
        outputs: output_upstream,
        routputs: routput_upstream,
        states: states.take(),
      }, rg, g);
      output_upstream = Some(down.inputs);
      routput_upstream = Some(down.rinputs);
      state_grads.push(down.states);
    }
    state_grads.reverse();

    let lanes = self.states.len();
    RDownstream {
      inputs: output_upstream.unwrap_or_default(),
      rinputs: routput_upstream.unwrap_or_default(),
      states: (0..lanes)
        .map(|lane| concat_r(state_grads.iter().map(|grads| &grads[lane] )) )
        .collect(),
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::block::{ lstm, square };

  #[test]
  #[should_panic(expected = "empty StackedBlock")]
  fn empty_stack() {
    StackedBlock::<f64>::new(vec![]);
  }

  #[test]
  fn composes_lanes() {
    let first = lstm::<f64>(2, 3);
    let second = square::<f64>(2);
    let inputs = vec![vec![0.5, -1.0], vec![2.0, 0.1]];
    let first_states = vec![first.start_state(), first.start_state()];
    let second_states = vec![State::Vector(vec![1.0, 2.0]), State::Vector(vec![-1.0, 0.5])];
    let (expected_outputs, expected_states) = {
      let a = first.batch(&first_states, &inputs);
      let b = second.batch(&second_states, a.outputs());
      let states: Vec<Vec<f64>> = (0..2)
        .map(|lane| [a.states()[lane].flatten(), b.states()[lane].flatten()].concat() )
        .collect();
      (b.outputs().to_vec(), states)
    };

    let stack = StackedBlock::new(vec![Box::new(first), Box::new(second)]);
    assert_eq!(stack.state_size(), 6 + 2);
    let states: Vec<State<f64>> = (0..2)
      .map(|lane| State::Vector([first_states[lane].flatten(), second_states[lane].flatten()].concat()) )
      .collect();
    let out = stack.batch(&states, &inputs);
    assert_eq!(out.outputs(), &expected_outputs[..]);
    for lane in 0..2 {
      assert_eq!(out.states()[lane].flatten(), expected_states[lane]);
    }
  }

  #[test]
  #[should_panic(expected = "sub-blocks expect")]
  fn mismatched_state() {
    let stack = StackedBlock::<f64>::new(vec![Box::new(square(2)), Box::new(square(1))]);
    stack.batch(&[State::Vector(vec![0.0; 2])], &[vec![1.0]]);
  }
}
