use crate::{
  internal::*,
  scalar::Real,
  parameter::Parameter,
  gradient::{ Gradient, RGradient, RVector },
  state::{ State, StateGrad, RState, RStateGrad },
  variable::{ Variable, Context },
  layer::Batcher,
  block::{ Block, BlockOutput, BlockROutput, Upstream, Downstream, RUpstream, RDownstream, check_lanes, zero_rows },
};


/// Leaf [Block] built from a [Batcher].
///
/// Each lane's input and state get packed into one row `[input, state]`,
/// which the batcher maps to `[output, state']`. The trailing
/// `state_size` components of every result row form the new state.

pub struct BatcherBlock<T: Real> {
  batcher: Box<dyn Batcher<T>>,
  state_size: usize,
  start: Option<Parameter<T>>,
}

impl<T: Real> BatcherBlock<T> {
  pub fn new(batcher: Box<dyn Batcher<T>>, state_size: usize) -> Self {
    Self { batcher, state_size, start: None }
  }

  /// Learn the start state, initialized to zero.

  pub fn with_trainable_start(self) -> Self {
    let start = Parameter::zeros(self.state_size);
    self.with_start(start)
  }

  pub fn with_start(mut self, start: Parameter<T>) -> Self {
    assert_eq!(start.len(), self.state_size, "Start state must have {} components", self.state_size);
    self.start = Some(start);
    self
  }

  pub fn batcher(&self) -> &dyn Batcher<T> {
    self.batcher.as_ref()
  }

  fn pack(inputs: &[Vec<T>], states: &[Vec<T>]) -> Vec<T> {
    let rows: Vec<Vec<T>> = inputs.iter().zip(states)
      .map(|(input, state)| [&input[..], &state[..]].concat() )
      .collect();
    join_rows(&rows)
  }

  fn unpack(&self, data: &[T], n: usize) -> (Vec<Vec<T>>, Vec<Vec<T>>) {
    split_rows(data, n).into_iter().map(|mut row| {
      assert!(row.len() >= self.state_size, "Batcher produced rows narrower than the state");
      let state = row.split_off(row.len() - self.state_size);
      (row, state)
    }).unzip()
  }
}

impl<T: Real> Block<T> for BatcherBlock<T> {
  fn state_size(&self) -> usize {
    self.state_size
  }

  fn start_state(&self) -> State<T> {
    State::Vector(match &self.start {
      Some(start) => start.data.clone(),
      None => vec![T::zero(); self.state_size],
    })
  }

  fn start_rstate(&self, rv: &RVector<T>) -> RState<T> {
    let value = self.start_state().into_vector();
    let rvalue = self.start.as_ref()
      .and_then(|start| rv.get(start.id()).cloned() )
      .unwrap_or_else(|| vec![T::zero(); self.state_size] );
    RState::Vector { value, rvalue }
  }

  fn propagate_start(&self, upstream: &[StateGrad<T>], g: &mut Gradient<T>) {
    if let Some(start) = &self.start {
      for grad in upstream {
        g.accumulate(start.id(), grad.vector());
      }
    }
  }

  fn propagate_start_r(&self, upstream: &[RStateGrad<T>], rg: &mut RGradient<T>, g: &mut Gradient<T>) {
    if let Some(start) = &self.start {
      for grad in upstream {
        let (value, rvalue) = grad.vector();
        g.accumulate(start.id(), value);
        rg.accumulate(start.id(), rvalue);
      }
    }
  }

  fn batch<'a>(&'a self, states: &[State<T>], inputs: &[Vec<T>]) -> Box<dyn BlockOutput<T> + 'a> {
    check_lanes(states.len(), inputs.len());
    let n = inputs.len();
    let states: Vec<Vec<T>> = states.iter().map(|state| state.vector().to_vec() ).collect();
    let ctx = Context::new();
    let input = ctx.input(Self::pack(inputs, &states), None);
    let output = self.batcher.batch(&ctx, &input, n);
    let (outputs, new_states) = self.unpack(output.value(), n);
    Box::new(BatcherOutput {
      input_width: inputs.first().map_or(0, |input| input.len() ),
      state_size: self.state_size,
      input,
      output,
      outputs,
      states: new_states.into_iter().map(State::Vector).collect(),
    })
  }

  fn batch_r<'a>(&'a self, rv: &RVector<T>, states: &[RState<T>], inputs: &[Vec<T>], rinputs: &[Vec<T>]) -> Box<dyn BlockROutput<T> + 'a> {
    check_lanes(states.len(), inputs.len());
    check_lanes(states.len(), rinputs.len());
    let n = inputs.len();
    let (values, rvalues): (Vec<Vec<T>>, Vec<Vec<T>>) = states.iter()
      .map(|state| {
        let (value, rvalue) = state.vector();
        (value.to_vec(), rvalue.to_vec())
      })
      .unzip();
    let ctx = Context::with_rvector(rv);
    let input = ctx.input(Self::pack(inputs, &values), Some(Self::pack(rinputs, &rvalues)));
    let output = self.batcher.batch(&ctx, &input, n);
    let routput = output.rvalue().map(|r| r.to_vec() ).unwrap_or_else(|| vec![T::zero(); output.len()] );
    let (outputs, new_states) = self.unpack(output.value(), n);
    let (routputs, new_rstates) = self.unpack(&routput, n);
    Box::new(BatcherROutput {
      input_width: inputs.first().map_or(0, |input| input.len() ),
      state_size: self.state_size,
      input,
      output,
      outputs,
      routputs,
      states: new_states.into_iter().zip(new_rstates)
        .map(|(value, rvalue)| RState::Vector { value, rvalue } )
        .collect(),
    })
  }

  fn parameters(&self) -> Vec<&Parameter<T>> {
    let mut params = self.batcher.parameters();
    params.extend(self.start.as_ref());
    params
  }

  fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
    let mut params = self.batcher.parameters_mut();
    params.extend(self.start.as_mut());
    params
  }
}


// Upstream gradient rows `[output, state]`, with zeros where nothing arrived
fn pack_upstream<T: Real>(
  outputs: &[Vec<T>],
  upstream: Option<Vec<Vec<T>>>,
  states: Option<Vec<Vec<T>>>,
  state_size: usize,
) -> Vec<T> {
  let n = outputs.len();
  let upstream = upstream.unwrap_or_else(|| zero_rows(outputs) );
  let states = states.unwrap_or_else(|| vec![vec![T::zero(); state_size]; n] );
  check_lanes(n, upstream.len());
  check_lanes(n, states.len());
  let rows: Vec<Vec<T>> = upstream.into_iter().zip(states)
    .map(|(output, state)| [output, state].concat() )
    .collect();
  join_rows(&rows)
}

fn unpack_downstream<T: Real>(grad: &[T], n: usize, input_width: usize) -> (Vec<Vec<T>>, Vec<Vec<T>>) {
  split_rows(grad, n).into_iter().map(|mut row| {
    let state = row.split_off(input_width);
    (row, state)
  }).unzip()
}


struct BatcherOutput<T: Real> {
  input_width: usize,
  state_size: usize,
  input: Variable<T>,
  output: Variable<T>,
  outputs: Vec<Vec<T>>,
  states: Vec<State<T>>,
}

impl<T: Real> BlockOutput<T> for BatcherOutput<T> {
  fn outputs(&self) -> &[Vec<T>] {
    &self.outputs
  }

  fn states(&self) -> &[State<T>] {
    &self.states
  }

  fn propagate_gradient(&self, upstream: Upstream<T>, g: &mut Gradient<T>) -> Downstream<T> {
    let n = self.outputs.len();
    let states = upstream.states.map(|states| states.into_iter().map(State::into_vector).collect() );
    let flat = pack_upstream(&self.outputs, upstream.outputs, states, self.state_size);
    let grad = self.output.propagate(&flat, &[&self.input], g).remove(0);
    let (inputs, states) = unpack_downstream(&grad, n, self.input_width);
    Downstream {
      inputs,
      states: states.into_iter().map(State::Vector).collect(),
    }
  }
}


struct BatcherROutput<T: Real> {
  input_width: usize,
  state_size: usize,
  input: Variable<T>,
  output: Variable<T>,
  outputs: Vec<Vec<T>>,
  routputs: Vec<Vec<T>>,
  states: Vec<RState<T>>,
}

impl<T: Real> BlockROutput<T> for BatcherROutput<T> {
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
    let n = self.outputs.len();
    let (states, rstates) = match upstream.states {
      Some(states) => {
        let (values, rvalues): (Vec<Vec<T>>, Vec<Vec<T>>) = states.iter()
          .map(|state| {
            let (value, rvalue) = state.vector();
            (value.to_vec(), rvalue.to_vec())
          })
          .unzip();
        (Some(values), Some(rvalues))
      },
      None => (None, None),
    };
    let flat = pack_upstream(&self.outputs, upstream.outputs, states, self.state_size);
    let rflat = pack_upstream(&self.outputs, upstream.routputs, rstates, self.state_size);
    let (mut grads, mut rgrads) = self.output.propagate_r(&flat, &rflat, &[&self.input], rg, g);
    let (inputs, states) = unpack_downstream(&grads.remove(0), n, self.input_width);
    let (rinputs, rstates) = unpack_downstream(&rgrads.remove(0), n, self.input_width);
    RDownstream {
      inputs,
      rinputs,
      states: states.into_iter().zip(rstates)
        .map(|(value, rvalue)| RState::Vector { value, rvalue } )
        .collect(),
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::variable::Activation;

  #[test]
  fn packs_lanes() {
    let block = BatcherBlock::<f64>::new(Box::new(Activation::Square), 2);
    let states = vec![State::Vector(vec![1.0, 2.0]), State::Vector(vec![3.0, 4.0])];
    let out = block.batch(&states, &[vec![5.0], vec![6.0]]);
    assert_eq!(out.outputs(), &[vec![25.0], vec![36.0]]);
    assert_eq!(out.states()[1], State::Vector(vec![9.0, 16.0]));
    let down = out.propagate_gradient(Upstream {
      outputs: Some(vec![vec![1.0], vec![0.0]]),
      states: None,
    }, &mut Gradient::default());
    assert_eq!(down.inputs, vec![vec![10.0], vec![0.0]]);
    assert_eq!(down.states, vec![State::Vector(vec![0.0, 0.0]), State::Vector(vec![0.0, 0.0])]);
  }

  #[test]
  fn trainable_start() {
    let block = BatcherBlock::<f64>::new(Box::new(Activation::Identity), 2).with_trainable_start();
    let start = block.parameters()[0].id();
    let mut g = Gradient::new(&block.parameters());
    block.propagate_start(&[State::Vector(vec![1.0, 2.0]), State::Vector(vec![0.5, 0.5])], &mut g);
    assert_eq!(g.get(start), Some(&vec![1.5, 2.5]));
  }

  #[test]
  fn r_channel() {
    let block = BatcherBlock::<f64>::new(Box::new(Activation::Square), 1).with_trainable_start();
    let mut rv = RVector::new(&block.parameters());
    rv.accumulate(block.parameters()[0].id(), &[1.0]);
    let start = block.start_rstate(&rv);
    assert_eq!(start, RState::Vector { value: vec![0.0], rvalue: vec![1.0] });
    let state = RState::Vector { value: vec![2.0], rvalue: vec![1.0] };
    let out = block.batch_r(&rv, &[state], &[vec![3.0]], &[vec![0.5]]);
    assert_eq!(out.routputs(), &[vec![3.0]]);
    assert_eq!(out.states(), &[RState::Vector { value: vec![4.0], rvalue: vec![4.0] }]);
  }
}
