use crate::{
  scalar::Real,
  parameter::Parameter,
  gradient::{ Gradient, RGradient, RVector },
  state::{ State, StateGrad, RState, RStateGrad },
  block::{ Block, BlockOutput, BlockROutput, Upstream, Downstream, RUpstream, RDownstream },
};


/// Replaces a [Block]'s output with its new state.
///
/// The wrapped block has to carry a vector state. Its own outputs are
/// discarded, so they receive no gradient.

pub struct StateOutBlock<T: Real, B: Block<T>> {
  block: B,
  _marker: std::marker::PhantomData<T>,
}

impl<T: Real, B: Block<T>> StateOutBlock<T, B> {
  pub fn new(block: B) -> Self {
    Self { block, _marker: std::marker::PhantomData }
  }

  pub fn inner(&self) -> &B {
    &self.block
  }
}


// Sum state and output gradients, both of which flow into the new state
fn merge<S: Clone>(states: Option<Vec<S>>, outputs: Option<Vec<S>>, add: impl Fn(&mut S, &S)) -> Option<Vec<S>> {
  match (states, outputs) {
    (Some(mut states), Some(outputs)) => {
      for (state, output) in states.iter_mut().zip(&outputs) {
        add(state, output);
      }
      Some(states)
    },
    (states, None) => states,
    (None, outputs) => outputs,
  }
}


impl<T: Real, B: Block<T>> Block<T> for StateOutBlock<T, B> {
  fn state_size(&self) -> usize {
    self.block.state_size()
  }

  fn start_state(&self) -> State<T> {
    self.block.start_state()
  }

  fn start_rstate(&self, rv: &RVector<T>) -> RState<T> {
    self.block.start_rstate(rv)
  }

  fn propagate_start(&self, upstream: &[StateGrad<T>], g: &mut Gradient<T>) {
    self.block.propagate_start(upstream, g)
  }

  fn propagate_start_r(&self, upstream: &[RStateGrad<T>], rg: &mut RGradient<T>, g: &mut Gradient<T>) {
    self.block.propagate_start_r(upstream, rg, g)
  }

  fn batch<'a>(&'a self, states: &[State<T>], inputs: &[Vec<T>]) -> Box<dyn BlockOutput<T> + 'a> {
    let result = self.block.batch(states, inputs);
    let outputs = result.states().iter().map(|state| state.vector().to_vec() ).collect();
    Box::new(StateOutOutput { result, outputs })
  }

  fn batch_r<'a>(&'a self, rv: &RVector<T>, states: &[RState<T>], inputs: &[Vec<T>], rinputs: &[Vec<T>]) -> Box<dyn BlockROutput<T> + 'a> {
    let result = self.block.batch_r(rv, states, inputs, rinputs);
    let (outputs, routputs) = result.states().iter()
      .map(|state| {
        let (value, rvalue) = state.vector();
        (value.to_vec(), rvalue.to_vec())
      })
      .unzip();
    Box::new(StateOutROutput { result, outputs, routputs })
  }

  fn parameters(&self) -> Vec<&Parameter<T>> {
    self.block.parameters()
  }

  fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
    self.block.parameters_mut()
  }
}


struct StateOutOutput<'a, T: Real> {
  result: Box<dyn BlockOutput<T> + 'a>,
  outputs: Vec<Vec<T>>,
}

impl<'a, T: Real> BlockOutput<T> for StateOutOutput<'a, T> {
  fn outputs(&self) -> &[Vec<T>] {
    &self.outputs
  }

  fn states(&self) -> &[State<T>] {
    self.result.states()
  }

  fn propagate_gradient(&self, upstream: Upstream<T>, g: &mut Gradient<T>) -> Downstream<T> {
    let outputs = upstream.outputs.map(|grads| grads.into_iter().map(State::Vector).collect() );
    let states = merge(upstream.states, outputs, State::add);
    self.result.propagate_gradient(Upstream { outputs: None, states }, g)
  }
}


struct StateOutROutput<'a, T: Real> {
  result: Box<dyn BlockROutput<T> + 'a>,
  outputs: Vec<Vec<T>>,
  routputs: Vec<Vec<T>>,
}

impl<'a, T: Real> BlockROutput<T> for StateOutROutput<'a, T> {
  fn outputs(&self) -> &[Vec<T>] {
    &self.outputs
  }

  fn routputs(&self) -> &[Vec<T>] {
    &self.routputs
  }

  fn states(&self) -> &[RState<T>] {
    self.result.states()
  }

  fn propagate_gradient(&self, upstream: RUpstream<T>, rg: &mut RGradient<T>, g: &mut Gradient<T>) -> RDownstream<T> {
    let outputs = match (upstream.outputs, upstream.routputs) {
      (None, None) => None,
      (values, rvalues) => {
        let values = values.unwrap_or_else(|| self.outputs.iter().map(|row| vec![T::zero(); row.len()] ).collect() );
        let rvalues = rvalues.unwrap_or_else(|| self.outputs.iter().map(|row| vec![T::zero(); row.len()] ).collect() );
        Some(values.into_iter().zip(rvalues)
          .map(|(value, rvalue)| RState::Vector { value, rvalue } )
          .collect())
      },
    };
    let states = merge(upstream.states, outputs, RState::add);
    self.result.propagate_gradient(RUpstream { outputs: None, routputs: None, states }, rg, g)
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::block::square;

  #[test]
  fn outputs_state() {
    let block = StateOutBlock::new(square::<f64>(2));
    let out = block.batch(&[State::Vector(vec![1.0, 3.0])], &[vec![2.0]]);
    assert_eq!(out.outputs(), &[vec![1.0, 9.0]]);
    let down = out.propagate_gradient(Upstream {
      outputs: Some(vec![vec![1.0, 0.0]]),
      states: Some(vec![State::Vector(vec![1.0, 1.0])]),
    }, &mut Gradient::default());
    // Squared input feeds nothing
    assert_eq!(down.inputs, vec![vec![0.0]]);
    assert_eq!(down.states, vec![State::Vector(vec![4.0, 6.0])]);
  }

  #[test]
  #[should_panic(expected = "Expected vector state")]
  fn rejects_composite_state() {
    let parallel = crate::block::ParallelBlock::<f64>::new(vec![Box::new(square(1))]);
    let block = StateOutBlock::new(parallel);
    block.batch(&[block.start_state()], &[vec![1.0]]);
  }
}
