use crate::{
  scalar::Real,
  parameter::Parameter,
  gradient::{ Gradient, RGradient, RVector },
  state::{ State, StateGrad, RState, RStateGrad },
  layer::{ Network, Dense, LstmCell },
  variable::Activation,
};

mod batcher;
mod stacked;
mod parallel;
mod state_out;

pub use batcher::BatcherBlock;
pub use stacked::StackedBlock;
pub use parallel::ParallelBlock;
pub use state_out::StateOutBlock;


/// Recurrent computation unit mapping `(input, state)` to `(output, new state)`.
///
/// Blocks process many independent lanes at once: every slice passed to
/// [batch](Block::batch) holds one entry per lane, and results keep that
/// lane order. Blocks own no per-call data, so one Block may be evaluated
/// from several threads at once while its parameters stay untouched.

pub trait Block<T: Real>: Send + Sync {
  /// Number of scalars in this Block's flattened state.
  fn state_size(&self) -> usize;

  fn start_state(&self) -> State<T>;

  fn start_rstate(&self, rv: &RVector<T>) -> RState<T>;

  /// Back-propagate gradients of all lanes' first-timestep input states through the start state.
  fn propagate_start(&self, upstream: &[StateGrad<T>], g: &mut Gradient<T>);

  fn propagate_start_r(&self, upstream: &[RStateGrad<T>], rg: &mut RGradient<T>, g: &mut Gradient<T>);

  fn batch<'a>(&'a self, states: &[State<T>], inputs: &[Vec<T>]) -> Box<dyn BlockOutput<T> + 'a>;

  /// Like [batch](Block::batch), but also carry R-values along `rv`.
  ///
  /// `rinputs` holds the R-derivative of every input.
  fn batch_r<'a>(&'a self, rv: &RVector<T>, states: &[RState<T>], inputs: &[Vec<T>], rinputs: &[Vec<T>]) -> Box<dyn BlockROutput<T> + 'a>;

  fn parameters(&self) -> Vec<&Parameter<T>>;

  fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>>;
}


/// Gradients arriving at a [BlockOutput] from later computation.
///
/// A missing entry stands for an all-zero gradient.

#[derive(Debug, Clone, PartialEq)]
pub struct Upstream<T: Real> {
  pub outputs: Option<Vec<Vec<T>>>,
  pub states: Option<Vec<StateGrad<T>>>,
}

/// Gradients with respect to the inputs and input states of one [Block::batch] call.

#[derive(Debug, Clone, PartialEq)]
pub struct Downstream<T: Real> {
  pub inputs: Vec<Vec<T>>,
  pub states: Vec<StateGrad<T>>,
}


/// Result of one [Block::batch] call.

pub trait BlockOutput<T: Real> {
  fn outputs(&self) -> &[Vec<T>];

  fn states(&self) -> &[State<T>];

  /// Back-propagate through this timestep, accumulating parameter gradients into `g`.
  fn propagate_gradient(&self, upstream: Upstream<T>, g: &mut Gradient<T>) -> Downstream<T>;
}


/// Gradients and R-gradients arriving at a [BlockROutput].

#[derive(Debug, Clone, PartialEq)]
pub struct RUpstream<T: Real> {
  pub outputs: Option<Vec<Vec<T>>>,
  pub routputs: Option<Vec<Vec<T>>>,
  pub states: Option<Vec<RStateGrad<T>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RDownstream<T: Real> {
  pub inputs: Vec<Vec<T>>,
  pub rinputs: Vec<Vec<T>>,
  pub states: Vec<RStateGrad<T>>,
}


/// Result of one [Block::batch_r] call.

pub trait BlockROutput<T: Real> {
  fn outputs(&self) -> &[Vec<T>];

  fn routputs(&self) -> &[Vec<T>];

  fn states(&self) -> &[RState<T>];

  fn propagate_gradient(&self, upstream: RUpstream<T>, rg: &mut RGradient<T>, g: &mut Gradient<T>) -> RDownstream<T>;
}


pub(crate) fn check_lanes(states: usize, inputs: usize) {
  assert_eq!(states, inputs, "Mismatched lane counts: {states} states but {inputs} inputs");
}

pub(crate) fn zero_rows<T: Real>(rows: &[Vec<T>]) -> Vec<Vec<T>> {
  rows.iter().map(|row| vec![T::zero(); row.len()] ).collect()
}


/// LSTM with a trainable start state, carrying `[cell, hidden]` as state.

pub fn lstm<T: Real>(input_size: usize, hidden_size: usize) -> BatcherBlock<T> {
  BatcherBlock::new(Box::new(LstmCell::new(input_size, hidden_size)), hidden_size * 2)
    .with_trainable_start()
}


/// Identity-initialized recurrent ReLU network.
///
/// Its hidden state doubles as its output.

pub fn irnn<T: Real>(input_size: usize, hidden_size: usize, scale: T) -> StateOutBlock<T, BatcherBlock<T>> {
  let mut dense = Dense::new(input_size + hidden_size, hidden_size);
  let width = input_size + hidden_size;
  for (row, weights) in dense.weights.data.chunks_mut(width).enumerate() {
    for (col, weight) in weights[input_size..].iter_mut().enumerate() {
      *weight = if row == col { scale } else { T::zero() };
    }
  }
  let network = Network::new(vec![Box::new(dense), Box::new(Activation::ReLU)]);
  StateOutBlock::new(BatcherBlock::new(Box::new(network), hidden_size))
}


/// Squares input and state elementwise, emitting the squared input
/// and carrying the squared state.

pub fn square<T: Real>(state_size: usize) -> BatcherBlock<T> {
  BatcherBlock::new(Box::new(Activation::Square), state_size)
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    runner::Runner,
    cost::MeanSquaredCost,
    sequence::Sequence,
    bptt::{ Gradienter, BPTT },
    check::*,
  };

  fn samples(width: usize) -> Vec<Sequence<f64>> {
    [3, 1, 0, 4].iter().enumerate().map(|(i, &len)| {
      // Offsets keep ReLU pre-activations clear of zero, where finite differences break down
      let inputs = (0..len).map(|t| vec![0.4 * t as f64 - 0.3 * i as f64 + 0.0137, (t + i) as f64 * 0.1 + 0.021] ).collect();
      let outputs = (0..len).map(|t| vec![0.05 * (t * i) as f64; width] ).collect();
      Sequence::new(inputs, outputs)
    }).collect()
  }

  fn check_block<B: Block<f64>>(block: B, width: usize) {
    let samples = samples(width);
    let mut bptt = BPTT::new(block, MeanSquaredCost).max_lanes(2);
    let expected = block_numeric_gradient(&mut bptt.block, &MeanSquaredCost, &samples);
    assert_gradients_close(&bptt.gradient(&samples), &expected, 1e-6);

    let rv = RVector::randn(&bptt.block.parameters());
    let (g, rg) = bptt.rgradient(&rv, &samples);
    assert_gradients_close(&g, &expected, 1e-6);
    let expected_r = numeric_rgradient(&mut bptt, |bptt| bptt.block.parameters_mut(), &rv, &samples);
    assert_gradients_close(&rg, &expected_r, 1e-6);
  }

  #[test]
  fn irnn_identity() {
    let mut block = irnn::<f64>(1, 2, 1.0);
    for param in block.parameters_mut() {
      if param.len() == 3 * 2 {
        param.data[0] = 1.0;
        param.data[3] = 1.0;
      }
    }
    assert_eq!(block.state_size(), 2);
    let mut runner = Runner::new(&block);
    assert_eq!(runner.step_time(&[5.0]), vec![5.0, 5.0]);
    assert_eq!(runner.step_time(&[0.0]), vec![5.0, 5.0]);
    assert_eq!(runner.step_time(&[-1.0]), vec![4.0, 4.0]);
    assert_eq!(runner.step_time(&[-9.0]), vec![0.0, 0.0]);
  }

  #[test]
  fn square_block() {
    let block = square::<f64>(1);
    let out = block.batch(&[State::Vector(vec![3.0])], &[vec![2.0, -1.0]]);
    assert_eq!(out.outputs(), &[vec![4.0, 1.0]]);
    assert_eq!(out.states(), &[State::Vector(vec![9.0])]);
  }

  #[test]
  fn lstm_shapes() {
    let block = lstm::<f64>(3, 4);
    assert_eq!(block.state_size(), 8);
    assert_eq!(block.parameters().len(), 4);
    let out = block.batch(&[block.start_state(), block.start_state()], &[vec![1.0, 2.0, 3.0], vec![0.0; 3]]);
    assert_eq!(out.outputs().len(), 2);
    assert_eq!(out.outputs()[0].len(), 4);
    assert_eq!(out.states()[1].size(), 8);
  }

  #[test]
  fn parallel_state_out_gradients() {
    let block = StackedBlock::new(vec![
      Box::new(ParallelBlock::new(vec![
        Box::new(lstm(2, 2)),
        Box::new(StateOutBlock::new(lstm(2, 1))),
      ])),
      Box::new(square(1)),
    ]);
    // lstm(2, 1) exposes its 2 state scalars next to the 2 hidden outputs
    check_block(block, 4);
  }

  #[test]
  fn irnn_gradients() {
    check_block(irnn(2, 3, 0.9), 3);
  }
}
