use crate::{
  scalar::Real,
  state::State,
  block::Block,
  cost::CostFunc,
  sequence::Sequence,
};


/// Evaluates a [Block] without keeping anything around for back-propagation.

pub struct Runner<'a, T: Real> {
  block: &'a dyn Block<T>,
  state: Option<State<T>>,
}

impl<'a, T: Real> Runner<'a, T> {
  pub fn new(block: &'a dyn Block<T>) -> Self {
    Self { block, state: None }
  }

  /// Start over from the block's start state.

  pub fn reset(&mut self) {
    self.state = None;
  }

  /// Feed one input of a single running sequence.

  pub fn step_time(&mut self, input: &[T]) -> Vec<T> {
    let state = self.state.take().unwrap_or_else(|| self.block.start_state() );
    let result = self.block.batch(&[state], &[input.to_vec()]);
    self.state = result.states().first().cloned();
    result.outputs().first().cloned().unwrap_or_default()
  }

  /// Run a batch of independent sequences from the start state.
  ///
  /// Output sequences line up with the inputs, so an empty input
  /// sequence yields an empty output sequence at the same index.

  pub fn run_all(&self, inputs: &[Vec<Vec<T>>]) -> Vec<Vec<Vec<T>>> {
    let mut outputs = vec![vec![]; inputs.len()];
    let mut lanes: Vec<usize> = (0..inputs.len()).filter(|&lane| !inputs[lane].is_empty() ).collect();
    let mut states = vec![self.block.start_state(); lanes.len()];
    let mut time = 0;
    while !lanes.is_empty() {
      let step: Vec<Vec<T>> = lanes.iter().map(|&lane| inputs[lane][time].clone() ).collect();
      let result = self.block.batch(&states, &step);
      for (&lane, output) in lanes.iter().zip(result.outputs()) {
        outputs[lane].push(output.clone());
      }
      (lanes, states) = lanes.iter()
        .zip(result.states())
        .filter(|&(&lane, _)| inputs[lane].len() > time + 1 )
        .map(|(&lane, state)| (lane, state.clone()) )
        .unzip();
      time += 1;
    }
    outputs
  }

  /// Summed cost over all timesteps of all samples, evaluated
  /// `batch_size` sequences at a time.

  pub fn total_cost(&self, batch_size: usize, samples: &[Sequence<T>], cost: &dyn CostFunc<T>) -> T {
    samples.chunks(batch_size.max(1)).map(|batch| {
      let inputs: Vec<Vec<Vec<T>>> = batch.iter().map(|sample| sample.inputs.clone() ).collect();
      self.run_all(&inputs).iter().zip(batch).map(|(actual, sample)| {
        actual.iter().zip(&sample.outputs).map(|(a, e)| cost.cost(a, e) ).sum::<T>()
      }).sum::<T>()
    }).sum()
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    block::{ StackedBlock, ParallelBlock, lstm, square },
    cost::MeanSquaredCost,
  };

  fn block() -> StackedBlock<f64> {
    StackedBlock::new(vec![
      Box::new(ParallelBlock::new(vec![Box::new(lstm(2, 2)), Box::new(square(1))])),
      Box::new(square(2)),
    ])
  }

  fn sequence(len: usize, offset: f64) -> Vec<Vec<f64>> {
    (0..len).map(|t| vec![t as f64 * 0.5 - offset, offset] ).collect()
  }

  #[test]
  fn batched_matches_stepping() {
    let block = block();
    let inputs = vec![sequence(3, 0.1), sequence(0, 0.0), sequence(5, -0.3), sequence(1, 0.7)];
    let batched = Runner::new(&block).run_all(&inputs);
    assert_eq!(batched.len(), 4);
    assert!(batched[1].is_empty());

    let mut runner = Runner::new(&block);
    for (seq, outputs) in inputs.iter().zip(&batched) {
      runner.reset();
      assert_eq!(outputs.len(), seq.len());
      for (input, output) in seq.iter().zip(outputs) {
        let stepped = runner.step_time(input);
        for (a, b) in stepped.iter().zip(output) {
          assert!((a - b).abs() < 1e-12);
        }
      }
    }
  }

  #[test]
  fn sums_costs() {
    let block = square::<f64>(0);
    let samples = vec![
      Sequence::new(vec![vec![1.0], vec![2.0]], vec![vec![0.0], vec![0.0]]),
      Sequence::new(vec![vec![3.0]], vec![vec![1.0]]),
    ];
    let runner = Runner::new(&block);
    // ½(1 + 16) + ½(64)
    assert_eq!(runner.total_cost(1, &samples, &MeanSquaredCost), 40.5);
    assert_eq!(runner.total_cost(5, &samples, &MeanSquaredCost), 40.5);
  }
}
