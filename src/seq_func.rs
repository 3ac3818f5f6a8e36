use std::marker::PhantomData;

use crate::{
  scalar::Real,
  parameter::Parameter,
  gradient::{ Gradient, RGradient, RVector, PooledGradient },
  state::{ State, StateGrad, RState, RStateGrad },
  block::{ Block, BlockOutput, BlockROutput, Upstream, RUpstream },
  cost::CostFunc,
  sequence::Sequence,
  seq_prop::expand_lanes,
  bptt::Gradienter,
  grad_helper::GradHelper,
};

mod compose;

pub use compose::{ MapSeqFunc, ComposedSeqFunc, Bidirectional };


/// A batch of vector sequences, indexed by sequence, then timestep.

pub type Seqs<T> = Vec<Vec<Vec<T>>>;


/// Differentiable function mapping whole sequences to sequences of equal length.
///
/// Unlike a [Block], a SeqFunc sees every timestep of its input at once,
/// which allows for compositions that run backwards in time.

pub trait SeqFunc<T: Real>: Send + Sync {
  fn apply_seqs<'a>(&'a self, inputs: &[Vec<Vec<T>>]) -> Box<dyn ResultSeqs<T> + 'a>;

  fn apply_seqs_r<'a>(&'a self, rv: &RVector<T>, inputs: &[Vec<Vec<T>>], rinputs: &[Vec<Vec<T>>]) -> Box<dyn RResultSeqs<T> + 'a>;

  fn parameters(&self) -> Vec<&Parameter<T>>;

  fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>>;
}


/// Result of [SeqFunc::apply_seqs].

pub trait ResultSeqs<T: Real> {
  fn output_seqs(&self) -> &[Vec<Vec<T>>];

  /// Back-propagate `upstream`, shaped like the outputs, returning gradients shaped like the inputs.
  fn propagate_gradient(&self, upstream: Seqs<T>, g: &mut Gradient<T>) -> Seqs<T>;
}


/// Result of [SeqFunc::apply_seqs_r].

pub trait RResultSeqs<T: Real> {
  fn output_seqs(&self) -> &[Vec<Vec<T>>];

  fn routput_seqs(&self) -> &[Vec<Vec<T>>];

  fn propagate_gradient(&self, upstream: Seqs<T>, rupstream: Seqs<T>, rg: &mut RGradient<T>, g: &mut Gradient<T>) -> (Seqs<T>, Seqs<T>);
}


pub(crate) fn zero_seqs<T: Real>(seqs: &[Vec<Vec<T>>]) -> Seqs<T> {
  seqs.iter().map(|seq| seq.iter().map(|step| vec![T::zero(); step.len()] ).collect() ).collect()
}

fn check_shape<T: Real>(upstream: &[Vec<Vec<T>>], lengths: &[usize]) {
  assert_eq!(upstream.len(), lengths.len(), "Upstream holds {} sequences but {} were produced", upstream.len(), lengths.len());
  for (seq, &len) in upstream.iter().zip(lengths) {
    assert_eq!(seq.len(), len, "Upstream sequence length does not match output");
  }
}


struct Step<O: ?Sized> {
  output: Box<O>,
  lanes: Vec<usize>,
}


/// Runs a [Block] over complete sequences, starting each from the block's start state.

pub struct BlockSeqFunc<T: Real, B: Block<T>> {
  pub block: B,
  _marker: PhantomData<T>,
}

impl<T: Real, B: Block<T>> BlockSeqFunc<T, B> {
  pub fn new(block: B) -> Self {
    Self { block, _marker: PhantomData }
  }
}

impl<T: Real, B: Block<T>> SeqFunc<T> for BlockSeqFunc<T, B> {
  fn apply_seqs<'a>(&'a self, inputs: &[Vec<Vec<T>>]) -> Box<dyn ResultSeqs<T> + 'a> {
    let lengths: Vec<usize> = inputs.iter().map(|seq| seq.len() ).collect();
    let mut outputs = vec![vec![]; inputs.len()];
    let mut steps = vec![];
    let mut lanes: Vec<usize> = (0..inputs.len()).filter(|&lane| lengths[lane] > 0 ).collect();
    let mut states = vec![self.block.start_state(); lanes.len()];
    let mut time = 0;
    while !lanes.is_empty() {
      let step_inputs: Vec<Vec<T>> = lanes.iter().map(|&lane| inputs[lane][time].clone() ).collect();
      let output = self.block.batch(&states, &step_inputs);
      for (&lane, out) in lanes.iter().zip(output.outputs()) {
        outputs[lane].push(out.clone());
      }
      let (next_lanes, next_states) = lanes.iter()
        .zip(output.states())
        .filter(|&(&lane, _)| lengths[lane] > time + 1 )
        .map(|(&lane, state)| (lane, state.clone()) )
        .unzip();
      steps.push(Step { output, lanes: std::mem::replace(&mut lanes, next_lanes) });
      states = next_states;
      time += 1;
    }
    Box::new(BlockResult { block: &self.block, lengths, steps, outputs })
  }

  fn apply_seqs_r<'a>(&'a self, rv: &RVector<T>, inputs: &[Vec<Vec<T>>], rinputs: &[Vec<Vec<T>>]) -> Box<dyn RResultSeqs<T> + 'a> {
    let lengths: Vec<usize> = inputs.iter().map(|seq| seq.len() ).collect();
    check_shape(rinputs, &lengths);
    let mut outputs = vec![vec![]; inputs.len()];
    let mut routputs = vec![vec![]; inputs.len()];
    let mut steps = vec![];
    let mut lanes: Vec<usize> = (0..inputs.len()).filter(|&lane| lengths[lane] > 0 ).collect();
    let mut states = vec![self.block.start_rstate(rv); lanes.len()];
    let mut time = 0;
    while !lanes.is_empty() {
      let step_inputs: Vec<Vec<T>> = lanes.iter().map(|&lane| inputs[lane][time].clone() ).collect();
      let step_rinputs: Vec<Vec<T>> = lanes.iter().map(|&lane| rinputs[lane][time].clone() ).collect();
      let output = self.block.batch_r(rv, &states, &step_inputs, &step_rinputs);
      for ((&lane, out), rout) in lanes.iter().zip(output.outputs()).zip(output.routputs()) {
        outputs[lane].push(out.clone());
        routputs[lane].push(rout.clone());
      }
      let (next_lanes, next_states) = lanes.iter()
        .zip(output.states())
        .filter(|&(&lane, _)| lengths[lane] > time + 1 )
        .map(|(&lane, state)| (lane, state.clone()) )
        .unzip();
      steps.push(Step { output, lanes: std::mem::replace(&mut lanes, next_lanes) });
      states = next_states;
      time += 1;
    }
    Box::new(BlockRResult { block: &self.block, lengths, steps, outputs, routputs })
  }

  fn parameters(&self) -> Vec<&Parameter<T>> {
    self.block.parameters()
  }

  fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
    self.block.parameters_mut()
  }
}


struct BlockResult<'a, T: Real> {
  block: &'a dyn Block<T>,
  lengths: Vec<usize>,
  steps: Vec<Step<dyn BlockOutput<T> + 'a>>,
  outputs: Seqs<T>,
}

impl<'a, T: Real> ResultSeqs<T> for BlockResult<'a, T> {
  fn output_seqs(&self) -> &[Vec<Vec<T>>] {
    &self.outputs
  }

  fn propagate_gradient(&self, mut upstream: Seqs<T>, g: &mut Gradient<T>) -> Seqs<T> {
    check_shape(&upstream, &self.lengths);
    let mut grads: Seqs<T> = self.lengths.iter().map(|&len| vec![vec![]; len] ).collect();
    let mut states: Option<Vec<StateGrad<T>>> = None;
    let mut start = vec![];
    for (time, step) in self.steps.iter().enumerate().rev() {
      let outputs = step.lanes.iter().map(|&lane| std::mem::take(&mut upstream[lane][time]) ).collect();
      let down = step.output.propagate_gradient(Upstream { outputs: Some(outputs), states: states.take() }, g);
      for (&lane, grad) in step.lanes.iter().zip(down.inputs) {
        grads[lane][time] = grad;
      }
      if time == 0 {
        start = down.states;
      } else {
        let prev = &self.steps[time - 1];
        states = Some(expand_lanes(&prev.lanes, prev.output.states(), &step.lanes, down.states, State::zeroed));
      }
    }
    if !start.is_empty() {
      self.block.propagate_start(&start, g);
    }
    grads
  }
}


struct BlockRResult<'a, T: Real> {
  block: &'a dyn Block<T>,
  lengths: Vec<usize>,
  steps: Vec<Step<dyn BlockROutput<T> + 'a>>,
  outputs: Seqs<T>,
  routputs: Seqs<T>,
}

impl<'a, T: Real> RResultSeqs<T> for BlockRResult<'a, T> {
  fn output_seqs(&self) -> &[Vec<Vec<T>>] {
    &self.outputs
  }

  fn routput_seqs(&self) -> &[Vec<Vec<T>>] {
    &self.routputs
  }

  fn propagate_gradient(&self, mut upstream: Seqs<T>, mut rupstream: Seqs<T>, rg: &mut RGradient<T>, g: &mut Gradient<T>) -> (Seqs<T>, Seqs<T>) {
    check_shape(&upstream, &self.lengths);
    check_shape(&rupstream, &self.lengths);
    let mut grads: Seqs<T> = self.lengths.iter().map(|&len| vec![vec![]; len] ).collect();
    let mut rgrads = grads.clone();
    let mut states: Option<Vec<RStateGrad<T>>> = None;
    let mut start = vec![];
    for (time, step) in self.steps.iter().enumerate().rev() {
      let outputs = step.lanes.iter().map(|&lane| std::mem::take(&mut upstream[lane][time]) ).collect();
      let routputs = step.lanes.iter().map(|&lane| std::mem::take(&mut rupstream[lane][time]) ).collect();
      let down = step.output.propagate_gradient(RUpstream {
        outputs: Some(outputs),
        routputs: Some(routputs),
        states: states.take(),
      }, rg, g);
      for ((&lane, grad), rgrad) in step.lanes.iter().zip(down.inputs).zip(down.rinputs) {
        grads[lane][time] = grad;
        rgrads[lane][time] = rgrad;
      }
      if time == 0 {
        start = down.states;
      } else {
        let prev = &self.steps[time - 1];
        states = Some(expand_lanes(&prev.lanes, prev.output.states(), &step.lanes, down.states, RState::zeroed));
      }
    }
    if !start.is_empty() {
      self.block.propagate_start_r(&start, rg, g);
    }
    (grads, rgrads)
  }
}


/// Trains a [SeqFunc] on per-timestep targets, summing the cost over all timesteps.

pub struct SeqFuncGradienter<T: Real, F: SeqFunc<T>, C: CostFunc<T>> {
  pub func: F,
  pub cost: C,
  helper: GradHelper<T>,
}

impl<T: Real, F: SeqFunc<T>, C: CostFunc<T>> SeqFuncGradienter<T, F, C> {
  pub fn new(func: F, cost: C) -> Self {
    Self { func, cost, helper: GradHelper::default() }
  }

  pub fn max_lanes(mut self, lanes: usize) -> Self {
    self.helper.max_sub_batch = lanes;
    self
  }

  pub fn max_threads(mut self, threads: usize) -> Self {
    self.helper.max_concurrency = threads;
    self
  }
}

fn sample_inputs<T: Real>(samples: &[Sequence<T>]) -> Seqs<T> {
  samples.iter().map(|sample| sample.inputs.clone() ).collect()
}

impl<T: Real, F: SeqFunc<T>, C: CostFunc<T>> Gradienter<T> for SeqFuncGradienter<T, F, C> {
  type Sample = Sequence<T>;

  fn gradient(&mut self, samples: &[Sequence<T>]) -> PooledGradient<T> {
    let (func, cost) = (&self.func, &self.cost);
    let params = func.parameters();
    self.helper.gradient(&params, samples, |g: &mut Gradient<T>, batch: &[Sequence<T>]| {
      let result = func.apply_seqs(&sample_inputs(batch));
      let upstream = result.output_seqs().iter().zip(batch).map(|(actual, sample)| {
        actual.iter().zip(&sample.outputs).map(|(a, e)| cost.gradient(a, e) ).collect()
      }).collect();
      result.propagate_gradient(upstream, g);
    })
  }

  fn rgradient(&mut self, rv: &RVector<T>, samples: &[Sequence<T>]) -> (PooledGradient<T>, PooledGradient<T>) {
    let (func, cost) = (&self.func, &self.cost);
    let params = func.parameters();
    self.helper.rgradient(&params, samples, |g: &mut Gradient<T>, rg: &mut RGradient<T>, batch: &[Sequence<T>]| {
      let inputs = sample_inputs(batch);
      let result = func.apply_seqs_r(rv, &inputs, &zero_seqs(&inputs));
      let (upstream, rupstream): (Seqs<T>, Seqs<T>) = result.output_seqs().iter()
        .zip(result.routput_seqs())
        .zip(batch)
        .map(|((actual, ractual), sample)| -> (Vec<Vec<T>>, Vec<Vec<T>>) {
          actual.iter().zip(ractual).zip(&sample.outputs)
            .map(|((a, ra), e)| cost.gradient_r(a, ra, e) )
            .unzip()
        })
        .unzip();
      result.propagate_gradient(upstream, rupstream, rg, g);
    })
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    block::{ StackedBlock, ParallelBlock, StateOutBlock, lstm, square },
    bptt::BPTT,
    cost::MeanSquaredCost,
    runner::Runner,
    check::*,
  };

  fn block() -> StackedBlock<f64> {
    StackedBlock::new(vec![
      Box::new(ParallelBlock::new(vec![Box::new(lstm(2, 2)), Box::new(StateOutBlock::new(lstm(2, 1)))])),
      Box::new(square(0)),
    ])
  }

  fn samples() -> Vec<Sequence<f64>> {
    [3, 0, 1, 4, 2].iter().enumerate().map(|(i, &len)| {
      let inputs = (0..len).map(|t| vec![0.4 * t as f64 - 0.2 * i as f64, 0.3] ).collect();
      let outputs = (0..len).map(|t| vec![0.1 * (t + i) as f64, 0.2, -0.3, 0.5] ).collect();
      Sequence::new(inputs, outputs)
    }).collect()
  }

  #[test]
  fn matches_runner() {
    let func = BlockSeqFunc::new(block());
    let inputs = sample_inputs(&samples());
    let expected = Runner::new(&func.block).run_all(&inputs);
    let result = func.apply_seqs(&inputs);
    assert_eq!(result.output_seqs(), &expected[..]);

    let rv = RVector::default();
    let rresult = func.apply_seqs_r(&rv, &inputs, &zero_seqs(&inputs));
    assert_eq!(rresult.output_seqs(), &expected[..]);
    assert_eq!(rresult.routput_seqs(), &zero_seqs(&expected)[..]);
  }

  #[test]
  fn gradient_equals_bptt() {
    let samples = samples();
    let mut gradienter = SeqFuncGradienter::new(BlockSeqFunc::new(block()), MeanSquaredCost);
    let expected = gradienter.gradient(&samples).into_inner();
    let rv = RVector::randn(&gradienter.func.parameters());
    let (expected_g, expected_rg) = gradienter.rgradient(&rv, &samples);

    let mut bptt = BPTT::new(gradienter.func.block, MeanSquaredCost);
    assert_gradients_close(&bptt.gradient(&samples), &expected, 1e-12);
    let (g, rg) = bptt.rgradient(&rv, &samples);
    assert_gradients_close(&g, &expected_g, 1e-12);
    assert_gradients_close(&rg, &expected_rg, 1e-12);
  }

  #[test]
  fn input_gradients() {
    let func = BlockSeqFunc::new(block());
    let samples = samples();
    let mut inputs = sample_inputs(&samples);
    let cost: &dyn CostFunc<f64> = &MeanSquaredCost;
    let total = |inputs: &Seqs<f64>| -> f64 {
      let result = func.apply_seqs(inputs);
      result.output_seqs().iter().zip(&samples).map(|(actual, sample)| {
        actual.iter().zip(&sample.outputs).map(|(a, e)| cost.cost(a, e) ).sum::<f64>()
      }).sum()
    };

    let result = func.apply_seqs(&inputs);
    let upstream = result.output_seqs().iter().zip(&samples).map(|(actual, sample)| {
      actual.iter().zip(&sample.outputs).map(|(a, e)| cost.gradient(a, e) ).collect()
    }).collect();
    let grads = result.propagate_gradient(upstream, &mut Gradient::default());
    drop(result);

    for s in 0..inputs.len() {
      assert_eq!(grads[s].len(), inputs[s].len());
      for t in 0..inputs[s].len() {
        for i in 0..inputs[s][t].len() {
          let original = inputs[s][t][i];
          inputs[s][t][i] = original + EPSILON;
          let plus = total(&inputs);
          inputs[s][t][i] = original - EPSILON;
          let minus = total(&inputs);
          inputs[s][t][i] = original;
          let numeric = (plus - minus) / (2.0 * EPSILON);
          assert!((grads[s][t][i] - numeric).abs() < 1e-6, "Input gradient {s}/{t}/{i} is {} but expected {numeric}", grads[s][t][i]);
        }
      }
    }
  }
}
