use tracing::trace;

use crate::{
  scalar::Real,
  gradient::{ Gradient, RGradient, RVector, PooledGradient },
  block::Block,
  cost::CostFunc,
  sequence::{ Sequence, sort_by_length },
  seq_prop::{ SeqProp, SeqRProp },
  grad_helper::GradHelper,
};


/// Anything that computes parameter gradients of a total cost over a sample set.

pub trait Gradienter<T: Real> {
  type Sample;

  fn gradient(&mut self, samples: &[Self::Sample]) -> PooledGradient<T>;

  /// Gradient together with its directional derivative along `rv`,
  /// i.e. the Hessian-vector product.
  fn rgradient(&mut self, rv: &RVector<T>, samples: &[Self::Sample]) -> (PooledGradient<T>, PooledGradient<T>);
}


fn sorted<T: Real>(samples: &[Sequence<T>]) -> Vec<Sequence<T>> {
  let mut samples = samples.to_vec();
  sort_by_length(&mut samples);
  samples
}


/// Full back-propagation through time.
///
/// Every sub-batch of at most `max_lanes` sequences is run forward to
/// completion before being back-propagated in one go.

pub struct BPTT<T: Real, B: Block<T>, C: CostFunc<T>> {
  pub block: B,
  pub cost: C,
  helper: GradHelper<T>,
}

impl<T: Real, B: Block<T>, C: CostFunc<T>> BPTT<T, B, C> {
  pub fn new(block: B, cost: C) -> Self {
    Self { block, cost, helper: GradHelper::default() }
  }

  /// Sequences per sub-batch. Zero picks the default.

  pub fn max_lanes(mut self, lanes: usize) -> Self {
    self.helper.max_sub_batch = lanes;
    self
  }

  /// Worker count limit. Zero uses all available cores.

  pub fn max_threads(mut self, threads: usize) -> Self {
    self.helper.max_concurrency = threads;
    self
  }

  pub fn helper(&self) -> &GradHelper<T> {
    &self.helper
  }
}

impl<T: Real, B: Block<T>, C: CostFunc<T>> Gradienter<T> for BPTT<T, B, C> {
  type Sample = Sequence<T>;

  fn gradient(&mut self, samples: &[Sequence<T>]) -> PooledGradient<T> {
    let samples = sorted(samples);
    let (block, cost) = (&self.block, &self.cost);
    let params = block.parameters();
    self.helper.gradient(&params, &samples, |g: &mut Gradient<T>, batch: &[Sequence<T>]| {
      let mut prop = SeqProp::new(block, cost, batch);
      while prop.time_step() {}
      prop.back_propagate(g, prop.memory_count(), 0);
    })
  }

  fn rgradient(&mut self, rv: &RVector<T>, samples: &[Sequence<T>]) -> (PooledGradient<T>, PooledGradient<T>) {
    let samples = sorted(samples);
    let (block, cost) = (&self.block, &self.cost);
    let params = block.parameters();
    self.helper.rgradient(&params, &samples, |g: &mut Gradient<T>, rg: &mut RGradient<T>, batch: &[Sequence<T>]| {
      let mut prop = SeqRProp::new(block, cost, rv, batch);
      while prop.time_step() {}
      prop.back_propagate(rg, g, prop.memory_count(), 0);
    })
  }
}


/// Back-propagation through time over a sliding window.
///
/// After every `head_size` forward steps, the latest `head_size` steps
/// get back-propagated including their output gradients, followed by
/// `tail_size` older steps that only pass state gradients further back.
/// Older memory is dropped afterwards.

pub struct TruncatedBPTT<T: Real, B: Block<T>, C: CostFunc<T>> {
  pub block: B,
  pub cost: C,
  pub head_size: usize,
  pub tail_size: usize,
  helper: GradHelper<T>,
}

impl<T: Real, B: Block<T>, C: CostFunc<T>> TruncatedBPTT<T, B, C> {
  pub fn new(block: B, cost: C, head_size: usize, tail_size: usize) -> Self {
    assert!(head_size > 0, "Truncated BPTT needs a head size of at least one");
    Self { block, cost, head_size, tail_size, helper: GradHelper::default() }
  }

  pub fn max_lanes(mut self, lanes: usize) -> Self {
    self.helper.max_sub_batch = lanes;
    self
  }

  pub fn max_threads(mut self, threads: usize) -> Self {
    self.helper.max_concurrency = threads;
    self
  }

  pub fn helper(&self) -> &GradHelper<T> {
    &self.helper
  }
}

impl<T: Real, B: Block<T>, C: CostFunc<T>> Gradienter<T> for TruncatedBPTT<T, B, C> {
  type Sample = Sequence<T>;

  fn gradient(&mut self, samples: &[Sequence<T>]) -> PooledGradient<T> {
    let samples = sorted(samples);
    let (block, cost) = (&self.block, &self.cost);
    let (head_size, tail_size) = (self.head_size, self.tail_size);
    let params = block.parameters();
    self.helper.gradient(&params, &samples, |g: &mut Gradient<T>, batch: &[Sequence<T>]| {
      let mut prop = SeqProp::new(block, cost, batch);
      let mut head_len = 0;
      while prop.time_step() {
        head_len += 1;
        if head_len == head_size || prop.is_done() {
          trace!(head = head_len, tail = tail_size, memory = prop.memory_count(), "truncated backward pass");
          prop.back_propagate(g, head_len, tail_size);
          prop.truncate(tail_size);
          head_len = 0;
        }
      }
    })
  }

  fn rgradient(&mut self, rv: &RVector<T>, samples: &[Sequence<T>]) -> (PooledGradient<T>, PooledGradient<T>) {
    let samples = sorted(samples);
    let (block, cost) = (&self.block, &self.cost);
    let (head_size, tail_size) = (self.head_size, self.tail_size);
    let params = block.parameters();
    self.helper.rgradient(&params, &samples, |g: &mut Gradient<T>, rg: &mut RGradient<T>, batch: &[Sequence<T>]| {
      let mut prop = SeqRProp::new(block, cost, rv, batch);
      let mut head_len = 0;
      while prop.time_step() {
        head_len += 1;
        if head_len == head_size || prop.is_done() {
          trace!(head = head_len, tail = tail_size, memory = prop.memory_count(), "truncated backward pass");
          prop.back_propagate(rg, g, head_len, tail_size);
          prop.truncate(tail_size);
          head_len = 0;
        }
      }
    })
  }
}
