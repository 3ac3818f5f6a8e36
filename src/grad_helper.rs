use std::sync::atomic::{ AtomicUsize, Ordering };

use rayon::prelude::*;
use tracing::{ debug, warn };

use crate::{
  scalar::Real,
  parameter::Parameter,
  gradient::{ Gradient, RGradient, GradientPool, PooledGradient },
};


/// Sub-batch size used when `max_sub_batch` is zero.

pub const DEFAULT_MAX_SUB_BATCH: usize = 15;


/// Computes gradients over sample sets by splitting them into
/// sub-batches and accumulating the partial results on a worker pool.
///
/// Accumulators are checked out of a [GradientPool] on the calling
/// thread and handed back there as well, so workers never touch the
/// pool's free-list.

pub struct GradHelper<T: Real> {
  /// Upper bound on concurrently running workers. Zero means available parallelism.
  pub max_concurrency: usize,
  /// Samples per sub-batch. Zero means [DEFAULT_MAX_SUB_BATCH].
  pub max_sub_batch: usize,
  pool: GradientPool<T>,
  threads: Option<(usize, rayon::ThreadPool)>,
}

impl<T: Real> Default for GradHelper<T> {
  fn default() -> Self {
    Self::new(0, 0)
  }
}

impl<T: Real> GradHelper<T> {
  pub fn new(max_concurrency: usize, max_sub_batch: usize) -> Self {
    Self {
      max_concurrency,
      max_sub_batch,
      pool: GradientPool::new(),
      threads: None,
    }
  }

  pub fn pool(&self) -> &GradientPool<T> {
    &self.pool
  }

  pub fn sub_batch_size(&self) -> usize {
    if self.max_sub_batch == 0 { DEFAULT_MAX_SUB_BATCH } else { self.max_sub_batch }
  }

  pub fn concurrency(&self) -> usize {
    if self.max_concurrency == 0 {
      std::thread::available_parallelism().map_or(1, |n| n.get() )
    } else {
      self.max_concurrency
    }
  }

  fn workers(&self, num_samples: usize) -> usize {
    let sub_batch = self.sub_batch_size();
    let workers = if num_samples < sub_batch {
      1
    } else {
      self.concurrency().min((num_samples + sub_batch - 1) / sub_batch)
    };
    debug!(samples = num_samples, sub_batch, workers, "distributing gradient computation");
    workers
  }

  // Sized by the concurrency limit so that varying batch sizes reuse the same threads
  fn thread_pool(&mut self) -> Option<&rayon::ThreadPool> {
    let size = self.concurrency();
    if self.threads.as_ref().map_or(true, |(threads, _)| *threads != size ) {
      self.threads = match rayon::ThreadPoolBuilder::new().num_threads(size).build() {
        Ok(pool) => Some((size, pool)),
        Err(err) => {
          warn!("failed to build gradient worker pool, running synchronously: {err}");
          None
        },
      };
    }
    self.threads.as_ref().map(|(_, pool)| pool )
  }

  /// Sum `f` over all sub-batches of `samples`.
  ///
  /// `f` adds the gradient of one sub-batch into the given accumulator.

  pub fn gradient<S, F>(&mut self, params: &[&Parameter<T>], samples: &[S], f: F) -> PooledGradient<T>
  where
    S: Sync,
    F: Fn(&mut Gradient<T>, &[S]) + Sync,
  {
    let sub_batch = self.sub_batch_size();
    let workers = self.workers(samples.len());
    let accumulators: Vec<_> = (0..workers).map(|_| self.pool.alloc(params) ).collect();

    let run_sync = |mut accumulators: Vec<PooledGradient<T>>| {
      let mut g = accumulators.swap_remove(0);
      for chunk in samples.chunks(sub_batch) {
        f(&mut *g, chunk);
      }
      g
    };
    if workers < 2 { return run_sync(accumulators) }
    let Some(threads) = self.thread_pool() else { return run_sync(accumulators) };

    let chunks: Vec<&[S]> = samples.chunks(sub_batch).collect();
    let next = AtomicUsize::new(0);
    let partials: Vec<PooledGradient<T>> = threads.install(|| {
      accumulators.into_par_iter().map(|mut g| {
        while let Some(chunk) = chunks.get(next.fetch_add(1, Ordering::Relaxed)) {
          f(&mut *g, chunk);
        }
        g
      }).collect()
    });

    let mut partials = partials.into_iter();
    let mut total = match partials.next() {
      Some(total) => total,
      None => return self.pool.alloc(params),
    };
    for partial in partials {
      total.add(&partial);
    }
    total
  }

  /// Like [gradient](Self::gradient) for functions that accumulate a
  /// Gradient and an RGradient at once.

  pub fn rgradient<S, F>(&mut self, params: &[&Parameter<T>], samples: &[S], f: F) -> (PooledGradient<T>, PooledGradient<T>)
  where
    S: Sync,
    F: Fn(&mut Gradient<T>, &mut RGradient<T>, &[S]) + Sync,
  {
    let sub_batch = self.sub_batch_size();
    let workers = self.workers(samples.len());
    let accumulators: Vec<_> = (0..workers)
      .map(|_| (self.pool.alloc(params), self.pool.alloc(params)) )
      .collect();

    let run_sync = |mut accumulators: Vec<(PooledGradient<T>, PooledGradient<T>)>| {
      let (mut g, mut rg) = accumulators.swap_remove(0);
      for chunk in samples.chunks(sub_batch) {
        f(&mut *g, &mut *rg, chunk);
      }
      (g, rg)
    };
    if workers < 2 { return run_sync(accumulators) }
    let Some(threads) = self.thread_pool() else { return run_sync(accumulators) };

    let chunks: Vec<&[S]> = samples.chunks(sub_batch).collect();
    let next = AtomicUsize::new(0);
    let partials: Vec<(PooledGradient<T>, PooledGradient<T>)> = threads.install(|| {
      accumulators.into_par_iter().map(|(mut g, mut rg)| {
        while let Some(chunk) = chunks.get(next.fetch_add(1, Ordering::Relaxed)) {
          f(&mut *g, &mut *rg, chunk);
        }
        (g, rg)
      }).collect()
    });

    let mut partials = partials.into_iter();
    let (mut total, mut rtotal) = match partials.next() {
      Some(totals) => totals,
      None => return (self.pool.alloc(params), self.pool.alloc(params)),
    };
    for (partial, rpartial) in partials {
      total.add(&partial);
      rtotal.add(&rpartial);
    }
    (total, rtotal)
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  fn count_samples(helper: &mut GradHelper<f64>, param: &Parameter<f64>, samples: &[f64]) -> Gradient<f64> {
    helper.gradient(&[param], samples, |g, chunk| {
      assert!(chunk.len() <= 3);
      g.accumulate(param.id(), &[chunk.len() as f64, chunk.iter().sum()]);
    }).into_inner()
  }

  #[test]
  fn concurrency_preserves_sum() {
    let param = Parameter::zeros(2);
    let samples: Vec<f64> = (0..20).map(|i| i as f64 ).collect();
    let single = count_samples(&mut GradHelper::new(1, 3), &param, &samples);
    let pooled = count_samples(&mut GradHelper::new(4, 3), &param, &samples);
    assert_eq!(single.get(param.id()), Some(&vec![20.0, 190.0]));
    assert_eq!(pooled, single);
  }

  #[test]
  fn small_batches_run_synchronously() {
    let mut helper = GradHelper::<f64>::new(8, 0);
    assert_eq!(helper.workers(DEFAULT_MAX_SUB_BATCH - 1), 1);
    assert_eq!(helper.workers(DEFAULT_MAX_SUB_BATCH * 3), 3);
    let param = Parameter::zeros(1);
    let (g, rg) = helper.rgradient(&[&param], &[1.0, 2.0], |g, rg, chunk| {
      g.accumulate(param.id(), &[chunk.len() as f64]);
      rg.accumulate(param.id(), &[-1.0]);
    });
    assert_eq!(g.get(param.id()), Some(&vec![2.0]));
    assert_eq!(rg.get(param.id()), Some(&vec![-1.0]));
  }

  #[test]
  fn partials_return_to_pool() {
    let mut helper = GradHelper::<f64>::new(3, 1);
    let param = Parameter::zeros(1);
    let g = helper.gradient(&[&param], &[1.0, 2.0, 3.0], |g, chunk| g.accumulate(param.id(), chunk) );
    assert_eq!(g.get(param.id()), Some(&vec![6.0]));
    assert_eq!(helper.pool().free_count(), 2);
    drop(g);
    assert_eq!(helper.pool().free_count(), 3);
  }

  #[test]
  fn varying_batches_keep_threads() {
    let mut helper = GradHelper::<f64>::new(4, 2);
    let param = Parameter::zeros(2);
    for count in [4, 8, 6, 20, 4] {
      let samples: Vec<f64> = (0..count).map(|i| i as f64 ).collect();
      let g = count_samples(&mut helper, &param, &samples);
      assert_eq!(g.get(param.id()).map(|values| values[0] ), Some(count as f64));
      assert_eq!(helper.threads.as_ref().map(|(size, _)| *size ), Some(4));
    }
  }
}
