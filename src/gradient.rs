use std::collections::HashMap;
use std::sync::Arc;
use std::ops::{ Deref, DerefMut };

use parking_lot::Mutex;

use crate::{
  internal::*,
  scalar::Real,
  parameter::{ ParamId, Parameter },
};


/// Accumulated partial derivatives, one vector per [Parameter].
///
/// A Gradient gets created zeroed for a fixed set of parameters
/// and is only ever added to or zeroed afterwards.

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Gradient<T: Real> {
  entries: HashMap<ParamId, Vec<T>>,
}

/// Directional derivative of a [Gradient], as produced by the R-operator.

pub type RGradient<T> = Gradient<T>;

/// Perturbation direction over parameters for the R-operator.

pub type RVector<T> = Gradient<T>;

impl<T: Real> Gradient<T> {
  pub fn new(params: &[&Parameter<T>]) -> Self {
    Self {
      entries: params.iter()
        .map(|param| (param.id(), vec![T::zero(); param.len()]) )
        .collect(),
    }
  }

  /// Random direction with normally distributed components.

  pub fn randn(params: &[&Parameter<T>]) -> Self {
    Self {
      entries: params.iter()
        .map(|param| (param.id(), randn_vec(param.len(), T::one())) )
        .collect(),
    }
  }

  pub fn zero(&mut self) {
    for values in self.entries.values_mut() {
      values.iter_mut().for_each(|v| *v = T::zero() );
    }
  }

  /// Add `other` component-wise. Both must cover the same parameters.

  pub fn add(&mut self, other: &Self) {
    assert_eq!(self.len(), other.len(), "Cannot add gradients over differing parameters");
    for (id, values) in &mut self.entries {
      let rhs = other.entries.get(id)
        .unwrap_or_else(|| panic!("Cannot add gradients over differing parameters ({id:?} missing)") );
      add_into(values, rhs);
    }
  }

  pub fn scale(&mut self, factor: T) {
    for values in self.entries.values_mut() {
      values.iter_mut().for_each(|v| *v *= factor );
    }
  }

  /// Add `change` to the entry for `id`, if this Gradient tracks it.

  pub fn accumulate(&mut self, id: ParamId, change: &[T]) {
    if let Some(values) = self.entries.get_mut(&id) {
      add_into(values, change);
    }
  }

  pub fn get(&self, id: ParamId) -> Option<&Vec<T>> {
    self.entries.get(&id)
  }

  pub fn get_mut(&mut self, id: ParamId) -> Option<&mut Vec<T>> {
    self.entries.get_mut(&id)
  }

  pub fn contains(&self, id: ParamId) -> bool {
    self.entries.contains_key(&id)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&ParamId, &Vec<T>)> {
    self.entries.iter()
  }

  /// Whether this Gradient has exactly one correctly sized entry per parameter.

  pub fn matches(&self, params: &[&Parameter<T>]) -> bool {
    self.entries.len() == params.len() && params.iter().all(|param| {
      self.entries.get(&param.id()).map_or(false, |values| values.len() == param.len() )
    })
  }

  /// Largest absolute component-wise difference to `other`.

  pub fn max_difference(&self, other: &Self) -> T {
    self.entries.iter().fold(T::zero(), |max, (id, values)| {
      let rhs = other.entries.get(id)
        .unwrap_or_else(|| panic!("Cannot compare gradients over differing parameters ({id:?} missing)") );
      values.iter().zip(rhs).fold(max, |max, (&a, &b)| max.max((a - b).abs()) )
    })
  }
}


/// Free-list of zeroed [Gradient]s for one parameter set.
///
/// Cloning a pool yields another handle onto the same free-list.

#[derive(Debug)]
pub struct GradientPool<T: Real> {
  free: Arc<Mutex<Vec<Gradient<T>>>>,
}

impl<T: Real> Clone for GradientPool<T> {
  fn clone(&self) -> Self {
    Self { free: self.free.clone() }
  }
}

impl<T: Real> Default for GradientPool<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Real> GradientPool<T> {
  pub fn new() -> Self {
    Self { free: Arc::new(Mutex::new(vec![])) }
  }

  /// Check out a zeroed Gradient for `params`.
  ///
  /// Buffers pooled for a different parameter set get discarded.

  pub fn alloc(&self, params: &[&Parameter<T>]) -> PooledGradient<T> {
    let reused = {
      let mut free = self.free.lock();
      if free.last().map_or(false, |grad| !grad.matches(params) ) {
        free.clear();
      }
      free.pop()
    };
    let gradient = match reused {
      Some(mut grad) => {
        grad.zero();
        grad
      },
      None => Gradient::new(params),
    };
    PooledGradient { gradient, pool: Some(self.clone()) }
  }

  pub fn free_count(&self) -> usize {
    self.free.lock().len()
  }

  fn release(&self, gradient: Gradient<T>) {
    self.free.lock().push(gradient);
  }
}


/// A [Gradient] checked out of a [GradientPool].
///
/// Returns itself to the pool when dropped.

#[derive(Debug)]
pub struct PooledGradient<T: Real> {
  gradient: Gradient<T>,
  pool: Option<GradientPool<T>>,
}

impl<T: Real> PooledGradient<T> {
  /// Detach from the pool, taking ownership of the Gradient.

  pub fn into_inner(mut self) -> Gradient<T> {
    self.pool = None;
    std::mem::take(&mut self.gradient)
  }
}

impl<T: Real> From<Gradient<T>> for PooledGradient<T> {
  fn from(gradient: Gradient<T>) -> Self {
    Self { gradient, pool: None }
  }
}

impl<T: Real> Deref for PooledGradient<T> {
  type Target = Gradient<T>;

  fn deref(&self) -> &Self::Target {
    &self.gradient
  }
}

impl<T: Real> DerefMut for PooledGradient<T> {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.gradient
  }
}

impl<T: Real> Drop for PooledGradient<T> {
  fn drop(&mut self) {
    if let Some(pool) = self.pool.take() {
      pool.release(std::mem::take(&mut self.gradient));
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn accumulate_and_add() {
    let a = Parameter::<f64>::zeros(2);
    let b = Parameter::<f64>::zeros(3);
    let other = Parameter::<f64>::zeros(1);
    let mut g = Gradient::new(&[&a, &b]);
    g.accumulate(a.id(), &[1.0, 2.0]);
    g.accumulate(other.id(), &[5.0]);
    assert!(!g.contains(other.id()));
    let mut h = Gradient::new(&[&a, &b]);
    h.accumulate(b.id(), &[1.0, 1.0, 1.0]);
    h.add(&g);
    assert_eq!(h.get(a.id()), Some(&vec![1.0, 2.0]));
    assert_eq!(h.get(b.id()), Some(&vec![1.0, 1.0, 1.0]));
    h.zero();
    assert_eq!(h, Gradient::new(&[&a, &b]));
  }

  #[test]
  #[should_panic(expected = "differing parameters")]
  fn add_rejects_extra_entries() {
    let a = Parameter::<f64>::zeros(2);
    let b = Parameter::<f64>::zeros(1);
    let mut g = Gradient::new(&[&a]);
    g.add(&Gradient::new(&[&a, &b]));
  }

  #[test]
  fn pool_reuses_zeroed() {
    let a = Parameter::<f64>::zeros(4);
    let pool = GradientPool::new();
    {
      let mut g = pool.alloc(&[&a]);
      g.accumulate(a.id(), &[1.0; 4]);
    }
    assert_eq!(pool.free_count(), 1);
    let g = pool.alloc(&[&a]);
    assert_eq!(pool.free_count(), 0);
    assert_eq!(g.get(a.id()), Some(&vec![0.0; 4]));
    let owned = g.into_inner();
    assert_eq!(pool.free_count(), 0);
    assert!(owned.matches(&[&a]));
  }

  #[test]
  fn pool_discards_foreign_shapes() {
    let a = Parameter::<f64>::zeros(4);
    let b = Parameter::<f64>::zeros(2);
    let pool = GradientPool::new();
    drop(pool.alloc(&[&a]));
    let g = pool.alloc(&[&b]);
    assert!(g.matches(&[&b]));
    assert_eq!(pool.free_count(), 0);
  }
}
