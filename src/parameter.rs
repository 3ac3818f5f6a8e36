use serde::{ Serialize, Deserialize };

use crate::{
  internal::*,
  scalar::Real,
};


/// Stable handle identifying a trainable [Parameter].
///
/// Handles are unique within a process and never reused.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(usize);

impl ParamId {
  pub fn fresh() -> Self {
    Self(make_id())
  }
}


/// A trainable vector of weights.
///
/// Matrices are stored row-major; the owning layer knows their shape.
/// Clones are independent parameters and receive their own [ParamId].

#[derive(Debug, Serialize, Deserialize)]
pub struct Parameter<T: Real> {
  #[serde(skip, default = "ParamId::fresh")]
  id: ParamId,
  pub data: Vec<T>,
}

impl<T: Real> Parameter<T> {
  pub fn new(data: Vec<T>) -> Self {
    Self { id: ParamId::fresh(), data }
  }

  pub fn zeros(len: usize) -> Self {
    Self::new(vec![T::zero(); len])
  }

  pub fn fill(len: usize, filler: T) -> Self {
    Self::new(vec![filler; len])
  }

  /// Normally distributed weights with standard deviation `scale`.

  pub fn randn(len: usize, scale: T) -> Self {
    Self::new(randn_vec(len, scale))
  }

  pub fn id(&self) -> ParamId {
    self.id
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }
}

impl<T: Real> Clone for Parameter<T> {
  fn clone(&self) -> Self {
    Self::new(self.data.clone())
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn clones_get_own_identity() {
    let p = Parameter::<f64>::randn(7, 0.1);
    let q = p.clone();
    assert_ne!(p.id(), q.id());
    assert_eq!(p.data, q.data);
    assert_ne!(p.id(), Parameter::<f64>::zeros(7).id());
  }
}
