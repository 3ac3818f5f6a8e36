use serde::{ Serialize, Deserialize };

use crate::scalar::Real;


/// Scalar loss comparing one output vector with its expected value.

pub trait CostFunc<T: Real>: Send + Sync {
  fn cost(&self, actual: &[T], expected: &[T]) -> T;

  /// Derivative of the cost with respect to every component of `actual`.
  fn gradient(&self, actual: &[T], expected: &[T]) -> Vec<T>;

  /// Gradient together with its directional derivative, given the R-value of `actual`.
  fn gradient_r(&self, actual: &[T], ractual: &[T], expected: &[T]) -> (Vec<T>, Vec<T>);
}


fn check_lengths<T>(actual: &[T], expected: &[T]) {
  assert_eq!(actual.len(), expected.len(), "Output has {} components but {} are expected", actual.len(), expected.len());
}


/// Half the squared euclidean distance.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeanSquaredCost;

impl<T: Real> CostFunc<T> for MeanSquaredCost {
  fn cost(&self, actual: &[T], expected: &[T]) -> T {
    check_lengths(actual, expected);
    let half = T::from(0.5).unwrap();
    actual.iter().zip(expected).map(|(&a, &e)| (a - e) * (a - e) ).sum::<T>() * half
  }

  fn gradient(&self, actual: &[T], expected: &[T]) -> Vec<T> {
    check_lengths(actual, expected);
    actual.iter().zip(expected).map(|(&a, &e)| a - e ).collect()
  }

  fn gradient_r(&self, actual: &[T], ractual: &[T], expected: &[T]) -> (Vec<T>, Vec<T>) {
    check_lengths(actual, ractual);
    (self.gradient(actual, expected), ractual.to_vec())
  }
}


/// Binary cross entropy for outputs in (0, 1).

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossEntropyCost;

impl<T: Real> CostFunc<T> for CrossEntropyCost {
  fn cost(&self, actual: &[T], expected: &[T]) -> T {
    check_lengths(actual, expected);
    -actual.iter().zip(expected).map(|(&a, &e)| {
      e * a.ln() + (T::one() - e) * (T::one() - a).ln()
    }).sum::<T>()
  }

  fn gradient(&self, actual: &[T], expected: &[T]) -> Vec<T> {
    check_lengths(actual, expected);
    actual.iter().zip(expected).map(|(&a, &e)| (a - e) / (a * (T::one() - a)) ).collect()
  }

  fn gradient_r(&self, actual: &[T], ractual: &[T], expected: &[T]) -> (Vec<T>, Vec<T>) {
    check_lengths(actual, ractual);
    let two = T::from(2.0).unwrap();
    let rgrad = actual.iter().zip(ractual).zip(expected).map(|((&a, &ra), &e)| {
      let denom = a - a * a;
      ra * (denom - (a - e) * (T::one() - two * a)) / (denom * denom)
    }).collect();
    (self.gradient(actual, expected), rgrad)
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn mean_squared() {
    let cost: &dyn CostFunc<f64> = &MeanSquaredCost;
    assert_eq!(cost.cost(&[1.0, 3.0], &[0.0, 1.0]), 2.5);
    assert_eq!(cost.gradient(&[1.0, 3.0], &[0.0, 1.0]), vec![1.0, 2.0]);
    assert_eq!(cost.gradient_r(&[1.0, 3.0], &[0.5, -1.0], &[0.0, 1.0]).1, vec![0.5, -1.0]);
  }

  #[test]
  fn cross_entropy_derivatives() {
    let cost: &dyn CostFunc<f64> = &CrossEntropyCost;
    let (a, e, eps) = (0.3, 0.8, 1e-6);
    let numeric = (cost.cost(&[a + eps], &[e]) - cost.cost(&[a - eps], &[e])) / (2.0 * eps);
    assert!((cost.gradient(&[a], &[e])[0] - numeric).abs() < 1e-6);

    let numeric_r = (cost.gradient(&[a + eps], &[e])[0] - cost.gradient(&[a - eps], &[e])[0]) / (2.0 * eps);
    let (_, rgrad) = cost.gradient_r(&[a], &[2.0], &[e]);
    assert!((rgrad[0] - 2.0 * numeric_r).abs() < 1e-5);
  }

  #[test]
  #[should_panic(expected = "but 1 are expected")]
  fn length_mismatch() {
    CostFunc::<f32>::cost(&MeanSquaredCost, &[1.0, 2.0], &[1.0]);
  }
}
