use serde::{ Serialize, Deserialize };

use crate::scalar::Real;


/// Training sample pairing one input with one expected output per timestep.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence<T: Real> {
  pub inputs: Vec<Vec<T>>,
  pub outputs: Vec<Vec<T>>,
}

impl<T: Real> Sequence<T> {
  pub fn new(inputs: Vec<Vec<T>>, outputs: Vec<Vec<T>>) -> Self {
    assert_eq!(inputs.len(), outputs.len(), "Sequence has {} inputs but {} outputs", inputs.len(), outputs.len());
    Self { inputs, outputs }
  }

  pub fn len(&self) -> usize {
    self.inputs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.inputs.is_empty()
  }
}


/// Order samples by descending length, keeping the relative order of equals.
///
/// Lanes of a batch then drop out strictly from the back.

pub fn sort_by_length<T: Real>(samples: &mut [Sequence<T>]) {
  samples.sort_by(|a, b| b.len().cmp(&a.len()) );
}


pub fn max_length<T: Real>(samples: &[Sequence<T>]) -> usize {
  samples.iter().map(|sample| sample.len() ).max().unwrap_or(0)
}
