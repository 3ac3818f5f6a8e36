use serde::{ Serialize, Deserialize };

use crate::{
  internal::*,
  scalar::Real,
  variable::{ UnaryOp, BinaryOp, MultiOp },
};


fn num_rows(len: usize, width: usize) -> usize {
  assert!(width > 0, "Cannot batch rows of zero width");
  assert!(len % width == 0, "{len} values do not form rows of width {width}");
  len / width
}

fn zip_map<T: Real>(lhs: &[T], rhs: &[T], cb: impl Fn(T, T) -> T) -> Vec<T> {
  assert_eq!(lhs.len(), rhs.len(), "Elementwise operation on vectors of length {} and {}", lhs.len(), rhs.len());
  lhs.iter().zip(rhs).map(|(&a, &b)| cb(a, b) ).collect()
}


#[derive(Debug, Clone, Copy)]
pub struct Add;

impl<T: Real> BinaryOp<T> for Add {
  fn run(&self, lhs: &[T], rhs: &[T]) -> Vec<T> {
    zip_map(lhs, rhs, |a, b| a + b )
  }

  fn run_r(&self, _lhs: &[T], lhs_r: &[T], _rhs: &[T], rhs_r: &[T]) -> Vec<T> {
    zip_map(lhs_r, rhs_r, |a, b| a + b )
  }

  fn derive(&self, _lhs: &[T], _rhs: &[T], grad: &[T]) -> (Vec<T>, Vec<T>) {
    (grad.to_vec(), grad.to_vec())
  }

  fn derive_r(&self, _lhs: &[T], _lhs_r: &[T], _rhs: &[T], _rhs_r: &[T], _grad: &[T], grad_r: &[T]) -> (Vec<T>, Vec<T>) {
    (grad_r.to_vec(), grad_r.to_vec())
  }
}


#[derive(Debug, Clone, Copy)]
pub struct Sub;

impl<T: Real> BinaryOp<T> for Sub {
  fn run(&self, lhs: &[T], rhs: &[T]) -> Vec<T> {
    zip_map(lhs, rhs, |a, b| a - b )
  }

  fn run_r(&self, _lhs: &[T], lhs_r: &[T], _rhs: &[T], rhs_r: &[T]) -> Vec<T> {
    zip_map(lhs_r, rhs_r, |a, b| a - b )
  }

  fn derive(&self, _lhs: &[T], _rhs: &[T], grad: &[T]) -> (Vec<T>, Vec<T>) {
    (grad.to_vec(), grad.iter().map(|&g| -g ).collect())
  }

  fn derive_r(&self, _lhs: &[T], _lhs_r: &[T], _rhs: &[T], _rhs_r: &[T], _grad: &[T], grad_r: &[T]) -> (Vec<T>, Vec<T>) {
    (grad_r.to_vec(), grad_r.iter().map(|&g| -g ).collect())
  }
}


#[derive(Debug, Clone, Copy)]
pub struct Mul;

impl<T: Real> BinaryOp<T> for Mul {
  fn run(&self, lhs: &[T], rhs: &[T]) -> Vec<T> {
    zip_map(lhs, rhs, |a, b| a * b )
  }

  fn run_r(&self, lhs: &[T], lhs_r: &[T], rhs: &[T], rhs_r: &[T]) -> Vec<T> {
    let mut result = zip_map(lhs_r, rhs, |a, b| a * b );
    add_into(&mut result, &zip_map(lhs, rhs_r, |a, b| a * b ));
    result
  }

  fn derive(&self, lhs: &[T], rhs: &[T], grad: &[T]) -> (Vec<T>, Vec<T>) {
    (zip_map(grad, rhs, |g, b| g * b ), zip_map(grad, lhs, |g, a| g * a ))
  }

  fn derive_r(&self, lhs: &[T], lhs_r: &[T], rhs: &[T], rhs_r: &[T], grad: &[T], grad_r: &[T]) -> (Vec<T>, Vec<T>) {
    let mut lhs_grad = zip_map(grad_r, rhs, |g, b| g * b );
    add_into(&mut lhs_grad, &zip_map(grad, rhs_r, |g, b| g * b ));
    let mut rhs_grad = zip_map(grad_r, lhs, |g, a| g * a );
    add_into(&mut rhs_grad, &zip_map(grad, lhs_r, |g, a| g * a ));
    (lhs_grad, rhs_grad)
  }
}


/// Batched product of a row-major `rows × cols` weight matrix (lhs)
/// with every row of an `n × cols` input (rhs), yielding `n × rows`.

#[derive(Debug, Clone, Copy)]
pub struct MatMul {
  pub rows: usize,
  pub cols: usize,
}

impl MatMul {
  fn lanes<T: Real>(&self, weights: &[T], input: &[T]) -> usize {
    assert_eq!(weights.len(), self.rows * self.cols, "Weights do not form a {}x{} matrix", self.rows, self.cols);
    num_rows(input.len(), self.cols)
  }

  // out += input · weights^T
  fn forward<T: Real>(&self, n: usize, weights: &[T], input: &[T], out: &mut [T]) {
    T::gemm(n, self.cols, self.rows, input, (self.cols, 1), weights, (1, self.cols), out, (self.rows, 1));
  }

  // out += grad^T · input
  fn weight_grad<T: Real>(&self, n: usize, input: &[T], grad: &[T], out: &mut [T]) {
    T::gemm(self.rows, n, self.cols, grad, (1, self.rows), input, (self.cols, 1), out, (self.cols, 1));
  }

  // out += grad · weights
  fn input_grad<T: Real>(&self, n: usize, weights: &[T], grad: &[T], out: &mut [T]) {
    T::gemm(n, self.rows, self.cols, grad, (self.rows, 1), weights, (self.cols, 1), out, (self.cols, 1));
  }
}

impl<T: Real> BinaryOp<T> for MatMul {
  fn run(&self, lhs: &[T], rhs: &[T]) -> Vec<T> {
    let n = self.lanes(lhs, rhs);
    let mut out = vec![T::zero(); n * self.rows];
    self.forward(n, lhs, rhs, &mut out);
    out
  }

  fn run_r(&self, lhs: &[T], lhs_r: &[T], rhs: &[T], rhs_r: &[T]) -> Vec<T> {
    let n = self.lanes(lhs, rhs);
    let mut out = vec![T::zero(); n * self.rows];
    self.forward(n, lhs_r, rhs, &mut out);
    self.forward(n, lhs, rhs_r, &mut out);
    out
  }

  fn derive(&self, lhs: &[T], rhs: &[T], grad: &[T]) -> (Vec<T>, Vec<T>) {
    let n = self.lanes(lhs, rhs);
    let mut weights_grad = vec![T::zero(); lhs.len()];
    let mut input_grad = vec![T::zero(); rhs.len()];
    self.weight_grad(n, rhs, grad, &mut weights_grad);
    self.input_grad(n, lhs, grad, &mut input_grad);
    (weights_grad, input_grad)
  }

  fn derive_r(&self, lhs: &[T], lhs_r: &[T], rhs: &[T], rhs_r: &[T], grad: &[T], grad_r: &[T]) -> (Vec<T>, Vec<T>) {
    let n = self.lanes(lhs, rhs);
    let mut weights_grad = vec![T::zero(); lhs.len()];
    let mut input_grad = vec![T::zero(); rhs.len()];
    self.weight_grad(n, rhs, grad_r, &mut weights_grad);
    self.weight_grad(n, rhs_r, grad, &mut weights_grad);
    self.input_grad(n, lhs, grad_r, &mut input_grad);
    self.input_grad(n, lhs_r, grad, &mut input_grad);
    (weights_grad, input_grad)
  }
}


/// Adds a bias vector (rhs) to every row of a batch (lhs).

#[derive(Debug, Clone, Copy)]
pub struct AddBias;

impl AddBias {
  fn broadcast<T: Real>(input: &[T], bias: &[T]) -> Vec<T> {
    if bias.is_empty() { return input.to_vec() }
    num_rows(input.len(), bias.len());
    input.chunks(bias.len())
      .flat_map(|row| row.iter().zip(bias).map(|(&x, &b)| x + b ) )
      .collect()
  }

  fn reduce<T: Real>(grad: &[T], width: usize) -> Vec<T> {
    let mut sum = vec![T::zero(); width];
    if width == 0 { return sum }
    for row in grad.chunks(width) {
      add_into(&mut sum, row);
    }
    sum
  }
}

impl<T: Real> BinaryOp<T> for AddBias {
  fn run(&self, lhs: &[T], rhs: &[T]) -> Vec<T> {
    Self::broadcast(lhs, rhs)
  }

  fn run_r(&self, _lhs: &[T], lhs_r: &[T], _rhs: &[T], rhs_r: &[T]) -> Vec<T> {
    Self::broadcast(lhs_r, rhs_r)
  }

  fn derive(&self, _lhs: &[T], rhs: &[T], grad: &[T]) -> (Vec<T>, Vec<T>) {
    (grad.to_vec(), Self::reduce(grad, rhs.len()))
  }

  fn derive_r(&self, _lhs: &[T], _lhs_r: &[T], rhs: &[T], _rhs_r: &[T], _grad: &[T], grad_r: &[T]) -> (Vec<T>, Vec<T>) {
    (grad_r.to_vec(), Self::reduce(grad_r, rhs.len()))
  }
}


/// Columns `start..start + len` of every row of width `width`.

#[derive(Debug, Clone, Copy)]
pub struct Select {
  pub width: usize,
  pub start: usize,
  pub len: usize,
}

impl Select {
  fn take<T: Real>(&self, input: &[T]) -> Vec<T> {
    assert!(self.start + self.len <= self.width, "Selection exceeds row width {}", self.width);
    if self.len == 0 { return vec![] }
    num_rows(input.len(), self.width);
    input.chunks(self.width)
      .flat_map(|row| row[self.start..self.start + self.len].iter().copied() )
      .collect()
  }

  fn scatter<T: Real>(&self, input_len: usize, grad: &[T]) -> Vec<T> {
    let mut result = vec![T::zero(); input_len];
    if self.len == 0 { return result }
    for (row, chunk) in result.chunks_mut(self.width).zip(grad.chunks(self.len)) {
      row[self.start..self.start + self.len].copy_from_slice(chunk);
    }
    result
  }
}

impl<T: Real> UnaryOp<T> for Select {
  fn run(&self, lhs: &[T]) -> Vec<T> {
    self.take(lhs)
  }

  fn run_r(&self, _lhs: &[T], lhs_r: &[T]) -> Vec<T> {
    self.take(lhs_r)
  }

  fn derive(&self, lhs: &[T], grad: &[T]) -> Vec<T> {
    self.scatter(lhs.len(), grad)
  }

  fn derive_r(&self, lhs: &[T], _lhs_r: &[T], _grad: &[T], grad_r: &[T]) -> Vec<T> {
    self.scatter(lhs.len(), grad_r)
  }
}


/// Row-wise concatenation of several batches with the given row widths.

#[derive(Debug, Clone)]
pub struct Join {
  pub widths: Vec<usize>,
}

impl Join {
  fn lanes<T: Real>(&self, inputs: &[&[T]]) -> usize {
    assert_eq!(inputs.len(), self.widths.len(), "Join expects {} inputs", self.widths.len());
    let (input, &width) = inputs.iter().zip(&self.widths)
      .find(|&(_, &width)| width > 0 )
      .unwrap_or_else(|| panic!("Cannot join rows of zero width") );
    num_rows(input.len(), width)
  }

  fn concat<T: Real>(&self, inputs: &[&[T]]) -> Vec<T> {
    let n = self.lanes(inputs);
    for (input, &width) in inputs.iter().zip(&self.widths) {
      assert_eq!(input.len(), n * width, "Joined inputs must have {n} rows");
    }
    (0..n).flat_map(move |i| {
      inputs.iter().zip(&self.widths)
        .flat_map(move |(input, &width)| input[i * width..(i + 1) * width].iter().copied() )
    }).collect()
  }

  fn split<T: Real>(&self, inputs: &[&[T]], grad: &[T]) -> Vec<Vec<T>> {
    let n = self.lanes(inputs);
    let total: usize = self.widths.iter().sum();
    let mut offset = 0;
    self.widths.iter().map(|&width| {
      let part: Vec<T> = (0..n)
        .flat_map(move |i| grad[i * total + offset..i * total + offset + width].iter().copied() )
        .collect();
      offset += width;
      part
    }).collect()
  }
}

impl<T: Real> MultiOp<T> for Join {
  fn run(&self, inputs: &[&[T]]) -> Vec<T> {
    self.concat(inputs)
  }

  fn run_r(&self, _inputs: &[&[T]], rinputs: &[&[T]]) -> Vec<T> {
    self.concat(rinputs)
  }

  fn derive(&self, inputs: &[&[T]], grad: &[T]) -> Vec<Vec<T>> {
    self.split(inputs, grad)
  }

  fn derive_r(&self, inputs: &[&[T]], _rinputs: &[&[T]], _grad: &[T], grad_r: &[T]) -> Vec<Vec<T>> {
    self.split(inputs, grad_r)
  }
}


#[derive(Debug, Clone, Copy)]
pub struct Scale<T: Real> {
  pub factor: T,
}

impl<T: Real> UnaryOp<T> for Scale<T> {
  fn run(&self, lhs: &[T]) -> Vec<T> {
    lhs.iter().map(|&x| x * self.factor ).collect()
  }

  fn run_r(&self, _lhs: &[T], lhs_r: &[T]) -> Vec<T> {
    self.run(lhs_r)
  }

  fn derive(&self, _lhs: &[T], grad: &[T]) -> Vec<T> {
    self.run(grad)
  }

  fn derive_r(&self, _lhs: &[T], _lhs_r: &[T], _grad: &[T], grad_r: &[T]) -> Vec<T> {
    self.run(grad_r)
  }
}


/// Elementwise activation functions.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
  Identity,
  Sigmoid,
  Tanh,
  ReLU,
  Square,
}

impl Activation {
  pub fn apply<T: Real>(&self, x: T) -> T {
    match self {
      Self::Identity => x,
      Self::Sigmoid => T::one() / (T::one() + (-x).exp()),
      Self::Tanh => x.tanh(),
      Self::ReLU => x.max(T::zero()),
      Self::Square => x * x,
    }
  }

  pub fn derivative<T: Real>(&self, x: T) -> T {
    match self {
      Self::Identity => T::one(),
      Self::Sigmoid => {
        let s = self.apply(x);
        s * (T::one() - s)
      },
      Self::Tanh => {
        let t = x.tanh();
        T::one() - t * t
      },
      Self::ReLU => if x > T::zero() { T::one() } else { T::zero() },
      Self::Square => x + x,
    }
  }

  pub fn second_derivative<T: Real>(&self, x: T) -> T {
    let two = T::one() + T::one();
    match self {
      Self::Identity | Self::ReLU => T::zero(),
      Self::Sigmoid => {
        let s = self.apply(x);
        s * (T::one() - s) * (T::one() - two * s)
      },
      Self::Tanh => {
        let t = x.tanh();
        -two * t * (T::one() - t * t)
      },
      Self::Square => two,
    }
  }
}

impl<T: Real> UnaryOp<T> for Activation {
  fn run(&self, lhs: &[T]) -> Vec<T> {
    lhs.iter().map(|&x| self.apply(x) ).collect()
  }

  fn run_r(&self, lhs: &[T], lhs_r: &[T]) -> Vec<T> {
    zip_map(lhs, lhs_r, |x, r| self.derivative(x) * r )
  }

  fn derive(&self, lhs: &[T], grad: &[T]) -> Vec<T> {
    zip_map(lhs, grad, |x, g| self.derivative(x) * g )
  }

  fn derive_r(&self, lhs: &[T], lhs_r: &[T], grad: &[T], grad_r: &[T]) -> Vec<T> {
    lhs.iter().zip(lhs_r).zip(grad.iter().zip(grad_r))
      .map(|((&x, &r), (&g, &gr))| gr * self.derivative(x) + g * self.second_derivative(x) * r )
      .collect()
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn matmul() {
    // W = [[1, 2], [3, 4], [5, 6]], two lanes
    let w = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let x = [1.0, 0.0, 0.0, 1.0];
    let op = MatMul { rows: 3, cols: 2 };
    assert_eq!(op.run(&w, &x), vec![1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
    let grad = [1.0, 0.0, 0.0, 0.0, 0.0, 1.0];
    let (gw, gx) = op.derive(&w, &x, &grad);
    assert_eq!(gw, vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
    assert_eq!(gx, vec![1.0, 2.0, 5.0, 6.0]);
  }

  #[test]
  fn bias() {
    let out = BinaryOp::<f64>::run(&AddBias, &[1.0, 2.0, 3.0, 4.0], &[10.0, 20.0]);
    assert_eq!(out, vec![11.0, 22.0, 13.0, 24.0]);
    let (_, gb) = BinaryOp::<f64>::derive(&AddBias, &[0.0; 4], &[0.0; 2], &[1.0, 2.0, 3.0, 4.0]);
    assert_eq!(gb, vec![4.0, 6.0]);
  }

  #[test]
  fn select_and_join() {
    let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let select = Select { width: 3, start: 1, len: 2 };
    assert_eq!(UnaryOp::<f64>::run(&select, &data), vec![2.0, 3.0, 5.0, 6.0]);
    assert_eq!(UnaryOp::<f64>::derive(&select, &data, &[1.0, 1.0, 1.0, 1.0]), vec![0.0, 1.0, 1.0, 0.0, 1.0, 1.0]);
    let join = Join { widths: vec![1, 2] };
    let joined = MultiOp::<f64>::run(&join, &[&[1.0, 4.0], &[2.0, 3.0, 5.0, 6.0]]);
    assert_eq!(joined, data.to_vec());
    let split = MultiOp::<f64>::derive(&join, &[&[1.0, 4.0], &[2.0, 3.0, 5.0, 6.0]], &data);
    assert_eq!(split, vec![vec![1.0, 4.0], vec![2.0, 3.0, 5.0, 6.0]]);
  }

  #[test]
  fn activation_derivatives() {
    let eps = 1e-6;
    for activation in [Activation::Sigmoid, Activation::Tanh, Activation::Square] {
      for x in [-1.3f64, 0.2, 0.9] {
        let numeric = (activation.apply(x + eps) - activation.apply(x - eps)) / (2.0 * eps);
        assert!((numeric - activation.derivative(x)).abs() < 1e-6);
        let numeric = (activation.derivative(x + eps) - activation.derivative(x - eps)) / (2.0 * eps);
        assert!((numeric - activation.second_derivative(x)).abs() < 1e-6);
      }
    }
  }
}
