use std::sync::atomic::{ AtomicUsize, Ordering };

use rand::Rng;

use crate::scalar::Real;


pub fn make_id() -> usize {
  static LAST_ID: AtomicUsize = AtomicUsize::new(0);
  LAST_ID.fetch_add(1, Ordering::Relaxed)
}


// Polar Box-Muller transformation

pub fn randn<T: Real>() -> (T, T) {
  let mut rng = rand::thread_rng();
  let u = rng.gen_range(-T::one(), T::one());
  let v = rng.gen_range(-T::one(), T::one());
  let r = u * u + v * v;
  // Try again if outside interval
  if r == T::zero() || r >= T::one() { return randn() }
  let c = (T::from(-2.0).unwrap() * r.ln() / r).sqrt();
  (u * c, v * c)
}


pub fn randn_vec<T: Real>(len: usize, scale: T) -> Vec<T> {
  let mut values = Vec::with_capacity(len + 1);
  while values.len() < len {
    let (a, b) = randn::<T>();
    values.push(a * scale);
    values.push(b * scale);
  }
  values.truncate(len);
  values
}


#[inline]
pub fn add_into<T: Real>(dst: &mut [T], src: &[T]) {
  assert_eq!(dst.len(), src.len(), "Cannot add vectors of length {} and {}", src.len(), dst.len());
  for (d, &s) in dst.iter_mut().zip(src) {
    *d += s;
  }
}


pub fn add_vecs<T: Real>(lhs: &[T], rhs: &[T]) -> Vec<T> {
  let mut sum = lhs.to_vec();
  add_into(&mut sum, rhs);
  sum
}


/// Split a packed batch into `n` equally sized rows.

pub fn split_rows<T: Real>(data: &[T], n: usize) -> Vec<Vec<T>> {
  if n == 0 { return vec![] }
  assert!(data.len() % n == 0, "Cannot split {} values into {n} lanes", data.len());
  let width = data.len() / n;
  if width == 0 { return vec![vec![]; n] }
  data.chunks(width).map(|row| row.to_vec() ).collect()
}


/// Pack equally sized rows into one contiguous batch.

pub fn join_rows<T: Real>(rows: &[Vec<T>]) -> Vec<T> {
  if let Some(first) = rows.first() {
    assert!(rows.iter().all(|row| row.len() == first.len() ), "Cannot pack rows of differing width");
  }
  rows.concat()
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ids_are_unique() {
    let a = make_id();
    let b = make_id();
    assert!(b > a);
  }

  #[test]
  fn gaussian_vector_length() {
    assert_eq!(randn_vec::<f64>(5, 1.0).len(), 5);
    assert_eq!(randn_vec::<f32>(0, 1.0).len(), 0);
  }

  #[test]
  fn rows() {
    let rows = split_rows(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 3);
    assert_eq!(rows, vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]);
    assert_eq!(join_rows(&rows), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
  }

  #[test]
  #[should_panic]
  fn uneven_split() {
    split_rows(&[1.0, 2.0, 3.0], 2);
  }
}
