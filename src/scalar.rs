use std::fmt::Debug;
use std::iter::Sum;

use rand::distributions::uniform::SampleUniform;
use num_traits::{ Float, NumAssignOps };


/// Continuous scalar types that blocks can be trained over.
///
/// Besides the usual float arithmetic, every implementation provides
/// a general matrix product kernel. The default is a naive strided loop;
/// `f32` and `f64` switch to [matrixmultiply] when the `unsafe`
/// feature is enabled.

pub trait Real: Float + NumAssignOps + Sum + SampleUniform + Default + Debug + Send + Sync + 'static {

  /// Compute `c += a · b` where `a` is `m × k` and `b` is `k × n`.
  ///
  /// Each matrix is addressed through a `(row_stride, col_stride)` pair,
  /// allowing transposed operands without copying.

  fn gemm(
    m: usize, k: usize, n: usize,
    a: &[Self], a_strides: (usize, usize),
    b: &[Self], b_strides: (usize, usize),
    c: &mut [Self], c_strides: (usize, usize),
  ) {
    for i in 0..m {
      for j in 0..n {
        let mut sum = Self::zero();
        for l in 0..k {
          sum += a[i * a_strides.0 + l * a_strides.1] * b[l * b_strides.0 + j * b_strides.1];
        }
        c[i * c_strides.0 + j * c_strides.1] += sum;
      }
    }
  }
}


#[cfg(feature = "unsafe")]
fn check_bounds<T>(rows: usize, cols: usize, data: &[T], strides: (usize, usize)) {
  if rows == 0 || cols == 0 { return }
  let last = (rows - 1) * strides.0 + (cols - 1) * strides.1;
  assert!(last < data.len(), "Matrix of {rows}x{cols} does not fit into {} elements", data.len());
}


impl Real for f32 {
  #[cfg(feature = "unsafe")]
  fn gemm(
    m: usize, k: usize, n: usize,
    a: &[Self], a_strides: (usize, usize),
    b: &[Self], b_strides: (usize, usize),
    c: &mut [Self], c_strides: (usize, usize),
  ) {
    check_bounds(m, k, a, a_strides);
    check_bounds(k, n, b, b_strides);
    check_bounds(m, n, c, c_strides);
    unsafe {
      matrixmultiply::sgemm(
        m, k, n,
        1.0,
        a.as_ptr(), a_strides.0 as isize, a_strides.1 as isize,
        b.as_ptr(), b_strides.0 as isize, b_strides.1 as isize,
        1.0,
        c.as_mut_ptr(), c_strides.0 as isize, c_strides.1 as isize,
      );
    }
  }
}


impl Real for f64 {
  #[cfg(feature = "unsafe")]
  fn gemm(
    m: usize, k: usize, n: usize,
    a: &[Self], a_strides: (usize, usize),
    b: &[Self], b_strides: (usize, usize),
    c: &mut [Self], c_strides: (usize, usize),
  ) {
    check_bounds(m, k, a, a_strides);
    check_bounds(k, n, b, b_strides);
    check_bounds(m, n, c, c_strides);
    unsafe {
      matrixmultiply::dgemm(
        m, k, n,
        1.0,
        a.as_ptr(), a_strides.0 as isize, a_strides.1 as isize,
        b.as_ptr(), b_strides.0 as isize, b_strides.1 as isize,
        1.0,
        c.as_mut_ptr(), c_strides.0 as isize, c_strides.1 as isize,
      );
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn gemm_transposed() {
    // a: 2x3, b^T stored as 2x3 -> b is 3x2
    let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let bt = [1.0, 0.0, -1.0, 2.0, 1.0, 0.5];
    let mut c = [1.0; 4];
    f64::gemm(2, 3, 2, &a, (3, 1), &bt, (1, 3), &mut c, (2, 1));
    assert_eq!(c, [1.0 - 2.0, 1.0 + 5.5, 1.0 - 2.0, 1.0 + 16.0]);
  }

  #[test]
  fn gemm_single_precision() {
    let a = [1.0f32, 2.0];
    let b = [3.0f32, 4.0];
    let mut c = [0.0f32];
    f32::gemm(1, 2, 1, &a, (2, 1), &b, (1, 1), &mut c, (1, 1));
    assert_eq!(c, [11.0]);
  }
}
