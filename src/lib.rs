//! Composable recurrent blocks, trained through time.
//! Tiny. Few dependencies. CPU only.
//!
//! # Features
//!
//! - **Composable blocks** - Recurrent units such as LSTMs can be stacked,
//! run side by side or have their state exposed as output, while their
//! gradients keep flowing through every composition.
//!
//! - **Variable-length batching** - Sequences of differing lengths are processed
//! together. Lanes drop out of the batch as their sequences end, so no padding
//! ever enters a computation.
//!
//! - **Full and truncated BPTT** - Back-propagate through entire sequences or
//! through bounded windows of recent history on long ones.
//!
//! - **R-operator** - Exact Hessian-vector products for second order optimizers,
//! computed alongside the regular gradient in a single pass.
//!
//! - **Parallel gradients** - Batches are split into sub-batches and processed
//! by a thread pool. Gradient buffers get recycled between calls.
//!
//! - **Sequence functions** - Whole-sequence transformations including
//! bidirectional processing.
//!
//! # Examples
//!
//! Computing the gradient of a stacked network over a batch of sequences:
//! ```
//! use recurrent::{
//!   block::{ Block, StackedBlock, lstm, square },
//!   Sequence, BPTT, Gradienter, MeanSquaredCost,
//! };
//!
//! let block = StackedBlock::<f64>::new(vec![
//!   Box::new(lstm(2, 4)),
//!   Box::new(square(1)),
//! ]);
//!
//! let samples = vec![
//!   Sequence::new(vec![vec![0.5, 1.0]; 3], vec![vec![0.1; 4]; 3]),
//!   Sequence::new(vec![vec![-1.0, 0.0]], vec![vec![0.2; 4]]),
//! ];
//!
//! let mut bptt = BPTT::new(block, MeanSquaredCost).max_threads(2);
//! let gradient = bptt.gradient(&samples);
//! assert_eq!(gradient.len(), bptt.block.parameters().len());
//! ```
//!
//! Hessian-vector products along a random direction:
//! ```
//! use recurrent::{ block::{ Block, lstm }, Sequence, BPTT, Gradienter, MeanSquaredCost, RVector };
//!
//! let mut bptt = BPTT::new(lstm::<f64>(1, 2), MeanSquaredCost);
//! let rv = RVector::randn(&bptt.block.parameters());
//! let samples = vec![Sequence::new(vec![vec![1.0]; 4], vec![vec![0.0; 2]; 4])];
//! let (_gradient, _hessian_product) = bptt.rgradient(&rv, &samples);
//! ```
//!
//! # Optional features
//!
//! Some features can be toggled in your `Cargo.toml`.
//!
//! - `unsafe` *(default)* - Accelerated matrix math using [matrixmultiply] crate.

mod internal;
mod seq_prop;

#[cfg(test)]
mod check;

pub mod scalar;
pub mod parameter;
pub mod gradient;
pub mod variable;
pub mod layer;
pub mod state;
pub mod block;
pub mod cost;
pub mod sequence;
pub mod grad_helper;
pub mod bptt;
pub mod runner;
pub mod seq_func;

pub use parameter::{ ParamId, Parameter };
pub use gradient::{ Gradient, RGradient, RVector, GradientPool, PooledGradient };
pub use state::{ State, RState };
pub use block::Block;
pub use cost::{ CostFunc, MeanSquaredCost, CrossEntropyCost };
pub use sequence::Sequence;
pub use grad_helper::GradHelper;
pub use bptt::{ Gradienter, BPTT, TruncatedBPTT };
pub use runner::Runner;
pub use seq_prop::{ SeqProp, SeqRProp };
pub use seq_func::{ SeqFunc, BlockSeqFunc, MapSeqFunc, ComposedSeqFunc, Bidirectional, SeqFuncGradienter };
