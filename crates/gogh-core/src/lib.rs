//! # gogh-core
//!
//! Tensor primitives and reverse-mode autodiff for the gogh style-transfer
//! engine.
//!
//! This crate provides:
//! - [`Tensor`] — n-dimensional array with automatic differentiation
//! - [`Shape`] / [`Layout`] — shape, strides, and memory layout
//! - [`DType`] — element types (F32, F64)
//! - [`Backend`] trait and the built-in [`CpuBackend`]
//! - [`GradStore`] — gradients returned by `backward()`
//!
//! The op set is the one a style-transfer loss graph evaluates: VGG-style
//! convolution/activation/pooling on the way down, reshape/transpose/matmul
//! for Gram matrices, sub/square/mean for MSE losses, affine and clamp for
//! normalization and the pixel-range projection.

pub mod backend;
pub mod backprop;
pub mod cpu;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod op;
pub mod shape;
pub mod tensor;

pub use backend::{Backend, BackendDevice, BackendStorage};
pub use backprop::GradStore;
pub use cpu::{CpuBackend, CpuDevice, CpuStorage};
pub use dtype::DType;
pub use error::{Error, Result};
pub use layout::Layout;
pub use op::Op;
pub use shape::Shape;
pub use tensor::Tensor;

/// Tensor on the built-in CPU backend.
pub type CpuTensor = Tensor<CpuBackend>;
