use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};

// Op — computational graph node for automatic differentiation
//
// Every tensor produced by a computation records the operation that created
// it, holding Arc-cheap clones of its input tensors. The resulting DAG is
// what backward() walks in reverse. Leaf tensors (image pixels, frozen conv
// weights) carry Op::None.
//
// The inputs are stored as Tensor<B> values rather than bare ids: backward
// needs the actual input data for most rules (d(a*b)/da = b), and holding
// the tensors keeps every intermediate alive exactly as long as the output
// that depends on it.

/// Unique identifier for a tensor. Key into the gradient store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(pub(crate) u64);

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorId {
    /// Generate a new unique tensor ID (global atomic counter).
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// The operation that produced a tensor.
///
/// This is the op set a style-transfer graph evaluates: VGG's convolutions,
/// activations and pooling on the way down; reshape/transpose/matmul for the
/// Gram matrices; sub/square/mean for the MSE losses; affine for
/// normalization and weighting; clamp for the pixel-range projection.
pub enum Op<B: Backend> {
    /// Leaf tensor — input data or a parameter.
    None,

    /// Element-wise binary: result = op(lhs, rhs), with broadcasting.
    Binary {
        lhs: crate::Tensor<B>,
        rhs: crate::Tensor<B>,
        op: BinaryOp,
    },

    /// Element-wise unary: result = op(input).
    Unary {
        input: crate::Tensor<B>,
        op: UnaryOp,
    },

    /// Reduction over all elements (empty dims) or specific dims.
    Reduce {
        input: crate::Tensor<B>,
        op: ReduceOp,
        dims: Vec<usize>,
        keep_dim: bool,
    },

    /// 2-D matrix multiplication: result = lhs @ rhs.
    Matmul {
        lhs: crate::Tensor<B>,
        rhs: crate::Tensor<B>,
    },

    /// Reshape (same data, new shape). `src_shape` lets backward reshape
    /// the gradient back.
    Reshape {
        input: crate::Tensor<B>,
        src_shape: crate::Shape,
    },

    /// Transpose: swap two dimensions.
    Transpose {
        input: crate::Tensor<B>,
        dim0: usize,
        dim1: usize,
    },

    /// Affine transform: result = input * mul + add.
    Affine {
        input: crate::Tensor<B>,
        mul: f64,
        add: f64,
    },

    /// Contiguous copy — identity for gradients.
    Contiguous { input: crate::Tensor<B> },

    /// Element-wise clamp into [min, max].
    Clamp {
        input: crate::Tensor<B>,
        min: f64,
        max: f64,
    },

    /// 2-D convolution.
    /// input: [N, C_in, H, W], weight: [C_out, C_in, kH, kW].
    Conv2d {
        input: crate::Tensor<B>,
        weight: crate::Tensor<B>,
        bias: Option<crate::Tensor<B>>,
        stride: [usize; 2],
        padding: [usize; 2],
    },

    /// 2-D max-pooling. `indices` are the argmax positions saved by the
    /// forward pass; backward routes each gradient to its winner.
    MaxPool2d {
        input: crate::Tensor<B>,
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
        indices: Vec<usize>,
    },

    /// 2-D average-pooling.
    AvgPool2d {
        input: crate::Tensor<B>,
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
    },
}

// Manual Clone: derive struggles with the B parameter. Every clone is an
// Arc refcount bump.
impl<B: Backend> Clone for Op<B> {
    fn clone(&self) -> Self {
        match self {
            Op::None => Op::None,
            Op::Binary { lhs, rhs, op } => Op::Binary {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
                op: *op,
            },
            Op::Unary { input, op } => Op::Unary {
                input: input.clone(),
                op: *op,
            },
            Op::Reduce {
                input,
                op,
                dims,
                keep_dim,
            } => Op::Reduce {
                input: input.clone(),
                op: *op,
                dims: dims.clone(),
                keep_dim: *keep_dim,
            },
            Op::Matmul { lhs, rhs } => Op::Matmul {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
            },
            Op::Reshape { input, src_shape } => Op::Reshape {
                input: input.clone(),
                src_shape: src_shape.clone(),
            },
            Op::Transpose { input, dim0, dim1 } => Op::Transpose {
                input: input.clone(),
                dim0: *dim0,
                dim1: *dim1,
            },
            Op::Affine { input, mul, add } => Op::Affine {
                input: input.clone(),
                mul: *mul,
                add: *add,
            },
            Op::Contiguous { input } => Op::Contiguous {
                input: input.clone(),
            },
            Op::Clamp { input, min, max } => Op::Clamp {
                input: input.clone(),
                min: *min,
                max: *max,
            },
            Op::Conv2d {
                input,
                weight,
                bias,
                stride,
                padding,
            } => Op::Conv2d {
                input: input.clone(),
                weight: weight.clone(),
                bias: bias.clone(),
                stride: *stride,
                padding: *padding,
            },
            Op::MaxPool2d {
                input,
                kernel_size,
                stride,
                padding,
                indices,
            } => Op::MaxPool2d {
                input: input.clone(),
                kernel_size: *kernel_size,
                stride: *stride,
                padding: *padding,
                indices: indices.clone(),
            },
            Op::AvgPool2d {
                input,
                kernel_size,
                stride,
                padding,
            } => Op::AvgPool2d {
                input: input.clone(),
                kernel_size: *kernel_size,
                stride: *stride,
                padding: *padding,
            },
        }
    }
}

// Concise Debug: op kind and input ids, never the data.
impl<B: Backend> std::fmt::Debug for Op<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::None => write!(f, "None"),
            Op::Binary { lhs, rhs, op } => {
                write!(f, "Binary({:?}, id={:?}, id={:?})", op, lhs.id(), rhs.id())
            }
            Op::Unary { input, op } => write!(f, "Unary({:?}, id={:?})", op, input.id()),
            Op::Reduce {
                input, op, dims, ..
            } => write!(f, "Reduce({:?}, dims={:?}, id={:?})", op, dims, input.id()),
            Op::Matmul { lhs, rhs } => write!(f, "Matmul(id={:?}, id={:?})", lhs.id(), rhs.id()),
            Op::Reshape { input, src_shape } => {
                write!(f, "Reshape({} → ?, id={:?})", src_shape, input.id())
            }
            Op::Transpose { input, dim0, dim1 } => {
                write!(f, "Transpose({}, {}, id={:?})", dim0, dim1, input.id())
            }
            Op::Affine { input, mul, add } => {
                write!(f, "Affine(*{} +{}, id={:?})", mul, add, input.id())
            }
            Op::Contiguous { input } => write!(f, "Contiguous(id={:?})", input.id()),
            Op::Clamp { input, min, max } => {
                write!(f, "Clamp(min={}, max={}, id={:?})", min, max, input.id())
            }
            Op::Conv2d {
                input,
                weight,
                bias,
                stride,
                padding,
            } => write!(
                f,
                "Conv2d(in={:?}, w={:?}, bias={}, s={:?}, p={:?})",
                input.id(),
                weight.id(),
                bias.is_some(),
                stride,
                padding
            ),
            Op::MaxPool2d {
                input,
                kernel_size,
                stride,
                padding,
                ..
            } => write!(
                f,
                "MaxPool2d(in={:?}, k={:?}, s={:?}, p={:?})",
                input.id(),
                kernel_size,
                stride,
                padding
            ),
            Op::AvgPool2d {
                input,
                kernel_size,
                stride,
                padding,
            } => write!(
                f,
                "AvgPool2d(in={:?}, k={:?}, s={:?}, p={:?})",
                input.id(),
                kernel_size,
                stride,
                padding
            ),
        }
    }
}

impl<B: Backend> Op<B> {
    /// References to all input tensors of this operation. Used by the
    /// topological sort in backward().
    pub fn inputs(&self) -> Vec<&crate::Tensor<B>> {
        match self {
            Op::None => vec![],
            Op::Binary { lhs, rhs, .. } | Op::Matmul { lhs, rhs } => vec![lhs, rhs],
            Op::Unary { input, .. }
            | Op::Reduce { input, .. }
            | Op::Reshape { input, .. }
            | Op::Transpose { input, .. }
            | Op::Affine { input, .. }
            | Op::Contiguous { input }
            | Op::Clamp { input, .. }
            | Op::MaxPool2d { input, .. }
            | Op::AvgPool2d { input, .. } => vec![input],
            Op::Conv2d {
                input,
                weight,
                bias,
                ..
            } => {
                let mut v = vec![input, weight];
                if let Some(b) = bias {
                    v.push(b);
                }
                v
            }
        }
    }
}
