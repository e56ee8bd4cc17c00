use crate::dtype::DType;
use crate::error::Result;
use crate::layout::Layout;
use crate::shape::Shape;
use std::fmt;

// Backend — abstraction over compute devices
//
// Tensor<B: Backend> dispatches its element-wise, reduction, and matmul
// kernels through this trait. Only a CPU backend is built in (`cpu.rs`),
// but the seam exists so that an accelerated backend can be added as a
// separate implementation without touching the tensor or autograd code:
// every tensor in a pipeline carries its backend in the type, which is also
// what makes "all tensors on one device" a compile-time fact rather than a
// runtime check.
//
// The convolution and pooling kernels are NOT part of this trait: they run
// on host-side buffers in tensor.rs (im2col + GEMM), which every backend
// can feed through `to_f64_vec`.

/// Identifies a compute device.
pub trait BackendDevice: Clone + fmt::Debug + Send + Sync + 'static {
    /// Human-readable name ("cpu").
    fn name(&self) -> String;
}

/// A storage buffer holding tensor data on a specific device.
pub trait BackendStorage: Clone + Send + Sync + 'static {
    /// Element type of this storage.
    fn dtype(&self) -> DType;

    /// Number of elements in this storage.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Op enums: they parameterize the backend kernels AND are recorded in the
// autograd graph — the backward pass needs to know which op produced a
// tensor to apply the right gradient rule.

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Element-wise unary operations.
///
/// The full set the style-transfer graph and its gradients evaluate: ReLU
/// is VGG's activation, Square serves the MSE losses, Neg appears in
/// gradient rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Square,
    Relu,
}

/// Reductions. Sum/Mean over all elements or chosen dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
}

/// The backend trait. Implementing it makes a type a complete compute
/// backend for `Tensor<B>`.
///
/// Kernels take storage + layout (the layout encodes shape, strides, and
/// offset, so views and broadcasts need no copies on the way in) and return
/// fresh contiguous storage.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    /// The device type for this backend.
    type Device: BackendDevice;
    /// The storage type for this backend.
    type Storage: BackendStorage;

    // Creation

    /// Allocate storage filled with zeros.
    fn zeros(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Allocate storage filled with ones.
    fn ones(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Allocate storage filled with a constant value.
    fn full(shape: &Shape, val: f64, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Create storage from a flat f64 slice, converting to the target dtype.
    fn from_f64_slice(data: &[f64], dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Storage with uniform random values in [0, 1).
    fn rand_uniform(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Storage with standard normal random values.
    fn rand_normal(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    // Element-wise

    /// Binary op with NumPy broadcasting between the two layouts.
    fn binary_op(
        op: BinaryOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    /// Unary op applied element-wise.
    fn unary_op(op: UnaryOp, input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// Affine transform: result = input * mul + add.
    fn affine(input: &Self::Storage, layout: &Layout, mul: f64, add: f64) -> Result<Self::Storage>;

    /// Clamp every element into [min, max].
    fn clamp(input: &Self::Storage, layout: &Layout, min: f64, max: f64) -> Result<Self::Storage>;

    // Reductions

    /// Reduce along `dims` (all elements when `dims` is empty).
    fn reduce_op(
        op: ReduceOp,
        input: &Self::Storage,
        layout: &Layout,
        dims: &[usize],
        keep_dim: bool,
    ) -> Result<Self::Storage>;

    // Linear algebra

    /// 2-D matrix multiply: [m, k] @ [k, n] → [m, n].
    fn matmul(
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    // Data movement

    /// Contiguous copy of the storage following the given layout.
    fn to_contiguous(input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// Copy the data out to a host Vec<f64> in logical order.
    fn to_f64_vec(input: &Self::Storage, layout: &Layout) -> Result<Vec<f64>>;
}
