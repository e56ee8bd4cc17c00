use std::sync::{Arc, RwLock};

use rayon::prelude::*;

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::bail;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::op::{Op, TensorId};
use crate::shape::Shape;

// Tensor — the fundamental data structure
//
// An n-dimensional array on a backend's device, with the operation that
// created it recorded for reverse-mode autodiff. Three kinds of tensor flow
// through a stylization run:
//
//   - frozen leaves: VGG weights and the detached loss targets
//     (Op::None, is_variable = false — backward never spends work on them)
//   - the one variable leaf: the output image being optimized
//     (Op::None, is_variable = true)
//   - intermediates: everything a forward evaluation produces, each tagged
//     with its Op so backward can chain gradients from the scalar loss down
//     to the output pixels
//
// MEMORY MODEL: Tensor is a cheap handle — Arc<TensorInner> — and the inner
// storage is itself Arc<RwLock<..>> so that views share data and the
// optimizer can write updated pixel values in place while every other
// holder of the handle observes them.

/// Inner data of a tensor, shared via Arc.
struct TensorInner<B: Backend> {
    /// Unique identifier (key into the gradient store).
    id: TensorId,
    /// Raw data on the backend's device.
    storage: Arc<RwLock<B::Storage>>,
    /// Memory layout: shape + strides + offset.
    layout: Layout,
    /// Element type.
    dtype: DType,
    /// The device this tensor lives on.
    device: B::Device,
    /// The operation that created this tensor. Op::None for leaves.
    op: Op<B>,
    /// Whether backward should accumulate a gradient for this leaf.
    is_variable: bool,
}

/// An n-dimensional array with reverse-mode automatic differentiation.
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

// Manual Clone: Arc::clone is a refcount increment.
impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, dtype={}, device={:?})",
            self.inner.id,
            self.inner.layout.shape(),
            self.inner.dtype,
            self.inner.device,
        )
    }
}

impl<B: Backend> Tensor<B> {
    // Internal constructors

    /// Build a tensor from freshly produced storage.
    pub(crate) fn from_storage(
        storage: B::Storage,
        layout: Layout,
        dtype: DType,
        device: B::Device,
        op: Op<B>,
    ) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::new(RwLock::new(storage)),
                layout,
                dtype,
                device,
                op,
                is_variable: false,
            }),
        }
    }

    /// View sharing the same storage under a different layout.
    fn view_with_layout(&self, layout: Layout, op: Op<B>) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op,
                is_variable: false,
            }),
        }
    }

    /// Build a tensor from host f64 data with an explicit graph op.
    /// Used by the conv/pool kernels, which compute on host buffers.
    fn from_host(
        data: &[f64],
        shape: Shape,
        dtype: DType,
        device: &B::Device,
        op: Op<B>,
    ) -> Result<Self> {
        let storage = B::from_f64_slice(data, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            op,
        ))
    }

    // Accessors

    /// Unique tensor ID.
    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    /// The shape of this tensor.
    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    /// The dimensions as a slice.
    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    /// Total number of elements.
    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    /// The device this tensor is on.
    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    /// The memory layout (shape + strides + offset).
    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    /// Whether the data is contiguous in memory.
    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    /// Whether backward accumulates a gradient for this tensor.
    pub fn is_variable(&self) -> bool {
        self.inner.is_variable
    }

    /// The op that created this tensor.
    pub fn op(&self) -> &Op<B> {
        &self.inner.op
    }

    fn read_storage(&self) -> Result<std::sync::RwLockReadGuard<'_, B::Storage>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    fn write_storage(&self) -> Result<std::sync::RwLockWriteGuard<'_, B::Storage>> {
        self.inner
            .storage
            .write()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    // In-place mutation

    /// Overwrite the underlying storage with new values.
    ///
    /// Writes through the shared Arc<RwLock<..>>, so every holder of this
    /// tensor (and of views onto it) sees the update. This is how the
    /// optimizer steps the output image without rebuilding the pipeline.
    ///
    /// The value count must match; the shape does not change.
    pub fn update_data_inplace(&self, new_data: &[f64]) -> Result<()> {
        let expected = self.elem_count();
        if new_data.len() != expected {
            return Err(Error::ElementCountMismatch {
                shape: self.shape().clone(),
                expected,
                got: new_data.len(),
            });
        }
        let new_storage = B::from_f64_slice(new_data, self.dtype(), self.device())?;
        let mut guard = self.write_storage()?;
        *guard = new_storage;
        Ok(())
    }

    // Creation

    /// Tensor filled with zeros.
    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::zeros(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Tensor filled with ones.
    pub fn ones(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::ones(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Tensor filled with a constant value.
    pub fn full(
        shape: impl Into<Shape>,
        val: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let storage = B::full(&shape, val, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Tensor from a flat f64 slice, converted to the given dtype.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: shape.clone(),
                expected: shape.elem_count(),
                got: data.len(),
            });
        }
        Self::from_host(data, shape, dtype, device, Op::None)
    }

    /// F32 tensor from a flat f32 slice. The natural entry point for image
    /// data.
    pub fn from_f32_slice(
        data: &[f32],
        shape: impl Into<Shape>,
        device: &B::Device,
    ) -> Result<Self> {
        let as_f64: Vec<f64> = data.iter().map(|&v| v as f64).collect();
        Self::from_f64_slice(&as_f64, shape, DType::F32, device)
    }

    /// Tensor with uniform random values in [0, 1).
    pub fn rand(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_uniform(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Tensor with standard normal random values.
    pub fn randn(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_normal(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Zeros with the same shape, dtype, and device as `other`.
    pub fn zeros_like(other: &Self) -> Result<Self> {
        Self::zeros(other.shape().clone(), other.dtype(), other.device())
    }

    /// Ones with the same shape, dtype, and device as `other`.
    pub fn ones_like(other: &Self) -> Result<Self> {
        Self::ones(other.shape().clone(), other.dtype(), other.device())
    }

    // Autograd marking

    /// Mark this tensor as a variable: backward() will accumulate its
    /// gradient. Same id and storage.
    pub fn set_variable(self) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: self.inner.id,
                storage: Arc::clone(&self.inner.storage),
                layout: self.inner.layout.clone(),
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op: self.inner.op.clone(),
                is_variable: true,
            }),
        }
    }

    /// Frozen view: same data and id, `is_variable = false`. The backward
    /// pass skips gradient work for frozen parameters entirely.
    pub fn freeze(&self) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: self.inner.id,
                storage: Arc::clone(&self.inner.storage),
                layout: self.inner.layout.clone(),
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op: self.inner.op.clone(),
                is_variable: false,
            }),
        }
    }

    /// Detached view: same data, no gradient history (Op::None, fresh id).
    /// This is how loss targets are fixed at assembly time.
    pub fn detach(&self) -> Self {
        self.view_with_layout(self.layout().clone(), Op::None)
    }

    /// Deep copy: fresh storage, no graph history. Unlike `detach`, later
    /// in-place updates to the copy do not touch the source.
    pub fn copy(&self) -> Result<Self> {
        Self::from_host(
            &self.to_f64_vec()?,
            self.shape().clone(),
            self.dtype(),
            self.device(),
            Op::None,
        )
    }

    // Shape manipulation (views — no data copy)

    /// Swap two dimensions.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        let new_layout = self.inner.layout.transpose(dim0, dim1)?;
        let op = Op::Transpose {
            input: self.clone(),
            dim0,
            dim1,
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Transpose a 2-D matrix (shorthand for transpose(0, 1)).
    pub fn t(&self) -> Result<Self> {
        if self.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        self.transpose(0, 1)
    }

    /// Reshape to a new shape with the same element count. A non-contiguous
    /// tensor is made contiguous first.
    pub fn reshape(&self, new_shape: impl Into<Shape>) -> Result<Self> {
        let new_shape = new_shape.into();
        if self.elem_count() != new_shape.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: self.elem_count(),
                dst: new_shape.elem_count(),
                dst_shape: new_shape,
            });
        }
        let tensor = if self.is_contiguous() {
            self.clone()
        } else {
            self.contiguous()?
        };
        let src_shape = tensor.shape().clone();
        let op = Op::Reshape {
            input: tensor.clone(),
            src_shape,
        };
        Ok(tensor.view_with_layout(Layout::contiguous(new_shape), op))
    }

    /// Contiguous version of this tensor (clone when already contiguous).
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let storage = self.read_storage()?;
        let new_storage = B::to_contiguous(&storage, &self.inner.layout)?;
        drop(storage);
        Ok(Self::from_storage(
            new_storage,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Contiguous {
                input: self.clone(),
            },
        ))
    }

    // Arithmetic

    /// Element-wise addition (broadcasting).
    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Add)
    }

    /// Element-wise subtraction (broadcasting).
    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Sub)
    }

    /// Element-wise multiplication (broadcasting).
    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Mul)
    }

    /// Element-wise division (broadcasting).
    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Div)
    }

    fn binary_op(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        let storage_lhs = self.read_storage()?;
        let storage_rhs = rhs.read_storage()?;
        let result = B::binary_op(
            op,
            &storage_lhs,
            &self.inner.layout,
            &storage_rhs,
            &rhs.inner.layout,
        )?;
        drop(storage_lhs);
        drop(storage_rhs);
        let result_shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        Ok(Self::from_storage(
            result,
            Layout::contiguous(result_shape),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Binary {
                lhs: self.clone(),
                rhs: rhs.clone(),
                op,
            },
        ))
    }

    // Unary

    /// Element-wise negation.
    pub fn neg(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Neg)
    }

    /// Element-wise square.
    pub fn square(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Square)
    }

    /// ReLU activation: max(0, x).
    pub fn relu(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Relu)
    }

    fn unary_op(&self, op: UnaryOp) -> Result<Self> {
        let storage = self.read_storage()?;
        let result = B::unary_op(op, &storage, &self.inner.layout)?;
        drop(storage);
        Ok(Self::from_storage(
            result,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Unary {
                input: self.clone(),
                op,
            },
        ))
    }

    /// Affine transform: result = self * mul + add.
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        let storage = self.read_storage()?;
        let result = B::affine(&storage, &self.inner.layout, mul, add)?;
        drop(storage);
        Ok(Self::from_storage(
            result,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Affine {
                input: self.clone(),
                mul,
                add,
            },
        ))
    }

    /// Element-wise clamp into [min, max].
    pub fn clamp(&self, min: f64, max: f64) -> Result<Self> {
        let storage = self.read_storage()?;
        let result = B::clamp(&storage, &self.inner.layout, min, max)?;
        drop(storage);
        Ok(Self::from_storage(
            result,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Clamp {
                input: self.clone(),
                min,
                max,
            },
        ))
    }

    // Reductions

    /// Sum of all elements, as a scalar tensor.
    pub fn sum_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[], false)
    }

    /// Sum along one dimension.
    pub fn sum(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[dim], keep_dim)
    }

    /// Mean of all elements, as a scalar tensor.
    pub fn mean_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, &[], false)
    }

    /// Mean along one dimension.
    pub fn mean(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, &[dim], keep_dim)
    }

    fn reduce_op(&self, op: ReduceOp, dims: &[usize], keep_dim: bool) -> Result<Self> {
        for &d in dims {
            if d >= self.rank() {
                return Err(Error::DimOutOfRange {
                    dim: d,
                    rank: self.rank(),
                });
            }
        }
        let storage = self.read_storage()?;
        let result = B::reduce_op(op, &storage, &self.inner.layout, dims, keep_dim)?;
        drop(storage);

        let result_shape = if dims.is_empty() {
            Shape::from(())
        } else if keep_dim {
            let mut new_dims = self.dims().to_vec();
            for &d in dims {
                new_dims[d] = 1;
            }
            Shape::new(new_dims)
        } else {
            let new_dims: Vec<usize> = self
                .dims()
                .iter()
                .enumerate()
                .filter(|(i, _)| !dims.contains(i))
                .map(|(_, &d)| d)
                .collect();
            if new_dims.is_empty() {
                Shape::from(())
            } else {
                Shape::new(new_dims)
            }
        };

        Ok(Self::from_storage(
            result,
            Layout::contiguous(result_shape),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Reduce {
                input: self.clone(),
                op,
                dims: dims.to_vec(),
                keep_dim,
            },
        ))
    }

    // Matrix multiplication

    /// 2-D matrix multiplication: [m, k] @ [k, n] → [m, n].
    ///
    /// Rank-2 only — the one matmul in this graph is the Gram product of a
    /// flattened feature map with its own transpose.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        if self.rank() != 2 || rhs.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank().min(rhs.rank()),
            });
        }
        let (m, k1) = (self.dims()[0], self.dims()[1]);
        let (k2, n) = (rhs.dims()[0], rhs.dims()[1]);
        if k1 != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
        }

        let storage_lhs = self.read_storage()?;
        let storage_rhs = rhs.read_storage()?;
        let result = B::matmul(
            &storage_lhs,
            &self.inner.layout,
            &storage_rhs,
            &rhs.inner.layout,
        )?;
        drop(storage_lhs);
        drop(storage_rhs);

        Ok(Self::from_storage(
            result,
            Layout::contiguous(Shape::from((m, n))),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Matmul {
                lhs: self.clone(),
                rhs: rhs.clone(),
            },
        ))
    }

    // 2-D convolution

    /// 2-D convolution.
    ///
    /// - `self` (input): `[N, C_in, H, W]`
    /// - `weight`:       `[C_out, C_in, kH, kW]`
    /// - `bias`:         optional `[C_out]`
    ///
    /// Output: `[N, C_out, H_out, W_out]` with
    /// `H_out = (H + 2*pH - kH) / sH + 1`.
    pub fn conv2d(
        &self,
        weight: &Self,
        bias: Option<&Self>,
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Self> {
        if self.rank() != 4 {
            bail!("conv2d input must be 4D [N,C,H,W], got rank {}", self.rank());
        }
        if weight.rank() != 4 {
            bail!(
                "conv2d weight must be 4D [C_out,C_in,kH,kW], got rank {}",
                weight.rank()
            );
        }

        let in_dims = self.dims();
        let w_dims = weight.dims();
        let (n, c_in, h, w) = (in_dims[0], in_dims[1], in_dims[2], in_dims[3]);
        let (c_out, wc_in, kh, kw) = (w_dims[0], w_dims[1], w_dims[2], w_dims[3]);

        if c_in != wc_in {
            bail!("conv2d: input channels {} != weight channels {}", c_in, wc_in);
        }
        if let Some(b) = bias {
            if b.elem_count() != c_out {
                bail!(
                    "conv2d: bias size {} != output channels {}",
                    b.elem_count(),
                    c_out
                );
            }
        }

        let [sh, sw] = stride;
        let [ph, pw] = padding;
        if h + 2 * ph < kh || w + 2 * pw < kw {
            bail!("conv2d: kernel larger than padded input");
        }

        let h_out = (h + 2 * ph - kh) / sh + 1;
        let w_out = (w + 2 * pw - kw) / sw + 1;

        let input_data = self.contiguous()?.to_f64_vec()?;
        let weight_data = weight.contiguous()?.to_f64_vec()?;
        let bias_data = match bias {
            Some(b) => Some(b.contiguous()?.to_f64_vec()?),
            None => None,
        };

        // im2col + GEMM per sample:
        //   columns = im2col(input)   [c_in*kh*kw, h_out*w_out]
        //   out     = weight × columns [c_out, h_out*w_out]
        let col_rows = c_in * kh * kw;
        let col_cols = h_out * w_out;
        let sample_size = c_in * h * w;
        let mut columns = vec![0.0f64; col_rows * col_cols];
        let mut output = vec![0.0f64; n * c_out * col_cols];

        for ni in 0..n {
            let in_offset = ni * sample_size;
            im2col(
                &input_data[in_offset..in_offset + sample_size],
                ConvGeometry {
                    c_in,
                    h,
                    w,
                    kh,
                    kw,
                    sh,
                    sw,
                    ph,
                    pw,
                    h_out,
                    w_out,
                },
                &mut columns,
            );

            let out_offset = ni * c_out * col_cols;
            gemm(
                &weight_data,
                &columns,
                &mut output[out_offset..out_offset + c_out * col_cols],
                c_out,
                col_cols,
                col_rows,
            );

            if let Some(ref bd) = bias_data {
                for co in 0..c_out {
                    let row = &mut output[out_offset + co * col_cols..out_offset + (co + 1) * col_cols];
                    for v in row.iter_mut() {
                        *v += bd[co];
                    }
                }
            }
        }

        Self::from_host(
            &output,
            Shape::new(vec![n, c_out, h_out, w_out]),
            self.dtype(),
            self.device(),
            Op::Conv2d {
                input: self.clone(),
                weight: weight.clone(),
                bias: bias.cloned(),
                stride,
                padding,
            },
        )
    }

    // 2-D max pooling

    /// 2-D max pooling on `[N, C, H, W]`. The argmax position of every
    /// window is recorded in the op for the backward pass.
    pub fn max_pool2d(
        &self,
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Self> {
        if self.rank() != 4 {
            bail!(
                "max_pool2d input must be 4D [N,C,H,W], got rank {}",
                self.rank()
            );
        }

        let dims = self.dims();
        let (n, c, h, w) = (dims[0], dims[1], dims[2], dims[3]);
        let [kh, kw] = kernel_size;
        let [sh, sw] = stride;
        let [ph, pw] = padding;

        if h + 2 * ph < kh || w + 2 * pw < kw {
            bail!("max_pool2d: kernel larger than padded input");
        }

        let h_out = (h + 2 * ph - kh) / sh + 1;
        let w_out = (w + 2 * pw - kw) / sw + 1;

        let input_data = self.contiguous()?.to_f64_vec()?;
        let out_size = n * c * h_out * w_out;
        let mut output = vec![f64::NEG_INFINITY; out_size];
        let mut indices = vec![0usize; out_size];

        for ni in 0..n {
            for ci in 0..c {
                for oh in 0..h_out {
                    for ow in 0..w_out {
                        let out_idx = ((ni * c + ci) * h_out + oh) * w_out + ow;
                        let mut max_val = f64::NEG_INFINITY;
                        let mut max_idx = 0usize;
                        for ki in 0..kh {
                            for kj in 0..kw {
                                let ih = (oh * sh + ki) as isize - ph as isize;
                                let iw = (ow * sw + kj) as isize - pw as isize;
                                if ih >= 0 && ih < h as isize && iw >= 0 && iw < w as isize {
                                    let in_idx =
                                        ((ni * c + ci) * h + ih as usize) * w + iw as usize;
                                    if input_data[in_idx] > max_val {
                                        max_val = input_data[in_idx];
                                        max_idx = in_idx;
                                    }
                                }
                            }
                        }
                        output[out_idx] = max_val;
                        indices[out_idx] = max_idx;
                    }
                }
            }
        }

        Self::from_host(
            &output,
            Shape::new(vec![n, c, h_out, w_out]),
            self.dtype(),
            self.device(),
            Op::MaxPool2d {
                input: self.clone(),
                kernel_size,
                stride,
                padding,
                indices,
            },
        )
    }

    // 2-D average pooling

    /// 2-D average pooling on `[N, C, H, W]`.
    pub fn avg_pool2d(
        &self,
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Self> {
        if self.rank() != 4 {
            bail!(
                "avg_pool2d input must be 4D [N,C,H,W], got rank {}",
                self.rank()
            );
        }

        let dims = self.dims();
        let (n, c, h, w) = (dims[0], dims[1], dims[2], dims[3]);
        let [kh, kw] = kernel_size;
        let [sh, sw] = stride;
        let [ph, pw] = padding;

        if h + 2 * ph < kh || w + 2 * pw < kw {
            bail!("avg_pool2d: kernel larger than padded input");
        }

        let h_out = (h + 2 * ph - kh) / sh + 1;
        let w_out = (w + 2 * pw - kw) / sw + 1;

        let input_data = self.contiguous()?.to_f64_vec()?;
        let mut output = vec![0.0f64; n * c * h_out * w_out];

        for ni in 0..n {
            for ci in 0..c {
                for oh in 0..h_out {
                    for ow in 0..w_out {
                        let out_idx = ((ni * c + ci) * h_out + oh) * w_out + ow;
                        let mut sum = 0.0f64;
                        let mut count = 0usize;
                        for ki in 0..kh {
                            for kj in 0..kw {
                                let ih = (oh * sh + ki) as isize - ph as isize;
                                let iw = (ow * sw + kj) as isize - pw as isize;
                                if ih >= 0 && ih < h as isize && iw >= 0 && iw < w as isize {
                                    let in_idx =
                                        ((ni * c + ci) * h + ih as usize) * w + iw as usize;
                                    sum += input_data[in_idx];
                                    count += 1;
                                }
                            }
                        }
                        output[out_idx] = if count > 0 { sum / count as f64 } else { 0.0 };
                    }
                }
            }
        }

        Self::from_host(
            &output,
            Shape::new(vec![n, c, h_out, w_out]),
            self.dtype(),
            self.device(),
            Op::AvgPool2d {
                input: self.clone(),
                kernel_size,
                stride,
                padding,
            },
        )
    }

    // Data extraction

    /// All elements as a flat Vec<f64> in logical order.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let storage = self.read_storage()?;
        B::to_f64_vec(&storage, &self.inner.layout)
    }

    /// All elements as a flat Vec<f32> in logical order.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        Ok(self.to_f64_vec()?.into_iter().map(|v| v as f32).collect())
    }

    /// The scalar value of a single-element tensor.
    pub fn to_scalar(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            return Err(Error::NotAScalar {
                shape: self.shape().clone(),
            });
        }
        Ok(self.to_f64_vec()?[0])
    }

    // Autograd

    /// Reverse-mode automatic differentiation from this scalar tensor.
    /// Returns a GradStore with gradients for every tensor the loss
    /// depends on (frozen parameters excluded).
    pub fn backward(&self) -> Result<crate::backprop::GradStore<B>> {
        crate::backprop::backward(self)
    }
}

// im2col / col2im / GEMM — convolution as matrix multiplication
//
// im2col unrolls every sliding window of one sample into a column, turning
// the convolution into one GEMM per sample. col2im is its adjoint: it
// scatters columns back into an image buffer, accumulating overlapping
// contributions, which is exactly the input-gradient computation.

/// Geometry of one conv2d application, bundled so the unroll helpers don't
/// take a dozen positional integers.
#[derive(Clone, Copy)]
pub(crate) struct ConvGeometry {
    pub c_in: usize,
    pub h: usize,
    pub w: usize,
    pub kh: usize,
    pub kw: usize,
    pub sh: usize,
    pub sw: usize,
    pub ph: usize,
    pub pw: usize,
    pub h_out: usize,
    pub w_out: usize,
}

/// Unroll one sample `[C_in, H, W]` into columns
/// `[C_in * kH * kW, H_out * W_out]`.
pub(crate) fn im2col(input: &[f64], g: ConvGeometry, columns: &mut [f64]) {
    let col_cols = g.h_out * g.w_out;
    for ci in 0..g.c_in {
        for ki in 0..g.kh {
            for kj in 0..g.kw {
                let row = (ci * g.kh + ki) * g.kw + kj;
                let row_offset = row * col_cols;
                for oh in 0..g.h_out {
                    for ow in 0..g.w_out {
                        let ih = (oh * g.sh + ki) as isize - g.ph as isize;
                        let iw = (ow * g.sw + kj) as isize - g.pw as isize;
                        let val = if ih >= 0
                            && ih < g.h as isize
                            && iw >= 0
                            && iw < g.w as isize
                        {
                            input[(ci * g.h + ih as usize) * g.w + iw as usize]
                        } else {
                            0.0
                        };
                        columns[row_offset + oh * g.w_out + ow] = val;
                    }
                }
            }
        }
    }
}

/// Scatter columns back into an image buffer `[C_in, H, W]`, accumulating.
/// The buffer must be zeroed by the caller.
pub(crate) fn col2im(columns: &[f64], g: ConvGeometry, output: &mut [f64]) {
    let col_cols = g.h_out * g.w_out;
    for ci in 0..g.c_in {
        for ki in 0..g.kh {
            for kj in 0..g.kw {
                let row = (ci * g.kh + ki) * g.kw + kj;
                let row_offset = row * col_cols;
                for oh in 0..g.h_out {
                    for ow in 0..g.w_out {
                        let ih = (oh * g.sh + ki) as isize - g.ph as isize;
                        let iw = (ow * g.sw + kj) as isize - g.pw as isize;
                        if ih >= 0 && ih < g.h as isize && iw >= 0 && iw < g.w as isize {
                            output[(ci * g.h + ih as usize) * g.w + iw as usize] +=
                                columns[row_offset + oh * g.w_out + ow];
                        }
                    }
                }
            }
        }
    }
}

/// C += A × B. A: [m, k], B: [k, n], C: [m, n], all row-major.
/// Output rows are independent, so they run in parallel.
pub(crate) fn gemm(a: &[f64], b: &[f64], c: &mut [f64], m: usize, n: usize, k: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    c.par_chunks_mut(n).enumerate().for_each(|(i, c_row)| {
        let a_row = &a[i * k..(i + 1) * k];
        for (p, &a_val) in a_row.iter().enumerate() {
            let b_row = &b[p * n..(p + 1) * n];
            for (c_val, &b_val) in c_row.iter_mut().zip(b_row.iter()) {
                *c_val += a_val * b_val;
            }
        }
    });
}

/// C += Aᵀ × B. A: [k, m], B: [k, n], C: [m, n].
pub(crate) fn gemm_at_b(a: &[f64], b: &[f64], c: &mut [f64], m: usize, n: usize, k: usize) {
    c.par_chunks_mut(n).enumerate().for_each(|(i, c_row)| {
        for p in 0..k {
            let a_val = a[p * m + i];
            let b_row = &b[p * n..(p + 1) * n];
            for (c_val, &b_val) in c_row.iter_mut().zip(b_row.iter()) {
                *c_val += a_val * b_val;
            }
        }
    });
}

/// C += A × Bᵀ. A: [m, k], B: [n, k], C: [m, n].
pub(crate) fn gemm_a_bt(a: &[f64], b: &[f64], c: &mut [f64], m: usize, n: usize, k: usize) {
    c.par_chunks_mut(n).enumerate().for_each(|(i, c_row)| {
        let a_row = &a[i * k..(i + 1) * k];
        for (j, c_val) in c_row.iter_mut().enumerate() {
            let b_row = &b[j * k..(j + 1) * k];
            let mut acc = 0.0f64;
            for p in 0..k {
                acc += a_row[p] * b_row[p];
            }
            *c_val += acc;
        }
    });
}
