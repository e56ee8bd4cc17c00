use rand::Rng;
use rayon::prelude::*;

use crate::backend::{Backend, BackendDevice, BackendStorage, BinaryOp, ReduceOp, UnaryOp};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::Shape;

// CpuBackend — the built-in compute backend
//
// Storage is a typed host vector; kernels compute in f64 and write back in
// the storage's dtype. That costs a conversion per kernel for f32 tensors
// but keeps every kernel a single readable loop, and it is exactly the
// precision path the autograd rules use. The one kernel where throughput
// matters for style transfer — the GEMM behind Gram matrices and the
// convolution path — parallelizes its output rows with rayon.

/// The CPU device. A unit type: there is only one host.
#[derive(Clone, Debug, Default)]
pub struct CpuDevice;

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }
}

/// Host-memory storage, typed by dtype.
#[derive(Clone)]
pub enum CpuStorage {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F64(v) => v.len(),
        }
    }
}

impl CpuStorage {
    /// Read one element by flat index, as f64.
    fn get(&self, idx: usize) -> f64 {
        match self {
            CpuStorage::F32(v) => v[idx] as f64,
            CpuStorage::F64(v) => v[idx],
        }
    }

    /// Build storage of the given dtype from host f64 values.
    fn from_f64(data: Vec<f64>, dtype: DType) -> CpuStorage {
        match dtype {
            DType::F32 => CpuStorage::F32(data.into_iter().map(|v| v as f32).collect()),
            DType::F64 => CpuStorage::F64(data),
        }
    }
}

/// Gather a storage's elements into a host Vec<f64> in logical order,
/// following the layout's strides and offset.
fn read_f64(input: &CpuStorage, layout: &Layout) -> Vec<f64> {
    layout.strided_indices().map(|i| input.get(i)).collect()
}

/// The CPU backend marker type.
#[derive(Clone, Debug)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn zeros(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64(vec![0.0; shape.elem_count()], dtype))
    }

    fn ones(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64(vec![1.0; shape.elem_count()], dtype))
    }

    fn full(shape: &Shape, val: f64, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64(vec![val; shape.elem_count()], dtype))
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64(data.to_vec(), dtype))
    }

    fn rand_uniform(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let mut rng = rand::thread_rng();
        let data: Vec<f64> = (0..shape.elem_count()).map(|_| rng.gen::<f64>()).collect();
        Ok(CpuStorage::from_f64(data, dtype))
    }

    fn rand_normal(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        // Box–Muller: two uniforms → one standard normal.
        let mut rng = rand::thread_rng();
        let data: Vec<f64> = (0..shape.elem_count())
            .map(|_| {
                let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
                let u2: f64 = rng.gen::<f64>();
                (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
            })
            .collect();
        Ok(CpuStorage::from_f64(data, dtype))
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        let out_shape = Shape::broadcast_shape(lhs_layout.shape(), rhs_layout.shape())?;
        let out_dims = out_shape.dims().to_vec();
        let out_strides = out_shape.stride_contiguous();
        let total = out_shape.elem_count();

        let lhs_bstrides = lhs_layout
            .shape()
            .broadcast_strides(lhs_layout.strides(), &out_shape);
        let rhs_bstrides = rhs_layout
            .shape()
            .broadcast_strides(rhs_layout.strides(), &out_shape);

        let f = |a: f64, b: f64| match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        };

        let mut out = vec![0.0f64; total];
        for (flat, slot) in out.iter_mut().enumerate() {
            // Decompose the output index, then project it through each
            // side's broadcast strides.
            let mut lhs_idx = lhs_layout.offset();
            let mut rhs_idx = rhs_layout.offset();
            let mut remainder = flat;
            for d in 0..out_dims.len() {
                let coord = remainder / out_strides[d];
                remainder %= out_strides[d];
                lhs_idx += coord * lhs_bstrides[d];
                rhs_idx += coord * rhs_bstrides[d];
            }
            *slot = f(lhs.get(lhs_idx), rhs.get(rhs_idx));
        }

        Ok(CpuStorage::from_f64(out, lhs.dtype()))
    }

    fn unary_op(op: UnaryOp, input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        let data = read_f64(input, layout);
        let out: Vec<f64> = data
            .into_iter()
            .map(|v| match op {
                UnaryOp::Neg => -v,
                UnaryOp::Square => v * v,
                UnaryOp::Relu => v.max(0.0),
            })
            .collect();
        Ok(CpuStorage::from_f64(out, input.dtype()))
    }

    fn affine(input: &CpuStorage, layout: &Layout, mul: f64, add: f64) -> Result<CpuStorage> {
        let out: Vec<f64> = read_f64(input, layout)
            .into_iter()
            .map(|v| v * mul + add)
            .collect();
        Ok(CpuStorage::from_f64(out, input.dtype()))
    }

    fn clamp(input: &CpuStorage, layout: &Layout, min: f64, max: f64) -> Result<CpuStorage> {
        let out: Vec<f64> = read_f64(input, layout)
            .into_iter()
            .map(|v| v.clamp(min, max))
            .collect();
        Ok(CpuStorage::from_f64(out, input.dtype()))
    }

    fn reduce_op(
        op: ReduceOp,
        input: &CpuStorage,
        layout: &Layout,
        dims: &[usize],
        keep_dim: bool,
    ) -> Result<CpuStorage> {
        let data = read_f64(input, layout);
        let in_dims = layout.dims();

        if dims.is_empty() {
            // Full reduction to a scalar.
            let sum: f64 = data.iter().sum();
            let val = match op {
                ReduceOp::Sum => sum,
                ReduceOp::Mean => sum / data.len().max(1) as f64,
            };
            return Ok(CpuStorage::from_f64(vec![val], input.dtype()));
        }

        for &d in dims {
            if d >= in_dims.len() {
                return Err(Error::DimOutOfRange {
                    dim: d,
                    rank: in_dims.len(),
                });
            }
        }

        // Output shape: reduced dims become 1 (kept) or vanish.
        let out_dims: Vec<usize> = if keep_dim {
            in_dims
                .iter()
                .enumerate()
                .map(|(i, &d)| if dims.contains(&i) { 1 } else { d })
                .collect()
        } else {
            in_dims
                .iter()
                .enumerate()
                .filter(|(i, _)| !dims.contains(i))
                .map(|(_, &d)| d)
                .collect()
        };
        let out_shape = Shape::new(out_dims);
        let out_total = out_shape.elem_count();

        let in_strides = Shape::new(in_dims.to_vec()).stride_contiguous();
        // Strides into the output for each INPUT dim; reduced dims map to 0.
        let kept_strides = {
            let out_strides_kept = out_shape.stride_contiguous();
            let mut v = vec![0usize; in_dims.len()];
            if keep_dim {
                for d in 0..in_dims.len() {
                    if !dims.contains(&d) {
                        v[d] = out_strides_kept[d];
                    }
                }
            } else {
                let mut k = 0;
                for d in 0..in_dims.len() {
                    if !dims.contains(&d) {
                        v[d] = out_strides_kept[k];
                        k += 1;
                    }
                }
            }
            v
        };

        let mut out = vec![0.0f64; out_total];
        for (flat, &val) in data.iter().enumerate() {
            let mut out_flat = 0;
            let mut remainder = flat;
            for d in 0..in_dims.len() {
                let coord = remainder / in_strides[d];
                remainder %= in_strides[d];
                out_flat += coord * kept_strides[d];
            }
            out[out_flat] += val;
        }

        if op == ReduceOp::Mean {
            let n: f64 = dims.iter().map(|&d| in_dims[d] as f64).product();
            for v in out.iter_mut() {
                *v /= n;
            }
        }

        Ok(CpuStorage::from_f64(out, input.dtype()))
    }

    fn matmul(
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        let lhs_dims = lhs_layout.dims();
        let rhs_dims = rhs_layout.dims();
        if lhs_dims.len() != 2 || rhs_dims.len() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: lhs_dims.len().min(rhs_dims.len()),
            });
        }
        let (m, k) = (lhs_dims[0], lhs_dims[1]);
        let n = rhs_dims[1];

        let a = read_f64(lhs, lhs_layout);
        let b = read_f64(rhs, rhs_layout);
        let mut c = vec![0.0f64; m * n];

        // Row-parallel GEMM. Each output row only touches its own slice.
        c.par_chunks_mut(n).enumerate().for_each(|(i, c_row)| {
            let a_row = &a[i * k..(i + 1) * k];
            for (p, &a_val) in a_row.iter().enumerate() {
                let b_row = &b[p * n..(p + 1) * n];
                for (c_val, &b_val) in c_row.iter_mut().zip(b_row.iter()) {
                    *c_val += a_val * b_val;
                }
            }
        });

        Ok(CpuStorage::from_f64(c, lhs.dtype()))
    }

    fn to_contiguous(input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        if layout.is_contiguous() {
            return Ok(input.clone());
        }
        Ok(CpuStorage::from_f64(
            read_f64(input, layout),
            input.dtype(),
        ))
    }

    fn to_f64_vec(input: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
        Ok(read_f64(input, layout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(dims: &[usize]) -> Layout {
        Layout::contiguous(Shape::new(dims.to_vec()))
    }

    #[test]
    fn test_binary_broadcast() {
        let dev = CpuDevice;
        let img = CpuBackend::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], DType::F32, &dev).unwrap();
        let chan = CpuBackend::from_f64_slice(&[10.0, 20.0], DType::F32, &dev).unwrap();
        // [2, 2] + [2, 1] broadcasts the per-row constant.
        let out = CpuBackend::binary_op(
            BinaryOp::Add,
            &img,
            &layout(&[2, 2]),
            &chan,
            &layout(&[2, 1]),
        )
        .unwrap();
        let got = CpuBackend::to_f64_vec(&out, &layout(&[2, 2])).unwrap();
        assert_eq!(got, vec![11.0, 12.0, 23.0, 24.0]);
    }

    #[test]
    fn test_reduce_sum_dim() {
        let dev = CpuDevice;
        let s = CpuBackend::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], DType::F64, &dev)
            .unwrap();
        let out = CpuBackend::reduce_op(ReduceOp::Sum, &s, &layout(&[2, 3]), &[1], false).unwrap();
        let got = CpuBackend::to_f64_vec(&out, &layout(&[2])).unwrap();
        assert_eq!(got, vec![6.0, 15.0]);
    }

    #[test]
    fn test_reduce_mean_keepdim() {
        let dev = CpuDevice;
        let s = CpuBackend::from_f64_slice(&[2.0, 4.0, 6.0, 8.0], DType::F64, &dev).unwrap();
        let out = CpuBackend::reduce_op(ReduceOp::Mean, &s, &layout(&[2, 2]), &[0], true).unwrap();
        let got = CpuBackend::to_f64_vec(&out, &layout(&[1, 2])).unwrap();
        assert_eq!(got, vec![4.0, 6.0]);
    }

    #[test]
    fn test_matmul_identity() {
        let dev = CpuDevice;
        let a = CpuBackend::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], DType::F64, &dev).unwrap();
        let eye = CpuBackend::from_f64_slice(&[1.0, 0.0, 0.0, 1.0], DType::F64, &dev).unwrap();
        let out = CpuBackend::matmul(&a, &layout(&[2, 2]), &eye, &layout(&[2, 2])).unwrap();
        let got = CpuBackend::to_f64_vec(&out, &layout(&[2, 2])).unwrap();
        assert_eq!(got, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_matmul_transposed_view() {
        let dev = CpuDevice;
        // [2, 3] times its own transpose, read through a strided view.
        let a = CpuBackend::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], DType::F64, &dev)
            .unwrap();
        let a_layout = layout(&[2, 3]);
        let at_layout = a_layout.transpose(0, 1).unwrap();
        let out = CpuBackend::matmul(&a, &a_layout, &a, &at_layout).unwrap();
        let got = CpuBackend::to_f64_vec(&out, &layout(&[2, 2])).unwrap();
        assert_eq!(got, vec![14.0, 32.0, 32.0, 77.0]);
    }

    #[test]
    fn test_clamp() {
        let dev = CpuDevice;
        let s = CpuBackend::from_f64_slice(&[-0.5, 0.25, 1.5], DType::F32, &dev).unwrap();
        let out = CpuBackend::clamp(&s, &layout(&[3]), 0.0, 1.0).unwrap();
        let got = CpuBackend::to_f64_vec(&out, &layout(&[3])).unwrap();
        assert_eq!(got, vec![0.0, 0.25, 1.0]);
    }

    #[test]
    fn test_rand_uniform_range() {
        let dev = CpuDevice;
        let s = CpuBackend::rand_uniform(&Shape::from(1000), DType::F64, &dev).unwrap();
        let got = CpuBackend::to_f64_vec(&s, &layout(&[1000])).unwrap();
        assert!(got.iter().all(|&v| (0.0..1.0).contains(&v)));
    }
}
