use std::collections::{HashMap, HashSet};

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::error::Result;
use crate::op::{Op, TensorId};
use crate::shape::Shape;
use crate::tensor::{col2im, gemm_a_bt, gemm_at_b, ConvGeometry, Tensor};

// Backpropagation — reverse-mode automatic differentiation
//
// The forward pass builds a DAG (each tensor records its Op). backward()
// topologically sorts that DAG from the scalar loss, seeds grad(loss) = 1,
// and walks the ordering in reverse, applying the chain rule per op and
// accumulating contributions where a tensor feeds several ops.
//
// In a style-transfer evaluation the only gradient anyone reads is the one
// on the output image. The extractor's conv weights are frozen leaves
// (is_variable = false), so the conv rule skips the weight-gradient GEMM
// for them outright — that is most of the backward cost of a training
// framework, and none of it is needed here.
//
// Each call returns a fresh GradStore; no gradient state survives between
// evaluations, so there is nothing to "zero" before the next one.

/// Gradients for the tensors of one computation graph, keyed by tensor id.
pub struct GradStore<B: Backend> {
    grads: HashMap<TensorId, Tensor<B>>,
}

impl<B: Backend> Default for GradStore<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> GradStore<B> {
    /// Create an empty store.
    pub fn new() -> Self {
        GradStore {
            grads: HashMap::new(),
        }
    }

    /// The gradient of a tensor, if any flowed to it.
    pub fn get(&self, tensor: &Tensor<B>) -> Option<&Tensor<B>> {
        self.grads.get(&tensor.id())
    }

    fn get_by_id(&self, id: &TensorId) -> Option<&Tensor<B>> {
        self.grads.get(id)
    }

    /// Accumulate a gradient contribution (sum with any existing one —
    /// the multivariate chain rule for tensors used more than once).
    pub fn accumulate(&mut self, id: TensorId, grad: Tensor<B>) -> Result<()> {
        if let Some(existing) = self.grads.get(&id) {
            let new_grad = existing.add(&grad)?;
            self.grads.insert(id, new_grad);
        } else {
            self.grads.insert(id, grad);
        }
        Ok(())
    }
}

/// Topological ordering of the graph rooted at `root`: leaves first,
/// root last. Depth-first, post-order.
fn build_topo<B: Backend>(root: &Tensor<B>) -> Vec<Tensor<B>> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();

    fn visit<B: Backend>(
        t: &Tensor<B>,
        visited: &mut HashSet<TensorId>,
        order: &mut Vec<Tensor<B>>,
    ) {
        if visited.contains(&t.id()) {
            return;
        }
        visited.insert(t.id());
        for input in t.op().inputs() {
            visit(input, visited, order);
        }
        order.push(t.clone());
    }

    visit(root, &mut visited, &mut order);
    order
}

/// Compute gradients of `root` with respect to the tensors in its graph.
/// `root` must be a scalar.
pub fn backward<B: Backend>(root: &Tensor<B>) -> Result<GradStore<B>> {
    if root.elem_count() != 1 {
        return Err(crate::Error::msg(
            "backward() requires a scalar tensor. \
             Reduce with .sum_all() or .mean_all() first.",
        ));
    }

    let topo = build_topo(root);

    let mut grads = GradStore::new();
    let ones = Tensor::<B>::ones(root.shape().clone(), root.dtype(), root.device())?;
    grads.grads.insert(root.id(), ones);

    for tensor in topo.iter().rev() {
        let grad_output = match grads.get_by_id(&tensor.id()) {
            Some(g) => g.clone(),
            None => continue, // no gradient flows through this tensor
        };

        match tensor.op() {
            Op::None => {
                // Leaf — nothing to propagate.
            }

            Op::Contiguous { input } => {
                grads.accumulate(input.id(), grad_output)?;
            }

            Op::Binary { lhs, rhs, op } => {
                compute_binary_grad(*op, &grad_output, lhs, rhs, &mut grads)?;
            }

            Op::Unary { input, op } => {
                compute_unary_grad(*op, &grad_output, input, &mut grads)?;
            }

            Op::Reduce {
                input,
                op,
                dims,
                keep_dim: _,
            } => {
                compute_reduce_grad(*op, &grad_output, input, dims, &mut grads)?;
            }

            Op::Matmul { lhs, rhs } => {
                // C = A @ B:  grad_A = grad_C @ Bᵀ,  grad_B = Aᵀ @ grad_C.
                let grad_lhs = grad_output.matmul(&rhs.t()?)?;
                grads.accumulate(lhs.id(), grad_lhs)?;
                let grad_rhs = lhs.t()?.matmul(&grad_output)?;
                grads.accumulate(rhs.id(), grad_rhs)?;
            }

            Op::Reshape { input, src_shape } => {
                let grad = grad_output.reshape(src_shape.clone())?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Transpose { input, dim0, dim1 } => {
                // Transpose is its own inverse.
                let grad = grad_output.transpose(*dim0, *dim1)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Affine { input, mul, .. } => {
                // d(x * mul + add)/dx = mul
                let grad = grad_output.affine(*mul, 0.0)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Clamp { input, min, max } => {
                // Gradient passes where min < x < max, zero at and beyond
                // the bounds.
                let input_data = input.to_f64_vec()?;
                let grad_data = grad_output.to_f64_vec()?;
                let masked: Vec<f64> = input_data
                    .iter()
                    .zip(grad_data.iter())
                    .map(|(&x, &g)| if x > *min && x < *max { g } else { 0.0 })
                    .collect();
                let grad = Tensor::<B>::from_f64_slice(
                    &masked,
                    input.shape().clone(),
                    input.dtype(),
                    input.device(),
                )?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Conv2d {
                input,
                weight,
                bias,
                stride,
                padding,
            } => {
                compute_conv2d_grad(
                    &grad_output,
                    input,
                    weight,
                    bias.as_ref(),
                    *stride,
                    *padding,
                    &mut grads,
                )?;
            }

            Op::MaxPool2d { input, indices, .. } => {
                compute_maxpool2d_grad(&grad_output, input, indices, &mut grads)?;
            }

            Op::AvgPool2d {
                input,
                kernel_size,
                stride,
                padding,
            } => {
                compute_avgpool2d_grad(
                    &grad_output,
                    input,
                    *kernel_size,
                    *stride,
                    *padding,
                    &mut grads,
                )?;
            }
        }
    }

    Ok(grads)
}

// Binary gradients

fn compute_binary_grad<B: Backend>(
    op: BinaryOp,
    grad_output: &Tensor<B>,
    lhs: &Tensor<B>,
    rhs: &Tensor<B>,
    grads: &mut GradStore<B>,
) -> Result<()> {
    match op {
        BinaryOp::Add => {
            grads.accumulate(lhs.id(), reduce_broadcast_grad(grad_output, lhs.shape())?)?;
            grads.accumulate(rhs.id(), reduce_broadcast_grad(grad_output, rhs.shape())?)?;
        }
        BinaryOp::Sub => {
            grads.accumulate(lhs.id(), reduce_broadcast_grad(grad_output, lhs.shape())?)?;
            let neg = grad_output.neg()?;
            grads.accumulate(rhs.id(), reduce_broadcast_grad(&neg, rhs.shape())?)?;
        }
        BinaryOp::Mul => {
            let raw_lhs = grad_output.mul(rhs)?;
            let raw_rhs = grad_output.mul(lhs)?;
            grads.accumulate(lhs.id(), reduce_broadcast_grad(&raw_lhs, lhs.shape())?)?;
            grads.accumulate(rhs.id(), reduce_broadcast_grad(&raw_rhs, rhs.shape())?)?;
        }
        BinaryOp::Div => {
            // d(a/b)/da = 1/b,  d(a/b)/db = -a/b²
            let raw_lhs = grad_output.div(rhs)?;
            grads.accumulate(lhs.id(), reduce_broadcast_grad(&raw_lhs, lhs.shape())?)?;
            let b_sq = rhs.mul(rhs)?;
            let raw_rhs = grad_output.neg()?.mul(lhs)?.div(&b_sq)?;
            grads.accumulate(rhs.id(), reduce_broadcast_grad(&raw_rhs, rhs.shape())?)?;
        }
    }
    Ok(())
}

/// Sum a gradient over the dimensions that broadcasting expanded, so it
/// matches the original operand's shape. A [1, 3, 1, 1] normalization
/// constant used against a [1, 3, H, W] image gets its gradient summed over
/// the two spatial dims.
fn reduce_broadcast_grad<B: Backend>(
    grad: &Tensor<B>,
    target_shape: &Shape,
) -> Result<Tensor<B>> {
    let grad_dims = grad.dims();
    let target_dims = target_shape.dims();

    if grad_dims == target_dims {
        return Ok(grad.clone());
    }

    // Pad the target with leading 1s to the gradient's rank, then sum every
    // dim where the target is 1 and the gradient is wider.
    let grad_rank = grad_dims.len();
    let offset = grad_rank - target_dims.len();
    let mut padded_target = vec![1usize; grad_rank];
    padded_target[offset..].copy_from_slice(target_dims);

    let mut result = grad.clone();
    for d in (0..grad_rank).rev() {
        if padded_target[d] == 1 && result.dims()[d] > 1 {
            result = result.sum(d, true)?;
        }
    }

    result.reshape(target_shape.clone())
}

// Unary gradients

fn compute_unary_grad<B: Backend>(
    op: UnaryOp,
    grad_output: &Tensor<B>,
    input: &Tensor<B>,
    grads: &mut GradStore<B>,
) -> Result<()> {
    let grad_input = match op {
        // d(-x)/dx = -1
        UnaryOp::Neg => grad_output.neg()?,

        // d(x²)/dx = 2x
        UnaryOp::Square => {
            let two_x = input.affine(2.0, 0.0)?;
            grad_output.mul(&two_x)?
        }

        // d(relu(x))/dx = 1 where x > 0, else 0
        UnaryOp::Relu => {
            let mask_data: Vec<f64> = input
                .to_f64_vec()?
                .iter()
                .map(|&v| if v > 0.0 { 1.0 } else { 0.0 })
                .collect();
            let mask = Tensor::<B>::from_f64_slice(
                &mask_data,
                input.shape().clone(),
                input.dtype(),
                input.device(),
            )?;
            grad_output.mul(&mask)?
        }
    };

    grads.accumulate(input.id(), grad_input)?;
    Ok(())
}

// Reduction gradients

fn compute_reduce_grad<B: Backend>(
    op: ReduceOp,
    grad_output: &Tensor<B>,
    input: &Tensor<B>,
    dims: &[usize],
    grads: &mut GradStore<B>,
) -> Result<()> {
    match op {
        ReduceOp::Sum => {
            if dims.is_empty() {
                // sum_all: every input element sees the scalar gradient.
                let grad_val = grad_output.to_scalar()?;
                let grad = Tensor::<B>::full(
                    input.shape().clone(),
                    grad_val,
                    input.dtype(),
                    input.device(),
                )?;
                grads.accumulate(input.id(), grad)?;
            } else {
                let grad = expand_grad_for_reduce(grad_output, input, dims)?;
                grads.accumulate(input.id(), grad)?;
            }
        }
        ReduceOp::Mean => {
            if dims.is_empty() {
                let n = input.elem_count() as f64;
                let grad_val = grad_output.to_scalar()? / n;
                let grad = Tensor::<B>::full(
                    input.shape().clone(),
                    grad_val,
                    input.dtype(),
                    input.device(),
                )?;
                grads.accumulate(input.id(), grad)?;
            } else {
                let n: f64 = dims.iter().map(|&d| input.dims()[d] as f64).product();
                let grad = expand_grad_for_reduce(grad_output, input, dims)?
                    .affine(1.0 / n, 0.0)?;
                grads.accumulate(input.id(), grad)?;
            }
        }
    }
    Ok(())
}

/// Repeat a reduced gradient back over the reduced dimension(s) so it
/// matches the input's shape.
fn expand_grad_for_reduce<B: Backend>(
    grad: &Tensor<B>,
    input: &Tensor<B>,
    dims: &[usize],
) -> Result<Tensor<B>> {
    let input_dims = input.dims();
    let input_shape = input.shape().clone();
    let grad_data = grad.to_f64_vec()?;
    let total = input_shape.elem_count();
    let input_strides = input_shape.stride_contiguous();

    // Strides into the reduced gradient for each input dim (0 on reduced
    // dims), regardless of whether keep_dim was used.
    let grad_dims: Vec<usize> = input_dims
        .iter()
        .enumerate()
        .filter(|(i, _)| !dims.contains(i))
        .map(|(_, &d)| d)
        .collect();
    let grad_strides_kept = Shape::new(grad_dims).stride_contiguous();
    let mut grad_strides = vec![0usize; input_dims.len()];
    let mut k = 0;
    for d in 0..input_dims.len() {
        if !dims.contains(&d) {
            grad_strides[d] = grad_strides_kept[k];
            k += 1;
        }
    }

    let mut result = vec![0.0f64; total];
    for (flat, slot) in result.iter_mut().enumerate() {
        let mut grad_flat = 0;
        let mut remainder = flat;
        for d in 0..input_dims.len() {
            let coord = remainder / input_strides[d];
            remainder %= input_strides[d];
            grad_flat += coord * grad_strides[d];
        }
        *slot = grad_data[grad_flat];
    }

    Tensor::<B>::from_f64_slice(&result, input_shape, input.dtype(), input.device())
}

// Conv2d gradient
//
//   grad_input  = col2im(weightᵀ × grad_out)      — always needed
//   grad_weight = Σ_batch grad_out × columnsᵀ     — skipped for frozen weights
//   grad_bias   = Σ_{batch, spatial} grad_out     — skipped for frozen bias

fn compute_conv2d_grad<B: Backend>(
    grad_output: &Tensor<B>,
    input: &Tensor<B>,
    weight: &Tensor<B>,
    bias: Option<&Tensor<B>>,
    stride: [usize; 2],
    padding: [usize; 2],
    grads: &mut GradStore<B>,
) -> Result<()> {
    let in_dims = input.dims();
    let w_dims = weight.dims();
    let go_dims = grad_output.dims();
    let (n_batch, c_in, h, w) = (in_dims[0], in_dims[1], in_dims[2], in_dims[3]);
    let (c_out, _, kh, kw) = (w_dims[0], w_dims[1], w_dims[2], w_dims[3]);
    let (h_out, w_out) = (go_dims[2], go_dims[3]);
    let [sh, sw] = stride;
    let [ph, pw] = padding;

    let geometry = ConvGeometry {
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
    };

    let weight_data = weight.contiguous()?.to_f64_vec()?;
    let grad_out_data = grad_output.contiguous()?.to_f64_vec()?;

    let col_rows = c_in * kh * kw;
    let col_cols = h_out * w_out;
    let sample_size = c_in * h * w;

    // grad_input = col2im(weightᵀ × grad_out), per sample.
    let mut columns = vec![0.0f64; col_rows * col_cols];
    let mut grad_in = vec![0.0f64; n_batch * sample_size];

    for ni in 0..n_batch {
        for v in columns.iter_mut() {
            *v = 0.0;
        }
        let go_offset = ni * c_out * col_cols;
        gemm_at_b(
            &weight_data,
            &grad_out_data[go_offset..go_offset + c_out * col_cols],
            &mut columns,
            col_rows,
            col_cols,
            c_out,
        );
        let in_offset = ni * sample_size;
        col2im(
            &columns,
            geometry,
            &mut grad_in[in_offset..in_offset + sample_size],
        );
    }

    let grad_input_t = Tensor::<B>::from_f64_slice(
        &grad_in,
        input.shape().clone(),
        input.dtype(),
        input.device(),
    )?;
    grads.accumulate(input.id(), grad_input_t)?;

    // grad_weight only for trainable weights. The extractor is frozen, so
    // a stylization run never enters this branch.
    if weight.is_variable() {
        let input_data = input.contiguous()?.to_f64_vec()?;
        let mut grad_w = vec![0.0f64; c_out * col_rows];
        for ni in 0..n_batch {
            let in_offset = ni * sample_size;
            crate::tensor::im2col(
                &input_data[in_offset..in_offset + sample_size],
                geometry,
                &mut columns,
            );
            let go_offset = ni * c_out * col_cols;
            gemm_a_bt(
                &grad_out_data[go_offset..go_offset + c_out * col_cols],
                &columns,
                &mut grad_w,
                c_out,
                col_rows,
                col_cols,
            );
        }
        let grad_weight_t = Tensor::<B>::from_f64_slice(
            &grad_w,
            weight.shape().clone(),
            weight.dtype(),
            weight.device(),
        )?;
        grads.accumulate(weight.id(), grad_weight_t)?;
    }

    if let Some(b) = bias {
        if b.is_variable() {
            let mut grad_b = vec![0.0f64; c_out];
            for ni in 0..n_batch {
                for co in 0..c_out {
                    let go_offset = (ni * c_out + co) * col_cols;
                    for j in 0..col_cols {
                        grad_b[co] += grad_out_data[go_offset + j];
                    }
                }
            }
            let grad_bias_t =
                Tensor::<B>::from_f64_slice(&grad_b, b.shape().clone(), b.dtype(), b.device())?;
            grads.accumulate(b.id(), grad_bias_t)?;
        }
    }

    Ok(())
}

// MaxPool2d gradient: each output routes its gradient to the saved argmax.

fn compute_maxpool2d_grad<B: Backend>(
    grad_output: &Tensor<B>,
    input: &Tensor<B>,
    indices: &[usize],
    grads: &mut GradStore<B>,
) -> Result<()> {
    let input_size = input.elem_count();
    let grad_out_data = grad_output.contiguous()?.to_f64_vec()?;

    let mut grad_in = vec![0.0f64; input_size];
    for (out_idx, &in_idx) in indices.iter().enumerate() {
        if in_idx < input_size && out_idx < grad_out_data.len() {
            grad_in[in_idx] += grad_out_data[out_idx];
        }
    }

    let grad_input_t = Tensor::<B>::from_f64_slice(
        &grad_in,
        input.shape().clone(),
        input.dtype(),
        input.device(),
    )?;
    grads.accumulate(input.id(), grad_input_t)?;
    Ok(())
}

// AvgPool2d gradient: distribute each output gradient equally over the
// positions its window covered.

fn compute_avgpool2d_grad<B: Backend>(
    grad_output: &Tensor<B>,
    input: &Tensor<B>,
    kernel_size: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
    grads: &mut GradStore<B>,
) -> Result<()> {
    let in_dims = input.dims();
    let (n, c, h, w) = (in_dims[0], in_dims[1], in_dims[2], in_dims[3]);
    let [kh, kw] = kernel_size;
    let [sh, sw] = stride;
    let [ph, pw] = padding;
    let h_out = (h + 2 * ph - kh) / sh + 1;
    let w_out = (w + 2 * pw - kw) / sw + 1;

    let grad_out_data = grad_output.contiguous()?.to_f64_vec()?;
    let mut grad_in = vec![0.0f64; input.elem_count()];

    for ni in 0..n {
        for ci in 0..c {
            for oh in 0..h_out {
                for ow in 0..w_out {
                    let out_idx = ((ni * c + ci) * h_out + oh) * w_out + ow;
                    let mut count = 0usize;
                    for ki in 0..kh {
                        for kj in 0..kw {
                            let ih = (oh * sh + ki) as isize - ph as isize;
                            let iw = (ow * sw + kj) as isize - pw as isize;
                            if ih >= 0 && ih < h as isize && iw >= 0 && iw < w as isize {
                                count += 1;
                            }
                        }
                    }
                    if count == 0 {
                        continue;
                    }
                    let scale = 1.0 / count as f64;
                    for ki in 0..kh {
                        for kj in 0..kw {
                            let ih = (oh * sh + ki) as isize - ph as isize;
                            let iw = (ow * sw + kj) as isize - pw as isize;
                            if ih >= 0 && ih < h as isize && iw >= 0 && iw < w as isize {
                                let in_idx =
                                    ((ni * c + ci) * h + ih as usize) * w + iw as usize;
                                grad_in[in_idx] += grad_out_data[out_idx] * scale;
                            }
                        }
                    }
                }
            }
        }
    }

    let grad_input_t = Tensor::<B>::from_f64_slice(
        &grad_in,
        input.shape().clone(),
        input.dtype(),
        input.device(),
    )?;
    grads.accumulate(input.id(), grad_input_t)?;
    Ok(())
}
