// Integration tests for the tensor engine: op semantics and gradient
// correctness for the operations the style-transfer graph evaluates.
// Gradient checks run in F64 against central finite differences.

use gogh::prelude::*;

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

// Op semantics

#[test]
fn test_add_broadcast_channel_constant() -> gogh::Result<()> {
    let dev = CpuDevice;
    let img = CpuTensor::ones((1, 3, 2, 2), DType::F64, &dev)?;
    let chan = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0], (1, 3, 1, 1), DType::F64, &dev)?;
    let out = img.add(&chan)?;
    assert_eq!(out.dims(), &[1, 3, 2, 2]);
    assert_vec_approx(
        &out.to_f64_vec()?,
        &[2.0, 2.0, 2.0, 2.0, 3.0, 3.0, 3.0, 3.0, 4.0, 4.0, 4.0, 4.0],
        1e-12,
    );
    Ok(())
}

#[test]
fn test_relu() -> gogh::Result<()> {
    let dev = CpuDevice;
    let x = CpuTensor::from_f64_slice(&[-1.0, 0.0, 2.5], 3, DType::F64, &dev)?;
    assert_vec_approx(&x.relu()?.to_f64_vec()?, &[0.0, 0.0, 2.5], 1e-12);
    Ok(())
}

#[test]
fn test_clamp_idempotent() -> gogh::Result<()> {
    let dev = CpuDevice;
    let x = CpuTensor::from_f64_slice(&[-0.2, 0.0, 0.4, 1.0, 1.7], 5, DType::F32, &dev)?;
    let once = x.clamp(0.0, 1.0)?;
    let twice = once.clamp(0.0, 1.0)?;
    // Applying the projection twice changes nothing, bit for bit.
    assert_eq!(once.to_f64_vec()?, twice.to_f64_vec()?);
    assert_vec_approx(&once.to_f64_vec()?, &[0.0, 0.0, 0.4, 1.0, 1.0], 1e-6);
    Ok(())
}

#[test]
fn test_reshape_transpose_gram_shape() -> gogh::Result<()> {
    let dev = CpuDevice;
    let f = CpuTensor::rand((1, 4, 3, 3), DType::F64, &dev)?;
    let flat = f.reshape((4, 9))?;
    let gram = flat.matmul(&flat.t()?)?;
    assert_eq!(gram.dims(), &[4, 4]);
    Ok(())
}

#[test]
fn test_mean_all_value() -> gogh::Result<()> {
    let dev = CpuDevice;
    let x = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 6.0], (2, 2), DType::F64, &dev)?;
    assert!(approx_eq(x.mean_all()?.to_scalar()?, 3.0, 1e-12));
    Ok(())
}

#[test]
fn test_max_pool_values() -> gogh::Result<()> {
    let dev = CpuDevice;
    let x = CpuTensor::from_f64_slice(
        &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0, 13.0, 14.0, 15.0, 16.0],
        (1, 1, 4, 4),
        DType::F64,
        &dev,
    )?;
    let y = x.max_pool2d([2, 2], [2, 2], [0, 0])?;
    assert_eq!(y.dims(), &[1, 1, 2, 2]);
    assert_vec_approx(&y.to_f64_vec()?, &[6.0, 8.0, 14.0, 16.0], 1e-12);
    Ok(())
}

#[test]
fn test_conv2d_known_kernel() -> gogh::Result<()> {
    let dev = CpuDevice;
    // A 3×3 box filter over a constant image keeps the interior constant.
    let x = CpuTensor::ones((1, 1, 4, 4), DType::F64, &dev)?;
    let w = CpuTensor::full((1, 1, 3, 3), 1.0 / 9.0, DType::F64, &dev)?;
    let y = x.conv2d(&w, None, [1, 1], [0, 0])?;
    assert_eq!(y.dims(), &[1, 1, 2, 2]);
    assert_vec_approx(&y.to_f64_vec()?, &[1.0, 1.0, 1.0, 1.0], 1e-12);
    Ok(())
}

// Gradient checks

/// Central finite difference of a scalar-valued function of one tensor.
fn finite_diff<F>(x: &CpuTensor, f: F, eps: f64) -> gogh::Result<Vec<f64>>
where
    F: Fn(&CpuTensor) -> gogh_core::Result<f64>,
{
    let base = x.to_f64_vec()?;
    let dev = CpuDevice;
    let mut grad = vec![0.0f64; base.len()];
    for i in 0..base.len() {
        let mut plus = base.clone();
        plus[i] += eps;
        let xp = CpuTensor::from_f64_slice(&plus, x.shape().clone(), DType::F64, &dev)?;
        let mut minus = base.clone();
        minus[i] -= eps;
        let xm = CpuTensor::from_f64_slice(&minus, x.shape().clone(), DType::F64, &dev)?;
        grad[i] = (f(&xp)? - f(&xm)?) / (2.0 * eps);
    }
    Ok(grad)
}

#[test]
fn test_grad_square_mean() -> gogh::Result<()> {
    let dev = CpuDevice;
    let x = CpuTensor::from_f64_slice(&[0.5, -1.5, 2.0, 0.0], (2, 2), DType::F64, &dev)?
        .set_variable();
    let loss = x.square()?.mean_all()?;
    let grads = loss.backward()?;
    let got = grads.get(&x).unwrap().to_f64_vec()?;
    // d(mean(x²))/dx = 2x / N
    assert_vec_approx(&got, &[0.25, -0.75, 1.0, 0.0], 1e-10);
    Ok(())
}

#[test]
fn test_grad_mse_against_finite_diff() -> gogh::Result<()> {
    let dev = CpuDevice;
    let x = CpuTensor::randn((1, 2, 3, 3), DType::F64, &dev)?.set_variable();
    let target = CpuTensor::randn((1, 2, 3, 3), DType::F64, &dev)?;

    let loss = mse_loss(&x, &target)?;
    let grads = loss.backward()?;
    let got = grads.get(&x).unwrap().to_f64_vec()?;

    let expected = finite_diff(&x, |t| mse_loss(t, &target)?.to_scalar(), 1e-5)?;
    assert_vec_approx(&got, &expected, 1e-6);
    Ok(())
}

#[test]
fn test_grad_conv2d_input_against_finite_diff() -> gogh::Result<()> {
    let dev = CpuDevice;
    let x = CpuTensor::randn((1, 2, 4, 4), DType::F64, &dev)?.set_variable();
    let w = CpuTensor::randn((3, 2, 3, 3), DType::F64, &dev)?;
    let b = CpuTensor::randn(3, DType::F64, &dev)?;

    let loss = x
        .conv2d(&w, Some(&b), [1, 1], [1, 1])?
        .square()?
        .mean_all()?;
    let grads = loss.backward()?;
    let got = grads.get(&x).unwrap().to_f64_vec()?;

    let expected = finite_diff(
        &x,
        |t| {
            t.conv2d(&w, Some(&b), [1, 1], [1, 1])?
                .square()?
                .mean_all()?
                .to_scalar()
        },
        1e-5,
    )?;
    assert_vec_approx(&got, &expected, 1e-5);
    Ok(())
}

#[test]
fn test_grad_gram_against_finite_diff() -> gogh::Result<()> {
    let dev = CpuDevice;
    let x = CpuTensor::randn((1, 3, 3, 3), DType::F64, &dev)?.set_variable();
    let target = gram_matrix(&CpuTensor::randn((1, 3, 3, 3), DType::F64, &dev)?)?;

    let loss = mse_loss(&gram_matrix(&x)?, &target)?;
    let grads = loss.backward()?;
    let got = grads.get(&x).unwrap().to_f64_vec()?;

    let expected = finite_diff(
        &x,
        |t| mse_loss(&gram_matrix(t)?, &target)?.to_scalar(),
        1e-5,
    )?;
    assert_vec_approx(&got, &expected, 1e-5);
    Ok(())
}

#[test]
fn test_grad_max_pool_routes_to_argmax() -> gogh::Result<()> {
    let dev = CpuDevice;
    let x = CpuTensor::from_f64_slice(
        &[1.0, 2.0, 3.0, 9.0],
        (1, 1, 2, 2),
        DType::F64,
        &dev,
    )?
    .set_variable();
    let loss = x.max_pool2d([2, 2], [2, 2], [0, 0])?.sum_all()?;
    let grads = loss.backward()?;
    // Only the 9.0 slot wins the window.
    assert_vec_approx(
        &grads.get(&x).unwrap().to_f64_vec()?,
        &[0.0, 0.0, 0.0, 1.0],
        1e-12,
    );
    Ok(())
}

#[test]
fn test_grad_normalization_against_finite_diff() -> gogh::Result<()> {
    let dev = CpuDevice;
    let norm = Normalization::<CpuBackend>::new(IMAGENET_MEAN, IMAGENET_STD, DType::F64, &dev)?;
    let x = CpuTensor::rand((1, 3, 4, 4), DType::F64, &dev)?.set_variable();

    let loss = norm.forward(&x)?.square()?.mean_all()?;
    let grads = loss.backward()?;
    let got = grads.get(&x).unwrap().to_f64_vec()?;

    let expected = finite_diff(
        &x,
        |t| norm.forward(t)?.square()?.mean_all()?.to_scalar(),
        1e-6,
    )?;
    assert_vec_approx(&got, &expected, 1e-6);
    Ok(())
}

// Frozen-parameter behavior

#[test]
fn test_frozen_weight_gets_no_gradient() -> gogh::Result<()> {
    let dev = CpuDevice;
    let x = CpuTensor::randn((1, 2, 4, 4), DType::F64, &dev)?.set_variable();

    let trainable = CpuTensor::randn((3, 2, 3, 3), DType::F64, &dev)?.set_variable();
    let loss = x.conv2d(&trainable, None, [1, 1], [1, 1])?.mean_all()?;
    let grads = loss.backward()?;
    assert!(grads.get(&trainable).is_some());

    let frozen = trainable.freeze();
    let loss = x.conv2d(&frozen, None, [1, 1], [1, 1])?.mean_all()?;
    let grads = loss.backward()?;
    assert!(grads.get(&frozen).is_none());
    // The image still gets its gradient through the frozen layer.
    assert!(grads.get(&x).is_some());
    Ok(())
}

#[test]
fn test_detach_blocks_gradient_flow() -> gogh::Result<()> {
    let dev = CpuDevice;
    let x = CpuTensor::from_f64_slice(&[2.0], 1, DType::F64, &dev)?.set_variable();
    let y = x.square()?;
    let loss = y.detach().square()?.mean_all()?;
    let grads = loss.backward()?;
    assert!(grads.get(&x).is_none());
    Ok(())
}

#[test]
fn test_inplace_update_visible_through_clones() -> gogh::Result<()> {
    let dev = CpuDevice;
    let x = CpuTensor::from_f64_slice(&[1.0, 2.0], 2, DType::F32, &dev)?;
    let view = x.clone();
    x.update_data_inplace(&[7.0, 8.0])?;
    assert_vec_approx(&view.to_f64_vec()?, &[7.0, 8.0], 1e-6);
    // A deep copy is independent.
    let copied = x.copy()?;
    x.update_data_inplace(&[0.0, 0.0])?;
    assert_vec_approx(&copied.to_f64_vec()?, &[7.0, 8.0], 1e-6);
    Ok(())
}
