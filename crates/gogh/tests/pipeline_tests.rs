// Integration tests for the loss stages, the feature extractor, and the
// pipeline assembler: Gram properties, zero-loss properties, pass-through
// identity, truncation, and the assembly-time failure modes.

use std::collections::HashMap;

use gogh::prelude::*;

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

/// A small frozen extractor for pipeline tests:
/// conv_1, relu_1, pool_1, conv_2, relu_2, conv_3, relu_3.
fn tiny_extractor(dev: &CpuDevice) -> FeatureExtractor<CpuBackend> {
    let conv = |c_in, c_out| {
        Conv2d::<CpuBackend>::new(c_in, c_out, [3, 3], [1, 1], [1, 1], true, DType::F32, dev)
            .unwrap()
    };
    FeatureExtractor::new(vec![
        ("conv_1".to_string(), ExtractorLayer::Conv(conv(3, 4))),
        ("relu_1".to_string(), ExtractorLayer::Relu),
        (
            "pool_1".to_string(),
            ExtractorLayer::Pool(PoolLayer::Max(MaxPool2d::new([2, 2], [2, 2], [0, 0]))),
        ),
        ("conv_2".to_string(), ExtractorLayer::Conv(conv(4, 4))),
        ("relu_2".to_string(), ExtractorLayer::Relu),
        ("conv_3".to_string(), ExtractorLayer::Conv(conv(4, 4))),
        ("relu_3".to_string(), ExtractorLayer::Relu),
    ])
}

fn identity_norm(dev: &CpuDevice) -> Normalization<CpuBackend> {
    Normalization::new([0.0; 3], [1.0; 3], DType::F32, dev).unwrap()
}

// Gram matrix properties

#[test]
fn test_gram_symmetry() -> gogh::Result<()> {
    let dev = CpuDevice;
    let f = CpuTensor::randn((1, 6, 5, 5), DType::F64, &dev)?;
    let gram = gram_matrix(&f)?;
    let gram_t = gram.t()?.contiguous()?;
    let a = gram.to_f64_vec()?;
    let b = gram_t.to_f64_vec()?;
    for (x, y) in a.iter().zip(b.iter()) {
        assert!(approx_eq(*x, *y, 1e-10), "gram not symmetric: {x} vs {y}");
    }
    Ok(())
}

#[test]
fn test_gram_scales_quadratically() -> gogh::Result<()> {
    let dev = CpuDevice;
    let f = CpuTensor::randn((1, 4, 6, 6), DType::F64, &dev)?;
    let k = 3.0;
    let scaled = f.affine(k, 0.0)?;
    let g1 = gram_matrix(&f)?.to_f64_vec()?;
    let g2 = gram_matrix(&scaled)?.to_f64_vec()?;
    for (a, b) in g1.iter().zip(g2.iter()) {
        assert!(
            approx_eq(b / (k * k), *a, 1e-8),
            "gram(k·F) != k²·gram(F): {b} vs {}",
            a * k * k
        );
    }
    Ok(())
}

#[test]
fn test_gram_normalization_divisor() -> gogh::Result<()> {
    let dev = CpuDevice;
    // A single all-ones channel: every raw inner product is H·W, and the
    // normalized Gram entry must be H·W / (C·H·W) = 1/C with C = 1.
    let f = CpuTensor::ones((1, 1, 4, 4), DType::F64, &dev)?;
    let gram = gram_matrix(&f)?;
    assert_eq!(gram.dims(), &[1, 1]);
    assert!(approx_eq(gram.to_scalar()?, 1.0, 1e-12));
    Ok(())
}

// Loss stage properties

#[test]
fn test_content_loss_zero_on_target() -> gogh::Result<()> {
    let dev = CpuDevice;
    let target = CpuTensor::randn((1, 4, 5, 5), DType::F64, &dev)?;
    let loss = ContentLoss::new(&target).loss(&target)?;
    assert!(loss.to_scalar()?.abs() < 1e-12);
    Ok(())
}

#[test]
fn test_style_loss_zero_on_matching_gram() -> gogh::Result<()> {
    let dev = CpuDevice;
    let feature = CpuTensor::randn((1, 4, 5, 5), DType::F64, &dev)?;
    let style = StyleLoss::new(&feature)?;
    assert!(style.loss(&feature)?.to_scalar()?.abs() < 1e-12);
    Ok(())
}

#[test]
fn test_content_loss_positive_off_target() -> gogh::Result<()> {
    let dev = CpuDevice;
    let target = CpuTensor::zeros((1, 2, 3, 3), DType::F64, &dev)?;
    let other = CpuTensor::ones((1, 2, 3, 3), DType::F64, &dev)?;
    let loss = ContentLoss::new(&target).loss(&other)?;
    assert!(approx_eq(loss.to_scalar()?, 1.0, 1e-12));
    Ok(())
}

#[test]
fn test_content_loss_rejects_shape_mismatch() {
    let dev = CpuDevice;
    let target = CpuTensor::zeros((1, 2, 4, 4), DType::F64, &dev).unwrap();
    let wrong = CpuTensor::zeros((1, 2, 8, 8), DType::F64, &dev).unwrap();
    assert!(ContentLoss::new(&target).loss(&wrong).is_err());
}

#[test]
fn test_loss_targets_are_detached() -> gogh::Result<()> {
    let dev = CpuDevice;
    let source = CpuTensor::randn((1, 2, 4, 4), DType::F64, &dev)?.set_variable();
    let activation = source.square()?;
    let content = ContentLoss::new(&activation);

    // Driving the loss with a different input must not leak gradient into
    // the tensor the target was captured from.
    let probe = CpuTensor::randn((1, 2, 4, 4), DType::F64, &dev)?.set_variable();
    let grads = content.loss(&probe)?.backward()?;
    assert!(grads.get(&source).is_none());
    assert!(grads.get(&probe).is_some());
    Ok(())
}

// Extractor

#[test]
fn test_extractor_freezes_convs() {
    let dev = CpuDevice;
    let extractor = tiny_extractor(&dev);
    for (_, layer) in extractor.layers() {
        if let ExtractorLayer::Conv(conv) = layer {
            assert!(!conv.weight().is_variable());
            if let Some(bias) = conv.bias() {
                assert!(!bias.is_variable());
            }
        }
    }
}

/// Synthetic VGG-19 state dict in the torchvision key layout.
fn vgg19_state_dict(dev: &CpuDevice) -> HashMap<String, CpuTensor> {
    const CFG: &[usize] = &[
        64, 64, 0, 128, 128, 0, 256, 256, 256, 256, 0, 512, 512, 512, 512, 0, 512, 512, 512,
        512, 0,
    ];
    let mut dict = HashMap::new();
    let mut idx = 0usize;
    let mut c_in = 3usize;
    for &c_out in CFG {
        if c_out == 0 {
            idx += 1;
            continue;
        }
        dict.insert(
            format!("features.{idx}.weight"),
            CpuTensor::randn((c_out, c_in, 3, 3), DType::F32, dev).unwrap(),
        );
        dict.insert(
            format!("features.{idx}.bias"),
            CpuTensor::randn(c_out, DType::F32, dev).unwrap(),
        );
        c_in = c_out;
        idx += 2;
    }
    dict
}

#[test]
fn test_vgg19_construction_and_naming() -> gogh::Result<()> {
    let dev = CpuDevice;
    let dict = vgg19_state_dict(&dev);
    let vgg = FeatureExtractor::vgg19(&dict, Pooling::Max)?;

    // 16 convs + 16 relus + 5 pools.
    assert_eq!(vgg.len(), 37);
    let names = vgg.layer_names();
    assert_eq!(names[0], "conv_1");
    assert_eq!(names[1], "relu_1");
    assert_eq!(names[4], "pool_2");
    assert!(names.contains(&"conv_16"));
    assert_eq!(names.iter().filter(|n| n.starts_with("pool")).count(), 5);

    // Every conv arrives frozen.
    for (_, layer) in vgg.layers() {
        if let ExtractorLayer::Conv(conv) = layer {
            assert!(!conv.weight().is_variable());
        }
    }
    Ok(())
}

#[test]
fn test_vgg19_average_pooling_variant() -> gogh::Result<()> {
    let dev = CpuDevice;
    let dict = vgg19_state_dict(&dev);
    let vgg = FeatureExtractor::vgg19(&dict, Pooling::Avg)?;
    let has_avg = vgg
        .layers()
        .iter()
        .any(|(_, l)| matches!(l, ExtractorLayer::Pool(PoolLayer::Avg(_))));
    let has_max = vgg
        .layers()
        .iter()
        .any(|(_, l)| matches!(l, ExtractorLayer::Pool(PoolLayer::Max(_))));
    assert!(has_avg && !has_max);
    Ok(())
}

#[test]
fn test_vgg19_missing_tensor() {
    let dev = CpuDevice;
    let mut dict = vgg19_state_dict(&dev);
    dict.remove("features.10.weight");
    assert!(FeatureExtractor::vgg19(&dict, Pooling::Max).is_err());
}

// Assembler

#[test]
fn test_assembled_pipeline_counts_and_order() -> gogh::Result<()> {
    let dev = CpuDevice;
    let extractor = tiny_extractor(&dev);
    let content = CpuTensor::rand((1, 3, 8, 8), DType::F32, &dev)?;
    let style = CpuTensor::rand((1, 3, 8, 8), DType::F32, &dev)?;

    let pipeline = assemble(
        &extractor,
        identity_norm(&dev),
        &content,
        &style,
        &["conv_2".to_string()],
        &["conv_1".to_string(), "conv_2".to_string()],
    )?;

    assert_eq!(pipeline.num_content_stages(), 1);
    assert_eq!(pipeline.num_style_stages(), 2);
    assert!(matches!(pipeline.stages()[0], Stage::Normalize(_)));
    Ok(())
}

#[test]
fn test_pipeline_truncates_after_deepest_insertion() -> gogh::Result<()> {
    let dev = CpuDevice;
    let extractor = tiny_extractor(&dev);
    let content = CpuTensor::rand((1, 3, 8, 8), DType::F32, &dev)?;
    let style = CpuTensor::rand((1, 3, 8, 8), DType::F32, &dev)?;

    let pipeline = assemble(
        &extractor,
        identity_norm(&dev),
        &content,
        &style,
        &[],
        &["conv_1".to_string(), "conv_2".to_string()],
    )?;

    let names = pipeline.layer_names();
    // Nothing past conv_2 — relu_2, conv_3, relu_3 are excluded.
    assert_eq!(names.last().copied(), Some("conv_2"));
    assert!(!names.contains(&"relu_2"));
    assert!(!names.contains(&"conv_3"));
    Ok(())
}

#[test]
fn test_pass_through_identity() -> gogh::Result<()> {
    let dev = CpuDevice;
    let extractor = tiny_extractor(&dev);
    let content = CpuTensor::rand((1, 3, 8, 8), DType::F32, &dev)?;
    let style = CpuTensor::rand((1, 3, 8, 8), DType::F32, &dev)?;

    let pipeline = assemble(
        &extractor,
        identity_norm(&dev),
        &content,
        &style,
        &["conv_2".to_string()],
        &["conv_1".to_string(), "conv_2".to_string()],
    )?;

    // The loss stages must not alter the activation: evaluating the
    // pipeline equals evaluating the bare layer prefix.
    let probe = CpuTensor::rand((1, 3, 8, 8), DType::F32, &dev)?;
    let with_losses = pipeline.forward(&probe)?;

    let mut bare = identity_norm(&dev).forward(&probe)?;
    for (name, layer) in extractor.layers() {
        bare = layer.forward(&bare)?;
        if name == "conv_2" {
            break;
        }
    }

    assert_eq!(with_losses.output.to_f64_vec()?, bare.to_f64_vec()?);
    assert_eq!(with_losses.content.len(), 1);
    assert_eq!(with_losses.style.len(), 2);
    Ok(())
}

#[test]
fn test_pipeline_losses_zero_for_content_input() -> gogh::Result<()> {
    let dev = CpuDevice;
    let extractor = tiny_extractor(&dev);
    let content = CpuTensor::rand((1, 3, 8, 8), DType::F32, &dev)?;
    let pipeline = assemble(
        &extractor,
        identity_norm(&dev),
        &content,
        &content,
        &["conv_2".to_string()],
        &["conv_1".to_string()],
    )?;

    // Content == style == probe: every target matches its activation.
    let losses = pipeline.forward(&content)?;
    for l in losses.content.iter().chain(losses.style.iter()) {
        assert!(l.to_scalar()?.abs() < 1e-8);
    }
    Ok(())
}

#[test]
fn test_missing_insertion_point_fails_at_assembly() {
    let dev = CpuDevice;
    let extractor = tiny_extractor(&dev);
    let content = CpuTensor::rand((1, 3, 8, 8), DType::F32, &dev).unwrap();
    let style = CpuTensor::rand((1, 3, 8, 8), DType::F32, &dev).unwrap();

    let err = assemble(
        &extractor,
        identity_norm(&dev),
        &content,
        &style,
        &["conv_9".to_string()],
        &["conv_1".to_string()],
    )
    .unwrap_err();
    assert!(matches!(err, gogh::Error::LayerNotFound { ref name } if name == "conv_9"));
}

#[test]
fn test_dimension_mismatch_fails_at_assembly() {
    let dev = CpuDevice;
    let extractor = tiny_extractor(&dev);
    let content = CpuTensor::rand((1, 3, 100, 100), DType::F32, &dev).unwrap();
    let style = CpuTensor::rand((1, 3, 50, 50), DType::F32, &dev).unwrap();

    let err = assemble(
        &extractor,
        identity_norm(&dev),
        &content,
        &style,
        &["conv_2".to_string()],
        &["conv_1".to_string()],
    )
    .unwrap_err();
    assert!(matches!(err, gogh::Error::SizeMismatch { .. }));
}
