// End-to-end tests: the optimization loop over an assembled pipeline,
// image file round-trips, and weight-file round-trips.

use std::path::PathBuf;

use gogh::prelude::*;

/// A unique scratch path under the system temp dir.
fn scratch(name: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("gogh-test-{}-{}", std::process::id(), name));
    p
}

/// A solid-color [1, 3, size, size] image tensor.
fn solid(rgb: [f64; 3], size: usize, dev: &CpuDevice) -> CpuTensor {
    let hw = size * size;
    let mut data = vec![0.0f64; 3 * hw];
    for c in 0..3 {
        data[c * hw..(c + 1) * hw].fill(rgb[c]);
    }
    CpuTensor::from_f64_slice(&data, (1, 3, size, size), DType::F32, dev).unwrap()
}

/// A small frozen extractor deep enough for one pool and two convs.
fn small_extractor(dev: &CpuDevice) -> FeatureExtractor<CpuBackend> {
    let conv = |c_in, c_out| {
        Conv2d::<CpuBackend>::new(c_in, c_out, [3, 3], [1, 1], [1, 1], true, DType::F32, dev)
            .unwrap()
    };
    FeatureExtractor::new(vec![
        ("conv_1".to_string(), ExtractorLayer::Conv(conv(3, 8))),
        ("relu_1".to_string(), ExtractorLayer::Relu),
        (
            "pool_1".to_string(),
            ExtractorLayer::Pool(PoolLayer::Max(MaxPool2d::new([2, 2], [2, 2], [0, 0]))),
        ),
        ("conv_2".to_string(), ExtractorLayer::Conv(conv(8, 8))),
        ("relu_2".to_string(), ExtractorLayer::Relu),
    ])
}

fn build_pipeline(
    content: &CpuTensor,
    style: &CpuTensor,
    dev: &CpuDevice,
) -> gogh::Result<LossPipeline<CpuBackend>> {
    let norm = Normalization::new(IMAGENET_MEAN, IMAGENET_STD, DType::F32, dev)?;
    assemble(
        &small_extractor(dev),
        norm,
        content,
        style,
        &["conv_2".to_string()],
        &["conv_1".to_string(), "conv_2".to_string()],
    )
}

/// The weighted objective at the pipeline's current losses for an input.
fn weighted_loss(
    pipeline: &LossPipeline<CpuBackend>,
    input: &CpuTensor,
    style_weight: f64,
    content_weight: f64,
) -> gogh::Result<f64> {
    let losses = pipeline.forward(input)?;
    let mut total = 0.0;
    for l in &losses.style {
        total += style_weight * l.to_scalar()?;
    }
    for l in &losses.content {
        total += content_weight * l.to_scalar()?;
    }
    Ok(total)
}

// The optimization loop

#[test]
fn test_end_to_end_gray_to_red() -> gogh::Result<()> {
    let dev = CpuDevice;
    let content = solid([0.5, 0.5, 0.5], 64, &dev);
    let style = solid([1.0, 0.0, 0.0], 64, &dev);

    let pipeline = build_pipeline(&content, &style, &dev)?;
    let output = run_style_transfer(&pipeline, content.copy()?, 5, 10_000.0, 1.0)?;

    assert_eq!(output.dims(), &[1, 3, 64, 64]);
    let data = output.to_f64_vec()?;
    assert_eq!(data.len(), 3 * 64 * 64);
    assert!(
        data.iter().all(|&v| (0.0..=1.0).contains(&v)),
        "output pixels must lie in [0, 1]"
    );
    Ok(())
}

#[test]
fn test_weighted_loss_decreases() -> gogh::Result<()> {
    let dev = CpuDevice;
    let content = solid([0.5, 0.5, 0.5], 32, &dev);
    let style = solid([0.9, 0.1, 0.2], 32, &dev);

    let pipeline = build_pipeline(&content, &style, &dev)?;
    let (style_weight, content_weight) = (10_000.0, 1.0);

    let initial = weighted_loss(&pipeline, &content, style_weight, content_weight)?;
    let output = run_style_transfer(&pipeline, content.copy()?, 15, style_weight, content_weight)?;
    let final_loss = weighted_loss(&pipeline, &output, style_weight, content_weight)?;

    assert!(
        final_loss < initial,
        "weighted loss did not improve: {initial} -> {final_loss}"
    );
    Ok(())
}

#[test]
fn test_output_starts_from_content_and_moves() -> gogh::Result<()> {
    let dev = CpuDevice;
    let content = solid([0.5, 0.5, 0.5], 32, &dev);
    let style = solid([1.0, 0.0, 0.0], 32, &dev);

    let pipeline = build_pipeline(&content, &style, &dev)?;
    let output = run_style_transfer(&pipeline, content.copy()?, 10, 100_000.0, 1.0)?;

    // The run must not mutate the caller's content tensor…
    assert!(content.to_f64_vec()?.iter().all(|&v| v == 0.5));
    // …and with this much style pressure the output must leave it.
    let moved = output
        .to_f64_vec()?
        .iter()
        .any(|&v| (v - 0.5).abs() > 1e-3);
    assert!(moved, "output never moved away from the content image");
    Ok(())
}

// Image I/O

#[test]
fn test_image_roundtrip_and_dir_creation() -> gogh::Result<()> {
    let dev = CpuDevice;
    let tensor = solid([1.0, 0.0, 0.0], 16, &dev);

    // Save into a directory that does not exist yet.
    let dir = scratch("imgio");
    let path = dir.join("nested").join("red.png");
    gogh::image_io::save_image(&tensor, &path)?;
    assert!(path.exists());

    let loaded = gogh::image_io::load_image::<CpuBackend>(&path, 16, &dev)?;
    assert_eq!(loaded.dims(), &[1, 3, 16, 16]);
    let data = loaded.to_f64_vec()?;
    let hw = 16 * 16;
    assert!(data[..hw].iter().all(|&v| v > 0.99)); // red channel
    assert!(data[hw..].iter().all(|&v| v < 0.01)); // green, blue

    // Loading at a different size resizes.
    let resized = gogh::image_io::load_image::<CpuBackend>(&path, 8, &dev)?;
    assert_eq!(resized.dims(), &[1, 3, 8, 8]);

    std::fs::remove_dir_all(&dir).ok();
    Ok(())
}

#[test]
fn test_load_missing_image_fails() {
    let dev = CpuDevice;
    let missing = scratch("no-such-image.png");
    assert!(gogh::image_io::load_image::<CpuBackend>(&missing, 16, &dev).is_err());
}

// Weights

#[test]
fn test_safetensors_roundtrip() -> gogh::Result<()> {
    let dev = CpuDevice;
    let w = CpuTensor::randn((4, 3, 3, 3), DType::F32, &dev)?;
    let b = CpuTensor::randn(4, DType::F64, &dev)?;
    let named = vec![
        ("features.0.weight".to_string(), w.clone()),
        ("features.0.bias".to_string(), b.clone()),
    ];

    let bytes = gogh::weights::to_bytes(&named)?;
    let loaded = gogh::weights::from_bytes::<CpuBackend>(&bytes, &dev)?;
    assert_eq!(loaded.len(), 2);

    for (name, original) in &named {
        let (_, restored) = loaded.iter().find(|(n, _)| n == name).unwrap();
        assert_eq!(restored.dims(), original.dims());
        assert_eq!(restored.dtype(), original.dtype());
        let a = original.to_f64_vec()?;
        let r = restored.to_f64_vec()?;
        for (x, y) in a.iter().zip(r.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }
    Ok(())
}

#[test]
fn test_safetensors_f16_payload_widens_to_f32() -> gogh::Result<()> {
    let dev = CpuDevice;
    // Hand-build a file with an F16 tensor, as redistributed checkpoints
    // often ship.
    let values = [0.5f32, -1.25, 2.0, 0.0];
    let payload: Vec<u8> = values
        .iter()
        .flat_map(|&v| half::f16::from_f32(v).to_le_bytes())
        .collect();
    let header = format!(
        "{{\"t\":{{\"dtype\":\"F16\",\"shape\":[2,2],\"data_offsets\":[0,{}]}}}}",
        payload.len()
    );
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&(header.len() as u64).to_le_bytes());
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(&payload);

    let loaded = gogh::weights::from_bytes::<CpuBackend>(&bytes, &dev)?;
    assert_eq!(loaded.len(), 1);
    let (name, tensor) = &loaded[0];
    assert_eq!(name, "t");
    assert_eq!(tensor.dtype(), DType::F32);
    assert_eq!(tensor.dims(), &[2, 2]);
    let got = tensor.to_f64_vec()?;
    for (g, e) in got.iter().zip(values.iter()) {
        assert!((g - *e as f64).abs() < 1e-3);
    }
    Ok(())
}

#[test]
fn test_safetensors_rejects_garbage() {
    let dev = CpuDevice;
    assert!(gogh::weights::from_bytes::<CpuBackend>(&[1, 2, 3], &dev).is_err());

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&(7u64).to_le_bytes());
    bytes.extend_from_slice(b"not json");
    assert!(gogh::weights::from_bytes::<CpuBackend>(&bytes, &dev).is_err());
}

// The full file-to-file path

#[test]
fn test_stylize_image_from_files() -> gogh::Result<()> {
    let dev = CpuDevice;
    let dir = scratch("stylize");
    std::fs::create_dir_all(&dir)?;
    let content_path = dir.join("content.png");
    let style_path = dir.join("style.png");
    gogh::image_io::save_image(&solid([0.5, 0.5, 0.5], 32, &dev), &content_path)?;
    gogh::image_io::save_image(&solid([1.0, 0.0, 0.0], 32, &dev), &style_path)?;

    let config = StylizeConfig {
        output_size: 32,
        num_steps: 3,
        style_weight: 10_000.0,
        content_weight: 1.0,
        content_layers: vec!["conv_2".to_string()],
        style_layers: vec!["conv_1".to_string(), "conv_2".to_string()],
        pooling: Pooling::Max,
    };
    let output = stylize_image(
        &small_extractor(&dev),
        &content_path,
        &style_path,
        &config,
        &dev,
    )?;
    assert_eq!(output.dims(), &[1, 3, 32, 32]);

    let out_path = dir.join("out.jpg");
    gogh::image_io::save_image(&output, &out_path)?;
    assert!(out_path.exists());

    std::fs::remove_dir_all(&dir).ok();
    Ok(())
}
