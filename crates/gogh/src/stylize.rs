use std::path::Path;

use gogh_core::backend::{Backend, BackendDevice};
use gogh_core::tensor::Tensor;
use gogh_core::Shape;

use gogh_nn::{FeatureExtractor, Normalization, Pooling};
use gogh_optim::{Evaluation, Lbfgs, LbfgsConfig};

use crate::device;
use crate::error::Result;
use crate::image_io::load_image;
use crate::pipeline::{assemble, LossPipeline};

// Stylization — the optimization loop and its orchestration
//
// The loop owns the output image tensor (initialized as a copy of the
// content image and marked as the one variable leaf) and treats the
// assembled pipeline as a pure loss-producing function of it. Each L-BFGS
// step hands the optimizer an evaluation closure that:
//
//   1. clamps the pixels back into [0, 1] — the optimizer steps are
//      unconstrained, so the iterate is projected before every evaluation
//   2. evaluates the pipeline, collecting every loss scalar
//   3. forms style_weight · Σ style + content_weight · Σ content
//   4. backpropagates and extracts the image gradient
//
// The closure is re-entrant: the line search may evaluate several
// candidate step lengths within one step. Gradients need no zeroing —
// every backward() builds its store from a fresh graph.

/// Per-channel statistics the pretrained VGG networks were trained with
/// (ImageNet).
pub const IMAGENET_MEAN: [f64; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f64; 3] = [0.229, 0.224, 0.225];

/// The classic insertion points: one mid-depth content layer…
pub fn default_content_layers() -> Vec<String> {
    vec!["conv_4".to_string()]
}

/// …and five style layers spanning the early depth.
pub fn default_style_layers() -> Vec<String> {
    (1..=5).map(|i| format!("conv_{i}")).collect()
}

/// Configuration of one stylization run.
#[derive(Debug, Clone)]
pub struct StylizeConfig {
    /// Requested output edge length (may be capped by the device).
    pub output_size: usize,
    /// Number of optimizer steps.
    pub num_steps: usize,
    /// Weight on the summed style losses.
    pub style_weight: f64,
    /// Weight on the summed content losses.
    pub content_weight: f64,
    /// Insertion points for content losses.
    pub content_layers: Vec<String>,
    /// Insertion points for style losses.
    pub style_layers: Vec<String>,
    /// Pooling flavor for the extractor's down-sampling layers.
    pub pooling: Pooling,
}

impl Default for StylizeConfig {
    fn default() -> Self {
        StylizeConfig {
            output_size: 512,
            num_steps: 300,
            style_weight: 1_000_000.0,
            content_weight: 1.0,
            content_layers: default_content_layers(),
            style_layers: default_style_layers(),
            pooling: Pooling::Max,
        }
    }
}

/// Sum a list of scalar loss tensors into one scalar (zero when empty).
fn sum_scalars<B: Backend>(list: &[Tensor<B>], like: &Tensor<B>) -> gogh_core::Result<Tensor<B>> {
    let mut acc = Tensor::<B>::zeros(Shape::from(()), like.dtype(), like.device())?;
    for t in list {
        acc = acc.add(t)?;
    }
    Ok(acc)
}

/// Run the optimization loop over an assembled pipeline.
///
/// `input` is consumed as the mutable output image — conventionally a copy
/// of the content image. Returns it after `num_steps` optimizer steps,
/// clamped into [0, 1].
pub fn run_style_transfer<B: Backend>(
    pipeline: &LossPipeline<B>,
    input: Tensor<B>,
    num_steps: usize,
    style_weight: f64,
    content_weight: f64,
) -> Result<Tensor<B>> {
    let input = input.set_variable();
    let mut optimizer = Lbfgs::new(input.clone(), LbfgsConfig::default());

    println!("Optimizing for {num_steps} steps..");
    let mut style_score = 0.0f64;
    let mut content_score = 0.0f64;

    for step in 0..num_steps {
        let style_out = &mut style_score;
        let content_out = &mut content_score;

        optimizer.step(|param| {
            // Project the unconstrained iterate back into pixel range.
            let clamped: Vec<f64> = param
                .to_f64_vec()?
                .into_iter()
                .map(|v| v.clamp(0.0, 1.0))
                .collect();
            param.update_data_inplace(&clamped)?;

            let losses = pipeline.forward(param)?;
            let style_sum = sum_scalars(&losses.style, param)?;
            let content_sum = sum_scalars(&losses.content, param)?;
            let total = style_sum
                .affine(style_weight, 0.0)?
                .add(&content_sum.affine(content_weight, 0.0)?)?;

            let grads = total.backward()?;
            let grad = grads
                .get(param)
                .ok_or_else(|| {
                    gogh_core::Error::msg("no gradient reached the output image")
                })?
                .to_f64_vec()?;

            *style_out = style_sum.to_scalar()?;
            *content_out = content_sum.to_scalar()?;
            Ok(Evaluation {
                loss: total.to_scalar()?,
                grad,
            })
        })?;

        if (step + 1) % 50 == 0 {
            println!(
                "Step {}/{}:  style loss {:.6}  content loss {:.6}",
                step + 1,
                num_steps,
                style_score,
                content_score
            );
        }
    }

    // One last projection so the returned tensor is a valid image.
    let final_pixels: Vec<f64> = input
        .to_f64_vec()?
        .into_iter()
        .map(|v| v.clamp(0.0, 1.0))
        .collect();
    input.update_data_inplace(&final_pixels)?;
    Ok(input.detach())
}

/// Stylize one content image with one style image.
///
/// Loads both images at the device-safe size, verifies they agree on
/// dimensions, assembles the loss pipeline around `extractor`, and runs
/// the optimization loop starting from a copy of the content image.
pub fn stylize_image<B: Backend>(
    extractor: &FeatureExtractor<B>,
    content_path: &Path,
    style_path: &Path,
    config: &StylizeConfig,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let imsize = device::max_image_size(config.output_size);
    if imsize < config.output_size {
        println!(
            "Requested size {} capped at {} on {}",
            config.output_size,
            imsize,
            device.name()
        );
    }

    println!("Loading content image from: {}", content_path.display());
    let content = load_image::<B>(content_path, imsize, device)?;

    println!("Loading style image from: {}", style_path.display());
    let style = load_image::<B>(style_path, imsize, device)?;

    let normalization =
        Normalization::<B>::new(IMAGENET_MEAN, IMAGENET_STD, content.dtype(), device)?;
    let pipeline = assemble(
        extractor,
        normalization,
        &content,
        &style,
        &config.content_layers,
        &config.style_layers,
    )?;

    let output = run_style_transfer(
        &pipeline,
        content.copy()?,
        config.num_steps,
        config.style_weight,
        config.content_weight,
    )?;

    println!("Style transfer completed!");
    Ok(output)
}
