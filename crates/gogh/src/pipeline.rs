use std::collections::HashSet;

use gogh_core::backend::Backend;
use gogh_core::tensor::Tensor;

use gogh_nn::{ContentLoss, ExtractorLayer, FeatureExtractor, Module, Normalization, StyleLoss};

use crate::error::{Error, Result};

// Loss pipeline — the hybrid network a stylization run evaluates
//
// The pipeline interleaves the frozen extractor's layers with injected
// loss-measurement stages:
//
//   [Normalize, conv_1, Style, relu_1, conv_2, Style, …, conv_4, Content, …]
//
// Stages are a tagged enum walked by a small interpreter. Loss stages are
// pass-through on the activation; their scalar results are collected into
// ordered vectors and returned alongside the final activation, so one
// forward pass yields every loss with no hidden mutable state.
//
// Structure is fixed at assembly. The assembler truncates the walk as soon
// as the deepest insertion point is satisfied: layers past it cannot
// influence any loss and would only add forward/backward cost.

/// One stage of the assembled pipeline.
pub enum Stage<B: Backend> {
    /// The input normalization, always first.
    Normalize(Normalization<B>),
    /// A copied extractor layer, keeping its extractor name.
    Layer {
        name: String,
        layer: ExtractorLayer<B>,
    },
    /// Content loss against a fixed target feature map.
    Content(ContentLoss<B>),
    /// Style loss against a fixed target Gram matrix.
    Style(StyleLoss<B>),
}

/// The losses produced by one pipeline evaluation.
pub struct PipelineLosses<B: Backend> {
    /// The activation leaving the last stage (loss stages pass their input
    /// through unchanged).
    pub output: Tensor<B>,
    /// Content loss scalars in depth order.
    pub content: Vec<Tensor<B>>,
    /// Style loss scalars in depth order.
    pub style: Vec<Tensor<B>>,
}

/// The assembled hybrid pipeline.
pub struct LossPipeline<B: Backend> {
    stages: Vec<Stage<B>>,
}

impl<B: Backend> std::fmt::Debug for LossPipeline<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LossPipeline")
            .field("num_stages", &self.stages.len())
            .finish()
    }
}

impl<B: Backend> LossPipeline<B> {
    /// The ordered stages.
    pub fn stages(&self) -> &[Stage<B>] {
        &self.stages
    }

    /// Number of stages, loss stages included.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Number of content loss stages.
    pub fn num_content_stages(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| matches!(s, Stage::Content(_)))
            .count()
    }

    /// Number of style loss stages.
    pub fn num_style_stages(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| matches!(s, Stage::Style(_)))
            .count()
    }

    /// Names of the copied extractor layers, in order.
    pub fn layer_names(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter_map(|s| match s {
                Stage::Layer { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Evaluate the pipeline on an image tensor, collecting every loss
    /// scalar. The scalars stay attached to the autograd graph: summing
    /// them and calling backward() yields the image gradient.
    pub fn forward(&self, x: &Tensor<B>) -> gogh_core::Result<PipelineLosses<B>> {
        let mut activation = x.clone();
        let mut content = Vec::new();
        let mut style = Vec::new();

        for stage in &self.stages {
            match stage {
                Stage::Normalize(norm) => {
                    activation = norm.forward(&activation)?;
                }
                Stage::Layer { layer, .. } => {
                    activation = layer.forward(&activation)?;
                }
                Stage::Content(loss) => {
                    content.push(loss.loss(&activation)?);
                }
                Stage::Style(loss) => {
                    style.push(loss.loss(&activation)?);
                }
            }
        }

        Ok(PipelineLosses {
            output: activation,
            content,
            style,
        })
    }
}

/// Assemble the hybrid pipeline.
///
/// Walks the extractor's layers in depth order, copying each into the
/// pipeline behind the normalization stage. Immediately after a layer
/// whose name is a designated insertion point, the running content (or
/// style) activation is captured — detached — as that point's target, and
/// the loss stage is appended. The walk stops once every insertion point
/// is satisfied, so nothing past the deepest one enters the pipeline.
///
/// Fails with [`Error::LayerNotFound`] before touching any tensor when a
/// requested name does not exist in the extractor, and with
/// [`Error::SizeMismatch`] when the content and style tensors disagree on
/// shape.
pub fn assemble<B: Backend>(
    extractor: &FeatureExtractor<B>,
    normalization: Normalization<B>,
    content: &Tensor<B>,
    style: &Tensor<B>,
    content_layers: &[String],
    style_layers: &[String],
) -> Result<LossPipeline<B>> {
    // Validate the insertion points up front: a name that is not in the
    // extractor is a configuration error, reported with zero evaluation
    // work done.
    let known: HashSet<&str> = extractor.layer_names().into_iter().collect();
    for name in content_layers.iter().chain(style_layers.iter()) {
        if !known.contains(name.as_str()) {
            return Err(Error::LayerNotFound { name: name.clone() });
        }
    }

    if content.dims() != style.dims() {
        return Err(Error::SizeMismatch {
            content: content.shape().clone(),
            style: style.shape().clone(),
        });
    }

    let mut remaining_content: HashSet<&str> =
        content_layers.iter().map(|s| s.as_str()).collect();
    let mut remaining_style: HashSet<&str> = style_layers.iter().map(|s| s.as_str()).collect();

    // Running activations: the pipeline-so-far applied to each fixed
    // target, advanced one layer at a time.
    let mut c_act = normalization.forward(content)?;
    let mut s_act = normalization.forward(style)?;
    let mut stages: Vec<Stage<B>> = vec![Stage::Normalize(normalization)];

    for (name, layer) in extractor.layers() {
        if remaining_content.is_empty() && remaining_style.is_empty() {
            break;
        }

        let layer = layer.clone();
        c_act = layer.forward(&c_act)?;
        s_act = layer.forward(&s_act)?;
        stages.push(Stage::Layer {
            name: name.clone(),
            layer,
        });

        if remaining_content.remove(name.as_str()) {
            stages.push(Stage::Content(ContentLoss::new(&c_act)));
        }
        if remaining_style.remove(name.as_str()) {
            stages.push(Stage::Style(StyleLoss::new(&s_act)?));
        }
    }

    Ok(LossPipeline { stages })
}
