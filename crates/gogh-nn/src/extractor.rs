// FeatureExtractor — a frozen, named, sequential conv stack
//
// The extractor is only ever used for its intermediate activations: the
// assembler walks its layers in order and injects loss stages after
// designated ones. Layers are therefore exposed as an ordered list of
// (name, layer) pairs rather than an opaque forward().
//
// NAMING: the conventional style-transfer scheme. A counter increments on
// every convolution; the conv is `conv_i`, the ReLU that follows it is
// `relu_i`, and a pooling layer is `pool_i` for the current counter value.
// VGG-19's convolutions are thus conv_1 … conv_16.
//
// FROZEN: construction freezes every conv it is given. Whatever pipeline
// the extractor ends up in, gradient flow stops at the activations — the
// weights never accumulate gradients.

use std::collections::HashMap;

use gogh_core::backend::Backend;
use gogh_core::bail;
use gogh_core::error::Result;
use gogh_core::tensor::Tensor;

use crate::activation::ReLU;
use crate::conv::{AvgPool2d, Conv2d, MaxPool2d};
use crate::module::Module;

/// Which pooling the extractor's down-sampling layers use.
///
/// VGG ships with max pooling; average pooling is the classic substitution
/// for style transfer (Gatys et al.), trading a little sharpness for
/// smoother gradients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pooling {
    #[default]
    Max,
    Avg,
}

/// One stage of a feature extractor.
pub enum ExtractorLayer<B: Backend> {
    Conv(Conv2d<B>),
    Relu,
    Pool(PoolLayer),
}

// Manual Clone: derive would demand B: Clone on top of the Backend bound.
impl<B: Backend> Clone for ExtractorLayer<B> {
    fn clone(&self) -> Self {
        match self {
            ExtractorLayer::Conv(conv) => ExtractorLayer::Conv(conv.clone()),
            ExtractorLayer::Relu => ExtractorLayer::Relu,
            ExtractorLayer::Pool(pool) => ExtractorLayer::Pool(pool.clone()),
        }
    }
}

/// A concrete pooling layer, either flavor.
#[derive(Clone)]
pub enum PoolLayer {
    Max(MaxPool2d),
    Avg(AvgPool2d),
}

impl<B: Backend> ExtractorLayer<B> {
    /// Apply this layer to an activation.
    pub fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        match self {
            ExtractorLayer::Conv(conv) => conv.forward(x),
            ExtractorLayer::Relu => ReLU.forward(x),
            ExtractorLayer::Pool(PoolLayer::Max(pool)) => pool.forward(x),
            ExtractorLayer::Pool(PoolLayer::Avg(pool)) => pool.forward(x),
        }
    }
}

/// A frozen sequential stack of named conv/relu/pool layers.
pub struct FeatureExtractor<B: Backend> {
    layers: Vec<(String, ExtractorLayer<B>)>,
}

impl<B: Backend> FeatureExtractor<B> {
    /// Build from explicit (name, layer) pairs. Every convolution is
    /// frozen here, whatever state its tensors arrived in.
    pub fn new(layers: Vec<(String, ExtractorLayer<B>)>) -> Self {
        let layers = layers
            .into_iter()
            .map(|(name, layer)| {
                let layer = match layer {
                    ExtractorLayer::Conv(conv) => ExtractorLayer::Conv(conv.freeze()),
                    other => other,
                };
                (name, layer)
            })
            .collect();
        FeatureExtractor { layers }
    }

    /// The ordered (name, layer) pairs.
    pub fn layers(&self) -> &[(String, ExtractorLayer<B>)] {
        &self.layers
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layer names in depth order.
    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// The VGG-19 feature stack from a pretrained state dict.
    ///
    /// `state_dict` uses the torchvision key layout
    /// `features.{idx}.weight` / `features.{idx}.bias`; all convolutions
    /// are 3×3, stride 1, padding 1.
    pub fn vgg19(
        state_dict: &HashMap<String, Tensor<B>>,
        pooling: Pooling,
    ) -> Result<Self> {
        // Output channels per conv, with 0 marking a pooling layer —
        // the standard VGG-19 "configuration E" table.
        const VGG19_CFG: &[usize] = &[
            64, 64, 0, 128, 128, 0, 256, 256, 256, 256, 0, 512, 512, 512, 512, 0, 512, 512,
            512, 512, 0,
        ];

        let mut layers = Vec::new();
        let mut feature_idx = 0usize; // torchvision features.* index
        let mut conv_idx = 0usize; // the conv_i naming counter

        for &out_channels in VGG19_CFG {
            if out_channels == 0 {
                layers.push((
                    format!("pool_{conv_idx}"),
                    ExtractorLayer::Pool(match pooling {
                        Pooling::Max => PoolLayer::Max(MaxPool2d::new([2, 2], [2, 2], [0, 0])),
                        Pooling::Avg => PoolLayer::Avg(AvgPool2d::new([2, 2], [2, 2], [0, 0])),
                    }),
                ));
                feature_idx += 1;
                continue;
            }

            let weight_key = format!("features.{feature_idx}.weight");
            let bias_key = format!("features.{feature_idx}.bias");
            let weight = match state_dict.get(&weight_key) {
                Some(t) => t.clone(),
                None => bail!("vgg19: missing tensor '{weight_key}' in state dict"),
            };
            let bias = match state_dict.get(&bias_key) {
                Some(t) => Some(t.clone()),
                None => bail!("vgg19: missing tensor '{bias_key}' in state dict"),
            };

            let w_dims = weight.dims().to_vec();
            if w_dims.len() != 4 || w_dims[0] != out_channels {
                bail!(
                    "vgg19: tensor '{weight_key}' has shape {:?}, expected [{out_channels}, _, 3, 3]",
                    w_dims
                );
            }

            let conv = Conv2d::from_tensors(weight, bias, [1, 1], [1, 1])?;
            conv_idx += 1;
            layers.push((format!("conv_{conv_idx}"), ExtractorLayer::Conv(conv)));
            layers.push((format!("relu_{conv_idx}"), ExtractorLayer::Relu));
            feature_idx += 2;
        }

        Ok(Self::new(layers))
    }

    /// Evaluate the whole stack. Mostly useful in tests — stylization goes
    /// through the assembled loss pipeline, which stops early.
    pub fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let mut out = x.clone();
        for (_, layer) in &self.layers {
            out = layer.forward(&out)?;
        }
        Ok(out)
    }
}
