// Losses — MSE, the Gram matrix, and the two style-transfer loss stages
//
// ContentLoss and StyleLoss are the measurement stages the assembler
// injects into the pipeline. Each owns a fixed, detached target captured
// once at assembly time. Evaluation is pass-through on the activation:
// the stage returns its scalar loss and the pipeline hands the unchanged
// activation to the next layer, so one forward pass populates every loss
// at once. The scalar is a graph-tracked tensor — summing the scalars and
// calling backward() is the whole training signal.

use gogh_core::backend::Backend;
use gogh_core::error::{Error, Result};
use gogh_core::tensor::Tensor;
use gogh_core::bail;

/// Mean squared error: mean((prediction - target)²), as a scalar tensor.
pub fn mse_loss<B: Backend>(prediction: &Tensor<B>, target: &Tensor<B>) -> Result<Tensor<B>> {
    let diff = prediction.sub(target)?;
    diff.square()?.mean_all()
}

/// Gram matrix of a feature map: channel co-occurrence statistics with the
/// spatial arrangement discarded.
///
/// `[N, C, H, W]` is flattened to `[N·C, H·W]`, multiplied with its own
/// transpose, and normalized by the total element count `N·C·H·W`. The same
/// divisor must be used for targets and live activations — otherwise the
/// relative loss magnitudes across layers stop being comparable.
pub fn gram_matrix<B: Backend>(input: &Tensor<B>) -> Result<Tensor<B>> {
    let dims = input.dims();
    if dims.len() != 4 {
        bail!("gram_matrix expects 4D [N,C,H,W], got {:?}", dims);
    }
    let (n, c, h, w) = (dims[0], dims[1], dims[2], dims[3]);

    let features = input.reshape((n * c, h * w))?;
    let gram = features.matmul(&features.t()?)?;
    gram.affine(1.0 / (n * c * h * w) as f64, 0.0)
}

/// Content loss stage: MSE between the current activation and a fixed
/// target feature map captured from the content image.
pub struct ContentLoss<B: Backend> {
    target: Tensor<B>,
}

impl<B: Backend> ContentLoss<B> {
    /// Capture the target. Detached: no gradient ever flows into it.
    pub fn new(target: &Tensor<B>) -> Self {
        ContentLoss {
            target: target.detach(),
        }
    }

    /// The scalar loss for the current activation. The activation itself
    /// passes through the pipeline untouched.
    pub fn loss(&self, input: &Tensor<B>) -> Result<Tensor<B>> {
        if input.dims() != self.target.dims() {
            return Err(Error::ShapeMismatch {
                expected: self.target.shape().clone(),
                got: input.shape().clone(),
            });
        }
        mse_loss(input, &self.target)
    }

    pub fn target(&self) -> &Tensor<B> {
        &self.target
    }
}

/// Style loss stage: MSE between the Gram matrix of the current activation
/// and a fixed target Gram captured from the style image.
pub struct StyleLoss<B: Backend> {
    target: Tensor<B>,
}

impl<B: Backend> StyleLoss<B> {
    /// Capture the target Gram from the style image's activation at this
    /// layer. Detached: no gradient ever flows into it.
    pub fn new(target_feature: &Tensor<B>) -> Result<Self> {
        Ok(StyleLoss {
            target: gram_matrix(target_feature)?.detach(),
        })
    }

    /// The scalar loss for the current activation.
    pub fn loss(&self, input: &Tensor<B>) -> Result<Tensor<B>> {
        let gram = gram_matrix(input)?;
        if gram.dims() != self.target.dims() {
            return Err(Error::ShapeMismatch {
                expected: self.target.shape().clone(),
                got: gram.shape().clone(),
            });
        }
        mse_loss(&gram, &self.target)
    }

    pub fn target_gram(&self) -> &Tensor<B> {
        &self.target
    }
}
