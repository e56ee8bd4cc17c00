// Normalization — map [0, 1] pixel tensors into the distribution the
// frozen extractor was trained on
//
// A stateless per-channel transform: out = (in - mean) / std. The mean and
// std are fixed 3-vectors stored as [1, 3, 1, 1] tensors so broadcasting
// applies them across batch and space. This must be the first stage of
// every assembled pipeline; raw pixels never touch extractor weights.

use gogh_core::backend::Backend;
use gogh_core::dtype::DType;
use gogh_core::error::Result;
use gogh_core::shape::Shape;
use gogh_core::tensor::Tensor;

use crate::module::Module;

/// Per-channel input normalization: `(x - mean) / std`.
pub struct Normalization<B: Backend> {
    mean: Tensor<B>,
    std: Tensor<B>,
}

impl<B: Backend> Normalization<B> {
    /// Build from per-channel RGB mean and std.
    pub fn new(mean: [f64; 3], std: [f64; 3], dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = Shape::new(vec![1, 3, 1, 1]);
        Ok(Normalization {
            mean: Tensor::<B>::from_f64_slice(&mean, shape.clone(), dtype, device)?,
            std: Tensor::<B>::from_f64_slice(&std, shape, dtype, device)?,
        })
    }
}

impl<B: Backend> Module<B> for Normalization<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        x.sub(&self.mean)?.div(&self.std)
    }

    /// The mean and std are constants, not parameters.
    fn parameters(&self) -> Vec<Tensor<B>> {
        vec![]
    }
}
