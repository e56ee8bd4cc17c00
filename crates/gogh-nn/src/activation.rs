// Activation module — tensor-level activation as a composable layer
//
// VGG uses exactly one nonlinearity, so that is the one that exists here.
// The tensor-level relu() is already out-of-place: it allocates a fresh
// result and leaves its input untouched, which is what lets loss stages
// observe the same activation the next layer consumes.

use gogh_core::backend::Backend;
use gogh_core::error::Result;
use gogh_core::tensor::Tensor;

use crate::module::Module;

/// ReLU activation: max(0, x).
pub struct ReLU;

impl<B: Backend> Module<B> for ReLU {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        x.relu()
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        vec![]
    }
}
