// Module trait — the interface every network layer implements
//
// Rust's answer to nn.Module is a trait: each layer is a plain struct with
// a forward() method, and polymorphic stacks hold Box<dyn Module<B>>. All
// modules are generic over the Backend, so a layer definition is not tied
// to the device its tensors live on.
//
// There is no train/eval mode here: every stage a style-transfer pipeline
// evaluates (conv, relu, pooling, normalization) behaves identically in
// both, so the toggle would be dead surface.

use gogh_core::backend::Backend;
use gogh_core::error::Result;
use gogh_core::tensor::Tensor;

/// A neural network layer: computes an output tensor from an input tensor
/// and exposes its parameters.
pub trait Module<B: Backend> {
    /// Compute the output tensor from the input tensor.
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>>;

    /// All parameters of this module (empty for stateless layers).
    fn parameters(&self) -> Vec<Tensor<B>>;

    /// Total number of scalar parameters.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.elem_count()).sum()
    }

    /// Parameters with human-readable names. Leaf modules override this
    /// with names like `"weight"` / `"bias"`; the default uses positional
    /// indices.
    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        self.parameters()
            .into_iter()
            .enumerate()
            .map(|(i, p)| (format!("param_{i}"), p))
            .collect()
    }
}
