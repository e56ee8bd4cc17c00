//! # gogh-nn
//!
//! Neural network building blocks for the gogh style-transfer engine:
//!
//! 1. **Module trait** — every layer implements `forward()`
//! 2. **Conv2d / MaxPool2d / AvgPool2d** — the VGG layer types, with
//!    construction from pretrained tensors and freezing
//! 3. **ReLU** — the one activation VGG uses
//! 4. **Normalization** — the per-channel input rescaling stage
//! 5. **Losses** — `mse_loss`, `gram_matrix`, `ContentLoss`, `StyleLoss`
//! 6. **FeatureExtractor** — a frozen, named, walkable conv stack with a
//!    VGG-19 constructor
//!
//! Modules are generic over `Backend` like `Tensor<B>` itself.

pub mod activation;
pub mod conv;
pub mod extractor;
pub mod loss;
pub mod module;
pub mod norm;

pub use activation::ReLU;
pub use conv::{AvgPool2d, Conv2d, MaxPool2d};
pub use extractor::{ExtractorLayer, FeatureExtractor, PoolLayer, Pooling};
pub use loss::{gram_matrix, mse_loss, ContentLoss, StyleLoss};
pub use module::Module;
pub use norm::Normalization;
