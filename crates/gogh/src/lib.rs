//! # gogh
//!
//! Neural style transfer: given a content image and a style image,
//! synthesize an output that keeps the content's spatial structure while
//! adopting the style's texture and color statistics.
//!
//! The method is iterative, pixel-space optimization against a frozen
//! convolutional feature extractor (VGG-19): content is matched on a
//! mid-depth feature map, style on the Gram matrices of several layers
//! spanning the depth, and an L-BFGS optimizer drives a weighted sum of
//! both losses down by adjusting the output pixels directly.
//!
//! ```no_run
//! use gogh::prelude::*;
//! use std::path::Path;
//!
//! # fn main() -> gogh::Result<()> {
//! let device = gogh::device::default_device();
//! let weights = gogh::weights::load_state_dict("vgg19.safetensors", &device)?;
//! let vgg = FeatureExtractor::<CpuBackend>::vgg19(&weights, Pooling::Max)?;
//!
//! let config = StylizeConfig::default();
//! let output = gogh::stylize::stylize_image(
//!     &vgg,
//!     Path::new("content.jpg"),
//!     Path::new("style.jpg"),
//!     &config,
//!     &device,
//! )?;
//! gogh::image_io::save_image(&output, "output.jpg")?;
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod error;
pub mod image_io;
pub mod pipeline;
pub mod stylize;
pub mod weights;

pub use error::{Error, Result};
pub use pipeline::{assemble, LossPipeline, PipelineLosses, Stage};
pub use stylize::{run_style_transfer, stylize_image, StylizeConfig};

/// The common imports for working with the stylization engine.
pub mod prelude {
    pub use gogh_core::{
        Backend, BackendDevice, CpuBackend, CpuDevice, CpuTensor, DType, Shape, Tensor,
    };
    pub use gogh_nn::{
        gram_matrix, mse_loss, AvgPool2d, ContentLoss, Conv2d, ExtractorLayer, FeatureExtractor,
        MaxPool2d, Module, Normalization, PoolLayer, Pooling, ReLU, StyleLoss,
    };
    pub use gogh_optim::{Evaluation, Lbfgs, LbfgsConfig};

    pub use crate::pipeline::{assemble, LossPipeline, PipelineLosses, Stage};
    pub use crate::stylize::{
        default_content_layers, default_style_layers, run_style_transfer, stylize_image,
        StylizeConfig, IMAGENET_MEAN, IMAGENET_STD,
    };
}
