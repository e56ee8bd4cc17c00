use gogh_core::Shape;
use std::path::PathBuf;

/// Errors of the stylization surface: everything the tensor engine cannot
/// know about — files, images, weight checkpoints, and the preconditions
/// checked before any optimization work starts.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Image decode/encode failure.
    #[error(transparent)]
    Image(#[from] image::ImageError),

    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A tensor-engine error bubbling up from evaluation.
    #[error(transparent)]
    Tensor(#[from] gogh_core::Error),

    /// Content and style tensors must have identical dimensions; checked
    /// before the optimization loop starts.
    #[error("content and style images must have the same size: content {content}, style {style}")]
    SizeMismatch { content: Shape, style: Shape },

    /// A requested insertion point does not exist in the extractor —
    /// a configuration/model-version mismatch, caught at assembly time.
    #[error("insertion point '{name}' not found in the feature extractor")]
    LayerNotFound { name: String },

    /// A malformed or unsupported weights file.
    #[error("weights file error: {0}")]
    Weights(String),

    /// An input file that does not exist, reported with its path.
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),
}

/// Convenience Result type for the stylization surface.
pub type Result<T> = std::result::Result<T, Error>;
