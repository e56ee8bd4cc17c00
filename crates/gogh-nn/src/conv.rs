// Conv2d, MaxPool2d, AvgPool2d — the layer types a VGG feature stack is
// made of
//
// Conv2d applies learnable filters to [N, C_in, H, W], producing
// [N, C_out, H_out, W_out]. In this crate's main use the filters are not
// learnable at all: they are loaded from a pretrained checkpoint and
// frozen, so backward never touches them.
//
// OUTPUT SIZE: H_out = (H + 2*padding_h - kernel_h) / stride_h + 1

use gogh_core::backend::Backend;
use gogh_core::dtype::DType;
use gogh_core::error::Result;
use gogh_core::shape::Shape;
use gogh_core::tensor::Tensor;
use gogh_core::{bail, Error};

use crate::module::Module;

/// 2-D convolutional layer.
///
/// weight: `[C_out, C_in, kH, kW]`, bias (optional): `[C_out]`.
pub struct Conv2d<B: Backend> {
    weight: Tensor<B>,
    bias: Option<Tensor<B>>,
    in_channels: usize,
    out_channels: usize,
    kernel_size: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
}

impl<B: Backend> Conv2d<B> {
    /// New Conv2d with Kaiming-uniform initialization: U(-k, k) with
    /// k = sqrt(1 / (C_in · kH · kW)). The parameters are trainable
    /// variables; use [`Conv2d::freeze`] for a fixed feature extractor.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
        use_bias: bool,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let [kh, kw] = kernel_size;
        let fan_in = in_channels * kh * kw;
        let k = (1.0 / fan_in as f64).sqrt();

        let weight = Tensor::<B>::rand(
            Shape::new(vec![out_channels, in_channels, kh, kw]),
            dtype,
            device,
        )?
        .affine(2.0 * k, -k)?
        .set_variable();

        let bias = if use_bias {
            let b = Tensor::<B>::rand(Shape::new(vec![out_channels]), dtype, device)?
                .affine(2.0 * k, -k)?
                .set_variable();
            Some(b)
        } else {
            None
        };

        Ok(Conv2d {
            weight,
            bias,
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
        })
    }

    /// Conv2d from existing weight and bias tensors (pretrained loading).
    /// The tensors keep their variable/frozen state as given.
    pub fn from_tensors(
        weight: Tensor<B>,
        bias: Option<Tensor<B>>,
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Self> {
        let dims = weight.dims().to_vec();
        if dims.len() != 4 {
            bail!(
                "Conv2d weight must be 4D [C_out,C_in,kH,kW], got {:?}",
                dims
            );
        }
        if let Some(ref b) = bias {
            if b.elem_count() != dims[0] {
                return Err(Error::ShapeMismatch {
                    expected: Shape::from(dims[0]),
                    got: b.shape().clone(),
                });
            }
        }
        Ok(Conv2d {
            out_channels: dims[0],
            in_channels: dims[1],
            kernel_size: [dims[2], dims[3]],
            weight,
            bias,
            stride,
            padding,
        })
    }

    /// The same layer with frozen parameters: backward() will skip its
    /// weight and bias gradients entirely.
    pub fn freeze(self) -> Self {
        Conv2d {
            weight: self.weight.freeze(),
            bias: self.bias.map(|b| b.freeze()),
            in_channels: self.in_channels,
            out_channels: self.out_channels,
            kernel_size: self.kernel_size,
            stride: self.stride,
            padding: self.padding,
        }
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
    pub fn kernel_size(&self) -> [usize; 2] {
        self.kernel_size
    }
    pub fn weight(&self) -> &Tensor<B> {
        &self.weight
    }
    pub fn bias(&self) -> Option<&Tensor<B>> {
        self.bias.as_ref()
    }
}

// Manual Clone: tensor clones are Arc refcount bumps, so a cloned layer
// shares its weights.
impl<B: Backend> Clone for Conv2d<B> {
    fn clone(&self) -> Self {
        Conv2d {
            weight: self.weight.clone(),
            bias: self.bias.clone(),
            in_channels: self.in_channels,
            out_channels: self.out_channels,
            kernel_size: self.kernel_size,
            stride: self.stride,
            padding: self.padding,
        }
    }
}

impl<B: Backend> Module<B> for Conv2d<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        x.conv2d(&self.weight, self.bias.as_ref(), self.stride, self.padding)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        let mut params = vec![self.weight.clone()];
        if let Some(ref b) = self.bias {
            params.push(b.clone());
        }
        params
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        let mut named = vec![("weight".to_string(), self.weight.clone())];
        if let Some(ref b) = self.bias {
            named.push(("bias".to_string(), b.clone()));
        }
        named
    }
}

/// 2-D max-pooling layer: the max of each sliding window.
#[derive(Clone)]
pub struct MaxPool2d {
    kernel_size: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
}

impl MaxPool2d {
    pub fn new(kernel_size: [usize; 2], stride: [usize; 2], padding: [usize; 2]) -> Self {
        MaxPool2d {
            kernel_size,
            stride,
            padding,
        }
    }
}

impl<B: Backend> Module<B> for MaxPool2d {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        x.max_pool2d(self.kernel_size, self.stride, self.padding)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        vec![]
    }
}

/// 2-D average-pooling layer: the mean of each sliding window.
///
/// Average pooling is the smoother alternative for feature extraction —
/// its gradient spreads over the whole window instead of flowing through a
/// single winner pixel.
#[derive(Clone)]
pub struct AvgPool2d {
    kernel_size: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
}

impl AvgPool2d {
    pub fn new(kernel_size: [usize; 2], stride: [usize; 2], padding: [usize; 2]) -> Self {
        AvgPool2d {
            kernel_size,
            stride,
            padding,
        }
    }
}

impl<B: Backend> Module<B> for AvgPool2d {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        x.avg_pool2d(self.kernel_size, self.stride, self.padding)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        vec![]
    }
}
