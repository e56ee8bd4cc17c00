use std::path::Path;

use image::imageops::FilterType;
use image::{Rgb, RgbImage};

use gogh_core::backend::Backend;
use gogh_core::tensor::Tensor;

use crate::error::Result;

// Image I/O — the boundary between image files and [1, 3, H, W] tensors
//
// Loading: decode whatever the `image` crate reads, force 3-channel RGB
// (palettes, grayscale, and alpha all collapse), resize to an exact
// size × size square, and scale bytes to [0, 1] floats in CHW order.
// Saving is the reverse: clamp, quantize to 8-bit, write in the format
// the output path's extension implies.

/// Load an image file as a `[1, 3, size, size]` F32 tensor in [0, 1].
pub fn load_image<B: Backend>(
    path: impl AsRef<Path>,
    size: usize,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let rgb = image::open(path.as_ref())?.to_rgb8();

    let side = size as u32;
    let rgb = if rgb.width() != side || rgb.height() != side {
        image::imageops::resize(&rgb, side, side, FilterType::CatmullRom)
    } else {
        rgb
    };

    // HWC bytes → CHW floats in [0, 1].
    let (w, h) = (size, size);
    let mut data = vec![0f32; 3 * h * w];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            data[c * h * w + y * w + x] = pixel[c] as f32 / 255.0;
        }
    }

    Ok(Tensor::from_f32_slice(&data, (1, 3, h, w), device)?)
}

/// Save a `[1, 3, H, W]` tensor in [0, 1] as an 8-bit RGB image. The
/// format follows the path's extension; parent directories are created.
pub fn save_image<B: Backend>(tensor: &Tensor<B>, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let dims = tensor.dims();
    if dims.len() != 4 || dims[0] != 1 || dims[1] != 3 {
        return Err(gogh_core::Error::msg(format!(
            "save_image expects [1, 3, H, W], got {:?}",
            dims
        ))
        .into());
    }
    let (h, w) = (dims[2], dims[3]);

    let data = tensor.clamp(0.0, 1.0)?.to_f32_vec()?;
    let img = RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let px = |c: usize| (data[c * h * w + y * w + x] * 255.0).round() as u8;
        Rgb([px(0), px(1), px(2)])
    });

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    img.save(path)?;
    println!("Image saved to: {}", path.display());
    Ok(())
}
