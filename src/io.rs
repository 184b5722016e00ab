//! Filesystem and image conversion helpers

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use image::{imageops::FilterType, ImageFormat, RgbImage};
use std::path::Path;
use tracing::info;

/// Create the output directory (and parents) if missing
pub fn ensure_output_directory(out_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create output directory: {}", out_dir.display()))
}

/// Write the image as PNG
pub fn save_generated_image(image: &RgbImage, output_path: &Path) -> Result<()> {
    image
        .save_with_format(output_path, ImageFormat::Png)
        .with_context(|| format!("Failed to save image: {}", output_path.display()))?;
    info!("Saved: {}", output_path.display());
    Ok(())
}

/// Load a reference image as RGB, resized to exactly `width` x `height`
pub fn load_reference_image(path: &Path, width: usize, height: usize) -> Result<RgbImage> {
    let image = image::open(path)
        .with_context(|| format!("Failed to open reference image: {}", path.display()))?
        .to_rgb8();

    let (width, height) = (width as u32, height as u32);
    if image.dimensions() == (width, height) {
        return Ok(image);
    }

    info!(
        path = %path.display(),
        from = format!("{}x{}", image.width(), image.height()),
        to = format!("{}x{}", width, height),
        "Resizing reference image"
    );
    Ok(image::imageops::resize(&image, width, height, FilterType::Lanczos3))
}

/// RGB image to a `[1, 3, H, W]` tensor with values in [-1, 1]
pub fn image_to_tensor(image: &RgbImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let (width, height) = image.dimensions();
    let data = image.as_raw().clone();
    let tensor = Tensor::from_vec(data, (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
    let tensor = ((tensor / 127.5)? - 1.0)?;
    Ok(tensor.unsqueeze(0)?.to_dtype(dtype)?)
}

/// Decoded `[1, 3, H, W]` tensor in [-1, 1] to an RGB image
pub fn tensor_to_image(tensor: &Tensor) -> Result<RgbImage> {
    let image = tensor.to_dtype(DType::F32)?.clamp(-1f32, 1f32)?;
    let image = ((image + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
    let image = image.i(0)?.permute((1, 2, 0))?.to_device(&Device::Cpu)?;
    let (height, width, _) = image.dims3()?;
    let pixels: Vec<u8> = image.flatten_all()?.to_vec1()?;

    RgbImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| anyhow::anyhow!("Failed to create image buffer"))
}
