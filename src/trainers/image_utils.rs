//! Image conversion between files and `[-1, 1]` CHW tensors
//! Used by the data loader, periodic sampling and the sample CLI

use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// RGB image to `[3, H, W]` f32 in `[-1, 1]`
pub fn rgb_to_tensor(img: &RgbImage, device: &Device) -> Result<Tensor> {
    let (width, height) = img.dimensions();
    let data = img.as_raw().clone();
    let tensor = Tensor::from_vec(data, (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
    Ok(((tensor / 127.5)? - 1.0)?)
}

/// Loads an image file as RGB, optionally resized to `size x size`
pub fn load_image_tensor<P: AsRef<Path>>(path: P, size: Option<u32>, device: &Device) -> Result<Tensor> {
    let img = image::open(path)?;
    let img = match size {
        Some(size) => img.resize_exact(size, size, FilterType::Triangle),
        None => img,
    };
    rgb_to_tensor(&img.to_rgb8(), device)
}

/// `[3, H, W]` tensor in `[-1, 1]` to an RGB image, clamping out-of-range values
pub fn tensor_to_rgb(tensor: &Tensor) -> Result<RgbImage> {
    let tensor = ((tensor.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.round()?;
    let tensor = tensor.to_dtype(DType::U8)?;
    let (channels, height, width) = tensor.dims3()?;
    if channels != 3 {
        return Err(candle_core::Error::Msg(format!("expected 3 channels (RGB), got {channels}")).into());
    }
    let data = tensor.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, data)
        .ok_or_else(|| candle_core::Error::Msg("failed to create image buffer".to_string()).into())
}

/// Saves a `[3, H, W]` tensor; format follows the extension, png otherwise
pub fn save_image<P: AsRef<Path>>(tensor: &Tensor, path: P) -> Result<()> {
    let img = DynamicImage::ImageRgb8(tensor_to_rgb(&tensor.to_device(&Device::Cpu)?)?);
    let path = path.as_ref();
    match path.extension().and_then(|s| s.to_str()) {
        Some("jpg") | Some("jpeg") => img.save_with_format(path, image::ImageFormat::Jpeg)?,
        _ => img.save_with_format(path, image::ImageFormat::Png)?,
    }
    Ok(())
}

/// Tiles a `[N, C, H, W]` batch into one `[C, H', W']` image, `nrow` images per row
///
/// Every tile is surrounded by `padding` pixels of `pad_value`.
pub fn make_grid(images: &Tensor, nrow: usize, padding: usize, pad_value: f64) -> Result<Tensor> {
    let (n, c, h, w) = images.dims4()?;
    let nrow = nrow.clamp(1, n.max(1));
    let rows = n.div_ceil(nrow);

    // work in a space where the pad value is zero
    let shifted = (images - pad_value)?;
    let blank = Tensor::zeros((c, h + padding, w + padding), images.dtype(), images.device())?;

    let mut grid_rows = Vec::with_capacity(rows);
    for row in 0..rows {
        let mut tiles = Vec::with_capacity(nrow);
        for col in 0..nrow {
            let index = row * nrow + col;
            if index < n {
                let tile = shifted
                    .get(index)?
                    .pad_with_zeros(1, 0, padding)?
                    .pad_with_zeros(2, 0, padding)?;
                tiles.push(tile);
            } else {
                tiles.push(blank.clone());
            }
        }
        grid_rows.push(Tensor::cat(&tiles, 2)?);
    }
    let grid = Tensor::cat(&grid_rows, 1)?
        .pad_with_zeros(1, padding, 0)?
        .pad_with_zeros(2, padding, 0)?;
    Ok((grid + pad_value)?)
}

/// `<base>/samples/step_<step>/`, created if missing
pub fn create_sample_directory(base_dir: &Path, step: usize) -> Result<PathBuf> {
    let sample_dir = base_dir.join("samples").join(format!("step_{:06}", step));
    fs::create_dir_all(&sample_dir)?;
    Ok(sample_dir)
}
