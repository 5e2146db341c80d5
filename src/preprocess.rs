//! Deterministic photo preprocessing for the vision encoder.
//!
//! A raw photo is cropped to a centered square of side `min(width, height)`,
//! resized to 224x224, scaled from `0..=255` to `[0, 1]`, and laid out
//! channel-first as `[1, 3, 224, 224]`. The cropped and resized image is also
//! written to a scratch directory as a [`TempImage`] so the caller can keep it
//! as the catalog copy or discard it.

use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage};
use ndarray::Array4;
use serde::Serialize;

use crate::models::INPUT_SIZE;
use crate::{Result, VaultError};

/// Square crop region in source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CropRect {
    pub width: u32,
    pub height: u32,
    pub origin_x: u32,
    pub origin_y: u32,
}

/// Centered square crop covering the full shorter side.
///
/// `(400, 300)` yields `{ width: 300, height: 300, origin_x: 50, origin_y: 0 }`.
#[must_use]
pub fn crop_dimensions(width: u32, height: u32) -> CropRect {
    let side = width.min(height);
    CropRect {
        width: side,
        height: side,
        origin_x: (width - side) / 2,
        origin_y: (height - side) / 2,
    }
}

/// Centered square crop for a zoomed field of view: the side shrinks to
/// `min(width, height) / zoom`. Zoom factors below 1 (or not finite) are
/// treated as 1.
#[must_use]
pub fn crop_dimensions_zoomed(width: u32, height: u32, zoom: f32) -> CropRect {
    let zoom = if zoom.is_finite() && zoom > 1.0 { zoom } else { 1.0 };
    let full = width.min(height);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let side = ((full as f32 / zoom).floor() as u32).clamp(1u32.min(full), full);
    CropRect {
        width: side,
        height: side,
        origin_x: (width - side) / 2,
        origin_y: (height - side) / 2,
    }
}

/// A processed image written to the scratch directory.
///
/// The file is released exactly once: explicitly through [`TempImage::remove`]
/// or [`TempImage::persist`], or implicitly when the value is dropped.
#[derive(Debug)]
pub struct TempImage {
    path: PathBuf,
    released: bool,
}

impl TempImage {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            released: false,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file.
    pub fn remove(mut self) -> Result<()> {
        self.released = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(VaultError::io_at(err, &self.path)),
        }
    }

    /// Move the file to `dest`, handing ownership to the caller.
    pub fn persist(mut self, dest: &Path) -> Result<PathBuf> {
        if std::fs::rename(&self.path, dest).is_err() {
            // Rename fails across filesystems; fall back to copy.
            std::fs::copy(&self.path, dest).map_err(|e| VaultError::io_at(e, dest))?;
            self.released = true;
            if let Err(err) = std::fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to remove scratch image");
            }
        }
        self.released = true;
        Ok(dest.to_path_buf())
    }
}

impl Drop for TempImage {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to remove scratch image");
            }
        }
    }
}

/// Output of [`preprocess`]: the model input and the scratch copy.
#[derive(Debug)]
pub struct ProcessedImage {
    /// `[1, 3, 224, 224]`, values in `[0, 1]`
    pub tensor: Array4<f32>,
    pub temp: TempImage,
}

/// Crop, resize and normalize an encoded photo.
///
/// `width` and `height` are the dimensions reported by the capture layer; the
/// crop computed from them must fit inside the decoded frame.
pub fn preprocess(
    raw: &[u8],
    width: u32,
    height: u32,
    scratch_dir: &Path,
) -> Result<ProcessedImage> {
    preprocess_zoomed(raw, width, height, 1.0, scratch_dir)
}

/// [`preprocess`] with a zoomed crop (see [`crop_dimensions_zoomed`]).
pub fn preprocess_zoomed(
    raw: &[u8],
    width: u32,
    height: u32,
    zoom: f32,
    scratch_dir: &Path,
) -> Result<ProcessedImage> {
    if width == 0 || height == 0 {
        return Err(VaultError::preprocess(format!(
            "degenerate image dimensions {width}x{height}"
        )));
    }
    if raw.is_empty() {
        return Err(VaultError::preprocess("empty image buffer"));
    }

    let decoded = image::load_from_memory(raw)?.to_rgb8();
    let crop = crop_dimensions_zoomed(width, height, zoom);
    let (frame_w, frame_h) = decoded.dimensions();
    if crop.origin_x + crop.width > frame_w || crop.origin_y + crop.height > frame_h {
        return Err(VaultError::preprocess(format!(
            "crop {}x{}+{}+{} does not fit decoded frame {frame_w}x{frame_h}",
            crop.width, crop.height, crop.origin_x, crop.origin_y
        )));
    }

    let cropped =
        imageops::crop_imm(&decoded, crop.origin_x, crop.origin_y, crop.width, crop.height)
            .to_image();
    let resized = imageops::resize(&cropped, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);

    let temp = write_scratch(&resized, scratch_dir)?;
    let tensor = to_tensor(&resized);

    tracing::debug!(
        width,
        height,
        origin_x = crop.origin_x,
        origin_y = crop.origin_y,
        side = crop.width,
        path = %temp.path().display(),
        "preprocessed photo"
    );

    Ok(ProcessedImage { tensor, temp })
}

/// Lay out an RGB image as NCHW `[1, 3, H, W]` with values scaled to `[0, 1]`.
#[must_use]
pub fn to_tensor(image: &RgbImage) -> Array4<f32> {
    let (w, h) = image.dimensions();
    let mut array = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        array[[0, 0, y, x]] = f32::from(pixel[0]) / 255.0;
        array[[0, 1, y, x]] = f32::from(pixel[1]) / 255.0;
        array[[0, 2, y, x]] = f32::from(pixel[2]) / 255.0;
    }
    array
}

fn write_scratch(image: &RgbImage, scratch_dir: &Path) -> Result<TempImage> {
    std::fs::create_dir_all(scratch_dir).map_err(|e| VaultError::io_at(e, scratch_dir))?;
    let (_file, path) = tempfile::Builder::new()
        .prefix("image_")
        .suffix(".jpg")
        .tempfile_in(scratch_dir)
        .map_err(|e| VaultError::io_at(e, scratch_dir))?
        .keep()
        .map_err(|e| VaultError::io_at(e.error, scratch_dir))?;

    // From here on the guard owns the file, so a failed encode still cleans up.
    let temp = TempImage::new(path);
    image
        .save_with_format(temp.path(), ImageFormat::Jpeg)
        .map_err(|e| VaultError::preprocess(format!("failed to write processed image: {e}")))?;
    Ok(temp)
}
