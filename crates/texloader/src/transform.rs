use crate::error::DecodeError;
use crate::raw::{checked_byte_len, RawImage, MAX_DIMENSION};
use crate::types::{CropRect, TransformParams};

/// Applies crop, resize and vertical flip, in that order, to every layer.
///
/// Operates on whole pixels, so it works for any [`RawFormat`](crate::RawFormat).
pub fn apply_transform(image: RawImage, params: &TransformParams) -> Result<RawImage, DecodeError> {
    let mut image = image;
    if let Some(crop) = params.crop {
        image = crop_image(&image, crop)?;
    }
    if let Some((width, height)) = params.resize {
        image = resize_nearest(&image, width, height)?;
    }
    if params.flip_vertical {
        flip_vertical(&mut image);
    }
    Ok(image)
}

fn crop_image(image: &RawImage, crop: CropRect) -> Result<RawImage, DecodeError> {
    let x0 = crop.x.min(image.width);
    let y0 = crop.y.min(image.height);
    let x1 = crop.x.saturating_add(crop.width).min(image.width);
    let y1 = crop.y.saturating_add(crop.height).min(image.height);
    if x1 <= x0 || y1 <= y0 {
        return Err(DecodeError::new(format!(
            "crop {}x{} at {},{} selects no pixels of a {}x{} image",
            crop.width, crop.height, crop.x, crop.y, image.width, image.height
        )));
    }
    if (x0, y0, x1, y1) == (0, 0, image.width, image.height) {
        return Ok(image.clone());
    }

    let bpp = image.format.bytes_per_pixel();
    let (width, height) = (x1 - x0, y1 - y0);
    let row_len = width as usize * bpp;
    let len = checked_byte_len(width, height, image.layers, image.format)
        .ok_or_else(|| DecodeError::new(format!("crop {width}x{height} does not fit in memory")))?;
    let mut bytes = Vec::with_capacity(len);
    for layer in 0..image.layers {
        let src = image.layer(layer);
        for y in y0..y1 {
            let start = y as usize * image.row_len() + x0 as usize * bpp;
            bytes.extend_from_slice(&src[start..start + row_len]);
        }
    }
    RawImage::layered(width, height, image.layers, image.format, bytes)
}

fn resize_nearest(image: &RawImage, width: u32, height: u32) -> Result<RawImage, DecodeError> {
    if width == 0 || height == 0 {
        return Err(DecodeError::new(format!(
            "cannot resize to an empty {width}x{height} image"
        )));
    }
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(DecodeError::new(format!(
            "cannot resize to {width}x{height}; the limit is {MAX_DIMENSION} per side"
        )));
    }
    if (width, height) == (image.width, image.height) {
        return Ok(image.clone());
    }

    let len = checked_byte_len(width, height, image.layers, image.format).ok_or_else(|| {
        DecodeError::new(format!("resizing to {width}x{height} does not fit in memory"))
    })?;
    let bpp = image.format.bytes_per_pixel();
    let mut bytes = Vec::with_capacity(len);
    for layer in 0..image.layers {
        let src = image.layer(layer);
        for y in 0..height {
            let sy = (y as u64 * image.height as u64 / height as u64) as usize;
            let row = &src[sy * image.row_len()..(sy + 1) * image.row_len()];
            for x in 0..width {
                let sx = (x as u64 * image.width as u64 / width as u64) as usize;
                bytes.extend_from_slice(&row[sx * bpp..(sx + 1) * bpp]);
            }
        }
    }
    RawImage::layered(width, height, image.layers, image.format, bytes)
}

fn flip_vertical(image: &mut RawImage) {
    let row_len = image.row_len();
    let layer_len = image.layer_len();
    let height = image.height as usize;
    for layer in image.bytes.chunks_exact_mut(layer_len) {
        for y in 0..height / 2 {
            let (top, bottom) = layer.split_at_mut((height - 1 - y) * row_len);
            top[y * row_len..(y + 1) * row_len].swap_with_slice(&mut bottom[..row_len]);
        }
    }
}
