use half::f16;

use crate::error::LoadError;
use crate::raw::{RawFormat, RawImage};
use crate::types::{ColorSpace, UsageHint};

/// GPU-side pixel layout a texture is uploaded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    G8,
    G16,
    Bgra8,
    Rgba16Sint,
    FloatRgba,
}

impl PixelLayout {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::G8 => 1,
            Self::G16 => 2,
            Self::Bgra8 => 4,
            Self::Rgba16Sint | Self::FloatRgba => 8,
        }
    }
}

/// Picks the upload layout for a decoded format. `None` means unsupported.
pub trait PixelFormatMapper: Send + Sync {
    fn map_format(&self, raw: RawFormat, usage: UsageHint) -> Option<PixelLayout>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFormatMapper;

impl PixelFormatMapper for DefaultFormatMapper {
    fn map_format(&self, raw: RawFormat, usage: UsageHint) -> Option<PixelLayout> {
        let scene = match raw {
            RawFormat::G8 => PixelLayout::G8,
            RawFormat::G16 => PixelLayout::G16,
            RawFormat::Bgra8 | RawFormat::Bgre8 => PixelLayout::Bgra8,
            RawFormat::Rgba16 => PixelLayout::Rgba16Sint,
            RawFormat::Rgba16F => PixelLayout::FloatRgba,
            RawFormat::Rgba32F => return None,
        };
        Some(match usage {
            UsageHint::Ui => PixelLayout::Bgra8,
            UsageHint::Scene => scene,
        })
    }
}

/// Pixels ready for upload, in the layout they will live in on the device.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedPixels {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub layout: PixelLayout,
    pub color_space: ColorSpace,
    pub bytes: Vec<u8>,
}

/// Converts decoded pixels into the bytes for `layout`.
///
/// UI imagery is always re-encoded to 8-bit BGRA and tagged sRGB. Scene imagery keeps
/// its native bytes and stays linear, which requires the layout to match the raw
/// pixel size.
pub fn prepare_pixels(
    image: RawImage,
    layout: PixelLayout,
    usage: UsageHint,
) -> Result<PreparedPixels, LoadError> {
    let RawImage {
        width,
        height,
        layers,
        format,
        bytes,
    } = image;
    let (layout, color_space, bytes) = match usage {
        UsageHint::Ui => (PixelLayout::Bgra8, ColorSpace::Srgb, encode_bgra8(format, &bytes)),
        UsageHint::Scene => {
            if layout.bytes_per_pixel() != format.bytes_per_pixel() {
                tracing::warn!(?format, ?layout, "decoded format does not fit the mapped layout");
                return Err(LoadError::UnsupportedFormat);
            }
            (layout, ColorSpace::Linear, bytes)
        }
    };
    Ok(PreparedPixels {
        width,
        height,
        layers,
        layout,
        color_space,
        bytes,
    })
}

/// Re-encodes any raw format into canonical 8-bit BGRA.
pub fn encode_bgra8(format: RawFormat, bytes: &[u8]) -> Vec<u8> {
    let pixels = bytes.len() / format.bytes_per_pixel();
    let mut out = Vec::with_capacity(pixels * 4);
    match format {
        RawFormat::G8 => {
            for &value in bytes {
                out.extend_from_slice(&[value, value, value, u8::MAX]);
            }
        }
        RawFormat::G16 => {
            for chunk in bytes.chunks_exact(2) {
                let value = narrow_u16(chunk);
                out.extend_from_slice(&[value, value, value, u8::MAX]);
            }
        }
        RawFormat::Bgra8 => out.extend_from_slice(bytes),
        RawFormat::Bgre8 => {
            for chunk in bytes.chunks_exact(4) {
                let scale = rgbe_scale(chunk[3]);
                out.extend_from_slice(&[
                    unit_to_u8(chunk[0] as f32 * scale),
                    unit_to_u8(chunk[1] as f32 * scale),
                    unit_to_u8(chunk[2] as f32 * scale),
                    u8::MAX,
                ]);
            }
        }
        RawFormat::Rgba16 => {
            for chunk in bytes.chunks_exact(8) {
                out.extend_from_slice(&[
                    narrow_u16(&chunk[4..6]),
                    narrow_u16(&chunk[2..4]),
                    narrow_u16(&chunk[0..2]),
                    narrow_u16(&chunk[6..8]),
                ]);
            }
        }
        RawFormat::Rgba16F => {
            for chunk in bytes.chunks_exact(8) {
                let channel = |offset: usize| {
                    unit_to_u8(f16::from_le_bytes([chunk[offset], chunk[offset + 1]]).to_f32())
                };
                out.extend_from_slice(&[channel(4), channel(2), channel(0), channel(6)]);
            }
        }
        RawFormat::Rgba32F => {
            for chunk in bytes.chunks_exact(16) {
                let channel = |offset: usize| {
                    let mut raw = [0u8; 4];
                    raw.copy_from_slice(&chunk[offset..offset + 4]);
                    unit_to_u8(f32::from_le_bytes(raw))
                };
                out.extend_from_slice(&[channel(8), channel(4), channel(0), channel(12)]);
            }
        }
    }
    out
}

fn narrow_u16(bytes: &[u8]) -> u8 {
    (u16::from_le_bytes([bytes[0], bytes[1]]) >> 8) as u8
}

fn unit_to_u8(value: f32) -> u8 {
    if value.is_nan() {
        return 0;
    }
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Multiplier turning an RGBE mantissa byte into a linear value.
fn rgbe_scale(exponent: u8) -> f32 {
    if exponent == 0 {
        return 0.0;
    }
    2f32.powi(exponent as i32 - (128 + 8))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_FORMATS: [RawFormat; 7] = [
        RawFormat::G8,
        RawFormat::G16,
        RawFormat::Bgra8,
        RawFormat::Bgre8,
        RawFormat::Rgba16,
        RawFormat::Rgba16F,
        RawFormat::Rgba32F,
    ];

    #[test]
    fn scene_mapping_follows_native_formats() {
        let mapper = DefaultFormatMapper;
        let map = |raw| mapper.map_format(raw, UsageHint::Scene);
        assert_eq!(map(RawFormat::G8), Some(PixelLayout::G8));
        assert_eq!(map(RawFormat::G16), Some(PixelLayout::G16));
        assert_eq!(map(RawFormat::Bgre8), Some(PixelLayout::Bgra8));
        assert_eq!(map(RawFormat::Rgba16), Some(PixelLayout::Rgba16Sint));
        assert_eq!(map(RawFormat::Rgba16F), Some(PixelLayout::FloatRgba));
        assert_eq!(map(RawFormat::Rgba32F), None);
    }

    #[test]
    fn ui_mapping_is_always_bgra8_when_supported() {
        let mapper = DefaultFormatMapper;
        for raw in ALL_FORMATS {
            let mapped = mapper.map_format(raw, UsageHint::Ui);
            if raw == RawFormat::Rgba32F {
                assert_eq!(mapped, None);
            } else {
                assert_eq!(mapped, Some(PixelLayout::Bgra8), "{raw:?}");
            }
        }
    }

    #[test]
    fn ui_preparation_reencodes_and_marks_srgb() {
        let image = RawImage::new(1, 1, RawFormat::Rgba16, {
            let mut bytes = Vec::new();
            for value in [0x1000u16, 0x2000, 0x3000, 0xffff] {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            bytes
        })
        .unwrap();
        let prepared = prepare_pixels(image, PixelLayout::Bgra8, UsageHint::Ui).unwrap();
        assert_eq!(prepared.layout, PixelLayout::Bgra8);
        assert_eq!(prepared.color_space, ColorSpace::Srgb);
        assert_eq!(prepared.bytes, vec![0x30, 0x20, 0x10, 0xff]);
    }

    #[test]
    fn scene_preparation_keeps_native_bytes() {
        let image = RawImage::new(2, 1, RawFormat::G16, vec![1, 2, 3, 4]).unwrap();
        let prepared = prepare_pixels(image, PixelLayout::G16, UsageHint::Scene).unwrap();
        assert_eq!(prepared.color_space, ColorSpace::Linear);
        assert_eq!(prepared.bytes, vec![1, 2, 3, 4]);

        let image = RawImage::new(1, 1, RawFormat::G16, vec![1, 2]).unwrap();
        let err = prepare_pixels(image, PixelLayout::Bgra8, UsageHint::Scene).unwrap_err();
        assert_eq!(err, LoadError::UnsupportedFormat);
    }

    #[test]
    fn float_and_grey_encode_to_bgra8() {
        let mut half_bytes = Vec::new();
        for value in [2.0f32, 0.5, -1.0, 1.0] {
            half_bytes.extend_from_slice(&f16::from_f32(value).to_le_bytes());
        }
        assert_eq!(encode_bgra8(RawFormat::Rgba16F, &half_bytes), vec![0, 128, 255, 255]);
        assert_eq!(encode_bgra8(RawFormat::G8, &[9]), vec![9, 9, 9, 255]);
        assert_eq!(encode_bgra8(RawFormat::G16, &[0, 0x80]), vec![0x80, 0x80, 0x80, 255]);
    }

    #[test]
    fn rgbe_decodes_to_clamped_bytes() {
        // exponent 128 => scale 1/256, so mantissa 128 is 0.5.
        assert_eq!(encode_bgra8(RawFormat::Bgre8, &[128, 0, 64, 128]), vec![128, 0, 64, 255]);
        assert_eq!(encode_bgra8(RawFormat::Bgre8, &[255, 1, 0, 133]), vec![255, 32, 0, 255]);
        assert_eq!(encode_bgra8(RawFormat::Bgre8, &[200, 200, 200, 0]), vec![0, 0, 0, 255]);
    }
}
