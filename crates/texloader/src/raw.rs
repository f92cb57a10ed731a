use crate::error::DecodeError;

/// Pixel encodings a decoder may hand back.
///
/// Multi-byte channels are stored little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawFormat {
    /// 8-bit greyscale.
    G8,
    /// 16-bit greyscale.
    G16,
    /// 8-bit blue, green, red, alpha.
    Bgra8,
    /// 8-bit blue, green, red mantissas sharing an exponent byte (RGBE).
    Bgre8,
    /// 16-bit unsigned red, green, blue, alpha.
    Rgba16,
    /// Half-float red, green, blue, alpha.
    Rgba16F,
    /// Full-float red, green, blue, alpha.
    Rgba32F,
}

impl RawFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::G8 => 1,
            Self::G16 => 2,
            Self::Bgra8 | Self::Bgre8 => 4,
            Self::Rgba16 | Self::Rgba16F => 8,
            Self::Rgba32F => 16,
        }
    }
}

/// Largest width or height a decoded or transformed image may have.
pub const MAX_DIMENSION: u32 = 16384;

/// Byte size of a `width` x `height` x `layers` buffer, or `None` when it overflows.
pub fn checked_byte_len(width: u32, height: u32, layers: u32, format: RawFormat) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(layers as usize)?
        .checked_mul(format.bytes_per_pixel())
}

/// Decoded pixels plus the metadata needed to place them on the GPU.
///
/// Layers are stored one after another; cubemaps carry six.
#[derive(Debug, Clone, PartialEq)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub format: RawFormat,
    pub bytes: Vec<u8>,
}

impl RawImage {
    pub fn new(
        width: u32,
        height: u32,
        format: RawFormat,
        bytes: Vec<u8>,
    ) -> Result<Self, DecodeError> {
        Self::layered(width, height, 1, format, bytes)
    }

    pub fn layered(
        width: u32,
        height: u32,
        layers: u32,
        format: RawFormat,
        bytes: Vec<u8>,
    ) -> Result<Self, DecodeError> {
        if width == 0 || height == 0 || layers == 0 {
            return Err(DecodeError::new(format!(
                "image has no pixels ({width}x{height}, {layers} layers)"
            )));
        }
        let expected = checked_byte_len(width, height, layers, format).ok_or_else(|| {
            DecodeError::new(format!(
                "{width}x{height}x{layers} {format:?} image does not fit in memory"
            ))
        })?;
        if bytes.len() != expected {
            return Err(DecodeError::new(format!(
                "pixel buffer holds {} bytes but {width}x{height}x{layers} {format:?} needs {expected}",
                bytes.len()
            )));
        }
        Ok(Self {
            width,
            height,
            layers,
            format,
            bytes,
        })
    }

    pub fn row_len(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    pub fn layer_len(&self) -> usize {
        self.row_len() * self.height as usize
    }

    pub fn layer(&self, index: u32) -> &[u8] {
        let len = self.layer_len();
        let start = index as usize * len;
        &self.bytes[start..start + len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_buffer() {
        let err = RawImage::new(2, 2, RawFormat::Bgra8, vec![0; 15]).unwrap_err();
        assert!(err.message().contains("needs 16"));
    }

    #[test]
    fn rejects_overflowing_dimensions() {
        assert_eq!(checked_byte_len(u32::MAX, u32::MAX, 6, RawFormat::Rgba32F), None);
        let err = RawImage::layered(u32::MAX, u32::MAX, 6, RawFormat::Rgba32F, Vec::new())
            .unwrap_err();
        assert!(err.message().contains("does not fit"));
    }

    #[test]
    fn rejects_empty_image() {
        assert!(RawImage::new(0, 4, RawFormat::G8, Vec::new()).is_err());
    }

    #[test]
    fn layers_are_contiguous() {
        let bytes: Vec<u8> = (0..12).collect();
        let image = RawImage::layered(2, 1, 3, RawFormat::G16, bytes).unwrap();
        assert_eq!(image.layer_len(), 4);
        assert_eq!(image.layer(2), &[8, 9, 10, 11]);
    }
}
