use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use half::f16;
use image::{ColorType, DynamicImage};

use crate::error::DecodeError;
use crate::raw::{RawFormat, RawImage};
use crate::source::SourceFetcher;
use crate::types::CUBEMAP_FACE_STEMS;

/// Face file extensions probed inside a cubemap directory, in priority order.
pub const CUBEMAP_FACE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "hdr", "exr"];

/// Turns a source into pixels. Runs on the worker thread.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, source: &str) -> Result<RawImage, DecodeError>;

    /// Decodes the six faces of a cubemap directory into one six-layer image.
    fn decode_cubemap(&self, directory: &str) -> Result<RawImage, DecodeError> {
        let dir = Path::new(directory);
        if !dir.is_dir() {
            return Err(DecodeError::new(format!(
                "cubemap directory {directory} is missing or not a directory"
            )));
        }
        let mut faces = Vec::with_capacity(CUBEMAP_FACE_STEMS.len());
        for stem in CUBEMAP_FACE_STEMS {
            let path = find_cubemap_face(dir, stem).ok_or_else(|| {
                DecodeError::new(format!("cubemap face '{stem}' missing in {directory}"))
            })?;
            faces.push(self.decode(&path.to_string_lossy())?);
        }
        assemble_cubemap(faces)
    }
}

pub fn find_cubemap_face(directory: &Path, stem: &str) -> Option<PathBuf> {
    CUBEMAP_FACE_EXTENSIONS
        .iter()
        .map(|ext| directory.join(format!("{stem}.{ext}")))
        .find(|candidate| candidate.is_file())
}

/// Stacks six square, equally sized faces of one format into a layered image.
pub fn assemble_cubemap(faces: Vec<RawImage>) -> Result<RawImage, DecodeError> {
    if faces.len() != CUBEMAP_FACE_STEMS.len() {
        return Err(DecodeError::new(format!(
            "cubemap needs {} faces, got {}",
            CUBEMAP_FACE_STEMS.len(),
            faces.len()
        )));
    }
    let first = &faces[0];
    let (size, format) = (first.width, first.format);
    if first.width != first.height {
        return Err(DecodeError::new(format!(
            "cubemap face '{}' is not square ({}x{})",
            CUBEMAP_FACE_STEMS[0], first.width, first.height
        )));
    }

    let mut bytes = Vec::with_capacity(first.bytes.len() * faces.len());
    for (stem, face) in CUBEMAP_FACE_STEMS.iter().zip(&faces) {
        if face.width != size || face.height != size || face.layers != 1 {
            return Err(DecodeError::new(format!(
                "cubemap face '{stem}' is {}x{}; expected {size}x{size}",
                face.width, face.height
            )));
        }
        if face.format != format {
            return Err(DecodeError::new(format!(
                "cubemap face '{stem}' is {:?}; expected {format:?}",
                face.format
            )));
        }
        bytes.extend_from_slice(&face.bytes);
    }
    RawImage::layered(size, size, CUBEMAP_FACE_STEMS.len() as u32, format, bytes)
}

/// Decoder backed by the `image` crate. Reads files or URLs through a [`SourceFetcher`].
#[derive(Debug, Clone, Default)]
pub struct StandardDecoder {
    fetcher: SourceFetcher,
}

impl StandardDecoder {
    pub fn new(fetcher: SourceFetcher) -> Self {
        Self { fetcher }
    }
}

impl ImageDecoder for StandardDecoder {
    fn decode(&self, source: &str) -> Result<RawImage, DecodeError> {
        let bytes = self.fetcher.fetch(source)?;
        decode_bytes(&bytes)
    }
}

/// Decodes an encoded image (PNG, JPEG, BMP, GIF, HDR, EXR) into a [`RawImage`].
pub fn decode_bytes(bytes: &[u8]) -> Result<RawImage, DecodeError> {
    let image = image::load_from_memory(bytes).map_err(|err| DecodeError::new(err.to_string()))?;
    raw_from_dynamic(image)
}

fn raw_from_dynamic(image: DynamicImage) -> Result<RawImage, DecodeError> {
    let (width, height) = (image.width(), image.height());
    match image.color() {
        ColorType::L8 => RawImage::new(width, height, RawFormat::G8, image.into_luma8().into_raw()),
        ColorType::L16 => {
            let bytes = image
                .into_luma16()
                .into_raw()
                .into_iter()
                .flat_map(u16::to_le_bytes)
                .collect();
            RawImage::new(width, height, RawFormat::G16, bytes)
        }
        ColorType::La16 | ColorType::Rgb16 | ColorType::Rgba16 => {
            let bytes = image
                .into_rgba16()
                .into_raw()
                .into_iter()
                .flat_map(u16::to_le_bytes)
                .collect();
            RawImage::new(width, height, RawFormat::Rgba16, bytes)
        }
        ColorType::Rgb32F | ColorType::Rgba32F => {
            let bytes = image
                .into_rgba32f()
                .into_raw()
                .into_iter()
                .flat_map(|value| f16::from_f32(value).to_le_bytes())
                .collect();
            RawImage::new(width, height, RawFormat::Rgba16F, bytes)
        }
        _ => {
            let mut bytes = image.into_rgba8().into_raw();
            for pixel in bytes.chunks_exact_mut(4) {
                pixel.swap(0, 2);
            }
            RawImage::new(width, height, RawFormat::Bgra8, bytes)
        }
    }
}

/// In-memory decoder keyed by source string.
///
/// Hosts that already hold decoded pixels (and the test suites) register them here.
/// Cubemap faces are looked up as `"{directory}/{stem}"`.
#[derive(Debug, Default)]
pub struct MemoryDecoder {
    entries: Mutex<HashMap<String, Result<RawImage, DecodeError>>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MemoryDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps this long inside every decode call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn insert(&self, source: impl Into<String>, image: RawImage) {
        self.lock().insert(source.into(), Ok(image));
    }

    pub fn insert_error(&self, source: impl Into<String>, message: impl Into<String>) {
        self.lock()
            .insert(source.into(), Err(DecodeError::new(message)));
    }

    /// Number of decode calls served so far, cubemap faces included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Result<RawImage, DecodeError>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ImageDecoder for MemoryDecoder {
    fn decode(&self, source: &str) -> Result<RawImage, DecodeError> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.lock()
            .get(source)
            .cloned()
            .unwrap_or_else(|| Err(DecodeError::new(format!("no such image: {source}"))))
    }

    fn decode_cubemap(&self, directory: &str) -> Result<RawImage, DecodeError> {
        let faces = CUBEMAP_FACE_STEMS
            .iter()
            .map(|stem| self.decode(&format!("{directory}/{stem}")))
            .collect::<Result<Vec<_>, _>>()?;
        assemble_cubemap(faces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma, Rgb, Rgba};

    fn solid_face(size: u32, value: u8) -> RawImage {
        RawImage::new(size, size, RawFormat::G8, vec![value; (size * size) as usize]).unwrap()
    }

    #[test]
    fn rgba8_png_decodes_to_bgra8() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("photo.png");
        ImageBuffer::from_pixel(4, 2, Rgba([10u8, 20, 30, 40]))
            .save(&path)
            .unwrap();

        let image = StandardDecoder::default()
            .decode(&path.to_string_lossy())
            .unwrap();
        assert_eq!((image.width, image.height, image.layers), (4, 2, 1));
        assert_eq!(image.format, RawFormat::Bgra8);
        assert_eq!(&image.bytes[..4], &[30, 20, 10, 40]);
    }

    #[test]
    fn grey_and_wide_pngs_keep_their_depth() {
        let dir = tempfile::TempDir::new().unwrap();
        let grey = dir.path().join("grey.png");
        ImageBuffer::from_pixel(2, 2, Luma([7u8])).save(&grey).unwrap();
        let wide = dir.path().join("wide.png");
        ImageBuffer::from_pixel(2, 2, Rgb([1000u16, 2000, 3000]))
            .save(&wide)
            .unwrap();

        let decoder = StandardDecoder::default();
        let grey = decoder.decode(&grey.to_string_lossy()).unwrap();
        assert_eq!(grey.format, RawFormat::G8);
        assert_eq!(grey.bytes, vec![7; 4]);

        let wide = decoder.decode(&wide.to_string_lossy()).unwrap();
        assert_eq!(wide.format, RawFormat::Rgba16);
        assert_eq!(&wide.bytes[..2], &1000u16.to_le_bytes());
        assert_eq!(&wide.bytes[6..8], &u16::MAX.to_le_bytes());
    }

    #[test]
    fn garbage_reports_decoder_message() {
        let err = decode_bytes(b"definitely not an image").unwrap_err();
        assert!(!err.message().is_empty());
    }

    #[test]
    fn assembles_cubemap_faces_in_order() {
        let faces = (0..6).map(|value| solid_face(2, value)).collect();
        let cube = assemble_cubemap(faces).unwrap();
        assert_eq!(cube.layers, 6);
        assert_eq!(cube.layer(0), &[0; 4]);
        assert_eq!(cube.layer(5), &[5; 4]);
    }

    #[test]
    fn rejects_non_square_or_mismatched_faces() {
        let mut faces: Vec<_> = (0..6).map(|_| solid_face(2, 1)).collect();
        faces[3] = solid_face(4, 1);
        let err = assemble_cubemap(faces).unwrap_err();
        assert!(err.message().contains("'negy'"));

        let mut faces: Vec<_> = (0..6).map(|_| solid_face(2, 1)).collect();
        faces[0] = RawImage::new(2, 1, RawFormat::G8, vec![0; 2]).unwrap();
        assert!(assemble_cubemap(faces).unwrap_err().message().contains("not square"));
    }

    #[test]
    fn standard_decoder_reads_cubemap_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        for (index, stem) in CUBEMAP_FACE_STEMS.iter().enumerate() {
            let ext = if index % 2 == 0 { "png" } else { "bmp" };
            ImageBuffer::from_pixel(8, 8, Rgba([index as u8, 0, 0, 255]))
                .save(dir.path().join(format!("{stem}.{ext}")))
                .unwrap();
        }
        let cube = StandardDecoder::default()
            .decode_cubemap(&dir.path().to_string_lossy())
            .unwrap();
        assert_eq!((cube.width, cube.height, cube.layers), (8, 8, 6));
        assert_eq!(cube.layer(3)[2], 3);
    }

    #[test]
    fn missing_face_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = StandardDecoder::default()
            .decode_cubemap(&dir.path().to_string_lossy())
            .unwrap_err();
        assert!(err.message().contains("'posx' missing"));
    }

    #[test]
    fn memory_decoder_serves_registered_entries() {
        let decoder = MemoryDecoder::new();
        decoder.insert("a", solid_face(1, 9));
        decoder.insert_error("b", "invalid header");
        assert_eq!(decoder.decode("a").unwrap().bytes, vec![9]);
        assert_eq!(decoder.decode("b").unwrap_err().message(), "invalid header");
        assert!(decoder.decode("c").is_err());
        assert_eq!(decoder.calls(), 3);
    }
}
