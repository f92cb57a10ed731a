use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::LoadError;
use crate::resource::TextureHandle;

/// Expected face stems for cubemap resources stored on disk.
pub const CUBEMAP_FACE_STEMS: [&str; 6] = ["posx", "negx", "posy", "negy", "posz", "negz"];

/// Where the texture is going to be displayed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum UsageHint {
    /// Interface imagery: re-encoded to 8-bit BGRA and sampled as sRGB.
    Ui,
    /// Scene imagery: native layout, linear colour space.
    #[default]
    Scene,
}

/// Texture dimensionality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TextureKind {
    #[default]
    Texture2d,
    Cubemap,
}

/// Colour space the uploaded texture should be sampled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorSpace {
    Linear,
    Srgb,
}

impl fmt::Display for ColorSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => f.write_str("linear"),
            Self::Srgb => f.write_str("srgb"),
        }
    }
}

/// Pixel rectangle in source image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Adjustments applied on the worker right after decoding (crop, then resize, then flip).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformParams {
    pub usage: UsageHint,
    pub crop: Option<CropRect>,
    pub resize: Option<(u32, u32)>,
    pub flip_vertical: bool,
}

impl TransformParams {
    pub fn ui() -> Self {
        Self {
            usage: UsageHint::Ui,
            ..Self::default()
        }
    }

    pub fn scene() -> Self {
        Self::default()
    }

    pub fn with_crop(mut self, crop: CropRect) -> Self {
        self.crop = Some(crop);
        self
    }

    pub fn with_resize(mut self, width: u32, height: u32) -> Self {
        self.resize = Some((width, height));
        self
    }

    pub fn flipped(mut self) -> Self {
        self.flip_vertical = true;
        self
    }
}

/// Identity of a single load request, used to correlate it with its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Work item handed to the [`ImageWorker`](crate::ImageWorker).
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeRequest {
    pub id: RequestId,
    pub source: String,
    pub transform: TransformParams,
    pub kind: TextureKind,
}

impl DecodeRequest {
    pub fn new(source: impl Into<String>, transform: TransformParams) -> Self {
        Self {
            id: RequestId::next(),
            source: source.into(),
            transform,
            kind: TextureKind::Texture2d,
        }
    }

    pub fn cubemap(directory: impl Into<String>, transform: TransformParams) -> Self {
        Self {
            kind: TextureKind::Cubemap,
            ..Self::new(directory, transform)
        }
    }

    pub fn usage(&self) -> UsageHint {
        self.transform.usage
    }
}

/// Outcome of one request. Exactly one of texture or error exists.
#[derive(Debug)]
pub struct LoadResult {
    pub request: RequestId,
    pub source: String,
    pub outcome: Result<TextureHandle, LoadError>,
}

impl LoadResult {
    pub fn texture(&self) -> Option<&TextureHandle> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&LoadError> {
        self.outcome.as_ref().err()
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn failed(request: RequestId, source: impl Into<String>, error: LoadError) -> Self {
        Self {
            request,
            source: source.into(),
            outcome: Err(error),
        }
    }
}
