//! Texture loading pipeline.
//!
//! Images are decoded on a background worker, but the objects that represent them
//! have to be created on privileged threads: placeholders on the main context, device
//! textures on the render context. The flow for one request is:
//!
//! ```text
//!   ImageWorker::enqueue ──▶ worker thread
//!                               │ ImageDecoder::decode ─▶ apply_transform
//!                               │ PixelFormatMapper::map_format ─▶ prepare_pixels
//!                               │
//!                               ├──▶ main context: ResourceConstructor::construct
//!                               │        (ConstructionTask, serviced by the main loop)
//!                               │
//!                               ├──▶ render context: create texture + bind   (hop 1)
//!                               ├──▶ render context: sampled view + bind     (hop 2)
//!                               ▼
//!                           LoadResult buffered ──▶ take_result / pop_result
//! ```
//!
//! The tick-driven front controller that owns an [`ImageWorker`] lives in the
//! `scheduler` crate.

mod decoder;
mod error;
mod format;
mod gpu;
mod raw;
mod render;
mod resource;
mod source;
mod transform;
mod types;
mod upload;
mod worker;

pub use decoder::{
    assemble_cubemap, decode_bytes, find_cubemap_face, ImageDecoder, MemoryDecoder,
    StandardDecoder, CUBEMAP_FACE_EXTENSIONS,
};
pub use error::{DecodeError, LoadError};
pub use format::{
    encode_bgra8, prepare_pixels, DefaultFormatMapper, PixelFormatMapper, PixelLayout,
    PreparedPixels,
};
pub use gpu::{texture_format, GpuTexture, GpuTextureStore, WgpuDevice};
pub use raw::{checked_byte_len, RawFormat, RawImage, MAX_DIMENSION};
pub use render::{
    DeviceTexture, HeadlessDevice, HeadlessInspector, HeadlessTexture, RenderContext,
    RenderDevice, SampledView, SamplerState, TextureDescriptor, ViewDimension,
};
pub use resource::{
    MainContext, PlaceholderSpec, ResourceConstructor, ResourceRegistry, TextureHandle, TextureId,
    TexturePlaceholder,
};
pub use source::{is_remote, SourceFetcher};
pub use transform::apply_transform;
pub use types::{
    ColorSpace, CropRect, DecodeRequest, LoadResult, RequestId, TextureKind, TransformParams,
    UsageHint, CUBEMAP_FACE_STEMS,
};
pub use upload::GpuUploader;
pub use worker::{ImageWorker, WorkerOptions};
