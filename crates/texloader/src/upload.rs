use std::sync::Arc;

use crate::error::LoadError;
use crate::format::PreparedPixels;
use crate::render::{RenderContext, SamplerState, TextureDescriptor};
use crate::resource::TextureHandle;

/// Moves prepared pixels onto the device and binds them to a placeholder.
#[derive(Clone)]
pub struct GpuUploader {
    render: RenderContext,
    sampler: SamplerState,
}

impl GpuUploader {
    pub fn new(render: RenderContext) -> Self {
        Self {
            render,
            sampler: SamplerState::TRILINEAR_WRAP,
        }
    }

    pub fn render_context(&self) -> &RenderContext {
        &self.render
    }

    /// Two blocking hops to the render context: the first creates the device texture
    /// and binds it to the placeholder's reference slot, the second creates the sampled
    /// view. Must not be called from the render thread.
    pub fn upload(&self, placeholder: &TextureHandle, pixels: PreparedPixels) -> Result<(), LoadError> {
        let descriptor = TextureDescriptor {
            label: placeholder.name().to_string(),
            width: pixels.width,
            height: pixels.height,
            layers: pixels.layers,
            layout: pixels.layout,
            color_space: pixels.color_space,
            kind: placeholder.kind(),
        };

        let target = Arc::clone(placeholder);
        let texture = self.render.execute(move |device| {
            let texture = device.create_texture(&descriptor, &pixels.bytes)?;
            target.bind_texture(texture.clone());
            Ok::<_, LoadError>(texture)
        })??;

        let target = Arc::clone(placeholder);
        let sampler = self.sampler;
        self.render.execute(move |device| {
            match device.create_sampled_view(&texture, sampler) {
                Ok(view) => {
                    target.bind_view(view);
                    Ok(())
                }
                Err(error) => {
                    target.unbind();
                    device.destroy_texture(&texture);
                    Err(error)
                }
            }
        })??;

        tracing::debug!(texture = %placeholder.id(), name = placeholder.name(), "uploaded texture");
        Ok(())
    }

    /// Unbinds and destroys the device texture behind a placeholder.
    pub fn destroy(&self, placeholder: &TextureHandle) -> Result<(), LoadError> {
        let Some(texture) = placeholder.unbind() else {
            return Ok(());
        };
        self.render
            .execute(move |device| device.destroy_texture(&texture))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelLayout;
    use crate::render::{HeadlessDevice, ViewDimension};
    use crate::resource::{MainContext, PlaceholderSpec, ResourceConstructor, ResourceRegistry};
    use crate::types::{ColorSpace, TextureKind};

    fn placeholder(kind: TextureKind) -> TextureHandle {
        ResourceConstructor::new(MainContext::current(), ResourceRegistry::new())
            .construct(PlaceholderSpec {
                name: "sky".into(),
                layout: PixelLayout::G8,
                kind,
                color_space: ColorSpace::Linear,
            })
            .unwrap()
    }

    fn pixels(size: u32, layers: u32) -> PreparedPixels {
        PreparedPixels {
            width: size,
            height: size,
            layers,
            layout: PixelLayout::G8,
            color_space: ColorSpace::Linear,
            bytes: vec![1; (size * size * layers) as usize],
        }
    }

    #[test]
    fn upload_binds_texture_then_view() {
        let device = HeadlessDevice::new();
        let inspector = device.inspector();
        let uploader = GpuUploader::new(RenderContext::spawn(device).unwrap());
        let handle = placeholder(TextureKind::Texture2d);

        uploader.upload(&handle, pixels(2, 1)).unwrap();
        assert!(handle.is_ready());
        let texture = handle.texture().unwrap();
        let view = handle.view().unwrap();
        assert_eq!(view.texture, texture.id);
        assert_eq!(view.sampler, SamplerState::TRILINEAR_WRAP);
        assert_eq!(inspector.texture(texture.id).unwrap().pixels, vec![1; 4]);

        uploader.destroy(&handle).unwrap();
        assert!(handle.texture().is_none());
        assert_eq!(inspector.live_textures(), 0);
    }

    #[test]
    fn cubemaps_get_cube_views() {
        let uploader = GpuUploader::new(RenderContext::spawn(HeadlessDevice::new()).unwrap());
        let handle = placeholder(TextureKind::Cubemap);
        uploader.upload(&handle, pixels(4, 6)).unwrap();
        assert_eq!(handle.view().unwrap().dimension, ViewDimension::Cube);
    }

    #[test]
    fn device_rejection_leaves_placeholder_unbound() {
        let uploader =
            GpuUploader::new(RenderContext::spawn(HeadlessDevice::with_max_dimension(2)).unwrap());
        let handle = placeholder(TextureKind::Texture2d);
        let err = uploader.upload(&handle, pixels(4, 1)).unwrap_err();
        assert!(matches!(err, LoadError::Upload(_)));
        assert!(handle.texture().is_none());
    }
}
