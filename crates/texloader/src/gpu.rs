use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use wgpu::util::{DeviceExt, TextureDataOrder};

use crate::error::LoadError;
use crate::format::PixelLayout;
use crate::render::{
    DeviceTexture, RenderDevice, SampledView, SamplerState, TextureDescriptor, ViewDimension,
};
use crate::types::{ColorSpace, TextureKind};

/// wgpu objects backing one uploaded texture.
#[derive(Debug)]
pub struct GpuTexture {
    pub texture: wgpu::Texture,
    pub view: Option<wgpu::TextureView>,
    pub sampler: Option<wgpu::Sampler>,
}

/// Uploaded textures keyed by [`DeviceTexture::id`]; shared with whoever renders them.
pub type GpuTextureStore = Arc<Mutex<HashMap<u64, GpuTexture>>>;

/// Picks the wgpu format for a layout, using the sRGB variant for display colours.
pub fn texture_format(layout: PixelLayout, color_space: ColorSpace) -> wgpu::TextureFormat {
    match (layout, color_space) {
        (PixelLayout::G8, _) => wgpu::TextureFormat::R8Unorm,
        (PixelLayout::G16, _) => wgpu::TextureFormat::R16Uint,
        (PixelLayout::Bgra8, ColorSpace::Linear) => wgpu::TextureFormat::Bgra8Unorm,
        (PixelLayout::Bgra8, ColorSpace::Srgb) => wgpu::TextureFormat::Bgra8UnormSrgb,
        (PixelLayout::Rgba16Sint, _) => wgpu::TextureFormat::Rgba16Sint,
        (PixelLayout::FloatRgba, _) => wgpu::TextureFormat::Rgba16Float,
    }
}

/// Headless wgpu backend.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    max_dimension: u32,
    store: GpuTextureStore,
    next_id: u64,
}

impl WgpuDevice {
    pub fn new(power_preference: wgpu::PowerPreference) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: wgpu::InstanceFlags::default(),
            memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
            backend_options: wgpu::BackendOptions::default(),
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .context("failed to find a suitable GPU adapter")?;

        let info = adapter.get_info();
        let limits = adapter.limits();
        tracing::debug!(
            name = %info.name,
            backend = ?info.backend,
            device_type = ?info.device_type,
            "selected GPU adapter"
        );

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("imgload device"),
            required_features: wgpu::Features::empty(),
            required_limits: limits.clone(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::default(),
        }))
        .context("failed to create GPU device")?;

        Ok(Self {
            device,
            queue,
            adapter_name: info.name,
            max_dimension: limits.max_texture_dimension_2d,
            store: Arc::new(Mutex::new(HashMap::new())),
            next_id: 1,
        })
    }

    pub fn store(&self) -> GpuTextureStore {
        Arc::clone(&self.store)
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    fn with_store<R>(&self, f: impl FnOnce(&mut HashMap<u64, GpuTexture>) -> R) -> R {
        let mut store = self
            .store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut store)
    }
}

impl RenderDevice for WgpuDevice {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn create_texture(
        &mut self,
        descriptor: &TextureDescriptor,
        pixels: &[u8],
    ) -> Result<DeviceTexture, LoadError> {
        if descriptor.width > self.max_dimension || descriptor.height > self.max_dimension {
            return Err(LoadError::Upload(format!(
                "GPU max texture dimension is {}, image is {}x{}",
                self.max_dimension, descriptor.width, descriptor.height
            )));
        }
        if descriptor.kind == TextureKind::Cubemap
            && (descriptor.layers != 6 || descriptor.width != descriptor.height)
        {
            return Err(LoadError::Upload(format!(
                "cubemap textures need six square layers, got {}x{}x{}",
                descriptor.width, descriptor.height, descriptor.layers
            )));
        }
        if pixels.len() != descriptor.byte_len() {
            return Err(LoadError::Upload(format!(
                "'{}' expects {} bytes, got {}",
                descriptor.label,
                descriptor.byte_len(),
                pixels.len()
            )));
        }

        let texture = self.device.create_texture_with_data(
            &self.queue,
            &wgpu::TextureDescriptor {
                label: Some(&descriptor.label),
                size: wgpu::Extent3d {
                    width: descriptor.width,
                    height: descriptor.height,
                    depth_or_array_layers: descriptor.layers,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: texture_format(descriptor.layout, descriptor.color_space),
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            },
            TextureDataOrder::LayerMajor,
            pixels,
        );

        let id = self.next_id;
        self.next_id += 1;
        self.with_store(|store| {
            store.insert(
                id,
                GpuTexture {
                    texture,
                    view: None,
                    sampler: None,
                },
            )
        });
        Ok(DeviceTexture {
            id,
            width: descriptor.width,
            height: descriptor.height,
            layers: descriptor.layers,
            layout: descriptor.layout,
            color_space: descriptor.color_space,
            kind: descriptor.kind,
        })
    }

    fn create_sampled_view(
        &mut self,
        texture: &DeviceTexture,
        sampler: SamplerState,
    ) -> Result<SampledView, LoadError> {
        let device = &self.device;
        self.with_store(|store| {
            let entry = store.get_mut(&texture.id).ok_or_else(|| {
                LoadError::Upload(format!("unknown device texture {}", texture.id))
            })?;
            let (view, dimension) = match texture.kind {
                TextureKind::Texture2d => (
                    entry
                        .texture
                        .create_view(&wgpu::TextureViewDescriptor::default()),
                    ViewDimension::D2,
                ),
                TextureKind::Cubemap => (
                    entry.texture.create_view(&wgpu::TextureViewDescriptor {
                        label: Some(&format!("cubemap view #{}", texture.id)),
                        dimension: Some(wgpu::TextureViewDimension::Cube),
                        array_layer_count: Some(6),
                        ..Default::default()
                    }),
                    ViewDimension::Cube,
                ),
            };
            entry.view = Some(view);
            entry.sampler = Some(device.create_sampler(&wgpu::SamplerDescriptor {
                address_mode_u: sampler.address_mode,
                address_mode_v: sampler.address_mode,
                address_mode_w: sampler.address_mode,
                mag_filter: sampler.filter,
                min_filter: sampler.filter,
                mipmap_filter: sampler.mipmap_filter,
                ..Default::default()
            }));
            Ok(SampledView {
                texture: texture.id,
                dimension,
                sampler,
            })
        })
    }

    fn destroy_texture(&mut self, texture: &DeviceTexture) {
        if let Some(entry) = self.with_store(|store| store.remove(&texture.id)) {
            entry.texture.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_colour_uses_srgb_variant() {
        assert_eq!(
            texture_format(PixelLayout::Bgra8, ColorSpace::Srgb),
            wgpu::TextureFormat::Bgra8UnormSrgb
        );
        assert_eq!(
            texture_format(PixelLayout::Bgra8, ColorSpace::Linear),
            wgpu::TextureFormat::Bgra8Unorm
        );
    }

    #[test]
    fn texel_sizes_match_layouts() {
        for layout in [
            PixelLayout::G8,
            PixelLayout::G16,
            PixelLayout::Bgra8,
            PixelLayout::Rgba16Sint,
            PixelLayout::FloatRgba,
        ] {
            let format = texture_format(layout, ColorSpace::Linear);
            assert_eq!(
                format.block_copy_size(None),
                Some(layout.bytes_per_pixel() as u32),
                "{layout:?}"
            );
        }
    }
}
