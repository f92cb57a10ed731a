//! Render-context plumbing.
//!
//! The render context is a dedicated thread that owns the graphics device. Other
//! threads hand it closures through [`RenderContext::execute`] and block until the
//! closure has run, which keeps every device call on one thread.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::error::LoadError;
use crate::format::PixelLayout;
use crate::types::{ColorSpace, TextureKind};

/// Everything a device needs to allocate a texture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDescriptor {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub layout: PixelLayout,
    pub color_space: ColorSpace,
    pub kind: TextureKind,
}

impl TextureDescriptor {
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.layers as usize * self.layout.bytes_per_pixel()
    }
}

/// Device-side texture bound into a placeholder's reference slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTexture {
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub layout: PixelLayout,
    pub color_space: ColorSpace,
    pub kind: TextureKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewDimension {
    D2,
    Cube,
}

/// Sampling state created alongside a texture's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerState {
    pub address_mode: wgpu::AddressMode,
    pub filter: wgpu::FilterMode,
    pub mipmap_filter: wgpu::FilterMode,
}

impl SamplerState {
    pub const TRILINEAR_WRAP: Self = Self {
        address_mode: wgpu::AddressMode::Repeat,
        filter: wgpu::FilterMode::Linear,
        mipmap_filter: wgpu::FilterMode::Linear,
    };
}

impl Default for SamplerState {
    fn default() -> Self {
        Self::TRILINEAR_WRAP
    }
}

/// Device-side sampling/view state for an uploaded texture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampledView {
    pub texture: u64,
    pub dimension: ViewDimension,
    pub sampler: SamplerState,
}

/// The allocate + upload contract a graphics backend provides.
pub trait RenderDevice: Send {
    fn name(&self) -> &str;

    fn create_texture(
        &mut self,
        descriptor: &TextureDescriptor,
        pixels: &[u8],
    ) -> Result<DeviceTexture, LoadError>;

    fn create_sampled_view(
        &mut self,
        texture: &DeviceTexture,
        sampler: SamplerState,
    ) -> Result<SampledView, LoadError>;

    fn destroy_texture(&mut self, texture: &DeviceTexture);
}

/// Snapshot of a texture held by a [`HeadlessDevice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlessTexture {
    pub descriptor: TextureDescriptor,
    pub pixels: Vec<u8>,
    pub view: Option<SampledView>,
}

#[derive(Debug, Default)]
struct HeadlessState {
    textures: HashMap<u64, HeadlessTexture>,
    created: usize,
    destroyed: usize,
}

/// In-memory device. Validates uploads the way a real backend would and keeps the
/// pixels around for inspection.
#[derive(Debug, Clone)]
pub struct HeadlessDevice {
    state: Arc<Mutex<HeadlessState>>,
    next_id: u64,
    max_dimension: u32,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::with_max_dimension(8192)
    }

    pub fn with_max_dimension(max_dimension: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(HeadlessState::default())),
            next_id: 1,
            max_dimension,
        }
    }

    /// Cloned handle that keeps observing the device after it moves to the render thread.
    pub fn inspector(&self) -> HeadlessInspector {
        HeadlessInspector {
            state: Arc::clone(&self.state),
        }
    }

    fn state(&self) -> MutexGuard<'_, HeadlessState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderDevice for HeadlessDevice {
    fn name(&self) -> &str {
        "headless"
    }

    fn create_texture(
        &mut self,
        descriptor: &TextureDescriptor,
        pixels: &[u8],
    ) -> Result<DeviceTexture, LoadError> {
        if descriptor.width > self.max_dimension || descriptor.height > self.max_dimension {
            return Err(LoadError::Upload(format!(
                "{}x{} exceeds the maximum texture dimension {}",
                descriptor.width, descriptor.height, self.max_dimension
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

        let id = self.next_id;
        self.next_id += 1;
        let mut state = self.state();
        state.textures.insert(
            id,
            HeadlessTexture {
                descriptor: descriptor.clone(),
                pixels: pixels.to_vec(),
                view: None,
            },
        );
        state.created += 1;
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
        let mut state = self.state();
        let entry = state
            .textures
            .get_mut(&texture.id)
            .ok_or_else(|| LoadError::Upload(format!("unknown device texture {}", texture.id)))?;
        let view = SampledView {
            texture: texture.id,
            dimension: match texture.kind {
                TextureKind::Texture2d => ViewDimension::D2,
                TextureKind::Cubemap => ViewDimension::Cube,
            },
            sampler,
        };
        entry.view = Some(view.clone());
        Ok(view)
    }

    fn destroy_texture(&mut self, texture: &DeviceTexture) {
        let mut state = self.state();
        if state.textures.remove(&texture.id).is_some() {
            state.destroyed += 1;
        }
    }
}

/// Read-only view of a [`HeadlessDevice`]'s textures.
#[derive(Debug, Clone)]
pub struct HeadlessInspector {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessInspector {
    pub fn texture(&self, id: u64) -> Option<HeadlessTexture> {
        self.lock().textures.get(&id).cloned()
    }

    pub fn live_textures(&self) -> usize {
        self.lock().textures.len()
    }

    pub fn created(&self) -> usize {
        self.lock().created
    }

    pub fn destroyed(&self) -> usize {
        self.lock().destroyed
    }

    fn lock(&self) -> MutexGuard<'_, HeadlessState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

type RenderJob = Box<dyn FnOnce(&mut dyn RenderDevice) + Send>;

enum RenderCommand {
    Run(RenderJob),
    Shutdown,
}

struct RenderInner {
    commands: Sender<RenderCommand>,
    thread: ThreadId,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for RenderInner {
    fn drop(&mut self) {
        let handle = self
            .join_handle
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = self.commands.send(RenderCommand::Shutdown);
            // The last handle may be released by a job running on the render thread.
            if thread::current().id() != self.thread {
                let _ = handle.join();
            }
        }
    }
}

/// Handle to the render thread. Cheap to clone; the thread stops with the last clone.
#[derive(Clone)]
pub struct RenderContext {
    inner: Arc<RenderInner>,
}

impl RenderContext {
    pub fn spawn<D>(device: D) -> Result<Self>
    where
        D: RenderDevice + 'static,
    {
        let (command_tx, command_rx) = unbounded();
        let handle = thread::Builder::new()
            .name("render-context".into())
            .spawn(move || run_render_thread(Box::new(device), command_rx))
            .map_err(|err| anyhow!("failed to spawn render thread: {err}"))?;
        let thread = handle.thread().id();
        Ok(Self {
            inner: Arc::new(RenderInner {
                commands: command_tx,
                thread,
                join_handle: Mutex::new(Some(handle)),
            }),
        })
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread
    }

    /// Runs `job` on the render thread and blocks until it returns.
    ///
    /// Calling this from the render thread itself would deadlock, so it is rejected.
    pub fn execute<R, F>(&self, job: F) -> Result<R, LoadError>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn RenderDevice) -> R + Send + 'static,
    {
        let reentrant = self.is_current();
        debug_assert!(!reentrant, "RenderContext::execute called from the render thread");
        if reentrant {
            tracing::error!("render job submitted from the render thread; refusing");
            return Err(LoadError::Precondition(
                "render jobs cannot be submitted from the render thread".into(),
            ));
        }

        let (reply_tx, reply_rx) = bounded(1);
        let job: RenderJob = Box::new(move |device| {
            let _ = reply_tx.send(job(device));
        });
        self.inner
            .commands
            .send(RenderCommand::Run(job))
            .map_err(|_| LoadError::Interrupted)?;
        reply_rx.recv().map_err(|_| LoadError::Interrupted)
    }
}

fn run_render_thread(mut device: Box<dyn RenderDevice>, commands: Receiver<RenderCommand>) {
    tracing::info!(device = device.name(), "render context started");
    while let Ok(command) = commands.recv() {
        match command {
            RenderCommand::Run(job) => job(device.as_mut()),
            RenderCommand::Shutdown => break,
        }
    }
    tracing::info!(device = device.name(), "render context stopped");
}
