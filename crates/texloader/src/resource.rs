use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use crate::error::LoadError;
use crate::format::PixelLayout;
use crate::render::{DeviceTexture, SampledView};
use crate::types::{ColorSpace, TextureKind};

/// Identifies the thread that owns long-lived resource objects.
///
/// Capture it on that thread with [`MainContext::current`] and hand copies to
/// everything that needs to check whether it is running there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MainContext {
    thread: ThreadId,
}

impl MainContext {
    pub fn current() -> Self {
        Self {
            thread: thread::current().id(),
        }
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(u64);

impl TextureId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TextureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tex{}", self.0)
    }
}

/// What the main context needs to know to allocate a placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderSpec {
    pub name: String,
    pub layout: PixelLayout,
    pub kind: TextureKind,
    pub color_space: ColorSpace,
}

/// Host-side texture object. Exists before any device memory is bound to it.
#[derive(Debug)]
pub struct TexturePlaceholder {
    id: TextureId,
    spec: PlaceholderSpec,
    width: AtomicU32,
    height: AtomicU32,
    texture: Mutex<Option<DeviceTexture>>,
    view: Mutex<Option<SampledView>>,
}

pub type TextureHandle = Arc<TexturePlaceholder>;

impl TexturePlaceholder {
    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn layout(&self) -> PixelLayout {
        self.spec.layout
    }

    pub fn kind(&self) -> TextureKind {
        self.spec.kind
    }

    pub fn color_space(&self) -> ColorSpace {
        self.spec.color_space
    }

    pub fn width(&self) -> u32 {
        self.width.load(Ordering::Acquire)
    }

    pub fn height(&self) -> u32 {
        self.height.load(Ordering::Acquire)
    }

    pub fn set_dimensions(&self, width: u32, height: u32) {
        self.width.store(width, Ordering::Release);
        self.height.store(height, Ordering::Release);
    }

    /// Device texture bound to the reference slot, if any.
    pub fn texture(&self) -> Option<DeviceTexture> {
        lock(&self.texture).clone()
    }

    pub fn view(&self) -> Option<SampledView> {
        lock(&self.view).clone()
    }

    /// True once both the device texture and its sampled view are bound.
    pub fn is_ready(&self) -> bool {
        lock(&self.texture).is_some() && lock(&self.view).is_some()
    }

    pub(crate) fn bind_texture(&self, texture: DeviceTexture) {
        *lock(&self.texture) = Some(texture);
    }

    pub(crate) fn bind_view(&self, view: SampledView) {
        *lock(&self.view) = Some(view);
    }

    /// Unbinds everything, returning the device texture so it can be destroyed.
    pub(crate) fn unbind(&self) -> Option<DeviceTexture> {
        lock(&self.view).take();
        lock(&self.texture).take()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps constructed placeholders alive until their owner releases them.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    entries: Arc<Mutex<HashMap<TextureId, TextureHandle>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: TextureHandle) {
        lock(&self.entries).insert(handle.id(), handle);
    }

    pub fn release(&self, id: TextureId) -> Option<TextureHandle> {
        lock(&self.entries).remove(&id)
    }

    pub fn get(&self, id: TextureId) -> Option<TextureHandle> {
        lock(&self.entries).get(&id).cloned()
    }

    pub fn contains(&self, id: TextureId) -> bool {
        lock(&self.entries).contains_key(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Allocates placeholders. Only valid on the main context.
#[derive(Debug)]
pub struct ResourceConstructor {
    main: MainContext,
    registry: ResourceRegistry,
    next_id: AtomicU64,
}

impl ResourceConstructor {
    pub fn new(main: MainContext, registry: ResourceRegistry) -> Self {
        Self {
            main,
            registry,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn main(&self) -> MainContext {
        self.main
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// Creates an empty placeholder for `spec` and registers it so it outlives the
    /// upload. Touches no device memory.
    pub fn construct(&self, spec: PlaceholderSpec) -> Result<TextureHandle, LoadError> {
        let on_main = self.main.is_current();
        debug_assert!(on_main, "ResourceConstructor::construct called off the main context");
        if !on_main {
            tracing::error!(name = %spec.name, "placeholder construction attempted off the main context");
            return Err(LoadError::Precondition(
                "placeholders can only be constructed on the main context".into(),
            ));
        }

        let id = TextureId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(TexturePlaceholder {
            id,
            spec,
            width: AtomicU32::new(0),
            height: AtomicU32::new(0),
            texture: Mutex::new(None),
            view: Mutex::new(None),
        });
        self.registry.register(Arc::clone(&handle));
        tracing::debug!(texture = %id, name = handle.name(), layout = ?handle.layout(), "constructed texture placeholder");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> PlaceholderSpec {
        PlaceholderSpec {
            name: name.to_string(),
            layout: PixelLayout::Bgra8,
            kind: TextureKind::Texture2d,
            color_space: ColorSpace::Linear,
        }
    }

    #[test]
    fn construct_registers_empty_placeholder() {
        let constructor = ResourceConstructor::new(MainContext::current(), ResourceRegistry::new());
        let handle = constructor.construct(spec("photo.png")).unwrap();
        assert_eq!(handle.name(), "photo.png");
        assert_eq!((handle.width(), handle.height()), (0, 0));
        assert!(handle.texture().is_none());
        assert!(!handle.is_ready());
        assert!(constructor.registry().contains(handle.id()));

        let other = constructor.construct(spec("other.png")).unwrap();
        assert_ne!(handle.id(), other.id());
        assert_eq!(constructor.registry().len(), 2);
    }

    #[test]
    fn release_drops_registry_reference() {
        let constructor = ResourceConstructor::new(MainContext::current(), ResourceRegistry::new());
        let handle = constructor.construct(spec("a")).unwrap();
        assert_eq!(Arc::strong_count(&handle), 2);
        let released = constructor.registry().release(handle.id()).unwrap();
        drop(released);
        assert_eq!(Arc::strong_count(&handle), 1);
        assert!(constructor.registry().is_empty());
        assert!(constructor.registry().release(handle.id()).is_none());
    }

    #[test]
    fn main_context_is_thread_bound() {
        let main = MainContext::current();
        assert!(main.is_current());
        let elsewhere = thread::spawn(move || main.is_current()).join().unwrap();
        assert!(!elsewhere);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn construct_off_main_context_panics_in_debug() {
        let constructor = ResourceConstructor::new(MainContext::current(), ResourceRegistry::new());
        let outcome = thread::scope(|scope| scope.spawn(|| constructor.construct(spec("x"))).join());
        assert!(outcome.is_err());
        assert!(constructor.registry().is_empty());
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn construct_off_main_context_is_rejected() {
        let constructor = ResourceConstructor::new(MainContext::current(), ResourceRegistry::new());
        let outcome = thread::scope(|scope| scope.spawn(|| constructor.construct(spec("x"))).join())
            .unwrap();
        assert!(matches!(outcome, Err(LoadError::Precondition(_))));
    }
}
