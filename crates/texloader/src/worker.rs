//! Background decode worker.
//!
//! One named thread drains a FIFO of [`DecodeRequest`]s. Each request is decoded,
//! mapped to a pixel layout, given a placeholder by the main context and uploaded
//! through the render context. Results are buffered until the main context takes them.
//!
//! The queue can also be drained re-entrantly from the main thread (`load_sync`). A
//! drain lock keeps requests in FIFO order across both drainers; while the main thread
//! waits for that lock it keeps servicing construction tasks, so a worker blocked on
//! the main context can always make progress.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use loaderconfig::WorkerSettings;

use crate::decoder::ImageDecoder;
use crate::error::LoadError;
use crate::format::{prepare_pixels, DefaultFormatMapper, PixelFormatMapper, PreparedPixels};
use crate::render::RenderContext;
use crate::resource::{
    MainContext, PlaceholderSpec, ResourceConstructor, ResourceRegistry, TextureHandle, TextureId,
};
use crate::transform::apply_transform;
use crate::types::{DecodeRequest, LoadResult, RequestId, TextureKind};
use crate::upload::GpuUploader;

/// Longest the main thread waits for a construction task before retrying the drain lock.
const MAIN_WAIT_SLICE: Duration = Duration::from_millis(2);

/// Placeholder request sent from the worker to the main context.
#[derive(Debug)]
struct ConstructionTask {
    request: RequestId,
    spec: PlaceholderSpec,
    reply: Sender<Result<TextureHandle, LoadError>>,
}

/// A request tagged with the `clear_all` generation it was accepted in.
struct Queued {
    generation: u64,
    request: DecodeRequest,
}

/// Collaborators the worker drives.
pub struct WorkerOptions {
    pub settings: WorkerSettings,
    pub decoder: Arc<dyn ImageDecoder>,
    pub mapper: Arc<dyn PixelFormatMapper>,
}

impl WorkerOptions {
    pub fn new(decoder: Arc<dyn ImageDecoder>) -> Self {
        Self {
            settings: WorkerSettings::default(),
            decoder,
            mapper: Arc::new(DefaultFormatMapper),
        }
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn PixelFormatMapper>) -> Self {
        self.mapper = mapper;
        self
    }
}

struct Shared {
    settings: WorkerSettings,
    decoder: Arc<dyn ImageDecoder>,
    mapper: Arc<dyn PixelFormatMapper>,
    constructor: ResourceConstructor,
    uploader: GpuUploader,
    requests_tx: Sender<Queued>,
    requests_rx: Receiver<Queued>,
    construct_tx: Sender<ConstructionTask>,
    construct_rx: Receiver<ConstructionTask>,
    wake_tx: Sender<()>,
    results: Mutex<Vec<LoadResult>>,
    /// Requests accepted by `enqueue` whose processing has not finished.
    outstanding: AtomicUsize,
    /// Bumped by `clear_all`; results from an older generation are discarded.
    generation: AtomicU64,
    drain_lock: Mutex<()>,
    stop: AtomicBool,
}

pub struct ImageWorker {
    shared: Arc<Shared>,
    join_handle: Option<JoinHandle<()>>,
}

impl ImageWorker {
    pub fn spawn(main: MainContext, render: RenderContext, options: WorkerOptions) -> Result<Self> {
        let WorkerOptions {
            settings,
            decoder,
            mapper,
        } = options;
        let (requests_tx, requests_rx) = unbounded();
        let (construct_tx, construct_rx) = unbounded();
        let (wake_tx, wake_rx) = bounded(1);
        let thread_name = settings.thread_name.clone();
        let shared = Arc::new(Shared {
            settings,
            decoder,
            mapper,
            constructor: ResourceConstructor::new(main, ResourceRegistry::new()),
            uploader: GpuUploader::new(render),
            requests_tx,
            requests_rx,
            construct_tx,
            construct_rx,
            wake_tx,
            results: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            drain_lock: Mutex::new(()),
            stop: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || run_worker_thread(thread_shared, wake_rx))
            .map_err(|err| anyhow!("failed to spawn image worker thread: {err}"))?;

        Ok(Self {
            shared,
            join_handle: Some(handle),
        })
    }

    /// Appends a request to the FIFO and wakes the worker. Never blocks.
    pub fn enqueue(&self, request: DecodeRequest) {
        tracing::debug!(request = %request.id, source = %request.source, "queued decode request");
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        let queued = Queued {
            generation: self.shared.generation.load(Ordering::Acquire),
            request,
        };
        if self.shared.requests_tx.send(queued).is_err() {
            self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        let _ = self.shared.wake_tx.try_send(());
    }

    /// Processes queued requests on the calling thread until the FIFO is empty or the
    /// worker is stopping.
    pub fn drain_until_idle(&self) {
        self.shared.drain_until_idle();
    }

    /// True once every accepted request has finished processing.
    pub fn is_idle(&self) -> bool {
        self.shared.outstanding.load(Ordering::Acquire) == 0
    }

    /// Removes and returns the most recently completed result.
    pub fn pop_result(&self) -> Result<LoadResult, LoadError> {
        let popped = self.shared.results().pop();
        debug_assert!(popped.is_some(), "pop_result called with no buffered result");
        popped.ok_or_else(|| {
            tracing::error!("pop_result called with no buffered result");
            LoadError::Precondition("no load result is buffered".into())
        })
    }

    /// Removes and returns the result produced for `request`, if it has landed.
    pub fn take_result(&self, request: RequestId) -> Option<LoadResult> {
        let mut results = self.shared.results();
        let index = results.iter().position(|result| result.request == request)?;
        Some(results.remove(index))
    }

    pub fn buffered_results(&self) -> usize {
        self.shared.results().len()
    }

    /// Drops queued requests and buffered results. A request already being processed
    /// keeps running, but its result is discarded when it lands.
    pub fn clear_all(&self) {
        let shared = &self.shared;
        let stale = {
            let mut results = shared.results();
            shared.generation.fetch_add(1, Ordering::AcqRel);
            results.drain(..).collect::<Vec<_>>()
        };

        let mut dropped = 0;
        while let Ok(Queued { request, .. }) = shared.requests_rx.try_recv() {
            tracing::debug!(request = %request.id, source = %request.source, "dropped queued request");
            dropped += 1;
        }
        shared.outstanding.fetch_sub(dropped, Ordering::AcqRel);

        for result in stale {
            if let Ok(handle) = result.outcome {
                shared.release_texture(handle.id());
            }
        }
        tracing::debug!(dropped, "cleared image worker");
    }

    /// Services construction tasks posted by the worker thread. Main context only.
    pub fn service_construction(&self) -> usize {
        let on_main = self.shared.constructor.main().is_current();
        debug_assert!(on_main, "service_construction called off the main context");
        if !on_main {
            tracing::error!("construction tasks can only be serviced on the main context");
            return 0;
        }
        let mut serviced = 0;
        while let Ok(task) = self.shared.construct_rx.try_recv() {
            self.shared.fulfil(task);
            serviced += 1;
        }
        serviced
    }

    pub fn registry(&self) -> &ResourceRegistry {
        self.shared.constructor.registry()
    }

    pub fn main_context(&self) -> MainContext {
        self.shared.constructor.main()
    }

    pub fn render_context(&self) -> &RenderContext {
        self.shared.uploader.render_context()
    }

    /// Drops the keep-alive reference for a texture and destroys its device resources.
    pub fn release(&self, id: TextureId) -> bool {
        self.shared.release_texture(id)
    }
}

impl Drop for ImageWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            self.shared.stop.store(true, Ordering::Release);
            let _ = self.shared.wake_tx.try_send(());
            let _ = handle.join();
        }
    }
}

/// Marks one request finished when dropped, even if processing unwound.
struct OutstandingGuard<'a>(&'a AtomicUsize);

impl Drop for OutstandingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_worker_thread(shared: Arc<Shared>, wake: Receiver<()>) {
    tracing::info!(thread = %shared.settings.thread_name, "image worker started");
    while !shared.stop.load(Ordering::Acquire) {
        match wake.recv_timeout(shared.settings.drain_interval) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        shared.drain_until_idle();
    }
    tracing::info!(thread = %shared.settings.thread_name, "image worker stopped");
}

impl Shared {
    fn results(&self) -> MutexGuard<'_, Vec<LoadResult>> {
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn drain_until_idle(&self) {
        let Some(_guard) = self.acquire_drain_lock() else {
            return;
        };
        while !self.stop.load(Ordering::Acquire) {
            let Ok(queued) = self.requests_rx.try_recv() else {
                break;
            };
            self.process(queued);
        }
    }

    fn acquire_drain_lock(&self) -> Option<MutexGuard<'_, ()>> {
        if !self.constructor.main().is_current() {
            return Some(
                self.drain_lock
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            );
        }
        // The holder may be waiting on us for a placeholder.
        loop {
            match self.drain_lock.try_lock() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {}
            }
            if self.stop.load(Ordering::Acquire) {
                return None;
            }
            if let Ok(task) = self.construct_rx.recv_timeout(MAIN_WAIT_SLICE) {
                self.fulfil(task);
            }
        }
    }

    fn process(&self, queued: Queued) {
        let _outstanding = OutstandingGuard(&self.outstanding);
        let Queued {
            generation,
            request,
        } = queued;
        tracing::debug!(request = %request.id, source = %request.source, "processing decode request");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_pipeline(&request)))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                tracing::error!(request = %request.id, source = %request.source, %message, "image pipeline panicked");
                Some(Err(LoadError::Panicked(message)))
            });
        match outcome {
            Some(outcome) => {
                if let Err(error) = &outcome {
                    tracing::warn!(request = %request.id, source = %request.source, %error, "image load failed");
                }
                self.publish(
                    generation,
                    LoadResult {
                        request: request.id,
                        source: request.source,
                        outcome,
                    },
                );
            }
            None => {
                tracing::error!(request = %request.id, source = %request.source, "load aborted while waiting for the main context");
            }
        }
    }

    /// `None` means the pipeline shut down before a placeholder was available.
    fn run_pipeline(&self, request: &DecodeRequest) -> Option<Result<TextureHandle, LoadError>> {
        let decoded = match request.kind {
            TextureKind::Texture2d => self.decoder.decode(&request.source),
            TextureKind::Cubemap => self.decoder.decode_cubemap(&request.source),
        };
        let image = match decoded.and_then(|image| apply_transform(image, &request.transform)) {
            Ok(image) => image,
            Err(error) => return Some(Err(error.into())),
        };

        let usage = request.usage();
        let Some(layout) = self.mapper.map_format(image.format, usage) else {
            tracing::debug!(format = ?image.format, ?usage, "no pixel layout for decoded format");
            return Some(Err(LoadError::UnsupportedFormat));
        };
        let pixels = match prepare_pixels(image, layout, usage) {
            Ok(pixels) => pixels,
            Err(error) => return Some(Err(error)),
        };

        let placeholder = match self.obtain_placeholder(request, &pixels)? {
            Ok(placeholder) => placeholder,
            Err(error) => return Some(Err(error)),
        };
        placeholder.set_dimensions(pixels.width, pixels.height);

        if let Err(error) = self.uploader.upload(&placeholder, pixels) {
            self.constructor.registry().release(placeholder.id());
            return Some(Err(error));
        }
        Some(Ok(placeholder))
    }

    fn obtain_placeholder(
        &self,
        request: &DecodeRequest,
        pixels: &PreparedPixels,
    ) -> Option<Result<TextureHandle, LoadError>> {
        let spec = PlaceholderSpec {
            name: request.source.clone(),
            layout: pixels.layout,
            kind: request.kind,
            color_space: pixels.color_space,
        };
        if self.constructor.main().is_current() {
            return Some(self.constructor.construct(spec));
        }

        let (reply_tx, reply_rx) = bounded(1);
        let task = ConstructionTask {
            request: request.id,
            spec,
            reply: reply_tx,
        };
        self.construct_tx.send(task).ok()?;
        loop {
            match reply_rx.recv_timeout(self.settings.poll_interval) {
                Ok(result) => return Some(result),
                Err(RecvTimeoutError::Timeout) => {
                    if self.stop.load(Ordering::Acquire) {
                        return None;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn fulfil(&self, task: ConstructionTask) {
        let ConstructionTask {
            request,
            spec,
            reply,
        } = task;
        tracing::debug!(%request, name = %spec.name, "servicing construction task");
        let result = self.constructor.construct(spec);
        if let Err(unsent) = reply.send(result) {
            // The worker gave up waiting; nothing else will ever own this placeholder.
            if let Ok(handle) = unsent.into_inner() {
                self.constructor.registry().release(handle.id());
            }
        }
    }

    fn publish(&self, generation: u64, result: LoadResult) {
        let mut results = self.results();
        if self.generation.load(Ordering::Acquire) != generation {
            drop(results);
            tracing::debug!(request = %result.request, source = %result.source, "discarding result of cancelled request");
            if let Ok(handle) = result.outcome {
                self.release_texture(handle.id());
            }
            return;
        }
        tracing::debug!(request = %result.request, source = %result.source, ok = result.is_ok(), "published load result");
        results.push(result);
    }

    fn release_texture(&self, id: TextureId) -> bool {
        let Some(handle) = self.constructor.registry().release(id) else {
            return false;
        };
        if let Err(error) = self.uploader.destroy(&handle) {
            tracing::warn!(texture = %id, %error, "failed to destroy device texture");
        }
        true
    }
}
