//! Frame-driven front controller for the texture loader.
//!
//! [`LoadScheduler::tick`] runs once per frame on the main context. It keeps at most
//! one request in flight on the [`ImageWorker`]: when the worker goes idle the active
//! request's callback fires, and the next pending request is dispatched.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use loaderconfig::{Capabilities, LoaderConfig};
use texloader::{
    DecodeRequest, ImageDecoder, ImageWorker, LoadError, LoadResult, MainContext, RenderContext,
    RequestId, ResourceRegistry, TextureHandle, TextureKind, TransformParams, WorkerOptions,
};

pub type Completion = Box<dyn FnOnce(LoadResult) + Send>;

const CUBEMAPS_UNSUPPORTED: &str = "loading cubemaps is not supported on this platform";

/// A caller's request, owned by the scheduler until it is dispatched.
pub struct LoadRequest {
    pub source: String,
    pub transform: TransformParams,
    pub kind: TextureKind,
    on_complete: Option<Completion>,
}

impl LoadRequest {
    pub fn new(source: impl Into<String>, transform: TransformParams) -> Self {
        Self {
            source: source.into(),
            transform,
            kind: TextureKind::Texture2d,
            on_complete: None,
        }
    }

    pub fn cubemap(directory: impl Into<String>, transform: TransformParams) -> Self {
        Self {
            kind: TextureKind::Cubemap,
            ..Self::new(directory, transform)
        }
    }

    pub fn on_complete(mut self, callback: impl FnOnce(LoadResult) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for LoadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadRequest")
            .field("source", &self.source)
            .field("transform", &self.transform)
            .field("kind", &self.kind)
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// What one frame did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub frame: u64,
    /// Placeholders constructed on behalf of the worker.
    pub constructed: usize,
    pub completed: Option<RequestId>,
    pub dispatched: Option<RequestId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled { pending: usize, active: bool },
    /// The platform cannot cancel in-flight loads; nothing was touched.
    Unsupported,
    /// Called off the main context; nothing was touched.
    Refused,
}

fn check_kind(capabilities: Capabilities, kind: TextureKind, source: &str) -> Result<(), LoadError> {
    if kind == TextureKind::Cubemap && !capabilities.cubemaps {
        tracing::warn!(%source, "{CUBEMAPS_UNSUPPORTED}");
        return Err(LoadError::PlatformUnsupported(CUBEMAPS_UNSUPPORTED.into()));
    }
    Ok(())
}

/// Cloneable handle for queueing loads from any thread.
#[derive(Clone)]
pub struct RequestQueue {
    tx: Sender<LoadRequest>,
    capabilities: Capabilities,
}

impl RequestQueue {
    pub fn enqueue(&self, request: LoadRequest) -> Result<(), LoadError> {
        check_kind(self.capabilities, request.kind, &request.source)?;
        tracing::debug!(source = %request.source, kind = ?request.kind, "queued load request");
        self.tx.send(request).map_err(|_| LoadError::Interrupted)
    }

    pub fn load_async(
        &self,
        source: impl Into<String>,
        transform: TransformParams,
        on_complete: impl FnOnce(LoadResult) + Send + 'static,
    ) -> Result<(), LoadError> {
        self.enqueue(LoadRequest::new(source, transform).on_complete(on_complete))
    }

    pub fn load_cubemap_async(
        &self,
        directory: impl Into<String>,
        transform: TransformParams,
        on_complete: impl FnOnce(LoadResult) + Send + 'static,
    ) -> Result<(), LoadError> {
        self.enqueue(LoadRequest::cubemap(directory, transform).on_complete(on_complete))
    }
}

struct ActiveRequest {
    id: RequestId,
    source: String,
    on_complete: Option<Completion>,
    dispatched_frame: u64,
}

pub struct LoadScheduler {
    worker: ImageWorker,
    capabilities: Capabilities,
    queue: RequestQueue,
    pending: Receiver<LoadRequest>,
    active: Option<ActiveRequest>,
    frame: u64,
}

impl LoadScheduler {
    pub fn new(worker: ImageWorker, capabilities: Capabilities) -> Self {
        let (tx, pending) = unbounded();
        Self {
            worker,
            capabilities,
            queue: RequestQueue { tx, capabilities },
            pending,
            active: None,
            frame: 0,
        }
    }

    /// Spawns a worker configured from `config`. The calling thread becomes the main
    /// context.
    pub fn from_config(
        config: &LoaderConfig,
        render: RenderContext,
        decoder: Arc<dyn ImageDecoder>,
    ) -> Result<Self> {
        let options = WorkerOptions::new(decoder).with_settings(config.worker.clone());
        let worker = ImageWorker::spawn(MainContext::current(), render, options)?;
        let capabilities = config.capabilities();
        tracing::info!(
            cancel_in_flight = capabilities.cancel_in_flight,
            cubemaps = capabilities.cubemaps,
            "texture loader ready"
        );
        Ok(Self::new(worker, capabilities))
    }

    pub fn queue(&self) -> RequestQueue {
        self.queue.clone()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn registry(&self) -> &ResourceRegistry {
        self.worker.registry()
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn active_request(&self) -> Option<RequestId> {
        self.active.as_ref().map(|active| active.id)
    }

    /// Nothing pending, nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.pending.is_empty() && self.worker.is_idle()
    }

    pub fn enqueue_async(&self, request: LoadRequest) -> Result<(), LoadError> {
        self.queue.enqueue(request)
    }

    pub fn load_async(
        &self,
        source: impl Into<String>,
        transform: TransformParams,
        on_complete: impl FnOnce(LoadResult) + Send + 'static,
    ) -> Result<(), LoadError> {
        self.queue.load_async(source, transform, on_complete)
    }

    /// Fails immediately with [`LoadError::PlatformUnsupported`] when cubemaps are
    /// disabled.
    pub fn load_cubemap_async(
        &self,
        directory: impl Into<String>,
        transform: TransformParams,
        on_complete: impl FnOnce(LoadResult) + Send + 'static,
    ) -> Result<(), LoadError> {
        self.queue.load_cubemap_async(directory, transform, on_complete)
    }

    pub fn tick(&mut self) -> TickReport {
        self.frame += 1;
        let mut report = TickReport {
            frame: self.frame,
            ..TickReport::default()
        };
        if !self.on_main("tick") {
            return report;
        }

        report.constructed = self.worker.service_construction();
        if self.active.is_some() && self.worker.is_idle() {
            report.completed = self.complete_active();
        }
        if self.active.is_none() {
            report.dispatched = self.dispatch_next();
        }
        report
    }

    /// Loads one image on the calling thread, bypassing the pending queue.
    ///
    /// Outstanding worker output is flushed first. Results of the asynchronous path
    /// stay buffered for their own requests.
    pub fn load_sync(&mut self, source: impl Into<String>, transform: TransformParams) -> LoadResult {
        self.run_sync(DecodeRequest::new(source, transform))
    }

    pub fn load_cubemap_sync(
        &mut self,
        directory: impl Into<String>,
        transform: TransformParams,
    ) -> LoadResult {
        self.run_sync(DecodeRequest::cubemap(directory, transform))
    }

    /// Drops pending requests and the active request without running their callbacks.
    pub fn cancel_all(&mut self) -> CancelOutcome {
        if !self.capabilities.cancel_in_flight {
            tracing::warn!(
                pending = self.pending.len(),
                active = self.active.is_some(),
                "cancelling loads is not supported on this platform; ignoring"
            );
            return CancelOutcome::Unsupported;
        }
        if !self.on_main("cancel_all") {
            return CancelOutcome::Refused;
        }

        let pending = self.pending.try_iter().count();
        let active = self.active.take();
        if let Some(active) = &active {
            tracing::debug!(request = %active.id, source = %active.source, "detached active request");
        }
        self.worker.clear_all();
        tracing::info!(pending, active = active.is_some(), "cancelled outstanding loads");
        CancelOutcome::Cancelled {
            pending,
            active: active.is_some(),
        }
    }

    /// Lets go of a loaded texture: drops the keep-alive reference and destroys the
    /// device texture.
    pub fn release(&self, texture: &TextureHandle) -> bool {
        self.worker.release(texture.id())
    }

    fn on_main(&self, operation: &str) -> bool {
        let on_main = self.worker.main_context().is_current();
        debug_assert!(on_main, "LoadScheduler::{operation} called off the main context");
        if !on_main {
            tracing::error!(operation, "scheduler used off the main context");
        }
        on_main
    }

    fn complete_active(&mut self) -> Option<RequestId> {
        let active = self.active.take()?;
        let result = self.worker.take_result(active.id).unwrap_or_else(|| {
            debug_assert!(false, "request {} finished without a result", active.id);
            tracing::error!(request = %active.id, source = %active.source, "worker went idle without a result");
            LoadResult::failed(active.id, active.source.clone(), LoadError::Interrupted)
        });
        tracing::debug!(
            request = %active.id,
            source = %active.source,
            ok = result.is_ok(),
            frames = self.frame - active.dispatched_frame,
            "load completed"
        );
        if let Some(callback) = active.on_complete {
            callback(result);
        }
        Some(active.id)
    }

    fn dispatch_next(&mut self) -> Option<RequestId> {
        let LoadRequest {
            source,
            transform,
            kind,
            on_complete,
        } = self.pending.try_recv().ok()?;
        let request = match kind {
            TextureKind::Texture2d => DecodeRequest::new(source.clone(), transform),
            TextureKind::Cubemap => DecodeRequest::cubemap(source.clone(), transform),
        };
        let id = request.id;
        self.worker.enqueue(request);
        tracing::debug!(request = %id, %source, "dispatched load request");
        self.active = Some(ActiveRequest {
            id,
            source,
            on_complete,
            dispatched_frame: self.frame,
        });
        Some(id)
    }

    fn run_sync(&mut self, request: DecodeRequest) -> LoadResult {
        if !self.on_main("load_sync") {
            return LoadResult::failed(
                request.id,
                request.source,
                LoadError::Precondition("load_sync must run on the main context".into()),
            );
        }
        if let Err(error) = check_kind(self.capabilities, request.kind, &request.source) {
            return LoadResult::failed(request.id, request.source, error);
        }

        self.worker.drain_until_idle();
        let (id, source) = (request.id, request.source.clone());
        self.worker.enqueue(request);
        self.worker.drain_until_idle();
        self.worker.take_result(id).unwrap_or_else(|| {
            tracing::error!(request = %id, %source, "synchronous load produced no result");
            LoadResult::failed(id, source, LoadError::Interrupted)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    use loaderconfig::WorkerSettings;
    use texloader::{
        ColorSpace, HeadlessDevice, MemoryDecoder, PixelLayout, RawFormat, RawImage,
        ViewDimension, CUBEMAP_FACE_STEMS,
    };

    type Sink = Arc<Mutex<Vec<LoadResult>>>;

    fn rgba(width: u32, height: u32) -> RawImage {
        RawImage::new(
            width,
            height,
            RawFormat::Bgra8,
            vec![200; (width * height * 4) as usize],
        )
        .unwrap()
    }

    fn scheduler(decoder: Arc<MemoryDecoder>, capabilities: Capabilities) -> LoadScheduler {
        let settings = WorkerSettings {
            thread_name: "image-reader-test".into(),
            poll_interval: Duration::from_millis(5),
            drain_interval: Duration::from_millis(5),
        };
        let worker = ImageWorker::spawn(
            MainContext::current(),
            RenderContext::spawn(HeadlessDevice::new()).unwrap(),
            WorkerOptions::new(decoder).with_settings(settings),
        )
        .unwrap();
        LoadScheduler::new(worker, capabilities)
    }

    fn sink() -> Sink {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn collect(sink: &Sink) -> impl FnOnce(LoadResult) + Send + 'static {
        let sink = Arc::clone(sink);
        move |result| sink.lock().unwrap().push(result)
    }

    fn tick_until(scheduler: &mut LoadScheduler, done: impl Fn(&LoadScheduler) -> bool) -> Vec<TickReport> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut reports = Vec::new();
        while !done(scheduler) {
            assert!(Instant::now() < deadline, "scheduler did not settle");
            reports.push(scheduler.tick());
            thread::sleep(Duration::from_millis(1));
        }
        reports
    }

    #[test]
    fn scene_load_delivers_texture_with_dimensions() {
        let decoder = Arc::new(MemoryDecoder::new());
        decoder.insert("photo.png", rgba(256, 128));
        let mut scheduler = scheduler(decoder, Capabilities::full());
        let results = sink();

        scheduler
            .load_async("photo.png", TransformParams::scene(), collect(&results))
            .unwrap();
        tick_until(&mut scheduler, LoadScheduler::is_idle);

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, "photo.png");
        assert!(results[0].error().is_none());
        let texture = results[0].texture().unwrap();
        assert_eq!((texture.width(), texture.height()), (256, 128));
        assert_eq!(texture.color_space(), ColorSpace::Linear);
    }

    #[test]
    fn decode_failure_reaches_callback_as_error() {
        let decoder = Arc::new(MemoryDecoder::new());
        decoder.insert_error("broken.png", "invalid header");
        let mut scheduler = scheduler(decoder, Capabilities::full());
        let results = sink();

        scheduler
            .load_async("broken.png", TransformParams::default(), collect(&results))
            .unwrap();
        tick_until(&mut scheduler, LoadScheduler::is_idle);

        let results = results.lock().unwrap();
        assert_eq!(results[0].error().unwrap().to_string(), "invalid header");
        assert!(results[0].texture().is_none());
    }

    #[test]
    fn ui_load_is_bgra8_and_non_linear() {
        let decoder = Arc::new(MemoryDecoder::new());
        decoder.insert(
            "photo.png",
            RawImage::new(1, 1, RawFormat::Rgba16, vec![0, 1, 0, 2, 0, 3, 0xff, 0xff]).unwrap(),
        );
        let mut scheduler = scheduler(decoder, Capabilities::full());
        let results = sink();

        scheduler
            .load_async("photo.png", TransformParams::ui(), collect(&results))
            .unwrap();
        tick_until(&mut scheduler, LoadScheduler::is_idle);

        let results = results.lock().unwrap();
        let texture = results[0].texture().unwrap();
        assert_eq!(texture.layout(), PixelLayout::Bgra8);
        assert_eq!(texture.color_space(), ColorSpace::Srgb);
    }

    #[test]
    fn every_request_completes_exactly_once_one_at_a_time() {
        let decoder = Arc::new(MemoryDecoder::new());
        let names: Vec<String> = (0..5).map(|index| format!("img{index}.png")).collect();
        for name in &names {
            decoder.insert(name.clone(), rgba(4, 4));
        }
        decoder.insert_error("img2.png", "invalid header");
        let mut scheduler = scheduler(decoder, Capabilities::full());
        let results = sink();
        for name in &names {
            scheduler
                .load_async(name.clone(), TransformParams::default(), collect(&results))
                .unwrap();
        }

        let reports = tick_until(&mut scheduler, LoadScheduler::is_idle);
        let mut in_flight = 0i32;
        for report in &reports {
            if report.completed.is_some() {
                in_flight -= 1;
            }
            assert!(in_flight >= 0);
            if report.dispatched.is_some() {
                in_flight += 1;
            }
            assert!(in_flight <= 1, "two requests in flight at frame {}", report.frame);
        }

        let results = results.lock().unwrap();
        let sources: Vec<&str> = results.iter().map(|result| result.source.as_str()).collect();
        assert_eq!(sources, names.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 4);
    }

    #[test]
    fn cancel_all_drops_pending_and_active_callbacks() {
        let decoder = Arc::new(MemoryDecoder::new());
        for name in ["a", "b", "c"] {
            decoder.insert(name, rgba(2, 2));
        }
        let mut scheduler = scheduler(decoder, Capabilities::full());
        let results = sink();
        for name in ["a", "b", "c"] {
            scheduler
                .load_async(name, TransformParams::default(), collect(&results))
                .unwrap();
        }

        let first = scheduler.tick();
        assert!(first.dispatched.is_some());
        assert_eq!(
            scheduler.cancel_all(),
            CancelOutcome::Cancelled {
                pending: 2,
                active: true
            }
        );
        assert_eq!(scheduler.pending_len(), 0);
        assert_eq!(scheduler.active_request(), None);

        tick_until(&mut scheduler, LoadScheduler::is_idle);
        for _ in 0..10 {
            scheduler.tick();
        }
        assert!(results.lock().unwrap().is_empty());
        assert!(scheduler.registry().is_empty());

        scheduler
            .load_async("a", TransformParams::default(), collect(&results))
            .unwrap();
        tick_until(&mut scheduler, LoadScheduler::is_idle);
        assert_eq!(results.lock().unwrap().len(), 1);
    }

    #[test]
    fn cancel_is_a_no_op_without_the_capability() {
        let decoder = Arc::new(MemoryDecoder::new());
        decoder.insert("a", rgba(2, 2));
        decoder.insert("b", rgba(2, 2));
        let capabilities = Capabilities {
            cancel_in_flight: false,
            cubemaps: true,
        };
        let mut scheduler = scheduler(decoder, capabilities);
        let results = sink();
        scheduler
            .load_async("a", TransformParams::default(), collect(&results))
            .unwrap();
        scheduler
            .load_async("b", TransformParams::default(), collect(&results))
            .unwrap();
        let dispatched = scheduler.tick().dispatched;

        assert_eq!(scheduler.cancel_all(), CancelOutcome::Unsupported);
        assert_eq!(scheduler.pending_len(), 1);
        assert_eq!(scheduler.active_request(), dispatched);

        tick_until(&mut scheduler, LoadScheduler::is_idle);
        assert_eq!(results.lock().unwrap().len(), 2);
    }

    #[test]
    fn cubemaps_are_rejected_when_disabled() {
        let decoder = Arc::new(MemoryDecoder::new());
        let capabilities = Capabilities {
            cancel_in_flight: true,
            cubemaps: false,
        };
        let mut scheduler = scheduler(Arc::clone(&decoder), capabilities);
        let results = sink();

        let err = scheduler
            .load_cubemap_async("sky", TransformParams::default(), collect(&results))
            .unwrap_err();
        assert_eq!(
            err,
            LoadError::PlatformUnsupported(
                "loading cubemaps is not supported on this platform".into()
            )
        );
        assert_eq!(scheduler.pending_len(), 0);

        let sync = scheduler.load_cubemap_sync("sky", TransformParams::default());
        assert!(matches!(sync.error(), Some(LoadError::PlatformUnsupported(_))));
        assert_eq!(decoder.calls(), 0);
    }

    #[test]
    fn cubemap_loads_as_six_layer_texture() {
        let decoder = Arc::new(MemoryDecoder::new());
        for stem in CUBEMAP_FACE_STEMS {
            decoder.insert(format!("sky/{stem}"), rgba(8, 8));
        }
        let mut scheduler = scheduler(decoder, Capabilities::full());
        let results = sink();
        scheduler
            .load_cubemap_async("sky", TransformParams::default(), collect(&results))
            .unwrap();
        tick_until(&mut scheduler, LoadScheduler::is_idle);

        let results = results.lock().unwrap();
        let texture = results[0].texture().unwrap();
        assert_eq!(texture.kind(), TextureKind::Cubemap);
        assert_eq!(texture.texture().unwrap().layers, 6);
        assert_eq!(texture.view().unwrap().dimension, ViewDimension::Cube);
    }

    #[test]
    fn load_sync_returns_its_own_result() {
        let decoder = Arc::new(MemoryDecoder::new());
        decoder.insert("sync.png", rgba(3, 3));
        let mut scheduler = scheduler(decoder, Capabilities::full());

        let result = scheduler.load_sync("sync.png", TransformParams::default());
        assert_eq!(result.source, "sync.png");
        assert_eq!(result.texture().unwrap().width(), 3);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn load_sync_does_not_steal_async_results() {
        let decoder = Arc::new(MemoryDecoder::new());
        decoder.insert("async.png", rgba(2, 2));
        decoder.insert("sync.png", rgba(5, 5));
        let mut scheduler = scheduler(decoder, Capabilities::full());
        let results = sink();

        scheduler
            .load_async("async.png", TransformParams::default(), collect(&results))
            .unwrap();
        assert!(scheduler.tick().dispatched.is_some());

        let sync = scheduler.load_sync("sync.png", TransformParams::default());
        assert_eq!(sync.source, "sync.png");
        assert_eq!(sync.texture().unwrap().width(), 5);

        tick_until(&mut scheduler, LoadScheduler::is_idle);
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, "async.png");
        assert_eq!(results[0].texture().unwrap().width(), 2);
    }

    #[test]
    fn release_drops_keep_alive_reference() {
        let decoder = Arc::new(MemoryDecoder::new());
        decoder.insert("a", rgba(2, 2));
        let mut scheduler = scheduler(decoder, Capabilities::full());
        let result = scheduler.load_sync("a", TransformParams::default());
        let texture = result.texture().unwrap();
        assert!(scheduler.registry().contains(texture.id()));
        assert!(scheduler.release(texture));
        assert!(!scheduler.registry().contains(texture.id()));
        assert!(!scheduler.release(texture));
    }

    #[test]
    fn request_queue_accepts_loads_from_other_threads() {
        let decoder = Arc::new(MemoryDecoder::new());
        decoder.insert("remote-thread.png", rgba(2, 2));
        let mut scheduler = scheduler(decoder, Capabilities::full());
        let results = sink();
        let queue = scheduler.queue();
        let callback = collect(&results);
        thread::spawn(move || {
            queue
                .load_async("remote-thread.png", TransformParams::default(), callback)
                .unwrap();
        })
        .join()
        .unwrap();

        tick_until(&mut scheduler, LoadScheduler::is_idle);
        assert_eq!(results.lock().unwrap().len(), 1);
    }

    #[test]
    fn requests_without_callbacks_still_complete() {
        let decoder = Arc::new(MemoryDecoder::new());
        decoder.insert("quiet.png", rgba(2, 2));
        let mut scheduler = scheduler(decoder, Capabilities::full());
        scheduler
            .enqueue_async(LoadRequest::new("quiet.png", TransformParams::default()))
            .unwrap();
        let reports = tick_until(&mut scheduler, LoadScheduler::is_idle);
        assert_eq!(reports.iter().filter(|report| report.completed.is_some()).count(), 1);
        assert_eq!(scheduler.registry().len(), 1);
    }

    #[test]
    fn queue_outliving_scheduler_reports_interrupted() {
        let decoder = Arc::new(MemoryDecoder::new());
        let queue = scheduler(decoder, Capabilities::full()).queue();
        let err = queue
            .enqueue(LoadRequest::new("late.png", TransformParams::default()))
            .unwrap_err();
        assert_eq!(err, LoadError::Interrupted);
    }
}
