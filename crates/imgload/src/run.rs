use std::path::Path;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use loaderconfig::{Capabilities, LoaderConfig};
use scheduler::LoadScheduler;
use serde::Serialize;
use texloader::{
    HeadlessDevice, LoadResult, RenderContext, SourceFetcher, StandardDecoder, TextureKind,
    TransformParams, WgpuDevice,
};
use tracing_subscriber::EnvFilter;

use crate::cli::{Args, Backend};

#[derive(Debug, Serialize)]
struct LoadSummary {
    source: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    layout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    color_space: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    elapsed_ms: u128,
}

impl LoadSummary {
    fn from_result(result: &LoadResult, elapsed: Duration) -> Self {
        let texture = result.texture();
        Self {
            source: result.source.clone(),
            ok: result.is_ok(),
            width: texture.map(|texture| texture.width()),
            height: texture.map(|texture| texture.height()),
            layout: texture.map(|texture| format!("{:?}", texture.layout())),
            color_space: texture.map(|texture| texture.color_space().to_string()),
            error: result.error().map(ToString::to_string),
            elapsed_ms: elapsed.as_millis(),
        }
    }

    fn rejected(source: &str, error: impl ToString) -> Self {
        Self {
            source: source.to_string(),
            ok: false,
            width: None,
            height: None,
            layout: None,
            color_space: None,
            error: Some(error.to_string()),
            elapsed_ms: 0,
        }
    }
}

#[derive(Debug, Serialize)]
struct RunSummary {
    backend: String,
    mode: &'static str,
    capabilities: Capabilities,
    frames: u64,
    failed: usize,
    loads: Vec<LoadSummary>,
}

pub fn run(args: Args) -> Result<ExitCode> {
    initialise_tracing(args.json);

    let config = load_config(args.config.as_deref())?;
    let render = spawn_render_context(args.backend)?;
    let fetcher = if config.network.enabled {
        SourceFetcher::new(&config.network).context("failed to build HTTP client")?
    } else {
        tracing::info!("remote sources disabled by configuration");
        SourceFetcher::local_only()
    };
    let decoder = Arc::new(StandardDecoder::new(fetcher));
    let mut scheduler = LoadScheduler::from_config(&config, render, decoder)
        .context("failed to start texture loader")?;

    let transform = args.transform();
    tracing::info!(
        sources = args.sources.len(),
        backend = %args.backend,
        usage = ?transform.usage,
        cubemap = args.cubemap,
        sync = args.sync,
        "loading images"
    );

    let loads = if args.sync {
        load_synchronously(&mut scheduler, &args, transform)
    } else {
        load_in_frames(&mut scheduler, &args, transform)
    };

    let failed = loads.iter().filter(|load| !load.ok).count();
    let summary = RunSummary {
        backend: args.backend.to_string(),
        mode: if args.sync { "sync" } else { "frames" },
        capabilities: scheduler.capabilities(),
        frames: scheduler.frame(),
        failed,
        loads,
    };
    report(&summary, args.json)?;

    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn initialise_tracing(json: bool) {
    let default = if json { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<LoaderConfig> {
    match path {
        Some(path) => LoaderConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(LoaderConfig::default()),
    }
}

fn spawn_render_context(backend: Backend) -> Result<RenderContext> {
    match backend {
        Backend::Headless => RenderContext::spawn(HeadlessDevice::new()),
        Backend::Wgpu => {
            let device = WgpuDevice::new(wgpu::PowerPreference::HighPerformance)
                .context("failed to initialise wgpu device")?;
            tracing::info!(adapter = device.adapter_name(), "using wgpu backend");
            RenderContext::spawn(device)
        }
    }
    .context("failed to start render context")
}

fn load_synchronously(
    scheduler: &mut LoadScheduler,
    args: &Args,
    transform: TransformParams,
) -> Vec<LoadSummary> {
    args.sources
        .iter()
        .map(|source| {
            let started = Instant::now();
            let result = if args.cubemap {
                scheduler.load_cubemap_sync(source.as_str(), transform)
            } else {
                scheduler.load_sync(source.as_str(), transform)
            };
            log_result(&result);
            LoadSummary::from_result(&result, started.elapsed())
        })
        .collect()
}

fn load_in_frames(
    scheduler: &mut LoadScheduler,
    args: &Args,
    transform: TransformParams,
) -> Vec<LoadSummary> {
    let completed: Arc<Mutex<Vec<(usize, LoadSummary)>>> = Arc::default();
    let kind = if args.cubemap {
        TextureKind::Cubemap
    } else {
        TextureKind::Texture2d
    };

    for (index, source) in args.sources.iter().enumerate() {
        let sink = Arc::clone(&completed);
        let queued = Instant::now();
        let on_complete = move |result: LoadResult| {
            log_result(&result);
            let summary = LoadSummary::from_result(&result, queued.elapsed());
            sink.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push((index, summary));
        };
        let accepted = match kind {
            TextureKind::Texture2d => scheduler.load_async(source.as_str(), transform, on_complete),
            TextureKind::Cubemap => {
                scheduler.load_cubemap_async(source.as_str(), transform, on_complete)
            }
        };
        if let Err(error) = accepted {
            tracing::warn!(%source, %error, "load rejected");
            completed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push((index, LoadSummary::rejected(source, error)));
        }
    }

    let frame_budget = Duration::from_secs(1) / args.fps;
    while !scheduler.is_idle() {
        let frame_start = Instant::now();
        let report = scheduler.tick();
        if report.completed.is_some() || report.dispatched.is_some() {
            tracing::debug!(
                frame = report.frame,
                constructed = report.constructed,
                completed = ?report.completed,
                dispatched = ?report.dispatched,
                "frame"
            );
        }
        if let Some(remaining) = frame_budget.checked_sub(frame_start.elapsed()) {
            thread::sleep(remaining);
        }
    }

    let mut loads = std::mem::take(
        &mut *completed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()),
    );
    loads.sort_by_key(|(index, _)| *index);
    loads.into_iter().map(|(_, summary)| summary).collect()
}

fn log_result(result: &LoadResult) {
    match &result.outcome {
        Ok(texture) => tracing::info!(
            source = %result.source,
            texture = %texture.id(),
            width = texture.width(),
            height = texture.height(),
            layout = ?texture.layout(),
            color_space = %texture.color_space(),
            "loaded texture"
        ),
        Err(error) => tracing::warn!(source = %result.source, %error, "failed to load image"),
    }
}

fn report(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        let rendered =
            serde_json::to_string_pretty(summary).context("failed to serialise summary")?;
        println!("{rendered}");
        return Ok(());
    }

    tracing::info!(
        loaded = summary.loads.len() - summary.failed,
        failed = summary.failed,
        frames = summary.frames,
        "done"
    );
    Ok(())
}
