use std::fmt;
use std::path::PathBuf;

use clap::Parser;
use texloader::{CropRect, TransformParams, MAX_DIMENSION};

#[derive(Parser, Debug)]
#[command(
    name = "imgload",
    author,
    version,
    about = "Load images into GPU textures through the background texture loader"
)]
pub struct Args {
    /// Image files or http(s) URLs; cubemap directories with `--cubemap`.
    #[arg(value_name = "SOURCES", required = true)]
    pub sources: Vec<String>,

    /// Loader configuration TOML file.
    #[arg(long, value_name = "PATH", env = "IMGLOAD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Load as interface imagery (8-bit BGRA, sRGB) instead of scene imagery.
    #[arg(long)]
    pub ui: bool,

    /// Crop rectangle applied after decoding (e.g. `10,20,64x64`).
    #[arg(long, value_name = "X,Y,WxH", value_parser = parse_crop)]
    pub crop: Option<CropRect>,

    /// Resize to the given dimensions after cropping (e.g. `256x256`).
    #[arg(long, value_name = "WxH", value_parser = parse_size)]
    pub resize: Option<(u32, u32)>,

    /// Flip rows vertically after cropping and resizing.
    #[arg(long)]
    pub flip: bool,

    /// Treat every source as a cubemap directory (posx/negx/posy/negy/posz/negz).
    #[arg(long)]
    pub cubemap: bool,

    /// Load each source synchronously instead of through the frame loop.
    #[arg(long)]
    pub sync: bool,

    /// Render backend: `headless` (in-memory) or `wgpu`.
    #[arg(
        long,
        value_name = "BACKEND",
        value_parser = parse_backend,
        default_value_t = Backend::Headless
    )]
    pub backend: Backend,

    /// Frame rate of the simulated main loop.
    #[arg(long, value_name = "FPS", value_parser = parse_fps, default_value_t = 60)]
    pub fps: u32,

    /// Print a JSON summary on stdout.
    #[arg(long)]
    pub json: bool,
}

impl Args {
    pub fn transform(&self) -> TransformParams {
        let mut transform = if self.ui {
            TransformParams::ui()
        } else {
            TransformParams::scene()
        };
        transform.crop = self.crop;
        transform.resize = self.resize;
        transform.flip_vertical = self.flip;
        transform
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Headless,
    Wgpu,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Headless => f.write_str("headless"),
            Self::Wgpu => f.write_str("wgpu"),
        }
    }
}

pub fn parse() -> Args {
    Args::parse()
}

pub fn parse_backend(value: &str) -> Result<Backend, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("backend must not be empty".to_string());
    }

    match trimmed.to_ascii_lowercase().as_str() {
        "headless" | "memory" => Ok(Backend::Headless),
        "wgpu" | "gpu" => Ok(Backend::Wgpu),
        other => Err(format!(
            "unknown backend '{other}'; expected headless or wgpu"
        )),
    }
}

pub fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(|| "expected WxH format, e.g. 256x256".to_string())?;

    let width: u32 = width
        .trim()
        .parse()
        .map_err(|_| format!("invalid width '{}'", width.trim()))?;
    let height: u32 = height
        .trim()
        .parse()
        .map_err(|_| format!("invalid height '{}'", height.trim()))?;

    if width == 0 || height == 0 {
        return Err("dimensions must be greater than zero".to_string());
    }
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(format!("dimensions must not exceed {MAX_DIMENSION}"));
    }

    Ok((width, height))
}

pub fn parse_crop(value: &str) -> Result<CropRect, String> {
    let mut parts = value.trim().splitn(3, ',');
    let (Some(x), Some(y), Some(size)) = (parts.next(), parts.next(), parts.next()) else {
        return Err("expected X,Y,WxH format, e.g. 0,0,128x128".to_string());
    };

    let x: u32 = x
        .trim()
        .parse()
        .map_err(|_| format!("invalid crop x '{}'", x.trim()))?;
    let y: u32 = y
        .trim()
        .parse()
        .map_err(|_| format!("invalid crop y '{}'", y.trim()))?;
    let (width, height) = parse_size(size)?;

    Ok(CropRect::new(x, y, width, height))
}

pub fn parse_fps(value: &str) -> Result<u32, String> {
    let fps: u32 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid frame rate '{}'", value.trim()))?;
    if fps == 0 || fps > 1000 {
        return Err("frame rate must be between 1 and 1000".to_string());
    }
    Ok(fps)
}
