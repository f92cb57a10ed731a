//! Configuration for the runtime image loader.
//!
//! A single TOML document drives the worker thread timings, the network fetcher and
//! the platform capability table. Capabilities are resolved once at startup so the
//! loader branches on flags instead of compile-time platform checks.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Deployment target used to pick the default capability table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformTarget {
    /// Detect the running target at startup.
    #[default]
    Auto,
    Desktop,
    Android,
    Web,
}

impl PlatformTarget {
    /// Returns the target this binary was built for.
    pub fn detect() -> Self {
        if cfg!(target_os = "android") {
            Self::Android
        } else if cfg!(target_arch = "wasm32") {
            Self::Web
        } else {
            Self::Desktop
        }
    }

    /// Replaces `Auto` with the detected target.
    pub fn resolve(self) -> Self {
        match self {
            Self::Auto => Self::detect(),
            other => other,
        }
    }
}

impl fmt::Display for PlatformTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Desktop => f.write_str("desktop"),
            Self::Android => f.write_str("android"),
            Self::Web => f.write_str("web"),
        }
    }
}

/// Feature switches that differ between deployment targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Cancelling queued and in-flight loads is safe on this target. Android hosts
    /// crash when outstanding network fetches are torn down.
    pub cancel_in_flight: bool,
    /// Cubemap (HDRI) loading is available.
    pub cubemaps: bool,
}

impl Capabilities {
    /// Everything enabled.
    pub const fn full() -> Self {
        Self {
            cancel_in_flight: true,
            cubemaps: true,
        }
    }

    /// Default capability table for a target.
    pub fn for_target(target: PlatformTarget) -> Self {
        match target.resolve() {
            PlatformTarget::Android => Self {
                cancel_in_flight: false,
                cubemaps: false,
            },
            _ => Self::full(),
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::for_target(PlatformTarget::Auto)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoaderConfig {
    pub version: u32,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub platform: PlatformSettings,
    #[serde(default)]
    pub network: NetworkSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerSettings {
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
    /// Upper bound on a single wait while the worker blocks on the main context.
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub poll_interval: Duration,
    /// How often an idle worker wakes up on its own to drain the queue.
    #[serde(
        default = "default_drain_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub drain_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            thread_name: default_thread_name(),
            poll_interval: default_poll_interval(),
            drain_interval: default_drain_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PlatformSettings {
    #[serde(default)]
    pub target: PlatformTarget,
    #[serde(default)]
    pub cancel_in_flight: Option<bool>,
    #[serde(default)]
    pub cubemaps: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(
        default = "default_network_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub timeout: Duration,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: default_network_timeout(),
            user_agent: None,
        }
    }
}

fn default_thread_name() -> String {
    "image-reader".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_drain_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_network_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_duration_opt(deserializer)?
        .ok_or_else(|| de::Error::custom("expected a duration"))
}

fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Option<Duration>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map(Some)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(Duration::from_secs(v)))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs(v as u64)))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs_f64(v)))
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }
    }

    deserializer.deserialize_any(Visitor)
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            version: 1,
            worker: WorkerSettings::default(),
            platform: PlatformSettings::default(),
            network: NetworkSettings::default(),
        }
    }
}

impl LoaderConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: LoaderConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&contents)?;
        tracing::debug!(path = %path.display(), "loaded loader configuration");
        Ok(config)
    }

    /// Resolves the capability table for the configured target, then applies the
    /// explicit overrides from `[platform]`.
    pub fn capabilities(&self) -> Capabilities {
        let mut capabilities = Capabilities::for_target(self.platform.target);
        if let Some(cancel) = self.platform.cancel_in_flight {
            capabilities.cancel_in_flight = cancel;
        }
        if let Some(cubemaps) = self.platform.cubemaps {
            capabilities.cubemaps = cubemaps;
        }
        capabilities
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        if self.worker.thread_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "worker.thread_name must not be empty".into(),
            ));
        }

        if self.worker.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "worker.poll_interval must be greater than zero".into(),
            ));
        }

        if self.worker.drain_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "worker.drain_interval must be greater than zero".into(),
            ));
        }

        if self.network.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "network.timeout must be greater than zero".into(),
            ));
        }

        if let Some(agent) = &self.network.user_agent {
            if agent.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "network.user_agent may not be blank".into(),
                ));
            }
        }

        Ok(())
    }
}
