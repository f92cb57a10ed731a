use std::fs;

use anyhow::{Context, Result};
use loaderconfig::NetworkSettings;
use reqwest::blocking::Client;

use crate::error::DecodeError;

const DEFAULT_USER_AGENT: &str = concat!("imgload/", env!("CARGO_PKG_VERSION"));

pub fn is_remote(source: &str) -> bool {
    let lower = source.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Reads source bytes from disk, or over HTTP when the source is a URL.
#[derive(Debug, Clone, Default)]
pub struct SourceFetcher {
    http: Option<Client>,
}

impl SourceFetcher {
    /// Fetcher that refuses remote sources.
    pub fn local_only() -> Self {
        Self { http: None }
    }

    pub fn new(settings: &NetworkSettings) -> Result<Self> {
        if !settings.enabled {
            tracing::debug!("network sources disabled");
            return Ok(Self::local_only());
        }
        let agent = settings
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let http = Client::builder()
            .timeout(settings.timeout)
            .user_agent(agent)
            .build()
            .context("failed to construct HTTP client")?;
        Ok(Self { http: Some(http) })
    }

    pub fn allows_remote(&self) -> bool {
        self.http.is_some()
    }

    pub fn fetch(&self, source: &str) -> Result<Vec<u8>, DecodeError> {
        if is_remote(source) {
            return self.fetch_remote(source);
        }
        fs::read(source).map_err(|err| DecodeError::new(format!("failed to read {source}: {err}")))
    }

    fn fetch_remote(&self, url: &str) -> Result<Vec<u8>, DecodeError> {
        let http = self.http.as_ref().ok_or_else(|| {
            DecodeError::new(format!("network sources are disabled; cannot fetch {url}"))
        })?;
        tracing::debug!(%url, "downloading image");
        let response = http
            .get(url)
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(|err| DecodeError::new(format!("failed to download {url}: {err}")))?;
        let bytes = response
            .bytes()
            .map_err(|err| DecodeError::new(format!("failed to read response from {url}: {err}")))?;
        Ok(bytes.to_vec())
    }
}
