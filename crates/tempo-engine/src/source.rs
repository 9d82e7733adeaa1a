//! Source resolution.
//!
//! A locator is either a filesystem path or a `file://` URL. Resolution checks that
//! the target is a readable regular file and that Symphonia can decode it.

use std::path::{Path, PathBuf};

use url::Url;

use crate::decode::{self, SourceInfo};
use crate::error::{EngineError, Result};

/// A validated, decodable audio source.
#[derive(Clone, Debug)]
pub struct SourceAsset {
    locator: String,
    path: PathBuf,
    info: SourceInfo,
}

impl SourceAsset {
    /// Resolve `locator`, returning [`EngineError::InvalidSource`] if it cannot be played.
    pub fn resolve(locator: &str) -> Result<Self> {
        let path = locator_to_path(locator)
            .map_err(|reason| EngineError::invalid_source(locator, reason))?;

        let meta = std::fs::metadata(&path)
            .map_err(|e| EngineError::invalid_source(locator, e))?;
        if !meta.is_file() {
            return Err(EngineError::invalid_source(locator, "not a regular file"));
        }

        let info = decode::probe_file(&path)
            .map_err(|e| EngineError::invalid_source(locator, format!("{e:#}")))?;
        if info.channels == 0 || info.sample_rate == 0 {
            return Err(EngineError::invalid_source(locator, "no audio in default track"));
        }

        tracing::debug!(
            path = %path.display(),
            codec = info.codec.as_deref().unwrap_or("unknown"),
            rate_hz = info.sample_rate,
            channels = info.channels,
            "source resolved"
        );
        Ok(Self {
            locator: locator.to_string(),
            path,
            info,
        })
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &SourceInfo {
        &self.info
    }
}

/// Map a locator to a local path. Only plain paths and `file://` URLs are accepted.
fn locator_to_path(locator: &str) -> std::result::Result<PathBuf, String> {
    let trimmed = locator.trim();
    if trimmed.is_empty() {
        return Err("empty locator".to_string());
    }
    if !trimmed.contains("://") {
        return Ok(PathBuf::from(trimmed));
    }
    let url = Url::parse(trimmed).map_err(|e| format!("malformed URL: {e}"))?;
    if url.scheme() != "file" {
        return Err(format!("unsupported scheme: {}", url.scheme()));
    }
    url.to_file_path()
        .map_err(|_| "file URL does not name a local path".to_string())
}
