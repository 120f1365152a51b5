//! Configuration synchronization: CDN fetching, polling, and the realtime
//! update stream.

use serde::Deserialize;

pub(crate) mod client;
mod manager;
mod realtime;

pub use client::{ConfigApiClient, ConfigSource, FetchOutcome};
pub use manager::EnvironmentConfigManager;

/// Cache validators of the currently applied configuration, exposed for
/// diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigMetadata {
    /// `ETag` of the applied configuration.
    pub etag: Option<String>,
    /// `Last-Modified` of the applied configuration.
    pub last_modified: Option<String>,
}

/// Realtime-stream coordinates carried inside the configuration body. The
/// rest of the body stays opaque to the host.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct SseSection {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

impl SseSection {
    /// The stream URL, when both coordinates are present.
    pub(crate) fn url(&self) -> Option<String> {
        match (&self.hostname, &self.path) {
            (Some(hostname), Some(path)) => Some(format!("{hostname}{path}")),
            _ => None,
        }
    }
}
