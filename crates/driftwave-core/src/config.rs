//! Shell configuration.

use crate::retry::RetryConfig;
use crate::types::ResourceManifest;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Configuration for the app shell: cache identity, resource manifest,
/// and the timing bounds of the update negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Application origin. Requests from other origins are never
    /// intercepted, and messages from other origins are ignored.
    pub origin: Url,

    /// Prefix for versioned cache bucket names.
    pub cache_prefix: String,

    /// Resources cached at install time.
    pub manifest: ResourceManifest,

    /// How long a version query waits for a reply before the version is
    /// treated as unknown.
    pub version_query_timeout: Duration,

    /// How long an accepted handoff may run before it is treated as
    /// stalled and the prompt is re-armed.
    pub handoff_stall_timeout: Duration,

    /// Interval between periodic update checks.
    pub update_check_interval: Duration,

    /// Retry policy applied to worker installation.
    pub install_retry: RetryConfig,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("https://app.driftwave.dev").expect("static origin"),
            cache_prefix: "driftwave".to_string(),
            manifest: ResourceManifest::new(
                vec![
                    "index.html".to_string(),
                    "app.js".to_string(),
                    "app.css".to_string(),
                    "manifest.json".to_string(),
                    "assets/icons/icon-192.png".to_string(),
                    "assets/icons/icon-512.png".to_string(),
                    "favicon.ico".to_string(),
                ],
                "index.html",
            ),
            version_query_timeout: Duration::from_secs(2),
            handoff_stall_timeout: Duration::from_secs(5),
            update_check_interval: Duration::from_secs(60 * 60), // hourly
            install_retry: RetryConfig::default(),
        }
    }
}

impl ShellConfig {
    /// Validate internal consistency of the configuration.
    pub fn validate(&self) -> Result<(), crate::CoreError> {
        if self.cache_prefix.is_empty() {
            return Err(crate::CoreError::config("cache_prefix must not be empty"));
        }
        if self.manifest.is_empty() {
            return Err(crate::CoreError::config("resource manifest must not be empty"));
        }
        if !self.manifest.contains(&self.manifest.offline_shell) {
            return Err(crate::CoreError::config(format!(
                "offline shell '{}' is not in the resource manifest",
                self.manifest.offline_shell
            )));
        }
        Ok(())
    }
}
