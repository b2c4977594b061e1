//! # Driftwave Core
//!
//! Shared types, configuration, logging, and retry utilities for the
//! Driftwave offline app shell.
//!
//! ## Features
//!
//! - Cache generation and version tag types
//! - Resource manifest (the install-time allow-list)
//! - Shell configuration with sensible defaults
//! - Logging configuration and setup
//! - Retry and timeout utilities

pub mod config;
pub mod error;
pub mod logging;
pub mod retry;
pub mod types;

pub use config::ShellConfig;
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};
pub use types::{Generation, ResourceManifest, VersionTag};
