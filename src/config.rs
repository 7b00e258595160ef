//! Configuration management for clabd
//!
//! Loads configuration from an optional file plus environment variable
//! overrides (prefix `CLABD_`). Everything has a sensible default so a bare
//! server can start with no config at all.

use crate::error::Result;
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level server configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Sandbox limits and container settings
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Critique (code-analysis) service settings
    #[serde(default)]
    pub critique: CritiqueConfig,
    /// Interactive session (WebSocket) settings
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    /// Load configuration with layered precedence:
    /// 1. defaults, 2. config file (if present), 3. `CLABD_*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        } else {
            builder = builder.add_source(
                config::File::with_name("clabd").required(false),
            );
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("CLABD").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

/// Sandbox configuration: resource caps applied to every compile/run
/// invocation and the image used by the container tier.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Container image for the Maximum tier
    #[serde(default = "default_image")]
    pub container_image: String,
    /// Memory ceiling in MiB
    #[serde(default = "default_memory_mb")]
    pub max_memory_mb: u64,
    /// CPU share as a percentage of one core
    #[serde(default = "default_cpu_percent")]
    pub max_cpu_percent: u32,
    /// Process-count ceiling
    #[serde(default = "default_max_processes")]
    pub max_processes: u32,
    /// File-size ceiling in MiB
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    /// Wall-clock ceiling for compilation
    #[serde(default = "default_compile_timeout", with = "humantime_serde")]
    pub compile_timeout: Duration,
    /// Default wall-clock ceiling for execution
    #[serde(default = "default_run_timeout", with = "humantime_serde")]
    pub run_timeout: Duration,
    /// Cap on captured output in bytes
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            container_image: default_image(),
            max_memory_mb: default_memory_mb(),
            max_cpu_percent: default_cpu_percent(),
            max_processes: default_max_processes(),
            max_file_size_mb: default_max_file_size_mb(),
            compile_timeout: default_compile_timeout(),
            run_timeout: default_run_timeout(),
            max_output_bytes: default_max_output(),
        }
    }
}

fn default_image() -> String {
    "gcc:latest".to_string()
}

fn default_memory_mb() -> u64 {
    128
}

fn default_cpu_percent() -> u32 {
    50
}

fn default_max_processes() -> u32 {
    64
}

fn default_max_file_size_mb() -> u64 {
    50
}

fn default_compile_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_run_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_output() -> usize {
    1024 * 1024 // 1MB
}

/// Critique service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CritiqueConfig {
    /// Base URL of the critique endpoint
    #[serde(default = "default_critique_url")]
    pub base_url: String,
    /// Model name passed to the service
    #[serde(default = "default_critique_model")]
    pub model: String,
    /// Optional API key
    #[serde(default)]
    pub api_key: Option<SecretString>,
    /// Request timeout
    #[serde(default = "default_critique_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for CritiqueConfig {
    fn default() -> Self {
        CritiqueConfig {
            base_url: default_critique_url(),
            model: default_critique_model(),
            api_key: None,
            timeout: default_critique_timeout(),
        }
    }
}

fn default_critique_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_critique_model() -> String {
    "llama3.2:1b".to_string()
}

fn default_critique_timeout() -> Duration {
    Duration::from_secs(120)
}

/// Interactive session (WebSocket) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Maximum inbound frame size in bytes
    #[serde(default = "default_max_frame")]
    pub max_frame_bytes: usize,
    /// Per-client outbound channel capacity
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
    /// Liveness ping interval on the outbound loop
    #[serde(default = "default_ping_interval", with = "humantime_serde")]
    pub ping_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_frame_bytes: default_max_frame(),
            send_buffer: default_send_buffer(),
            ping_interval: default_ping_interval(),
        }
    }
}

fn default_max_frame() -> usize {
    512 * 1024
}

fn default_send_buffer() -> usize {
    256
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(54)
}

/// Default staging root for compile workspaces
pub fn workspace_root() -> PathBuf {
    std::env::temp_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_config_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.max_memory_mb, 128);
        assert_eq!(config.compile_timeout, Duration::from_secs(30));
        assert_eq!(config.run_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_config_default_is_complete() {
        let config = Config::default();
        assert_eq!(config.sandbox.container_image, "gcc:latest");
        assert_eq!(config.session.send_buffer, 256);
        assert!(config.critique.api_key.is_none());
    }
}
