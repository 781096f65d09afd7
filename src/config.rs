//! Configuration System
//!
//! Hierarchical configuration loading from:
//! - cubist.toml (default configuration)
//! - cubist.local.toml (git-ignored local overrides)
//! - Environment variables (CUBIST_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # cubist.toml
//! [storage]
//! data_dir = "/var/lib/cubist/data"
//!
//! [engine]
//! read_only = false
//! splash_limit_reject = 100000.0
//!
//! [cache]
//! max_bytes = 67108864
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! CUBIST_STORAGE__DATA_DIR=/custom/path
//! CUBIST_ENGINE__READ_ONLY=true
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::cache::CacheConfig;
use crate::lock::LockConfig;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage and journal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for snapshot and journal files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Journal file rotation threshold, bytes
    #[serde(default = "default_journal_rotate_bytes")]
    pub journal_rotate_bytes: u64,

    /// Keep archived journal files after a successful save
    #[serde(default = "default_true")]
    pub keep_archived_journals: bool,
}

/// Engine behavior and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker pool size; 0 = max(16, 2 x hardware concurrency)
    #[serde(default)]
    pub pool_size: usize,

    /// Reject every mutating operation
    #[serde(default)]
    pub read_only: bool,

    /// Base-cell count under which a splash always runs silently
    #[serde(default = "default_splash_allow")]
    pub splash_limit_allow: f64,

    /// Base-cell count above which a splash logs a warning
    #[serde(default = "default_splash_warn")]
    pub splash_limit_warn: f64,

    /// Base-cell count above which a splash is rejected
    #[serde(default = "default_splash_reject")]
    pub splash_limit_reject: f64,

    /// Base-cell count above which an area aggregation runs on the pool
    #[serde(default = "default_parallel_threshold")]
    pub parallel_aggregation_cells: usize,

    /// Default goal-seek iteration cap
    #[serde(default = "default_goalseek_iterations")]
    pub goalseek_max_iterations: u32,

    /// Seconds a session may idle before the sweep reclaims its locks
    #[serde(default = "default_session_idle")]
    pub session_idle_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Optional log file directory; stderr when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_journal_rotate_bytes() -> u64 {
    100_000_000
}
fn default_true() -> bool {
    true
}
fn default_splash_allow() -> f64 {
    1000.0
}
fn default_splash_warn() -> f64 {
    500_000.0
}
fn default_splash_reject() -> f64 {
    100_000_000.0
}
fn default_parallel_threshold() -> usize {
    50_000
}
fn default_goalseek_iterations() -> u32 {
    16
}
fn default_session_idle() -> u64 {
    3600
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: default_data_dir(),
            journal_rotate_bytes: default_journal_rotate_bytes(),
            keep_archived_journals: true,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            pool_size: 0,
            read_only: false,
            splash_limit_allow: default_splash_allow(),
            splash_limit_warn: default_splash_warn(),
            splash_limit_reject: default_splash_reject(),
            parallel_aggregation_cells: default_parallel_threshold(),
            goalseek_max_iterations: default_goalseek_iterations(),
            session_idle_secs: default_session_idle(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
            directory: None,
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. cubist.toml (base configuration)
    /// 2. cubist.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (CUBIST_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("cubist.toml"))
            .merge(Toml::file("cubist.local.toml"))
            .merge(Env::prefixed("CUBIST_").split("__"))
            .extract()
    }

    /// Load configuration from a specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CUBIST_").split("__"))
            .extract()
    }
}
