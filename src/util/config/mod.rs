//! asyncload configuration
//!
//! Tuning knobs of the loader, with merge semantics.
//!
//! # Configuration hierarchy
//!
//! ```text
//! Priority (high → low):
//! 1. CLI arguments
//! 2. Environment variables (ASYNCLOAD_*)
//! 3. User-level (~/.config/asyncload/config.ron)
//! 4. Default values
//! ```
//!
//! # Usage
//!
//! ```rust
//! use asyncload::util::config::LoaderConfig;
//!
//! let config = LoaderConfig::default();
//! assert_eq!(config.max_outstanding_precache_requests, 2);
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::precache::{PrecacheLimits, SummaryLimits};

const MIB: u64 = 1024 * 1024;

/// Loader configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// First read of a package; should cover the whole summary
    pub max_package_summary_size: u64,
    /// Smallest first read worth issuing
    pub min_package_summary_size: u64,
    /// Larger headers fail the package
    pub max_header_size: u64,
    /// Largest coalesced precache read
    pub max_export_precache_block: u64,
    /// Most exports one precache read may span
    pub max_export_count_precache: u32,
    /// Largest gap skipped to merge two reads
    pub max_export_allowed_skip: u64,
    /// Completed but unconsumed megabytes before reads are paused
    pub max_ready_requests_to_stall_mb: u64,
    /// Completions waiting in the incoming queue before reads are paused
    pub max_incoming_backlog: usize,
    pub max_outstanding_precache_requests: usize,
    /// Work items per processing event
    pub process_imports_loop_limit: usize,
    /// Longest a full-time-limit tick blocks on I/O
    pub io_wait_forever_secs: u64,
    /// Flush loop iterations between heartbeats
    pub heartbeat_every: usize,
    /// Seed for the randomized load order; `None` keeps the order deterministic
    pub randomize_load_order: Option<u64>,
    pub use_background_thread: bool,
    pub warn_if_time_limit_exceeded: bool,
    pub time_limit_exceeded_multiplier: f64,
    pub time_limit_exceeded_min_time_ms: u64,
    /// Consult the bootstrap registry for compiled-in objects
    pub initial_load: bool,
    /// Extension of package files, without the dot
    pub package_extension: String,
    /// Directory package names are resolved against
    pub content_root: Option<PathBuf>,
    /// Deepest nesting of synchronous flushes
    pub max_flush_depth: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_package_summary_size: 16384,
            min_package_summary_size: 1024,
            max_header_size: 16 * MIB,
            max_export_precache_block: MIB,
            max_export_count_precache: 20,
            max_export_allowed_skip: 48 * 1024,
            max_ready_requests_to_stall_mb: 30,
            max_incoming_backlog: 1024,
            max_outstanding_precache_requests: 2,
            process_imports_loop_limit: 20,
            io_wait_forever_secs: 10,
            heartbeat_every: 32,
            randomize_load_order: None,
            use_background_thread: false,
            warn_if_time_limit_exceeded: false,
            time_limit_exceeded_multiplier: 1.5,
            time_limit_exceeded_min_time_ms: 5,
            initial_load: false,
            package_extension: "upkg".to_string(),
            content_root: None,
            max_flush_depth: 4,
        }
    }
}

impl LoaderConfig {
    pub fn summary_limits(&self) -> SummaryLimits {
        SummaryLimits {
            max_summary: self.max_package_summary_size,
            min_summary: self.min_package_summary_size.min(self.max_package_summary_size),
            max_header: self.max_header_size,
        }
    }

    pub fn precache_limits(&self) -> PrecacheLimits {
        PrecacheLimits {
            max_block: self.max_export_precache_block,
            max_exports: self.max_export_count_precache,
            max_skip: self.max_export_allowed_skip,
        }
    }

    /// Unconsumed bytes allowed before the throttle pauses new reads.
    pub fn throttle_budget(&self) -> u64 {
        self.max_ready_requests_to_stall_mb.saturating_mul(MIB)
    }

    pub fn io_wait_forever(&self) -> Duration {
        Duration::from_secs(self.io_wait_forever_secs)
    }

    /// Ticks shorter than this are never reported as overruns.
    pub fn time_limit_exceeded_min_time(&self) -> Duration {
        Duration::from_millis(self.time_limit_exceeded_min_time_ms)
    }

    /// Check that the values can work together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_package_summary_size == 0 {
            return Err(ConfigError::Invalid {
                field: "max_package_summary_size",
                reason: "must be positive",
            });
        }
        if self.max_outstanding_precache_requests == 0 {
            return Err(ConfigError::Invalid {
                field: "max_outstanding_precache_requests",
                reason: "at least one precache read must be allowed",
            });
        }
        if self.max_export_count_precache == 0 {
            return Err(ConfigError::Invalid {
                field: "max_export_count_precache",
                reason: "must be positive",
            });
        }
        if self.package_extension.is_empty() || self.package_extension.contains('.') {
            return Err(ConfigError::Invalid {
                field: "package_extension",
                reason: "must be a non-empty extension without dots",
            });
        }
        if self.time_limit_exceeded_multiplier.is_nan() || self.time_limit_exceeded_multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                field: "time_limit_exceeded_multiplier",
                reason: "must be at least 1.0",
            });
        }
        Ok(())
    }

    /// Parse a RON document.
    pub fn from_ron(content: &str) -> Result<Self, ConfigError> {
        let config: LoaderConfig = ron::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_ron(&self) -> Result<String, ConfigError> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ron(&content)
    }

    pub fn save_file(
        &self,
        path: &Path,
    ) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }
        }
        fs::write(path, self.to_ron()?).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `ASYNCLOAD_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `ASYNCLOAD_*` variables from `lookup`.
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup("ASYNCLOAD_RANDOMIZE_SEED") {
            self.randomize_load_order = if value.is_empty() || value == "off" {
                None
            } else {
                Some(parse_env("ASYNCLOAD_RANDOMIZE_SEED", &value)?)
            };
        }
        if let Some(value) = lookup("ASYNCLOAD_BACKGROUND_THREAD") {
            self.use_background_thread = parse_bool("ASYNCLOAD_BACKGROUND_THREAD", &value)?;
        }
        if let Some(value) = lookup("ASYNCLOAD_STALL_MB") {
            self.max_ready_requests_to_stall_mb = parse_env("ASYNCLOAD_STALL_MB", &value)?;
        }
        if let Some(value) = lookup("ASYNCLOAD_MAX_OUTSTANDING_PRECACHE") {
            self.max_outstanding_precache_requests = parse_env("ASYNCLOAD_MAX_OUTSTANDING_PRECACHE", &value)?;
        }
        if let Some(value) = lookup("ASYNCLOAD_WARN_TIME_LIMIT") {
            self.warn_if_time_limit_exceeded = parse_bool("ASYNCLOAD_WARN_TIME_LIMIT", &value)?;
        }
        if let Some(value) = lookup("ASYNCLOAD_CONTENT_ROOT") {
            self.content_root = Some(PathBuf::from(value));
        }
        self.validate()
    }
}

fn parse_env<T: std::str::FromStr>(
    key: &'static str,
    value: &str,
) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key,
        value: value.to_string(),
    })
}

fn parse_bool(
    key: &'static str,
    value: &str,
) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Env {
            key,
            value: value.to_string(),
        }),
    }
}

/// Get the user config directory
pub fn get_config_dir() -> Option<PathBuf> {
    // Try XDG config directory on Unix
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config).join("asyncload"));
    }

    // Fallback to ~/.config/asyncload
    if let Ok(home) = std::env::var("HOME") {
        return Some(PathBuf::from(home).join(".config").join("asyncload"));
    }

    // On Windows, try %APPDATA%
    if let Ok(appdata) = std::env::var("APPDATA") {
        return Some(PathBuf::from(appdata).join("asyncload"));
    }

    None
}

/// Get the user config file path (~/.config/asyncload/config.ron)
pub fn get_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.ron"))
}

/// Load the user-level config, then apply the environment.
/// Returns defaults if the file doesn't exist
pub fn load_user_config() -> Result<LoaderConfig, ConfigError> {
    let mut config = match get_config_path() {
        Some(path) if path.exists() => LoaderConfig::load_file(&path)?,
        _ => LoaderConfig::default(),
    };
    config.apply_env()?;
    Ok(config)
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config parse error: {0}")]
    Parse(String),

    #[error("Config serialize error: {0}")]
    Serialize(String),

    #[error("Invalid value for {key}: '{value}'")]
    Env { key: &'static str, value: String },

    #[error("Invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests;
