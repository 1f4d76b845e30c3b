//! Log output for the loader
//!
//! The loader reports through `tracing` with structured fields
//! (`package`, `request_id`, `bytes`, ...). This module only installs the
//! subscriber: a compact, uncoloured line per event with the level in
//! front and no timestamp. Per-event scheduling chatter is logged at
//! TRACE, package lifecycle at DEBUG, throttle flips and finished loads
//! at INFO.
//!
//! Only `asyncload` events are shown at the chosen level; other crates are
//! held to WARN.
//!
//! # Usage
//!
//! ```rust
//! use asyncload::util::logger::{self, LogLevel};
//!
//! logger::init_with_level(LogLevel::from_verbosity(1));
//! tracing::debug!(package = "/Game/Maps/Entry", "creating package loader");
//! ```

use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

/// Target of every event this crate emits.
const CRATE_TARGET: &str = "asyncload";

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl LogLevel {
    /// Map a `-v` count to a level: none is INFO, one DEBUG, more TRACE.
    pub fn from_verbosity(verbose: u8) -> Self {
        match verbose {
            0 => LogLevel::Info,
            1 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

/// Loader events at `level`, everything else at WARN.
fn targets(level: LogLevel) -> Targets {
    let level = LevelFilter::from_level(level.into());
    Targets::new()
        .with_default(LevelFilter::WARN.min(level))
        .with_target(CRATE_TARGET, level)
}

/// Install the subscriber at INFO.
pub fn init() {
    init_with_level(LogLevel::Info);
}

/// Install the subscriber at `level`. Calling it again after a subscriber
/// is installed does nothing.
pub fn init_with_level(level: LogLevel) {
    // 不显示时间、模块路径和颜色
    let layer = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(false)
        .with_level(true)
        .with_ansi(false)
        .compact()
        .with_filter(targets(level));

    let _ = Registry::default().with(layer).try_init();
}

pub fn init_debug() {
    init_with_level(LogLevel::Debug);
}

/// Subscriber for tests: DEBUG loader output captured by the test harness,
/// shown only for failing tests.
pub fn init_test() {
    let layer = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(false)
        .with_test_writer()
        .with_filter(targets(LogLevel::Debug));
    let _ = Registry::default().with(layer).try_init();
}
