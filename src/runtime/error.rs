//! Error types shared across the loader
//!
//! Errors are split by who can do something about them:
//!
//! - [`LoadError`] fails one package and is reported through its callback
//! - [`RequestError`] rejects a call on the public API
//! - [`FatalError`] means an internal invariant broke; the loader stops
//! - [`FsError`] comes back from the file system seam
//!
//! Graph primitive violations are [`GraphError`](crate::runtime::dag::GraphError)
//! and are always wrapped into a [`FatalError`] before they leave the loader.

use thiserror::Error;

use crate::runtime::dag::GraphError;
use crate::runtime::package::{PackageState, WeakPackageRef};
use crate::util::config::ConfigError;

/// Why a single package failed to load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("package file not found: '{path}'")]
    FileNotFound { path: String },

    #[error("package '{name}' is known to be missing")]
    KnownMissing { name: String },

    #[error("bad package magic {found:#010x}")]
    BadMagic { found: u32 },

    #[error("package file version {version} is older than the minimum supported {min}")]
    VersionTooOld { version: u32, min: u32 },

    #[error("package file version {version} is newer than the maximum supported {max}")]
    VersionTooNew { version: u32, max: u32 },

    #[error("package header of {size} bytes exceeds the {limit} byte limit")]
    HeaderTooLarge { size: u64, limit: u64 },

    #[error("package is truncated: needs {needed} bytes, file has {available}")]
    Truncated { needed: u64, available: u64 },

    #[error("package tables are corrupt: {reason}")]
    CorruptTables { reason: String },

    #[error("package has no exports")]
    NoExports,

    #[error("package guid mismatch: expected {expected:#x}, found {found:#x}")]
    GuidMismatch { expected: u128, found: u128 },

    #[error("read failed: {0}")]
    Io(#[from] FsError),
}

/// Errors from the asynchronous file system seam.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("file not found: '{path}'")]
    NotFound { path: String },

    #[error("read of {len} bytes at offset {offset} is out of range for '{path}' ({size} bytes)")]
    OutOfRange {
        path: String,
        offset: u64,
        len: u64,
        size: u64,
    },

    #[error("request was canceled")]
    Canceled,

    #[error("i/o error on '{path}': {message}")]
    Io { path: String, message: String },
}

/// Rejected public API calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("package name must not be empty")]
    EmptyName,

    #[error("invalid package name '{name}': {reason}")]
    InvalidPackageName { name: String, reason: &'static str },

    #[error("{operation} must be called from the thread that created the loader")]
    NotForegroundThread { operation: &'static str },

    #[error("cannot cancel while {arcs} cross-package arcs are outstanding; flush first")]
    CrossPackageArcsOutstanding { arcs: usize },

    #[error("loading is suspended")]
    Suspended,

    #[error("resume called without a matching suspend")]
    NotSuspended,

    #[error("flush nested {depth} levels deep")]
    FlushRecursion { depth: usize },

    #[error("the loader cannot be ticked from inside its own event execution")]
    ReentrantTick,

    #[error("the loader has been shut down")]
    ShutDown,
}

/// Broken internal invariants. The loader refuses further work after one.
#[derive(Debug, Clone, Error)]
pub enum FatalError {
    #[error("event graph invariant violated: {source}\n{dump}")]
    Graph {
        #[source]
        source: GraphError,
        dump: String,
    },

    #[error("serialized size mismatch for '{object}': read {read} bytes, expected {expected}")]
    SerialSizeMismatch {
        object: String,
        read: u64,
        expected: u64,
    },

    #[error("compiled-in objects never finished registering: {}", paths.join(", "))]
    MissingBootstrapDependency { paths: Vec<String> },

    #[error("package '{package}' is already executing an event")]
    Reentrant { package: String },

    #[error("package handle {package} no longer refers to a live loader")]
    StalePackage { package: WeakPackageRef },

    #[error("package '{package}' is in state {found:?}, expected {expected}")]
    InvalidState {
        package: String,
        expected: &'static str,
        found: PackageState,
    },

    #[error("package '{package}' finished with {count} nodes still in the event graph")]
    LeakedNodes { package: String, count: usize },

    #[error("import {index} of '{package}' was linked twice")]
    ImportRelinked { package: String, index: u32 },

    #[error("loading made no progress while {remaining} packages are still in flight")]
    Stalled { remaining: usize },

    #[error("background loading thread failed: {message}")]
    Background { message: String },
}

impl FatalError {
    /// Wrap a graph error together with a dump of the graph at that point.
    pub fn graph(
        source: GraphError,
        dump: String,
    ) -> Self {
        FatalError::Graph { source, dump }
    }
}

/// Anything the top-level loader API can return.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Fatal(#[from] FatalError),

    #[error(transparent)]
    FileSystem(#[from] FsError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
