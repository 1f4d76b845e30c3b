//! asyncload - event-driven asynchronous package loading
//!
//! Loads packages (files holding a header of import and export tables
//! followed by serialized object payloads) with a dependency event graph
//! instead of a fixed pipeline. Each import and export gets a handful of
//! graph nodes; a node runs only when all of its prerequisites are done,
//! so packages that import each other make progress together and disk
//! reads are coalesced into a few large precache requests.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use asyncload::runtime::io::{CompletionMode, MemoryFileSystem};
//! use asyncload::runtime::scheduler::{AsyncLoader, PackageRequest};
//!
//! fn main() -> asyncload::Result<()> {
//!     let fs = Arc::new(MemoryFileSystem::new(CompletionMode::Immediate));
//!     let loader = AsyncLoader::builder().file_system(fs).build()?;
//!     let id = loader.request_load(PackageRequest::new("/Game/Maps/Entry"))?;
//!     loader.flush(Some(id))?;
//!     Ok(())
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/asyncload")]
#![warn(rust_2018_idioms)]

pub mod manifest;
pub mod runtime;

// Utility modules
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use thiserror::Error;

pub use runtime::error::{FatalError, LoadError, LoaderError, RequestError};
pub use runtime::scheduler::{
    AsyncLoader, AsyncLoaderBuilder, LoadResult, PackageRequest, RequestId, TickState,
};
pub use util::config::LoaderConfig;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "asyncload";
