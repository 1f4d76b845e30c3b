//! Loader runtime
//!
//! Everything below this module runs inside the loader: the package file
//! format, the asynchronous file system seam, the object store, the event
//! graph, the precache layer, per-package state machines and the
//! scheduler that drives them.

pub mod boot;
pub mod dag;
pub mod error;
pub mod format;
pub mod io;
pub mod object;
pub mod package;
pub mod precache;
pub mod scheduler;
