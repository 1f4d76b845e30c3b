//! Load requests
//!
//! A [`PackageRequest`] is what a client hands to
//! [`AsyncLoader::request_load`](super::AsyncLoader::request_load). Requests
//! are validated at the call boundary, stamped with a [`RequestId`] and
//! parked in the [`RequestQueue`] until the loading thread materializes
//! them into package loaders.

use std::collections::VecDeque;
use std::fmt;
use std::ops::BitOr;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;

use crate::runtime::error::RequestError;
use crate::runtime::object::ObjectRef;

/// Outcome reported to every completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadResult {
    Succeeded,
    Failed,
    Canceled,
}

impl fmt::Display for LoadResult {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let text = match self {
            LoadResult::Succeeded => "succeeded",
            LoadResult::Failed => "failed",
            LoadResult::Canceled => "canceled",
        };
        f.write_str(text)
    }
}

/// Called once with the package name, the package object on success, and
/// the result.
pub type LoadCallback = Box<dyn FnOnce(&str, Option<ObjectRef>, LoadResult) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LoadFlags(u32);

impl LoadFlags {
    pub const NONE: LoadFlags = LoadFlags(0);
    /// Do not warn when the package file is missing.
    pub const QUIET: LoadFlags = LoadFlags(1 << 0);

    pub const fn contains(
        self,
        other: LoadFlags,
    ) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for LoadFlags {
    type Output = LoadFlags;

    fn bitor(
        self,
        rhs: LoadFlags,
    ) -> LoadFlags {
        LoadFlags(self.0 | rhs.0)
    }
}

/// A request to load one package.
pub struct PackageRequest {
    pub name: String,
    /// File to read instead of `name`, if different.
    pub name_to_load: Option<String>,
    /// Expected package guid; a mismatch fails the load.
    pub guid: Option<u128>,
    pub priority: i32,
    pub flags: LoadFlags,
    pub callback: Option<LoadCallback>,
}

impl PackageRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            name_to_load: None,
            guid: None,
            priority: 0,
            flags: LoadFlags::NONE,
            callback: None,
        }
    }

    pub fn with_name_to_load(
        mut self,
        name_to_load: impl Into<String>,
    ) -> Self {
        self.name_to_load = Some(name_to_load.into());
        self
    }

    pub fn with_guid(
        mut self,
        guid: u128,
    ) -> Self {
        self.guid = Some(guid);
        self
    }

    pub fn with_priority(
        mut self,
        priority: i32,
    ) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_flags(
        mut self,
        flags: LoadFlags,
    ) -> Self {
        self.flags = flags;
        self
    }

    pub fn on_complete(
        mut self,
        callback: impl FnOnce(&str, Option<ObjectRef>, LoadResult) + Send + 'static,
    ) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// The file name this request reads.
    pub fn file_name(&self) -> &str {
        self.name_to_load.as_deref().unwrap_or(&self.name)
    }

    /// Reject names the loader could never resolve.
    pub fn validate(&self) -> Result<(), RequestError> {
        validate_package_name(&self.name)?;
        if let Some(other) = &self.name_to_load {
            validate_package_name(other)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PackageRequest {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("PackageRequest")
            .field("name", &self.name)
            .field("name_to_load", &self.name_to_load)
            .field("guid", &self.guid)
            .field("priority", &self.priority)
            .field("flags", &self.flags)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

static PACKAGE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(/[A-Za-z0-9_][A-Za-z0-9_\-]*)+$").expect("valid package name regex"));

/// Long package names: `/Root/Sub/Name`, no extension, no empty segments.
pub fn validate_package_name(name: &str) -> Result<(), RequestError> {
    if name.is_empty() {
        return Err(RequestError::EmptyName);
    }
    let reason = if !name.starts_with('/') {
        "must start with '/'"
    } else if name.ends_with('/') {
        "must not end with '/'"
    } else if name.contains("//") {
        "must not contain empty path segments"
    } else if name.contains('.') {
        "must not contain '.'"
    } else if !PACKAGE_NAME.is_match(name) {
        "contains characters outside [A-Za-z0-9_-]"
    } else {
        return Ok(());
    };
    Err(RequestError::InvalidPackageName {
        name: name.to_string(),
        reason,
    })
}

/// A validated request waiting for the loading thread.
#[derive(Debug)]
pub struct QueuedRequest {
    pub id: RequestId,
    pub request: PackageRequest,
}

/// Requests submitted from any thread.
#[derive(Debug, Default)]
pub struct RequestQueue {
    queue: Mutex<VecDeque<QueuedRequest>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &self,
        queued: QueuedRequest,
    ) {
        self.queue.lock().push_back(queued);
    }

    /// Take everything queued, highest priority first, arrival order
    /// within a priority.
    pub fn drain_by_priority(&self) -> Vec<QueuedRequest> {
        let mut drained: Vec<_> = self.queue.lock().drain(..).collect();
        drained.sort_by(|a, b| b.request.priority.cmp(&a.request.priority));
        drained
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}
