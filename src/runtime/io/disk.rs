//! Disk-backed file system
//!
//! Package paths such as `/Game/Maps/Entry.upkg` are resolved below a
//! content root. Reads run on a dedicated rayon pool.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use super::{AsyncFileHandle, AsyncFileSystem, AsyncReadRequest, ReadCallback, ReadPayload};
use crate::runtime::error::FsError;

/// Reads package files from a directory tree.
pub struct DiskFileSystem {
    root: PathBuf,
    pool: Arc<ThreadPool>,
}

impl DiskFileSystem {
    /// Create a file system rooted at `root` with `threads` I/O workers.
    pub fn new(
        root: impl Into<PathBuf>,
        threads: usize,
    ) -> Result<Self, FsError> {
        let root = root.into();
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("asyncload-io-{}", i))
            .build()
            .map_err(|e| FsError::Io {
                path: root.display().to_string(),
                message: e.to_string(),
            })?;
        debug!(root = %root.display(), threads, "disk file system ready");
        Ok(Self {
            root,
            pool: Arc::new(pool),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a package path onto the content root.
    pub fn resolve(
        &self,
        path: &str,
    ) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

struct DiskFileHandle {
    path: String,
    disk_path: PathBuf,
    pool: Arc<ThreadPool>,
}

fn io_error(
    path: &str,
    error: std::io::Error,
) -> FsError {
    if error.kind() == std::io::ErrorKind::NotFound {
        FsError::NotFound {
            path: path.to_string(),
        }
    } else {
        FsError::Io {
            path: path.to_string(),
            message: error.to_string(),
        }
    }
}

fn read_range(
    path: &str,
    disk_path: &Path,
    offset: u64,
    len: u64,
) -> Result<ReadPayload, FsError> {
    let mut file = File::open(disk_path).map_err(|e| io_error(path, e))?;
    let size = file.metadata().map_err(|e| io_error(path, e))?.len();
    if offset.checked_add(len).is_none_or(|end| end > size) {
        return Err(FsError::OutOfRange {
            path: path.to_string(),
            offset,
            len,
            size,
        });
    }
    file.seek(SeekFrom::Start(offset)).map_err(|e| io_error(path, e))?;
    let mut buffer = vec![0u8; len as usize];
    file.read_exact(&mut buffer).map_err(|e| io_error(path, e))?;
    Ok(ReadPayload::Bytes(buffer))
}

impl AsyncFileHandle for DiskFileHandle {
    fn path(&self) -> &str {
        &self.path
    }

    fn size_request(
        &self,
        callback: ReadCallback,
    ) -> AsyncReadRequest {
        let (request, completer) = AsyncReadRequest::new(0, 0, Some(callback));
        let path = self.path.clone();
        let disk_path = self.disk_path.clone();
        self.pool.spawn(move || {
            let result = std::fs::metadata(&disk_path)
                .map(|m| ReadPayload::Size(m.len()))
                .map_err(|e| io_error(&path, e));
            completer.complete(result);
        });
        request
    }

    fn read_request(
        &self,
        offset: u64,
        len: u64,
        _priority: i32,
        callback: ReadCallback,
    ) -> AsyncReadRequest {
        let (request, completer) = AsyncReadRequest::new(offset, len, Some(callback));
        let path = self.path.clone();
        let disk_path = self.disk_path.clone();
        self.pool.spawn(move || {
            if completer.is_canceled() {
                completer.complete(Err(FsError::Canceled));
                return;
            }
            let result = read_range(&path, &disk_path, offset, len);
            completer.complete(result);
        });
        request
    }
}

impl AsyncFileSystem for DiskFileSystem {
    fn open_async_read(
        &self,
        path: &str,
    ) -> Arc<dyn AsyncFileHandle> {
        Arc::new(DiskFileHandle {
            path: path.to_string(),
            disk_path: self.resolve(path),
            pool: self.pool.clone(),
        })
    }
}
