//! In-memory file system
//!
//! Serves package bytes from a map. Three completion modes:
//!
//! - `Immediate` completes every request inside the call that issued it
//! - `Threaded` hands requests to a worker thread over a channel
//! - `Manual` parks requests until the owner calls [`MemoryFileSystem::complete_pending`]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::{AsyncFileHandle, AsyncFileSystem, AsyncReadRequest, ReadCallback, ReadCompleter, ReadPayload};
use crate::runtime::error::FsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    #[default]
    Immediate,
    Threaded,
    Manual,
}

enum ReadKind {
    Size,
    Range { offset: u64, len: u64 },
}

struct PendingRead {
    path: String,
    kind: ReadKind,
    completer: ReadCompleter,
}

type FileMap = Arc<RwLock<HashMap<String, Arc<Vec<u8>>>>>;

struct MemoryInner {
    files: FileMap,
    mode: CompletionMode,
    open_counts: Mutex<HashMap<String, usize>>,
    parked: Mutex<VecDeque<PendingRead>>,
    worker: Mutex<Option<Sender<PendingRead>>>,
    reads_issued: AtomicUsize,
    bytes_served: Arc<AtomicU64>,
}

/// A file system backed by byte vectors.
///
/// # Example
///
/// ```
/// use asyncload::runtime::io::{AsyncFileSystem, CompletionMode, MemoryFileSystem};
///
/// let fs = MemoryFileSystem::new(CompletionMode::Immediate);
/// fs.insert("/Game/A.upkg", vec![0u8; 64]);
/// let handle = fs.open_async_read("/Game/A.upkg");
/// let request = handle.size_request(Box::new(|_| {}));
/// assert!(request.poll_completion());
/// assert_eq!(request.take_size().unwrap(), 64);
/// ```
#[derive(Clone)]
pub struct MemoryFileSystem {
    inner: Arc<MemoryInner>,
}

impl MemoryFileSystem {
    pub fn new(mode: CompletionMode) -> Self {
        let files: FileMap = Arc::new(RwLock::new(HashMap::new()));
        let bytes_served = Arc::new(AtomicU64::new(0));
        let worker = if mode == CompletionMode::Threaded {
            let (tx, rx) = channel::unbounded::<PendingRead>();
            let worker_files = files.clone();
            let worker_bytes = bytes_served.clone();
            thread::Builder::new()
                .name("asyncload-memory-io".to_string())
                .spawn(move || {
                    for read in rx.iter() {
                        serve(&worker_files, &worker_bytes, read);
                    }
                })
                .ok()
                .map(|_| tx)
        } else {
            None
        };
        Self {
            inner: Arc::new(MemoryInner {
                files,
                mode: if mode == CompletionMode::Threaded && worker.is_none() {
                    CompletionMode::Immediate
                } else {
                    mode
                },
                open_counts: Mutex::new(HashMap::new()),
                parked: Mutex::new(VecDeque::new()),
                worker: Mutex::new(worker),
                reads_issued: AtomicUsize::new(0),
                bytes_served,
            }),
        }
    }

    pub fn mode(&self) -> CompletionMode {
        self.inner.mode
    }

    pub fn insert(
        &self,
        path: impl Into<String>,
        bytes: Vec<u8>,
    ) {
        self.inner.files.write().insert(path.into(), Arc::new(bytes));
    }

    pub fn remove(
        &self,
        path: &str,
    ) -> bool {
        self.inner.files.write().remove(path).is_some()
    }

    /// How many times `path` has been opened.
    pub fn open_count(
        &self,
        path: &str,
    ) -> usize {
        self.inner.open_counts.lock().get(path).copied().unwrap_or(0)
    }

    /// Range reads issued so far. Size requests are not counted.
    pub fn reads_issued(&self) -> usize {
        self.inner.reads_issued.load(Ordering::SeqCst)
    }

    pub fn bytes_served(&self) -> u64 {
        self.inner.bytes_served.load(Ordering::SeqCst)
    }

    /// Requests parked in manual mode.
    pub fn pending_reads(&self) -> usize {
        self.inner.parked.lock().len()
    }

    /// Complete every parked request, oldest first. Returns how many ran.
    pub fn complete_pending(&self) -> usize {
        let mut done = 0;
        while self.complete_next() {
            done += 1;
        }
        done
    }

    /// Complete the oldest parked request.
    pub fn complete_next(&self) -> bool {
        let next = self.inner.parked.lock().pop_front();
        match next {
            Some(read) => {
                serve(&self.inner.files, &self.inner.bytes_served, read);
                true
            }
            None => false,
        }
    }

    fn submit(
        &self,
        read: PendingRead,
    ) {
        match self.inner.mode {
            CompletionMode::Immediate => serve(&self.inner.files, &self.inner.bytes_served, read),
            CompletionMode::Manual => self.inner.parked.lock().push_back(read),
            CompletionMode::Threaded => {
                let sender = self.inner.worker.lock().clone();
                match sender {
                    Some(tx) => {
                        if let Err(channel::SendError(read)) = tx.send(read) {
                            serve(&self.inner.files, &self.inner.bytes_served, read);
                        }
                    }
                    None => serve(&self.inner.files, &self.inner.bytes_served, read),
                }
            }
        }
    }
}

impl Default for MemoryFileSystem {
    fn default() -> Self {
        Self::new(CompletionMode::Immediate)
    }
}

impl Drop for MemoryInner {
    fn drop(&mut self) {
        // Closing the channel ends the worker thread.
        self.worker.lock().take();
    }
}

fn serve(
    files: &FileMap,
    bytes_served: &AtomicU64,
    read: PendingRead,
) {
    let PendingRead { path, kind, completer } = read;
    if completer.is_canceled() {
        completer.complete(Err(FsError::Canceled));
        return;
    }
    let file = files.read().get(&path).cloned();
    let result = match (file, kind) {
        (None, _) => Err(FsError::NotFound { path }),
        (Some(bytes), ReadKind::Size) => Ok(ReadPayload::Size(bytes.len() as u64)),
        (Some(bytes), ReadKind::Range { offset, len }) => {
            let size = bytes.len() as u64;
            match offset.checked_add(len) {
                Some(end) if end <= size => {
                    bytes_served.fetch_add(len, Ordering::SeqCst);
                    Ok(ReadPayload::Bytes(bytes[offset as usize..end as usize].to_vec()))
                }
                _ => Err(FsError::OutOfRange { path, offset, len, size }),
            }
        }
    };
    completer.complete(result);
}

struct MemoryFileHandle {
    path: String,
    fs: MemoryFileSystem,
}

impl AsyncFileHandle for MemoryFileHandle {
    fn path(&self) -> &str {
        &self.path
    }

    fn size_request(
        &self,
        callback: ReadCallback,
    ) -> AsyncReadRequest {
        let (request, completer) = AsyncReadRequest::new(0, 0, Some(callback));
        self.fs.submit(PendingRead {
            path: self.path.clone(),
            kind: ReadKind::Size,
            completer,
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
        self.fs.inner.reads_issued.fetch_add(1, Ordering::SeqCst);
        trace!(path = %self.path, offset, len, "memory read");
        let (request, completer) = AsyncReadRequest::new(offset, len, Some(callback));
        self.fs.submit(PendingRead {
            path: self.path.clone(),
            kind: ReadKind::Range { offset, len },
            completer,
        });
        request
    }
}

impl AsyncFileSystem for MemoryFileSystem {
    fn open_async_read(
        &self,
        path: &str,
    ) -> Arc<dyn AsyncFileHandle> {
        *self.inner.open_counts.lock().entry(path.to_string()).or_insert(0) += 1;
        Arc::new(MemoryFileHandle {
            path: path.to_string(),
            fs: self.clone(),
        })
    }
}
