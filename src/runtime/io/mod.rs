//! Asynchronous file system seam
//!
//! The loader never blocks on a read it issued itself except through
//! [`AsyncReadRequest::wait_completion`]. Completion is signalled twice:
//! through the request object (poll or wait) and through a callback run on
//! whichever thread finished the read. The callback receives `true` when
//! the request was canceled.

mod disk;
mod memory;

pub use disk::DiskFileSystem;
pub use memory::{CompletionMode, MemoryFileSystem};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::runtime::error::FsError;

/// Called once when a request completes. The flag is `true` if canceled.
pub type ReadCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// What a completed request carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadPayload {
    Size(u64),
    Bytes(Vec<u8>),
}

struct RequestState {
    result: Option<Result<ReadPayload, FsError>>,
    callback: Option<ReadCallback>,
    complete: bool,
    canceled: bool,
}

struct RequestShared {
    state: Mutex<RequestState>,
    done: Condvar,
}

/// A read in flight.
///
/// Cheap to clone; clones observe the same completion.
#[derive(Clone)]
pub struct AsyncReadRequest {
    shared: Arc<RequestShared>,
    offset: u64,
    len: u64,
}

/// The producer half of an [`AsyncReadRequest`], held by the file system.
///
/// Dropping it without calling [`ReadCompleter::complete`] completes the
/// request with an error so waiters never hang.
pub struct ReadCompleter {
    shared: Arc<RequestShared>,
    finished: bool,
}

impl AsyncReadRequest {
    /// Create a request and its completer.
    pub fn new(
        offset: u64,
        len: u64,
        callback: Option<ReadCallback>,
    ) -> (Self, ReadCompleter) {
        let shared = Arc::new(RequestShared {
            state: Mutex::new(RequestState {
                result: None,
                callback,
                complete: false,
                canceled: false,
            }),
            done: Condvar::new(),
        });
        let request = AsyncReadRequest {
            shared: shared.clone(),
            offset,
            len,
        };
        (request, ReadCompleter { shared, finished: false })
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Has the read finished (successfully, with an error, or canceled)?
    pub fn poll_completion(&self) -> bool {
        self.shared.state.lock().complete
    }

    /// Block until the read finishes or `timeout` elapses.
    ///
    /// Returns `true` if the request is complete.
    pub fn wait_completion(
        &self,
        timeout: Option<Duration>,
    ) -> bool {
        let mut state = self.shared.state.lock();
        match timeout {
            None => {
                while !state.complete {
                    self.shared.done.wait(&mut state);
                }
                true
            }
            Some(timeout) => {
                if !state.complete {
                    self.shared.done.wait_while_for(&mut state, |s| !s.complete, timeout);
                }
                state.complete
            }
        }
    }

    /// Ask the file system to drop the read. The callback still runs, with
    /// `true`, once the file system gets to it.
    pub fn cancel(&self) {
        self.shared.state.lock().canceled = true;
    }

    pub fn is_canceled(&self) -> bool {
        self.shared.state.lock().canceled
    }

    /// Move the result out. Returns `None` until the request completes.
    pub fn take_result(&self) -> Option<Result<ReadPayload, FsError>> {
        self.shared.state.lock().result.take()
    }

    /// Take the result of a range read.
    pub fn take_bytes(&self) -> Result<Vec<u8>, FsError> {
        match self.take_result() {
            Some(Ok(ReadPayload::Bytes(bytes))) => Ok(bytes),
            Some(Ok(ReadPayload::Size(_))) => Err(FsError::Io {
                path: String::new(),
                message: "expected bytes, got a size".to_string(),
            }),
            Some(Err(e)) => Err(e),
            None => Err(FsError::Io {
                path: String::new(),
                message: "read result taken before completion".to_string(),
            }),
        }
    }

    /// Take the result of a size request.
    pub fn take_size(&self) -> Result<u64, FsError> {
        match self.take_result() {
            Some(Ok(ReadPayload::Size(size))) => Ok(size),
            Some(Ok(ReadPayload::Bytes(bytes))) => Ok(bytes.len() as u64),
            Some(Err(e)) => Err(e),
            None => Err(FsError::Io {
                path: String::new(),
                message: "size taken before completion".to_string(),
            }),
        }
    }
}

impl fmt::Debug for AsyncReadRequest {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("AsyncReadRequest")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("complete", &self.poll_completion())
            .finish()
    }
}

impl ReadCompleter {
    /// Whether the consumer already canceled the request.
    pub fn is_canceled(&self) -> bool {
        self.shared.state.lock().canceled
    }

    /// Publish the result, wake waiters and run the callback.
    pub fn complete(
        mut self,
        result: Result<ReadPayload, FsError>,
    ) {
        self.finish(result);
    }

    fn finish(
        &mut self,
        result: Result<ReadPayload, FsError>,
    ) {
        if self.finished {
            return;
        }
        self.finished = true;
        let (callback, canceled) = {
            let mut state = self.shared.state.lock();
            let canceled = state.canceled;
            state.result = Some(if canceled { Err(FsError::Canceled) } else { result });
            state.complete = true;
            (state.callback.take(), canceled)
        };
        self.shared.done.notify_all();
        if let Some(callback) = callback {
            callback(canceled);
        }
    }
}

impl Drop for ReadCompleter {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(Err(FsError::Io {
                path: String::new(),
                message: "read dropped by the file system".to_string(),
            }));
        }
    }
}

/// An open file that serves asynchronous size and range requests.
pub trait AsyncFileHandle: Send + Sync {
    fn path(&self) -> &str;

    /// Request the total file size. Missing files complete with
    /// [`FsError::NotFound`].
    fn size_request(
        &self,
        callback: ReadCallback,
    ) -> AsyncReadRequest;

    /// Request `len` bytes starting at `offset`.
    fn read_request(
        &self,
        offset: u64,
        len: u64,
        priority: i32,
        callback: ReadCallback,
    ) -> AsyncReadRequest;
}

/// Opens package files for asynchronous reading.
///
/// Opening never fails; a missing file shows up when the first request
/// on the handle completes.
pub trait AsyncFileSystem: Send + Sync {
    fn open_async_read(
        &self,
        path: &str,
    ) -> Arc<dyn AsyncFileHandle>;
}
