//! Per-package read archive
//!
//! Summary phases, in order:
//!
//! ```text
//! WaitingForSize -> WaitingForSummary -> [WaitingForHeader] -> WaitingForFirstExport -> ProcessingExports
//! ```
//!
//! The first summary read is capped; if the header turns out larger, only
//! the missing tail is read and spliced onto what is already resident.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::runtime::error::{FsError, LoadError};
use crate::runtime::format::{Prologue, PROLOGUE_SIZE};
use crate::runtime::io::{AsyncFileHandle, AsyncReadRequest, ReadCallback};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchivePhase {
    WaitingForSize,
    WaitingForSummary,
    WaitingForHeader,
    WaitingForFirstExport,
    ProcessingExports,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryLimits {
    /// Largest first summary read.
    pub max_summary: u64,
    /// Smallest first summary read (files smaller than this are read whole).
    pub min_summary: u64,
    /// Largest header accepted.
    pub max_header: u64,
}

impl Default for SummaryLimits {
    fn default() -> Self {
        Self {
            max_summary: 16384,
            min_summary: 1024,
            max_header: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummaryPoll {
    /// A read is outstanding; its callback fires when it lands.
    Pending,
    /// Header bytes are resident.
    Ready,
    Failed(LoadError),
}

pub struct PrecacheArchive {
    handle: Arc<dyn AsyncFileHandle>,
    limits: SummaryLimits,
    phase: ArchivePhase,
    pending: Option<AsyncReadRequest>,
    file_size: Option<u64>,
    header_size: Option<u64>,
    window_start: u64,
    window: Vec<u8>,
}

impl PrecacheArchive {
    /// Open the archive and issue the size request.
    pub fn open(
        handle: Arc<dyn AsyncFileHandle>,
        limits: SummaryLimits,
        callback: ReadCallback,
    ) -> Self {
        let size = handle.size_request(callback);
        Self {
            handle,
            limits,
            phase: ArchivePhase::WaitingForSize,
            pending: Some(size),
            file_size: None,
            header_size: None,
            window_start: 0,
            window: Vec::new(),
        }
    }

    pub fn path(&self) -> &str {
        self.handle.path()
    }

    pub fn handle(&self) -> &Arc<dyn AsyncFileHandle> {
        &self.handle
    }

    pub fn phase(&self) -> ArchivePhase {
        self.phase
    }

    pub fn file_size(&self) -> Option<u64> {
        self.file_size
    }

    pub fn header_size(&self) -> Option<u64> {
        self.header_size
    }

    /// Advance the summary phases as far as completed reads allow.
    /// `callback` produces the completion callback for any new read.
    pub fn poll_summary(
        &mut self,
        callback: &mut dyn FnMut() -> ReadCallback,
    ) -> SummaryPoll {
        loop {
            match self.phase {
                ArchivePhase::WaitingForFirstExport | ArchivePhase::ProcessingExports => {
                    return SummaryPoll::Ready;
                }
                ArchivePhase::WaitingForSize => {
                    let size = match self.take_pending() {
                        None => return SummaryPoll::Pending,
                        Some(request) => match request.take_size() {
                            Ok(size) => size,
                            Err(e) => return SummaryPoll::Failed(self.read_failed(e)),
                        },
                    };
                    if size < PROLOGUE_SIZE as u64 {
                        return SummaryPoll::Failed(LoadError::Truncated {
                            needed: PROLOGUE_SIZE as u64,
                            available: size,
                        });
                    }
                    self.file_size = Some(size);
                    let first = size.min(self.limits.max_summary.max(self.limits.min_summary));
                    trace!(path = self.path(), size, first, "summary read");
                    self.pending = Some(self.handle.read_request(0, first, i32::MAX, callback()));
                    self.phase = ArchivePhase::WaitingForSummary;
                }
                ArchivePhase::WaitingForSummary => {
                    let bytes = match self.take_pending() {
                        None => return SummaryPoll::Pending,
                        Some(request) => match request.take_bytes() {
                            Ok(bytes) => bytes,
                            Err(e) => return SummaryPoll::Failed(self.read_failed(e)),
                        },
                    };
                    let prologue = match Prologue::parse(&bytes) {
                        Ok(p) => p,
                        Err(e) => return SummaryPoll::Failed(e),
                    };
                    let header_size = prologue.header_size as u64;
                    let file_size = self.file_size.unwrap_or(0);
                    if header_size > self.limits.max_header {
                        return SummaryPoll::Failed(LoadError::HeaderTooLarge {
                            size: header_size,
                            limit: self.limits.max_header,
                        });
                    }
                    if header_size > file_size {
                        return SummaryPoll::Failed(LoadError::Truncated {
                            needed: header_size,
                            available: file_size,
                        });
                    }
                    self.header_size = Some(header_size);
                    self.window_start = 0;
                    self.window = bytes;
                    if header_size <= self.window.len() as u64 {
                        self.phase = ArchivePhase::WaitingForFirstExport;
                    } else {
                        // Keep the resident prefix, read only the tail.
                        let have = self.window.len() as u64;
                        debug!(path = self.path(), header_size, have, "header larger than first summary read");
                        self.pending = Some(self.handle.read_request(have, header_size - have, i32::MAX, callback()));
                        self.phase = ArchivePhase::WaitingForHeader;
                    }
                }
                ArchivePhase::WaitingForHeader => {
                    let tail = match self.take_pending() {
                        None => return SummaryPoll::Pending,
                        Some(request) => match request.take_bytes() {
                            Ok(bytes) => bytes,
                            Err(e) => return SummaryPoll::Failed(self.read_failed(e)),
                        },
                    };
                    self.window.extend_from_slice(&tail);
                    self.phase = ArchivePhase::WaitingForFirstExport;
                }
            }
        }
    }

    fn take_pending(&mut self) -> Option<AsyncReadRequest> {
        match &self.pending {
            Some(request) if request.poll_completion() => self.pending.take(),
            _ => None,
        }
    }

    fn read_failed(
        &self,
        error: FsError,
    ) -> LoadError {
        match error {
            FsError::NotFound { path } => LoadError::FileNotFound { path },
            other => LoadError::Io(other),
        }
    }

    /// Is a summary-phase read still outstanding?
    pub fn has_pending_read(&self) -> bool {
        self.pending.is_some()
    }

    /// Header bytes after the prologue, once the summary is ready.
    pub fn header_bytes(&self) -> Option<&[u8]> {
        let header_size = self.header_size? as usize;
        if self.window_start != 0 || self.window.len() < header_size {
            return None;
        }
        Some(&self.window[PROLOGUE_SIZE..header_size])
    }

    /// Is `[offset, offset + len)` inside the resident window?
    pub fn is_resident(
        &self,
        offset: u64,
        len: u64,
    ) -> bool {
        let window_end = self.window_start.saturating_add(self.window.len() as u64);
        offset >= self.window_start && offset.checked_add(len).is_some_and(|end| end <= window_end)
    }

    /// Bytes of the resident window, if `[offset, offset + len)` is inside it.
    pub fn slice(
        &self,
        offset: u64,
        len: u64,
    ) -> Option<&[u8]> {
        if !self.is_resident(offset, len) {
            return None;
        }
        let start = (offset - self.window_start) as usize;
        Some(&self.window[start..start + len as usize])
    }

    /// Make a completed precache read the current block.
    pub fn adopt_block(
        &mut self,
        offset: u64,
        bytes: Vec<u8>,
    ) {
        self.window_start = offset;
        self.window = bytes;
        self.phase = ArchivePhase::ProcessingExports;
    }

    /// Drop the current block.
    pub fn flush_block(&mut self) {
        self.window_start = 0;
        self.window = Vec::new();
    }

    pub fn block_range(&self) -> (u64, u64) {
        (self.window_start, self.window.len() as u64)
    }

    /// Read a range that is not resident and wait for it. Only used when an
    /// export's bytes were released before it could be serialized.
    ///
    /// Bytes already in the window are reused; only the missing head and
    /// tail of the range are read.
    pub fn read_blocking(
        &mut self,
        offset: u64,
        len: u64,
    ) -> Result<&[u8], FsError> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| self.out_of_range(offset, len))?;
        if !self.is_resident(offset, len) {
            let window_end = self.window_start + self.window.len() as u64;
            let overlap_start = offset.max(self.window_start);
            let overlap_end = end.min(window_end);
            let mut bytes = Vec::with_capacity(len as usize);
            if overlap_start < overlap_end {
                debug!(
                    path = self.path(),
                    offset,
                    len,
                    reused = overlap_end - overlap_start,
                    "blocking export read around the current block"
                );
                if offset < overlap_start {
                    bytes.extend(self.read_range(offset, overlap_start - offset)?);
                }
                let from = (overlap_start - self.window_start) as usize;
                let to = (overlap_end - self.window_start) as usize;
                bytes.extend_from_slice(&self.window[from..to]);
                if overlap_end < end {
                    bytes.extend(self.read_range(overlap_end, end - overlap_end)?);
                }
            } else {
                debug!(path = self.path(), offset, len, "blocking export read");
                bytes = self.read_range(offset, len)?;
            }
            self.window_start = offset;
            self.window = bytes;
        }
        self.slice(offset, len).ok_or_else(|| self.out_of_range(offset, len))
    }

    fn out_of_range(
        &self,
        offset: u64,
        len: u64,
    ) -> FsError {
        FsError::OutOfRange {
            path: self.path().to_string(),
            offset,
            len,
            size: self.file_size.unwrap_or(0),
        }
    }

    fn read_range(
        &self,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, FsError> {
        let request = self.handle.read_request(offset, len, i32::MAX, Box::new(|_| {}));
        request.wait_completion(None);
        request.take_bytes()
    }

    /// Cancel the outstanding summary read, handing it back so the caller
    /// can wait for it to drain.
    pub fn cancel(&mut self) -> Option<AsyncReadRequest> {
        let request = self.pending.take()?;
        request.cancel();
        Some(request)
    }
}

#[cfg(test)]
impl PrecacheArchive {
    pub(crate) fn window_len(&self) -> usize {
        self.window.len()
    }
}
