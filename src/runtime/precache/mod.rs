//! Precache: turning export I/O into a few large reads
//!
//! - [`plan_read`] merges neighbouring exports into one read
//! - [`IoThrottle`] stops new reads while too many completed bytes sit unconsumed
//! - [`PrecacheArchive`] owns a package's file handle, runs the summary
//!   read phases and holds the current block of export bytes

mod archive;

pub use archive::{ArchivePhase, PrecacheArchive, SummaryLimits, SummaryPoll};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::info;

/// Limits on how far a single precache read may grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecacheLimits {
    /// Largest merged read in bytes.
    pub max_block: u64,
    /// Largest span of export indices in one read.
    pub max_exports: u32,
    /// Largest unused gap between two merged exports.
    pub max_skip: u64,
}

impl Default for PrecacheLimits {
    fn default() -> Self {
        Self {
            max_block: 1024 * 1024,
            max_exports: 20,
            max_skip: 48 * 1024,
        }
    }
}

/// Byte range of one export in the package file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSpan {
    pub index: u32,
    pub offset: u64,
    pub size: u64,
}

impl ExportSpan {
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }
}

/// One planned read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPlan {
    pub offset: u64,
    pub len: u64,
    pub first: u32,
    pub last: u32,
    /// Exports whose I/O this read satisfies, in order.
    pub exports: Vec<u32>,
}

/// Result of [`plan_read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Planned {
    pub read: ReadPlan,
    /// Leading entries of `following` merged into the read.
    pub merged: usize,
    /// An entry of `following` found already resident in the current
    /// block; it should be released instead of read.
    pub resident: Option<u32>,
}

/// Plan a read starting at `first`, greedily merging entries of
/// `following` (the next exports waiting for I/O, in ascending offset
/// order) while the gap, size and index-span limits allow.
///
/// Merging stops at the first export already covered by an outstanding
/// request, including any export between the last merged index and the
/// candidate.
pub fn plan_read(
    first: ExportSpan,
    following: &[ExportSpan],
    limits: &PrecacheLimits,
    coalesce: bool,
    is_covered: &dyn Fn(u32) -> bool,
    is_resident: &dyn Fn(&ExportSpan) -> bool,
) -> Planned {
    let mut read = ReadPlan {
        offset: first.offset,
        len: first.size,
        first: first.index,
        last: first.index,
        exports: vec![first.index],
    };
    let mut merged = 0;
    let mut resident = None;
    if coalesce {
        for next in following {
            if next.index <= read.last || next.index - read.first > limits.max_exports {
                break;
            }
            if is_resident(next) {
                resident = Some(next.index);
                break;
            }
            let end = read.offset + read.len;
            let Some(gap) = next.offset.checked_sub(end) else {
                break;
            };
            if gap > limits.max_skip || next.end() - read.offset > limits.max_block {
                break;
            }
            if (read.last + 1..=next.index).any(|i| is_covered(i)) {
                break;
            }
            read.len = next.end() - read.offset;
            read.last = next.index;
            read.exports.push(next.index);
            merged += 1;
        }
    }
    Planned {
        read,
        merged,
        resident,
    }
}

/// Back-pressure on precache reads.
///
/// Completed reads add their size to the unprocessed counter; consuming a
/// block subtracts it. Above the budget no new reads are admitted until
/// consumption brings the counter back down.
#[derive(Debug)]
pub struct IoThrottle {
    unprocessed: AtomicU64,
    accepting: AtomicBool,
    budget: u64,
    incoming_limit: usize,
}

/// A change of admission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleChange {
    Paused,
    Resumed,
}

impl IoThrottle {
    pub fn new(
        budget: u64,
        incoming_limit: usize,
    ) -> Self {
        Self {
            unprocessed: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            budget,
            incoming_limit,
        }
    }

    #[inline]
    pub fn accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn unprocessed(&self) -> u64 {
        self.unprocessed.load(Ordering::SeqCst)
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// A read completed and its bytes await consumption.
    pub fn request_ready(
        &self,
        size: u64,
    ) -> Option<ThrottleChange> {
        self.unprocessed.fetch_add(size, Ordering::SeqCst);
        self.update()
    }

    /// A completed read was consumed or discarded.
    pub fn finish_request(
        &self,
        size: u64,
    ) -> Option<ThrottleChange> {
        let _ = self
            .unprocessed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(size)));
        self.update()
    }

    /// Too many completions waiting to be processed also pauses admission.
    pub fn note_incoming_backlog(
        &self,
        pending: usize,
    ) -> Option<ThrottleChange> {
        if pending > self.incoming_limit && self.accepting.swap(false, Ordering::SeqCst) {
            info!(pending, "Throttling off precacher: incoming backlog");
            return Some(ThrottleChange::Paused);
        }
        None
    }

    /// Re-evaluate admission against the byte budget.
    pub fn update(&self) -> Option<ThrottleChange> {
        let unprocessed = self.unprocessed();
        if unprocessed > self.budget {
            if self.accepting.swap(false, Ordering::SeqCst) {
                info!(
                    unprocessed_mb = unprocessed as f64 / (1024.0 * 1024.0),
                    "Throttling off precacher"
                );
                return Some(ThrottleChange::Paused);
            }
        } else if !self.accepting.swap(true, Ordering::SeqCst) {
            info!(
                unprocessed_mb = unprocessed as f64 / (1024.0 * 1024.0),
                "Resuming precacher"
            );
            return Some(ThrottleChange::Resumed);
        }
        None
    }
}

#[cfg(test)]
mod tests;
