//! I/O completions crossing from file system threads into the loader
//!
//! Read callbacks run on whatever thread finished the read. They only push
//! onto [`IncomingQueue`]; the loader drains it on its own thread. The same
//! condvar wakes an idle loading thread for new requests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::runtime::io::{AsyncReadRequest, ReadCallback};
use crate::runtime::package::WeakPackageRef;

/// Identifies one precache read issued by a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReadToken(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCompletion {
    /// A summary phase read (size, summary or header tail) landed.
    Summary(WeakPackageRef),
    /// An export precache read landed.
    Read(ReadToken),
}

#[derive(Default)]
struct IncomingState {
    completions: Vec<IoCompletion>,
    woken: bool,
}

/// Thread-safe inbox of completions.
#[derive(Default)]
pub struct IncomingQueue {
    state: Mutex<IncomingState>,
    cond: Condvar,
}

impl IncomingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &self,
        completion: IoCompletion,
    ) {
        let mut state = self.state.lock();
        state.completions.push(completion);
        state.woken = true;
        self.cond.notify_all();
    }

    /// Wake a waiter without delivering anything.
    pub fn notify(&self) {
        self.state.lock().woken = true;
        self.cond.notify_all();
    }

    pub fn drain(&self) -> Vec<IoCompletion> {
        let mut state = self.state.lock();
        state.woken = false;
        std::mem::take(&mut state.completions)
    }

    pub fn len(&self) -> usize {
        self.state.lock().completions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().completions.is_empty()
    }

    /// Block until something is pushed or notified, or `timeout` elapses.
    /// Returns whether anything arrived.
    pub fn wait(
        &self,
        timeout: Duration,
    ) -> bool {
        let mut state = self.state.lock();
        if !state.woken {
            self.cond.wait_for(&mut state, timeout);
        }
        let woken = state.woken;
        state.woken = false;
        woken || !state.completions.is_empty()
    }

    /// Callback for a summary read of `package`.
    pub fn summary_callback(
        self: &Arc<Self>,
        package: WeakPackageRef,
    ) -> ReadCallback {
        let incoming = Arc::clone(self);
        Box::new(move |_canceled| incoming.push(IoCompletion::Summary(package)))
    }

    /// Callback for the precache read `token`.
    pub fn read_callback(
        self: &Arc<Self>,
        token: ReadToken,
    ) -> ReadCallback {
        let incoming = Arc::clone(self);
        Box::new(move |_canceled| incoming.push(IoCompletion::Read(token)))
    }
}

/// Loader-side bookkeeping of outstanding reads.
#[derive(Default)]
pub struct IoRegistry {
    next_token: u64,
    /// Precache reads and the package waiting on each.
    pub waiting_reads: HashMap<ReadToken, WeakPackageRef>,
    /// Packages with a summary read in flight.
    pub waiting_summaries: HashSet<WeakPackageRef>,
    /// Canceled reads that still have to drain before they are dropped.
    pub tombstones: Vec<AsyncReadRequest>,
}

impl IoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_token(&mut self) -> ReadToken {
        self.next_token += 1;
        ReadToken(self.next_token)
    }

    /// Any read the loader still expects to complete.
    pub fn any_outstanding(&self) -> bool {
        !self.waiting_reads.is_empty() || !self.waiting_summaries.is_empty()
    }

    /// Forget every read belonging to `package`.
    pub fn forget_package(
        &mut self,
        package: WeakPackageRef,
    ) {
        self.waiting_reads.retain(|_, p| *p != package);
        self.waiting_summaries.remove(&package);
    }

    /// Wait for every tombstone to drain, then drop them. Returns how many
    /// were freed.
    pub fn drain_tombstones(
        &mut self,
        timeout: Duration,
    ) -> usize {
        let freed = self.tombstones.len();
        for request in self.tombstones.drain(..) {
            request.wait_completion(Some(timeout));
        }
        freed
    }
}
