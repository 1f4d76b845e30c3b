//! State shared between the foreground thread, the loading thread and
//! I/O callbacks. Everything here is safe to touch without the core lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::incoming::IncomingQueue;
use super::request::{PackageRequest, QueuedRequest, RequestId, RequestQueue};
use crate::runtime::boot::BootNotificationManager;
use crate::runtime::error::{FatalError, RequestError};
use crate::runtime::io::AsyncFileSystem;
use crate::runtime::object::{LoadRequester, ObjectSerializer, ObjectStore};
use crate::runtime::package::LiveToken;
use crate::runtime::precache::IoThrottle;
use crate::util::config::LoaderConfig;

/// Liveness signal emitted while a flush spins.
pub trait Heartbeat: Send + Sync {
    fn beat(&self);
}

/// Logs each beat at trace level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceHeartbeat;

impl Heartbeat for TraceHeartbeat {
    fn beat(&self) {
        trace!("loader heartbeat");
    }
}

/// Loader statistics.
#[derive(Debug, Default)]
pub struct LoaderStats {
    /// Loaders created.
    pub packages_created: AtomicUsize,
    /// Loaders whose callbacks fired with success.
    pub packages_completed: AtomicUsize,
    /// Loaders whose callbacks fired with failure.
    pub packages_failed: AtomicUsize,
    /// Loaders canceled.
    pub packages_canceled: AtomicUsize,
    /// Events executed.
    pub events_executed: AtomicUsize,
    /// Precache reads issued.
    pub reads_issued: AtomicUsize,
    /// Bytes delivered by precache reads.
    pub bytes_read: AtomicU64,
    /// Idle cycle checks run.
    pub cycle_checks: AtomicUsize,
}

/// Plain copy of [`LoaderStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packages_created: usize,
    pub packages_completed: usize,
    pub packages_failed: usize,
    pub packages_canceled: usize,
    pub events_executed: usize,
    pub reads_issued: usize,
    pub bytes_read: u64,
    pub cycle_checks: usize,
}

impl LoaderStats {
    #[inline]
    pub fn record_event(&self) {
        self.events_executed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_read(
        &self,
        bytes: u64,
    ) {
        self.reads_issued.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packages_created: self.packages_created.load(Ordering::Relaxed),
            packages_completed: self.packages_completed.load(Ordering::Relaxed),
            packages_failed: self.packages_failed.load(Ordering::Relaxed),
            packages_canceled: self.packages_canceled.load(Ordering::Relaxed),
            events_executed: self.events_executed.load(Ordering::Relaxed),
            reads_issued: self.reads_issued.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            cycle_checks: self.cycle_checks.load(Ordering::Relaxed),
        }
    }
}

pub struct Shared {
    pub config: LoaderConfig,
    pub fs: Arc<dyn AsyncFileSystem>,
    pub store: Arc<ObjectStore>,
    pub serializer: Arc<dyn ObjectSerializer>,
    pub boot: BootNotificationManager,
    pub heartbeat: Arc<dyn Heartbeat>,
    pub incoming: Arc<IncomingQueue>,
    pub requests: RequestQueue,
    pub throttle: IoThrottle,
    pub stats: LoaderStats,
    next_request_id: AtomicU64,
    pending_ids: Mutex<HashSet<RequestId>>,
    progress: Mutex<HashMap<String, f32>>,
    live_loaders: Arc<AtomicUsize>,
    /// Loaders created and not yet finished or canceled.
    in_flight: AtomicUsize,
    /// Loaders in the active list, published by the loading thread.
    async_packages: AtomicUsize,
    initial_load: AtomicBool,
    suspend_count: AtomicUsize,
    shutdown: AtomicBool,
    fatal: Mutex<Option<FatalError>>,
}

impl Shared {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: LoaderConfig,
        fs: Arc<dyn AsyncFileSystem>,
        store: Arc<ObjectStore>,
        serializer: Arc<dyn ObjectSerializer>,
        boot: BootNotificationManager,
        heartbeat: Arc<dyn Heartbeat>,
    ) -> Self {
        let throttle = IoThrottle::new(config.throttle_budget(), config.max_incoming_backlog);
        let initial_load = config.initial_load;
        Self {
            config,
            fs,
            store,
            serializer,
            boot,
            heartbeat,
            incoming: Arc::new(IncomingQueue::new()),
            requests: RequestQueue::new(),
            throttle,
            stats: LoaderStats::default(),
            next_request_id: AtomicU64::new(1),
            pending_ids: Mutex::new(HashSet::new()),
            progress: Mutex::new(HashMap::new()),
            live_loaders: Arc::new(AtomicUsize::new(0)),
            in_flight: AtomicUsize::new(0),
            async_packages: AtomicUsize::new(0),
            initial_load: AtomicBool::new(initial_load),
            suspend_count: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            fatal: Mutex::new(None),
        }
    }

    /// Validate and queue a request. Callable from any thread.
    pub fn enqueue(
        &self,
        request: PackageRequest,
    ) -> Result<RequestId, RequestError> {
        if self.is_shut_down() {
            return Err(RequestError::ShutDown);
        }
        request.validate()?;
        let id = RequestId(self.next_request_id.fetch_add(1, Ordering::SeqCst));
        debug!(request_id = %id, package = %request.name, priority = request.priority, "load requested");
        self.pending_ids.lock().insert(id);
        self.requests.push(QueuedRequest { id, request });
        self.incoming.notify();
        Ok(id)
    }

    pub fn is_request_complete(
        &self,
        id: RequestId,
    ) -> bool {
        id.0 < self.next_request_id.load(Ordering::SeqCst) && !self.pending_ids.lock().contains(&id)
    }

    pub fn complete_requests(
        &self,
        ids: &[RequestId],
    ) {
        let mut pending = self.pending_ids.lock();
        for id in ids {
            pending.remove(id);
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.pending_ids.lock().len()
    }

    pub fn live_token(&self) -> LiveToken {
        LiveToken::new(&self.live_loaders)
    }

    pub fn live_loaders(&self) -> usize {
        self.live_loaders.load(Ordering::SeqCst)
    }

    pub fn note_package_created(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.stats.packages_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_package_finished(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn set_async_packages(
        &self,
        count: usize,
    ) {
        self.async_packages.store(count, Ordering::SeqCst);
    }

    pub fn async_packages(&self) -> usize {
        self.async_packages.load(Ordering::SeqCst)
    }

    pub fn is_loading(&self) -> bool {
        self.pending_requests() > 0 || self.in_flight() > 0
    }

    /// Raise the published progress of `name`; it never goes down.
    pub fn publish_progress(
        &self,
        name: &str,
        percent: f32,
    ) {
        let mut progress = self.progress.lock();
        let entry = progress.entry(name.to_string()).or_insert(0.0);
        if percent > *entry {
            *entry = percent;
        }
    }

    pub fn clear_progress(
        &self,
        name: &str,
    ) {
        self.progress.lock().remove(name);
    }

    pub fn progress(
        &self,
        name: &str,
    ) -> Option<f32> {
        self.progress.lock().get(name).copied()
    }

    pub fn is_initial_load(&self) -> bool {
        self.initial_load.load(Ordering::SeqCst)
    }

    pub fn end_initial_load(&self) {
        self.initial_load.store(false, Ordering::SeqCst);
    }

    pub fn suspend_count(&self) -> usize {
        self.suspend_count.load(Ordering::SeqCst)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend_count() > 0
    }

    pub fn suspend(&self) -> usize {
        self.suspend_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn resume(&self) -> Result<usize, RequestError> {
        let previous = self
            .suspend_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .map_err(|_| RequestError::NotSuspended)?;
        if previous == 1 {
            self.incoming.notify();
        }
        Ok(previous - 1)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.incoming.notify();
    }

    /// Remember the first fatal error; later ones are dropped.
    pub fn set_fatal(
        &self,
        error: FatalError,
    ) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(error);
        }
    }

    pub fn fatal(&self) -> Option<FatalError> {
        self.fatal.lock().clone()
    }
}

impl LoadRequester for Shared {
    fn request_load(
        &self,
        request: PackageRequest,
    ) -> Result<RequestId, RequestError> {
        self.enqueue(request)
    }
}
