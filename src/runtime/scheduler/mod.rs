//! Load scheduler
//!
//! [`AsyncLoader`] is the client-facing loader. It owns the shared state
//! (request queue, I/O inbox, throttle, statistics) and the
//! [`LoaderCore`] behind a mutex, and optionally a background loading
//! thread that runs the graph side of loading. The foreground thread, the
//! one that built the loader, always runs postload and delivers callbacks.

pub mod context;
pub mod engine;
pub mod incoming;
pub mod queue;
pub mod request;
pub mod shared;

pub use context::{LoadContext, TimeBudget};
pub use engine::{AsyncStatus, LoaderCore};
pub use incoming::{IncomingQueue, IoCompletion, IoRegistry, ReadToken};
pub use queue::{Event, EventKind, EventQueue, LoadOrder};
pub use request::{
    validate_package_name, LoadCallback, LoadFlags, LoadResult, PackageRequest, QueuedRequest, RequestId,
    RequestQueue,
};
pub use shared::{Heartbeat, LoaderStats, Shared, StatsSnapshot, TraceHeartbeat};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::runtime::boot::{BootNotificationManager, BootstrapRegistry, NoBootstrap};
use crate::runtime::error::{FatalError, LoaderError, RequestError};
use crate::runtime::io::AsyncFileSystem;
use crate::runtime::object::{DefaultSerializer, ObjectSerializer, ObjectStore};
use crate::runtime::package::Completion;
use crate::util::config::{ConfigError, LoaderConfig};

/// Time slice of one background loading pass.
const BACKGROUND_SLICE: Duration = Duration::from_millis(5);
/// How long an idle loading thread sleeps before looking again.
const BACKGROUND_IDLE_WAIT: Duration = Duration::from_millis(50);
/// Sleep between flush iterations while the loading thread works.
const FLUSH_SLEEP: Duration = Duration::from_millis(1);

/// Result of a [`tick`](AsyncLoader::tick).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickState {
    /// No request is pending and no package is in flight.
    Complete,
    /// Work remains: out of time, waiting for I/O, or new requests arrived.
    TimedOut,
}

/// Builder for [`AsyncLoader`].
pub struct AsyncLoaderBuilder {
    config: LoaderConfig,
    fs: Option<Arc<dyn AsyncFileSystem>>,
    store: Option<Arc<ObjectStore>>,
    serializer: Arc<dyn ObjectSerializer>,
    bootstrap: Arc<dyn BootstrapRegistry>,
    heartbeat: Arc<dyn Heartbeat>,
}

impl AsyncLoaderBuilder {
    pub fn new() -> Self {
        Self {
            config: LoaderConfig::default(),
            fs: None,
            store: None,
            serializer: Arc::new(DefaultSerializer),
            bootstrap: Arc::new(NoBootstrap),
            heartbeat: Arc::new(TraceHeartbeat),
        }
    }

    pub fn config(
        mut self,
        config: LoaderConfig,
    ) -> Self {
        self.config = config;
        self
    }

    pub fn file_system(
        mut self,
        fs: Arc<dyn AsyncFileSystem>,
    ) -> Self {
        self.fs = Some(fs);
        self
    }

    /// Share an existing object store; a fresh one is created otherwise.
    pub fn store(
        mut self,
        store: Arc<ObjectStore>,
    ) -> Self {
        self.store = Some(store);
        self
    }

    pub fn serializer(
        mut self,
        serializer: Arc<dyn ObjectSerializer>,
    ) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn bootstrap(
        mut self,
        bootstrap: Arc<dyn BootstrapRegistry>,
    ) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn heartbeat(
        mut self,
        heartbeat: Arc<dyn Heartbeat>,
    ) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Validate the configuration and start the loader. With
    /// `use_background_thread` the loading thread is spawned here.
    pub fn build(self) -> Result<AsyncLoader, LoaderError> {
        self.config.validate()?;
        let fs = self.fs.ok_or(ConfigError::Invalid {
            field: "file_system",
            reason: "a file system is required",
        })?;
        let store = self.store.unwrap_or_else(|| Arc::new(ObjectStore::new()));
        let threaded = self.config.use_background_thread;
        let shared = Arc::new(Shared::new(
            self.config,
            fs,
            store,
            self.serializer,
            BootNotificationManager::new(self.bootstrap),
            self.heartbeat,
        ));
        let core = Arc::new(Mutex::new(LoaderCore::new(Arc::clone(&shared))));

        let thread = if threaded {
            let shared = Arc::clone(&shared);
            let core = Arc::clone(&core);
            let handle = thread::Builder::new()
                .name("asyncload".to_string())
                .spawn(move || loading_thread(&shared, &core))
                .map_err(|e| FatalError::Background { message: e.to_string() })?;
            Some(handle)
        } else {
            None
        };
        info!(threaded, "async loader started");

        Ok(AsyncLoader {
            shared,
            core,
            thread,
            foreground: thread::current().id(),
            flush_depth: AtomicUsize::new(0),
            in_tick: AtomicBool::new(false),
        })
    }
}

impl Default for AsyncLoaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Background loading thread main loop.
fn loading_thread(
    shared: &Arc<Shared>,
    core: &Arc<Mutex<LoaderCore>>,
) {
    debug!("loading thread running");
    while !shared.is_shut_down() {
        let status = {
            let mut core = core.lock();
            core.process_async_loading(&TimeBudget::new(Some(BACKGROUND_SLICE)), false)
        };
        match status {
            Ok(AsyncStatus::TimedOut) => continue,
            Ok(_) => {
                shared.incoming.wait(BACKGROUND_IDLE_WAIT);
            }
            Err(fatal) => {
                error!(error = %fatal, "loading thread stopped");
                shared.set_fatal(fatal);
                break;
            }
        }
    }
    debug!("loading thread exiting");
}

/// Clears a flag when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Decrements a depth counter when dropped.
struct DepthGuard<'a>(&'a AtomicUsize);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The asynchronous package loader.
///
/// `request_load` and the status queries may be called from any thread.
/// `tick`, `flush`, `cancel_all`, `suspend` and `resume` belong to the
/// thread that built the loader.
pub struct AsyncLoader {
    shared: Arc<Shared>,
    core: Arc<Mutex<LoaderCore>>,
    thread: Option<JoinHandle<()>>,
    foreground: ThreadId,
    flush_depth: AtomicUsize,
    in_tick: AtomicBool,
}

impl AsyncLoader {
    pub fn builder() -> AsyncLoaderBuilder {
        AsyncLoaderBuilder::new()
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.shared.store
    }

    fn check_foreground(
        &self,
        operation: &'static str,
    ) -> Result<(), RequestError> {
        if thread::current().id() != self.foreground {
            return Err(RequestError::NotForegroundThread { operation });
        }
        Ok(())
    }

    fn check_fatal(&self) -> Result<(), LoaderError> {
        match self.shared.fatal() {
            Some(fatal) => Err(fatal.into()),
            None => Ok(()),
        }
    }

    /// Queue a package load. Callable from any thread; wakes the loading
    /// thread.
    pub fn request_load(
        &self,
        request: PackageRequest,
    ) -> Result<RequestId, RequestError> {
        self.shared.enqueue(request)
    }

    /// Has the callback of request `id` been delivered?
    pub fn is_request_complete(
        &self,
        id: RequestId,
    ) -> bool {
        self.shared.is_request_complete(id)
    }

    /// Requests not yet turned into package loaders.
    pub fn num_queued_packages(&self) -> usize {
        self.shared.requests.len()
    }

    /// Packages still in the graph phase of loading.
    pub fn num_async_packages(&self) -> usize {
        self.shared.async_packages()
    }

    /// Package loaders alive right now, finished or not.
    pub fn live_package_loaders(&self) -> usize {
        self.shared.live_loaders()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.is_loading()
    }

    pub fn is_loading_multithreaded(&self) -> bool {
        self.thread.is_some()
    }

    /// Progress of package `name` in percent, or -1 if it is not loading.
    pub fn get_percent_complete(
        &self,
        name: &str,
    ) -> f32 {
        self.shared.progress(name).unwrap_or(-1.0)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Run one slice of loading on the foreground thread.
    ///
    /// Without a loading thread this drives the graph as well; with one it
    /// only postloads packages the loading thread has finished. With
    /// `use_full_time_limit` an idle loader waits for outstanding I/O
    /// instead of returning early. `filter` holds back packages whose name
    /// it rejects.
    pub fn tick(
        &self,
        use_time_limit: bool,
        use_full_time_limit: bool,
        time_limit: Duration,
        filter: Option<&dyn Fn(&str) -> bool>,
    ) -> Result<TickState, LoaderError> {
        self.check_foreground("tick")?;
        self.check_fatal()?;
        if self.in_tick.swap(true, Ordering::SeqCst) {
            return Err(RequestError::ReentrantTick.into());
        }
        let budget = TimeBudget::new(use_time_limit.then_some(time_limit));
        let completions = {
            let _in_tick = FlagGuard(&self.in_tick);
            let mut core = self.core.lock();
            if self.thread.is_none() {
                if let Err(fatal) = core.process_async_loading(&budget, use_full_time_limit) {
                    self.shared.set_fatal(fatal.clone());
                    return Err(fatal.into());
                }
            }
            let (completions, _) = core.process_loaded(&budget, filter);
            completions
        };
        self.deliver(completions);

        if use_time_limit {
            self.warn_if_time_limit_exceeded(&budget, time_limit);
        }
        if self.shared.is_loading() {
            Ok(TickState::TimedOut)
        } else {
            Ok(TickState::Complete)
        }
    }

    fn warn_if_time_limit_exceeded(
        &self,
        budget: &TimeBudget,
        time_limit: Duration,
    ) {
        let config = &self.shared.config;
        if !config.warn_if_time_limit_exceeded {
            return;
        }
        let elapsed = budget.elapsed();
        let threshold = time_limit.mul_f64(config.time_limit_exceeded_multiplier);
        if elapsed > threshold && elapsed > config.time_limit_exceeded_min_time() {
            warn!(
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                limit_ms = time_limit.as_secs_f64() * 1000.0,
                "tick exceeded its time limit"
            );
        }
    }

    /// Fire callbacks, then mark their requests complete. Runs without the
    /// core lock so callbacks may queue more loads or flush.
    fn deliver(
        &self,
        completions: Vec<Completion>,
    ) {
        for completion in completions {
            let Completion {
                name,
                object,
                result,
                callbacks,
                request_ids,
                ..
            } = completion;
            for callback in callbacks {
                callback(&name, object.clone(), result);
            }
            self.shared.complete_requests(&request_ids);
        }
    }

    /// Tick without a time limit until request `id` (or every request)
    /// is complete.
    pub fn flush(
        &self,
        id: Option<RequestId>,
    ) -> Result<(), LoaderError> {
        self.check_foreground("flush")?;
        if self.shared.is_suspended() {
            return Err(RequestError::Suspended.into());
        }
        let depth = self.flush_depth.fetch_add(1, Ordering::SeqCst) + 1;
        let _depth = DepthGuard(&self.flush_depth);
        if depth > self.shared.config.max_flush_depth {
            return Err(RequestError::FlushRecursion { depth }.into());
        }

        let heartbeat_every = self.shared.config.heartbeat_every.max(1);
        let mut iterations = 0usize;
        loop {
            let done = match id {
                Some(id) => self.shared.is_request_complete(id),
                None => !self.shared.is_loading(),
            };
            if done {
                break;
            }
            let state = self.tick(false, true, Duration::ZERO, None)?;
            iterations += 1;
            if iterations % heartbeat_every == 0 {
                self.shared.heartbeat.beat();
            }
            if state == TickState::Complete {
                continue;
            }
            if self.thread.is_some() {
                thread::sleep(FLUSH_SLEEP);
            } else if self.shared.boot.has_waiting() && self.core.lock().loaded_len() == 0 {
                // Nothing but compiled-in objects left to wait for, and
                // only the bootstrap registry can finish them.
                return Err(FatalError::MissingBootstrapDependency {
                    paths: self.shared.boot.waiting_paths(),
                }
                .into());
            }
        }
        debug!(iterations, "flush finished");
        Ok(())
    }

    /// Cancel every queued request and in-flight package; each callback
    /// fires with [`LoadResult::Canceled`]. Refused while packages are
    /// linked to each other through the graph: flush instead.
    pub fn cancel_all(&self) -> Result<(), LoaderError> {
        self.check_foreground("cancel_all")?;
        let completions = self.core.lock().cancel_all()?;
        self.deliver(completions);
        Ok(())
    }

    /// Pause loading. Nests: each call needs a matching [`resume`](Self::resume).
    pub fn suspend(&self) -> Result<usize, RequestError> {
        self.check_foreground("suspend")?;
        let count = self.shared.suspend();
        debug!(count, "loading suspended");
        Ok(count)
    }

    pub fn resume(&self) -> Result<usize, RequestError> {
        self.check_foreground("resume")?;
        let count = self.shared.resume()?;
        debug!(count, "loading resumed");
        Ok(count)
    }

    /// Forward a registration event of a compiled-in object to the
    /// bootstrap registry and wake the loader.
    pub fn notify_registration_event(
        &self,
        package: &str,
        name: &str,
        completed: bool,
    ) {
        self.shared.boot.notify_registration_event(package, name, completed);
        self.shared.incoming.notify();
    }

    /// Leave initial load. Fails if imports still wait on compiled-in
    /// objects that never finished registering.
    pub fn finish_initial_load(&self) -> Result<(), FatalError> {
        if self.shared.boot.has_waiting() {
            let fatal = FatalError::MissingBootstrapDependency {
                paths: self.shared.boot.waiting_paths(),
            };
            error!(error = %fatal, "initial load finished with unresolved imports");
            self.shared.set_fatal(fatal.clone());
            return Err(fatal);
        }
        self.shared.end_initial_load();
        Ok(())
    }

    /// Stop the loading thread and drain canceled reads. Further requests
    /// are rejected.
    pub fn shutdown(&mut self) {
        if self.shared.is_shut_down() {
            return;
        }
        self.shared.shut_down();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("loading thread panicked");
            }
        }
        self.core.lock().shutdown();
        info!("async loader shut down");
    }
}

impl Drop for AsyncLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests;
