//! The loading loop
//!
//! [`LoaderCore`] owns every package, the event graph and the event queue.
//! It lives behind one lock: the loading thread (or the foreground thread
//! when there is no loading thread) runs [`LoaderCore::process_async_loading`],
//! and the foreground thread runs [`LoaderCore::process_loaded`] to postload
//! finished packages. Callbacks are handed back to the caller to run after
//! the lock is released.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexSet;
use tracing::{debug, error, info, trace, warn};

use super::context::{LoadContext, TimeBudget};
use super::incoming::{IoCompletion, IoRegistry};
use super::queue::{EventKind, EventQueue, LoadOrder, SYSTEM_PRIORITY_MAX};
use super::request::{LoadResult, QueuedRequest};
use super::shared::Shared;
use crate::runtime::dag::EventGraph;
use crate::runtime::error::{FatalError, RequestError};
use crate::runtime::object::DefaultObjectBuilder;
use crate::runtime::package::{Completion, PackageDesc, PackageState, PackageTable, WeakPackageRef};

/// How long canceled reads get to drain.
const TOMBSTONE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one pass of [`LoaderCore::process_async_loading`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncStatus {
    /// Nothing queued and no I/O outstanding.
    Idle,
    /// Only I/O is left and the caller did not allow waiting for it.
    WaitingForIo,
    /// Suspended by the foreground.
    Suspended,
    TimedOut,
}

pub struct LoaderCore {
    shared: Arc<Shared>,
    packages: PackageTable,
    graph: EventGraph,
    events: EventQueue,
    io: IoRegistry,
    defaults: DefaultObjectBuilder,
    ready_for_tick: VecDeque<WeakPackageRef>,
    throttled: IndexSet<WeakPackageRef>,
    known_missing: HashSet<String>,
    order: LoadOrder,
    /// Packages past the graph, waiting for foreground postload.
    loaded: VecDeque<WeakPackageRef>,
    /// Finished packages still referenced by in-flight importers.
    to_delete: Vec<WeakPackageRef>,
}

impl LoaderCore {
    pub fn new(shared: Arc<Shared>) -> Self {
        let order = LoadOrder::from_seed(shared.config.randomize_load_order);
        if order.is_randomized() {
            warn!("load order is randomized; use only to shake out ordering bugs");
        }
        Self {
            shared,
            packages: PackageTable::new(),
            graph: EventGraph::new(),
            events: EventQueue::new(),
            io: IoRegistry::new(),
            defaults: DefaultObjectBuilder::new(),
            ready_for_tick: VecDeque::new(),
            throttled: IndexSet::new(),
            known_missing: HashSet::new(),
            order,
            loaded: VecDeque::new(),
            to_delete: Vec::new(),
        }
    }

    fn context<'a>(
        &'a mut self,
        budget: &'a TimeBudget,
    ) -> LoadContext<'a> {
        LoadContext {
            shared: &self.shared,
            budget,
            packages: &mut self.packages,
            graph: &mut self.graph,
            events: &mut self.events,
            io: &mut self.io,
            defaults: &mut self.defaults,
            ready_for_tick: &mut self.ready_for_tick,
            throttled: &mut self.throttled,
            known_missing: &mut self.known_missing,
            order: &mut self.order,
        }
    }

    pub fn packages(&self) -> &PackageTable {
        &self.packages
    }

    pub fn graph(&self) -> &EventGraph {
        &self.graph
    }

    /// Packages waiting for [`process_loaded`](Self::process_loaded).
    pub fn loaded_len(&self) -> usize {
        self.loaded.len()
    }

    /// Run the graph side of loading until out of work or out of time.
    ///
    /// With `wait_for_io`, an otherwise idle pass blocks on outstanding
    /// reads (bounded by the budget and `io_wait_forever`).
    pub fn process_async_loading(
        &mut self,
        budget: &TimeBudget,
        wait_for_io: bool,
    ) -> Result<AsyncStatus, FatalError> {
        let status = loop {
            self.process_incoming(budget)?;
            if self.shared.is_suspended() {
                break AsyncStatus::Suspended;
            }
            self.create_requested_packages(budget)?;
            self.requeue_throttled(budget)?;

            let mut did_something = false;
            if let Some(event) = self.events.pop() {
                self.execute(event.package, event.kind, budget)?;
                did_something = true;
            } else if self.route_boot_completions(budget)? {
                did_something = true;
            }
            self.move_ready_for_tick();

            if !did_something {
                if !self.shared.incoming.is_empty() || !self.shared.requests.is_empty() {
                    continue;
                }
                if self.io.any_outstanding() {
                    if !wait_for_io || budget.exceeded() {
                        break AsyncStatus::WaitingForIo;
                    }
                    self.wait_for_io(budget);
                    continue;
                }
                if self.shared.boot.has_waiting() && self.shared.boot.construct_waiting_boot_objects() {
                    continue;
                }
                self.check_idle_graph()?;
                break AsyncStatus::Idle;
            }
            if budget.exceeded() {
                break AsyncStatus::TimedOut;
            }
        };
        self.shared.set_async_packages(self.packages.active_len());
        Ok(status)
    }

    fn wait_for_io(
        &mut self,
        budget: &TimeBudget,
    ) {
        let forever = self.shared.config.io_wait_forever();
        let timeout = budget.remaining().map_or(forever, |r| r.min(forever));
        if !self.shared.incoming.wait(timeout) && timeout == forever {
            warn!(
                seconds = forever.as_secs(),
                summaries = self.io.waiting_summaries.len(),
                reads = self.io.waiting_reads.len(),
                "waited for I/O without any completion"
            );
        }
    }

    /// Drain completions pushed by file system threads.
    fn process_incoming(
        &mut self,
        budget: &TimeBudget,
    ) -> Result<(), FatalError> {
        let backlog = self.shared.incoming.len();
        if backlog == 0 {
            return Ok(());
        }
        self.shared.throttle.note_incoming_backlog(backlog);
        for completion in self.shared.incoming.drain() {
            match completion {
                IoCompletion::Summary(weak) => {
                    if !self.io.waiting_summaries.remove(&weak) {
                        continue;
                    }
                    if let Some(package) = self.packages.get(weak) {
                        let priority = package.priority();
                        self.events.schedule(
                            &mut self.order,
                            weak,
                            priority,
                            EventKind::FinishLinker,
                            SYSTEM_PRIORITY_MAX,
                        );
                    }
                }
                IoCompletion::Read(token) => {
                    let Some(weak) = self.io.waiting_reads.remove(&token) else {
                        trace!(token = token.0, "completion of a forgotten read");
                        continue;
                    };
                    let mut package = self.packages.check_out(weak)?;
                    let ready = {
                        let mut cx = self.context(budget);
                        package.precache_request_ready(token, &mut cx)
                    };
                    self.packages.check_in(package);
                    if let Some(bytes) = ready {
                        self.shared.throttle.request_ready(bytes);
                    }
                }
            }
        }
        self.shared.throttle.update();
        Ok(())
    }

    /// Turn queued requests into loaders, highest priority first.
    fn create_requested_packages(
        &mut self,
        budget: &TimeBudget,
    ) -> Result<(), FatalError> {
        if self.shared.requests.is_empty() {
            return Ok(());
        }
        for QueuedRequest { id, request } in self.shared.requests.drain_by_priority() {
            let priority = request.priority;
            let existing = self.packages.find_by_name(&request.name);
            let weak = match existing {
                Some(weak) => {
                    debug!(package = %request.name, request_id = %id, "joining in-flight load");
                    weak
                }
                None => {
                    debug!(package = %request.name, request_id = %id, priority, "creating package loader");
                    let mut desc = PackageDesc::new(request.name.clone()).with_priority(priority);
                    if let Some(name_to_load) = request.name_to_load.clone() {
                        desc.name_to_load = name_to_load;
                    }
                    desc.guid = request.guid;
                    desc.flags = request.flags;
                    self.context(budget).insert_package(desc, None)?
                }
            };
            let Some(package) = self.packages.get_mut(weak) else {
                return Err(FatalError::StalePackage { package: weak });
            };
            package.add_request(id, request.callback);
            if package.raise_priority(priority) {
                self.packages.activate(weak, priority);
            }
        }
        Ok(())
    }

    /// Packages that held back I/O while the throttle was closed get
    /// another look once it opens.
    fn requeue_throttled(
        &mut self,
        budget: &TimeBudget,
    ) -> Result<(), FatalError> {
        if self.throttled.is_empty() || !self.shared.throttle.accepting() {
            return Ok(());
        }
        for weak in std::mem::take(&mut self.throttled) {
            if !self.packages.contains(weak) {
                continue;
            }
            let mut package = self.packages.check_out(weak)?;
            {
                let mut cx = self.context(budget);
                package.resume_io(&mut cx);
            }
            self.packages.check_in(package);
        }
        Ok(())
    }

    fn execute(
        &mut self,
        weak: WeakPackageRef,
        kind: EventKind,
        budget: &TimeBudget,
    ) -> Result<(), FatalError> {
        let mut package = self.packages.check_out(weak)?;
        trace!(package = %package.name(), event = ?kind, "executing event");
        let result = {
            let mut cx = self.context(budget);
            package.execute(kind, &mut cx)
        };
        self.packages.check_in(package);
        self.shared.stats.record_event();
        result?;
        if self.graph.has_fired() {
            self.context(budget).route_fired(None)?;
        }
        Ok(())
    }

    /// Deliver import nodes whose compiled-in objects finished registering.
    fn route_boot_completions(
        &mut self,
        budget: &TimeBudget,
    ) -> Result<bool, FatalError> {
        if !self.shared.is_initial_load() || !self.shared.boot.has_waiting() {
            return Ok(false);
        }
        let nodes = self.shared.boot.take_completed();
        if nodes.is_empty() {
            return Ok(false);
        }
        for node in nodes {
            if !self.packages.contains(node.package) {
                continue;
            }
            let mut package = self.packages.check_out(node.package)?;
            let result = {
                let mut cx = self.context(budget);
                package.fire_node(node, &mut cx)
            };
            self.packages.check_in(package);
            result?;
        }
        Ok(true)
    }

    fn move_ready_for_tick(&mut self) {
        while let Some(weak) = self.ready_for_tick.pop_front() {
            self.packages.deactivate(weak);
            self.throttled.shift_remove(&weak);
            self.loaded.push_back(weak);
        }
    }

    /// Nothing left to run: the graph must be empty apart from nodes parked
    /// on bootstrap registration, and every active package must have moved on.
    fn check_idle_graph(&mut self) -> Result<(), FatalError> {
        if self.graph.is_empty() && self.packages.active_len() == 0 {
            return Ok(());
        }
        self.shared.stats.cycle_checks.fetch_add(1, Ordering::Relaxed);
        let initial_load = self.shared.is_initial_load();
        let boot_waiting = match self.graph.check_for_cycles(initial_load) {
            Ok(boot_waiting) => boot_waiting,
            Err(source) => {
                let dump = self.graph.describe(64);
                error!(error = %source, "event graph is stuck\n{}", dump);
                return Err(FatalError::graph(source, dump));
            }
        };
        if boot_waiting > 0 {
            debug!(boot_waiting, "idle while waiting on bootstrap registration");
            return Ok(());
        }
        let remaining = self.packages.active_len();
        if remaining > 0 {
            let stuck: Vec<String> = self
                .packages
                .active()
                .filter_map(|weak| self.packages.get(weak))
                .map(|p| format!("{} ({:?})", p.name(), p.state()))
                .collect();
            error!(remaining, packages = ?stuck, "loading made no progress");
            return Err(FatalError::Stalled { remaining });
        }
        Ok(())
    }

    /// Postload loaded packages and finish them. `filter` keeps packages
    /// for a later tick.
    ///
    /// Returns the finished packages, whose callbacks the caller runs once
    /// the core lock is released, and whether time ran out first.
    pub fn process_loaded(
        &mut self,
        budget: &TimeBudget,
        filter: Option<&dyn Fn(&str) -> bool>,
    ) -> (Vec<Completion>, bool) {
        let mut finished = Vec::new();
        let mut skipped = Vec::new();
        let mut timed_out = false;
        let serializer = Arc::clone(&self.shared.serializer);

        while let Some(weak) = self.loaded.pop_front() {
            let Some(package) = self.packages.get_mut(weak) else {
                continue;
            };
            if filter.is_some_and(|keep| !keep(package.name())) {
                skipped.push(weak);
                continue;
            }
            if !package.post_load_objects(serializer.as_ref(), budget) {
                self.loaded.push_front(weak);
                timed_out = true;
                break;
            }
            finished.push(self.finish_package(weak));
            if budget.exceeded() && !self.loaded.is_empty() {
                timed_out = true;
                break;
            }
        }
        for weak in skipped.into_iter().rev() {
            self.loaded.push_front(weak);
        }
        self.shared.set_async_packages(self.packages.active_len());
        (finished, timed_out)
    }

    fn finish_package(
        &mut self,
        weak: WeakPackageRef,
    ) -> Completion {
        let completion = match self.packages.get_mut(weak) {
            Some(package) => package.complete(false),
            None => unreachable_completion(weak),
        };
        let stats = &self.shared.stats;
        match completion.result {
            LoadResult::Succeeded => stats.packages_completed.fetch_add(1, Ordering::Relaxed),
            LoadResult::Failed => stats.packages_failed.fetch_add(1, Ordering::Relaxed),
            LoadResult::Canceled => stats.packages_canceled.fetch_add(1, Ordering::Relaxed),
        };
        self.shared.note_package_finished();
        self.shared.clear_progress(&completion.name);
        self.packages.release_name(&completion.name, weak);
        for imported in &completion.imported {
            self.release_import(*imported);
        }
        let unreferenced = self.packages.get(weak).is_some_and(|p| p.dependency_refs() == 0);
        if unreferenced {
            self.delete_package(weak);
        } else {
            self.to_delete.push(weak);
        }
        completion
    }

    fn release_import(
        &mut self,
        weak: WeakPackageRef,
    ) {
        let Some(package) = self.packages.get_mut(weak) else {
            return;
        };
        package.release_dependency_ref();
        if package.state() == PackageState::Complete && package.dependency_refs() == 0 {
            self.delete_package(weak);
        }
    }

    fn delete_package(
        &mut self,
        weak: WeakPackageRef,
    ) {
        self.to_delete.retain(|w| *w != weak);
        self.events.remove_package(weak);
        self.io.forget_package(weak);
        if let Some(package) = self.packages.remove(weak) {
            trace!(package = %package.name(), "package loader deleted");
        }
    }

    /// Cancel every queued request and in-flight package.
    ///
    /// Refused while cross-package arcs exist: tearing one side down would
    /// leave the other waiting forever.
    pub fn cancel_all(&mut self) -> Result<Vec<Completion>, RequestError> {
        let arcs = self.graph.cross_package_arcs();
        if arcs > 0 {
            return Err(RequestError::CrossPackageArcsOutstanding { arcs });
        }
        let mut canceled = Vec::new();
        for QueuedRequest { id, request } in self.shared.requests.drain_by_priority() {
            canceled.push(Completion {
                name: request.name,
                object: None,
                result: LoadResult::Canceled,
                callbacks: request.callback.into_iter().collect(),
                request_ids: vec![id],
                imported: Vec::new(),
            });
        }

        for weak in self.packages.handles() {
            let Some(mut package) = self.packages.remove(weak) else {
                continue;
            };
            self.graph.remove_package_nodes(weak);
            self.shared.boot.forget_package(weak);
            let unconsumed = package.cancel(&mut self.io);
            if unconsumed > 0 {
                self.shared.throttle.finish_request(unconsumed);
            }
            if package.state() == PackageState::Complete {
                continue;
            }
            let completion = package.complete(true);
            self.shared.stats.packages_canceled.fetch_add(1, Ordering::Relaxed);
            self.shared.note_package_finished();
            self.shared.clear_progress(&completion.name);
            canceled.push(completion);
        }

        self.events.clear();
        self.ready_for_tick.clear();
        self.loaded.clear();
        self.to_delete.clear();
        self.throttled.clear();
        let freed = self.io.drain_tombstones(TOMBSTONE_DRAIN_TIMEOUT);
        self.shared.throttle.update();
        self.shared.set_async_packages(0);
        info!(packages = canceled.len(), tombstones = freed, "canceled all loading");
        Ok(canceled)
    }

    /// Called at shutdown: cancel reads still in flight and wait for them.
    pub fn shutdown(&mut self) {
        for weak in self.packages.handles() {
            if let Some(package) = self.packages.get_mut(weak) {
                package.cancel(&mut self.io);
            }
        }
        self.io.drain_tombstones(TOMBSTONE_DRAIN_TIMEOUT);
    }
}

fn unreachable_completion(weak: WeakPackageRef) -> Completion {
    warn!(package = %weak, "finished package vanished from the table");
    Completion {
        name: String::new(),
        object: None,
        result: LoadResult::Failed,
        callbacks: Vec::new(),
        request_ids: Vec::new(),
        imported: Vec::new(),
    }
}
