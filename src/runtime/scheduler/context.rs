//! Borrowed view of the loader core handed to package events
//!
//! A package executing an event is checked out of the table; everything
//! else it may touch (other packages, the graph, the event queue, the I/O
//! registry) is reached through [`LoadContext`]. Graph primitives are
//! wrapped here so that a violated graph invariant is turned into a
//! [`FatalError`] carrying a dump of the graph.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use indexmap::IndexSet;
use tracing::error;

use super::queue::{EventKind, EventQueue, LoadOrder, SYSTEM_PRIORITY_MAX};
use super::shared::Shared;
use crate::runtime::dag::{EventGraph, GraphError, NodeRef, Phase};
use crate::runtime::error::FatalError;
use crate::runtime::object::{DefaultObjectBuilder, ObjectFlags, ObjectRef};
use crate::runtime::package::{PackageDesc, PackageLoader, PackageTable, WeakPackageRef};

/// Nodes listed in a fatal graph dump.
const GRAPH_DUMP_LIMIT: usize = 64;

/// Wall-clock budget of one tick.
#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    start: Instant,
    limit: Option<Duration>,
}

impl TimeBudget {
    pub fn new(limit: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            limit,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    pub fn limit(&self) -> Option<Duration> {
        self.limit
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    #[inline]
    pub fn exceeded(&self) -> bool {
        self.limit.is_some_and(|limit| self.start.elapsed() >= limit)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.limit.map(|limit| limit.saturating_sub(self.start.elapsed()))
    }
}

pub struct LoadContext<'a> {
    pub shared: &'a Shared,
    pub budget: &'a TimeBudget,
    pub packages: &'a mut PackageTable,
    pub graph: &'a mut EventGraph,
    pub events: &'a mut EventQueue,
    pub io: &'a mut super::incoming::IoRegistry,
    pub defaults: &'a mut DefaultObjectBuilder,
    pub ready_for_tick: &'a mut VecDeque<WeakPackageRef>,
    /// Packages holding startable I/O while the throttle is closed.
    pub throttled: &'a mut IndexSet<WeakPackageRef>,
    pub known_missing: &'a mut HashSet<String>,
    pub order: &'a mut LoadOrder,
}

impl LoadContext<'_> {
    fn fatal(
        &self,
        source: GraphError,
    ) -> FatalError {
        let dump = self.graph.describe(GRAPH_DUMP_LIMIT);
        error!(error = %source, "event graph invariant violated\n{}", dump);
        FatalError::graph(source, dump)
    }

    pub fn add_node(
        &mut self,
        node: NodeRef,
        hold: bool,
    ) -> Result<(), FatalError> {
        self.graph.add_node(node, hold, 0).map_err(|e| self.fatal(e))
    }

    pub fn add_arc(
        &mut self,
        prerequisite: NodeRef,
        dependent: NodeRef,
    ) -> Result<(), FatalError> {
        self.graph.add_arc(prerequisite, dependent).map_err(|e| self.fatal(e))
    }

    /// Add the arc only if it still means something: a prerequisite that
    /// was already removed has had its effect, and a dependent that is
    /// gone or fired cannot wait any more. Returns whether it was added.
    pub fn add_arc_if_live(
        &mut self,
        prerequisite: NodeRef,
        dependent: NodeRef,
    ) -> Result<bool, FatalError> {
        if !self.graph.contains(prerequisite) || !self.graph.is_pending(dependent) {
            return Ok(false);
        }
        self.add_arc(prerequisite, dependent)?;
        Ok(true)
    }

    pub fn fire_externally(
        &mut self,
        node: NodeRef,
    ) -> Result<(), FatalError> {
        self.graph.fire_externally(node).map_err(|e| self.fatal(e))
    }

    pub fn done_adding(
        &mut self,
        node: NodeRef,
        was_held: bool,
    ) -> Result<bool, FatalError> {
        self.graph
            .done_adding_prerequisites(node, was_held)
            .map_err(|e| self.fatal(e))
    }

    pub fn remove_node(
        &mut self,
        node: NodeRef,
    ) -> Result<(), FatalError> {
        self.graph.remove_node(node).map_err(|e| self.fatal(e))
    }

    /// Deliver every fired node to its package. `current` is the package
    /// executing right now, which is checked out of the table.
    pub fn route_fired(
        &mut self,
        mut current: Option<&mut PackageLoader>,
    ) -> Result<(), FatalError> {
        while let Some(node) = self.graph.pop_fired() {
            match current.as_deref_mut() {
                Some(package) if package.weak() == node.package => package.fire_node(node, self)?,
                _ => {
                    let mut package = self.packages.check_out(node.package)?;
                    let result = package.fire_node(node, self);
                    self.packages.check_in(package);
                    result?;
                }
            }
        }
        Ok(())
    }

    pub fn initial_load(&self) -> bool {
        self.shared.is_initial_load()
    }

    /// Loaded far enough to be linked against without waiting.
    pub fn is_fully_loaded(
        &self,
        object: &ObjectRef,
    ) -> bool {
        if object.has_flags(ObjectFlags::NEED_LOAD) {
            return false;
        }
        if self.initial_load() && object.has_flags(ObjectFlags::NATIVE) && !object.has_flags(ObjectFlags::PACKAGE) {
            return self.shared.boot.is_object_complete(object.path());
        }
        true
    }

    /// Queue an event for `package` at its own priority.
    pub fn schedule(
        &mut self,
        package: WeakPackageRef,
        priority: i32,
        kind: EventKind,
        system_priority: i32,
    ) {
        self.events.schedule(self.order, package, priority, kind, system_priority);
    }

    /// Create a loader, make it discoverable by name and queue its linker.
    pub fn insert_package(
        &mut self,
        desc: PackageDesc,
        dependency_root: Option<WeakPackageRef>,
    ) -> Result<WeakPackageRef, FatalError> {
        let priority = desc.priority;
        let name = desc.name.clone();
        let live = self.shared.live_token();
        let weak = self
            .packages
            .insert_with(|weak| PackageLoader::new(weak, desc, dependency_root, live));
        self.packages.register_name(&name, weak);
        self.packages.activate(weak, priority);
        self.shared.note_package_created();
        self.add_node(NodeRef::package_node(weak, Phase::LoadSummary), false)?;
        self.schedule(weak, priority, EventKind::CreateLinker, SYSTEM_PRIORITY_MAX);
        Ok(weak)
    }
}
