//! Per-package loading state machine
//!
//! A [`PackageLoader`] walks one package through:
//!
//! ```text
//! NewPackage -> WaitingForSummary -> StartImportPackages -> WaitingForImportPackages
//!     -> SetupImports -> SetupExports -> ProcessingImportsAndExports
//!     -> WaitingForPostLoad -> ReadyForPostLoad -> PostLoad -> Complete
//! ```
//!
//! Most transitions happen because an event graph node of the package
//! fired, not because the previous step returned. A failure at the linker
//! level jumps straight to `PostLoad` so callbacks still fire exactly once.
//!
//! The handlers are split by phase:
//!
//! - `linker`: summary reads, header parse, node registration
//! - `imports`: discovering imported packages and wiring imports
//! - `exports`: export nodes, creation, serialization and precache I/O
//! - `postload`: the postload wait, completion and cancellation

mod exports;
mod imports;
mod linker;
mod postload;
mod ready;
mod table;

pub use postload::Completion;
pub use table::{PackageTable, WeakPackageRef};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use indexmap::{IndexMap, IndexSet};
use once_cell::sync::OnceCell;
use tracing::trace;

use self::ready::ReadySets;
use crate::runtime::dag::{NodeRef, Phase};
use crate::runtime::error::{FatalError, LoadError};
use crate::runtime::format::{PackageHeader, PackageIndex};
use crate::runtime::io::AsyncReadRequest;
use crate::runtime::object::ObjectRef;
use crate::runtime::precache::PrecacheArchive;
use crate::runtime::scheduler::context::LoadContext;
use crate::runtime::scheduler::incoming::ReadToken;
use crate::runtime::scheduler::queue::{EventKind, EventQueue, LoadOrder};
use crate::runtime::scheduler::request::{LoadCallback, LoadFlags, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PackageState {
    NewPackage,
    WaitingForSummary,
    StartImportPackages,
    WaitingForImportPackages,
    SetupImports,
    SetupExports,
    ProcessingImportsAndExports,
    WaitingForPostLoad,
    ReadyForPostLoad,
    PostLoad,
    Complete,
}

/// What a loader was created for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDesc {
    pub name: String,
    /// File read for the package; usually the same as `name`.
    pub name_to_load: String,
    pub guid: Option<u128>,
    pub priority: i32,
    pub flags: LoadFlags,
}

impl PackageDesc {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            name_to_load: name.clone(),
            name,
            guid: None,
            priority: 0,
            flags: LoadFlags::NONE,
        }
    }

    pub fn with_priority(
        mut self,
        priority: i32,
    ) -> Self {
        self.priority = priority;
        self
    }
}

/// Counts live loaders for leak accounting.
pub struct LiveToken(Arc<AtomicUsize>);

impl LiveToken {
    pub fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct ImportSlot {
    path: String,
    /// Object found while wiring imports; linked only once the create
    /// node fires.
    found: Option<ObjectRef>,
    /// Export of another in-flight package this import resolves to.
    source: Option<(WeakPackageRef, u32)>,
    object: OnceCell<ObjectRef>,
    failed: bool,
    /// The package of this import was already considered for loading.
    package_handled: bool,
}

#[derive(Debug, Default)]
struct ExportSlot {
    path: String,
    object: Option<ObjectRef>,
    failed: bool,
}

/// One precache read in flight.
struct ExportIoRequest {
    offset: u64,
    len: u64,
    first: u32,
    last: u32,
    /// Exports whose start-I/O node is released when this read becomes
    /// the current block.
    exports: Vec<u32>,
    request: AsyncReadRequest,
}

pub struct PackageLoader {
    weak: WeakPackageRef,
    desc: PackageDesc,
    state: PackageState,
    failure: Option<LoadError>,
    _live: LiveToken,
    dependency_root: Option<WeakPackageRef>,
    load_start_time: Option<Instant>,
    load_percentage: f32,

    archive: Option<PrecacheArchive>,
    header: Option<PackageHeader>,
    package_object: Option<ObjectRef>,
    already_resident: bool,
    imports: Vec<ImportSlot>,
    exports: Vec<ExportSlot>,
    export_by_path: HashMap<String, u32>,

    package_nodes_added: bool,
    import_node_index: usize,
    export_node_index: usize,
    load_import_index: usize,
    setup_export_index: usize,
    items_done: usize,

    /// Packages whose import setup waits on this package's summary.
    waiting_to_link_imports: Vec<WeakPackageRef>,
    /// Packages this one keeps alive.
    imported_packages: IndexSet<WeakPackageRef>,
    /// In-flight importers keeping this one alive.
    dependency_refs: usize,

    ready: ReadySets,
    process_in_flight: bool,
    postload_wait_in_flight: bool,
    all_exports_serialized: bool,

    io_requests: IndexMap<ReadToken, ExportIoRequest>,
    export_to_request: HashMap<u32, ReadToken>,
    ready_requests: Vec<ReadToken>,
    exports_in_block: HashSet<u32>,

    may_wait_for: IndexSet<WeakPackageRef>,
    waiting_for: IndexSet<WeakPackageRef>,
    waiting_for_me: IndexSet<WeakPackageRef>,

    objects_to_postload: Vec<ObjectRef>,
    callbacks: Vec<LoadCallback>,
    request_ids: Vec<RequestId>,
}

impl PackageLoader {
    pub fn new(
        weak: WeakPackageRef,
        desc: PackageDesc,
        dependency_root: Option<WeakPackageRef>,
        live: LiveToken,
    ) -> Self {
        Self {
            weak,
            desc,
            state: PackageState::NewPackage,
            failure: None,
            _live: live,
            dependency_root,
            load_start_time: None,
            load_percentage: 0.0,
            archive: None,
            header: None,
            package_object: None,
            already_resident: false,
            imports: Vec::new(),
            exports: Vec::new(),
            export_by_path: HashMap::new(),
            package_nodes_added: false,
            import_node_index: 0,
            export_node_index: 0,
            load_import_index: 0,
            setup_export_index: 0,
            items_done: 0,
            waiting_to_link_imports: Vec::new(),
            imported_packages: IndexSet::new(),
            dependency_refs: 0,
            ready: ReadySets::default(),
            process_in_flight: false,
            postload_wait_in_flight: false,
            all_exports_serialized: false,
            io_requests: IndexMap::new(),
            export_to_request: HashMap::new(),
            ready_requests: Vec::new(),
            exports_in_block: HashSet::new(),
            may_wait_for: IndexSet::new(),
            waiting_for: IndexSet::new(),
            waiting_for_me: IndexSet::new(),
            objects_to_postload: Vec::new(),
            callbacks: Vec::new(),
            request_ids: Vec::new(),
        }
    }

    #[inline]
    pub fn weak(&self) -> WeakPackageRef {
        self.weak
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn desc(&self) -> &PackageDesc {
        &self.desc
    }

    #[inline]
    pub fn state(&self) -> PackageState {
        self.state
    }

    #[inline]
    pub fn priority(&self) -> i32 {
        self.desc.priority
    }

    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn failure(&self) -> Option<&LoadError> {
        self.failure.as_ref()
    }

    pub fn load_start_time(&self) -> Option<Instant> {
        self.load_start_time
    }

    pub fn load_percentage(&self) -> f32 {
        self.load_percentage
    }

    pub fn package_object(&self) -> Option<&ObjectRef> {
        self.package_object.as_ref()
    }

    pub fn dependency_refs(&self) -> usize {
        self.dependency_refs
    }

    pub fn import_count(&self) -> usize {
        self.imports.len()
    }

    pub fn export_count(&self) -> usize {
        self.exports.len()
    }

    pub fn export_object(
        &self,
        index: u32,
    ) -> Option<&ObjectRef> {
        self.exports.get(index as usize)?.object.as_ref()
    }

    pub fn import_object(
        &self,
        index: u32,
    ) -> Option<&ObjectRef> {
        self.imports.get(index as usize)?.object.get()
    }

    pub fn export_failed(
        &self,
        index: u32,
    ) -> bool {
        self.exports.get(index as usize).is_some_and(|e| e.failed)
    }

    pub fn import_failed(
        &self,
        index: u32,
    ) -> bool {
        self.imports.get(index as usize).is_some_and(|i| i.failed)
    }

    /// Raise priority; the caller re-sorts the active list.
    pub fn raise_priority(
        &mut self,
        priority: i32,
    ) -> bool {
        if priority > self.desc.priority {
            self.desc.priority = priority;
            return true;
        }
        false
    }

    pub fn add_request(
        &mut self,
        id: RequestId,
        callback: Option<LoadCallback>,
    ) {
        self.request_ids.push(id);
        if let Some(callback) = callback {
            self.callbacks.push(callback);
        }
    }

    pub(crate) fn add_dependency_ref(&mut self) {
        self.dependency_refs += 1;
    }

    pub(crate) fn release_dependency_ref(&mut self) {
        self.dependency_refs = self.dependency_refs.saturating_sub(1);
    }

    fn set_state(
        &mut self,
        state: PackageState,
    ) {
        trace!(package = %self.desc.name, from = ?self.state, to = ?state, "state");
        self.state = state;
    }

    fn expect_state(
        &self,
        expected: PackageState,
        label: &'static str,
    ) -> Result<(), FatalError> {
        if self.state != expected {
            return Err(FatalError::InvalidState {
                package: self.desc.name.clone(),
                expected: label,
                found: self.state,
            });
        }
        Ok(())
    }

    fn node(
        &self,
        phase: Phase,
    ) -> NodeRef {
        NodeRef::package_node(self.weak, phase)
    }

    fn import_node(
        &self,
        index: u32,
        phase: Phase,
    ) -> NodeRef {
        NodeRef::import(self.weak, index, phase)
    }

    fn export_node(
        &self,
        index: u32,
        phase: Phase,
    ) -> NodeRef {
        NodeRef::export(self.weak, index, phase)
    }

    /// Queue an event using the package's own priority.
    fn queue(
        &self,
        events: &mut EventQueue,
        order: &mut LoadOrder,
        kind: EventKind,
        system_priority: i32,
    ) {
        events.schedule(order, self.weak, self.desc.priority, kind, system_priority);
    }

    /// Remove one of this package's nodes and deliver whatever it releases.
    fn remove_node(
        &mut self,
        node: NodeRef,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        cx.remove_node(node)?;
        cx.route_fired(Some(self))
    }

    fn done_adding(
        &mut self,
        node: NodeRef,
        was_held: bool,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        if cx.done_adding(node, was_held)? {
            cx.route_fired(Some(self))?;
        }
        Ok(())
    }

    /// Map a table index of this package to its object, if there is one yet.
    fn index_to_object(
        &self,
        index: PackageIndex,
    ) -> Option<ObjectRef> {
        match index {
            PackageIndex::Null => None,
            PackageIndex::Import(i) => self.import_object(i).cloned(),
            PackageIndex::Export(i) => self.export_object(i).cloned(),
        }
    }

    /// Run one queued event.
    pub fn execute(
        &mut self,
        kind: EventKind,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        match kind {
            EventKind::CreateLinker => self.event_create_linker(cx),
            EventKind::FinishLinker => self.event_finish_linker(cx),
            EventKind::StartImportPackages => self.event_start_import_packages(cx),
            EventKind::SetupImports => self.event_setup_imports(cx),
            EventKind::SetupExports => self.event_setup_exports(cx),
            EventKind::ProcessImportsAndExports => self.event_process_imports_and_exports(cx),
            EventKind::ExportsDone => self.event_exports_done(cx),
            EventKind::ProcessPostloadWait => self.event_process_postload_wait(cx),
            EventKind::StartPostLoad => self.event_start_post_load(cx),
        }
    }

    /// A node of this package fired.
    pub fn fire_node(
        &mut self,
        node: NodeRef,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        trace!(%node, "fired");
        match (node.phase, node.item) {
            (Phase::LoadSummary, _) => {}
            (Phase::SetupImports, _) => {
                self.queue(cx.events, cx.order, EventKind::SetupImports, 0);
            }
            (Phase::ExportsSerialized, _) => {
                self.queue(cx.events, cx.order, EventKind::ExportsDone, 0);
            }
            (Phase::Create, PackageIndex::Import(i)) => {
                self.ready.imports_created.insert(i);
            }
            (Phase::Serialize, PackageIndex::Import(i)) => {
                self.ready.imports_serialized.insert(i);
            }
            (Phase::Create, PackageIndex::Export(i)) => {
                self.ready.exports_creatable.insert(i);
            }
            (Phase::StartIo, PackageIndex::Export(i)) => {
                self.ready.exports_io_startable.insert(i);
            }
            (Phase::Serialize, PackageIndex::Export(i)) => {
                self.ready.exports_serializable.insert(i);
            }
            _ => {
                return Err(FatalError::graph(
                    crate::runtime::dag::GraphError::UnknownNode { node },
                    cx.graph.describe(16),
                ));
            }
        }
        if node.phase.is_item_phase() {
            self.conditional_queue_process(cx);
        }
        Ok(())
    }

    /// Best-effort progress in percent, never decreasing.
    fn update_load_percentage(
        &mut self,
        cx: &LoadContext<'_>,
    ) {
        let total = 2 * (self.imports.len() + self.exports.len());
        let done = self.load_import_index + self.setup_export_index + self.items_done;
        let percent = if total == 0 {
            0.0
        } else {
            (100.0 * done as f32 / total as f32).min(100.0)
        };
        if percent > self.load_percentage {
            self.load_percentage = percent;
            cx.shared.publish_progress(&self.desc.name, percent);
        }
    }
}

#[cfg(test)]
mod tests;
