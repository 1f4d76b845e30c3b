//! Linker creation: summary reads, header parse and node registration.

use std::time::Instant;

use tracing::{debug, warn};

use super::{ExportSlot, ImportSlot, PackageLoader, PackageState};
use crate::runtime::dag::{NodeRef, Phase};
use crate::runtime::error::{FatalError, LoadError};
use crate::runtime::format::{package_file_path, PackageHeader};
use crate::runtime::object::{ObjectDesc, ObjectFlags};
use crate::runtime::precache::{PrecacheArchive, SummaryPoll};
use crate::runtime::scheduler::context::LoadContext;
use crate::runtime::scheduler::queue::{EventKind, SYSTEM_PRIORITY_MAX};
use crate::runtime::scheduler::request::LoadFlags;

/// Imports registered between time checks.
const IMPORT_NODES_PER_CHECK: usize = 50;
/// Exports registered between time checks.
const EXPORT_NODES_PER_CHECK: usize = 30;

impl PackageLoader {
    pub(super) fn event_create_linker(
        &mut self,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        self.expect_state(PackageState::NewPackage, "NewPackage")?;
        let now = Instant::now();
        self.load_start_time.get_or_insert(now);
        if let Some(root) = self.dependency_root.and_then(|root| cx.packages.get_mut(root)) {
            root.load_start_time.get_or_insert(now);
        }

        cx.fire_externally(self.node(Phase::LoadSummary))?;
        if self.create_linker(cx) {
            self.set_state(PackageState::WaitingForSummary);
            cx.io.waiting_summaries.insert(self.weak);
            return Ok(());
        }
        self.remove_node(self.node(Phase::LoadSummary), cx)?;
        self.finish_early(cx)
    }

    /// Open the package file. Returns `false` when there is nothing to
    /// read: the package failed or is already resident.
    fn create_linker(
        &mut self,
        cx: &mut LoadContext<'_>,
    ) -> bool {
        let name = self.desc.name.clone();
        if cx.known_missing.contains(&self.desc.name_to_load) {
            self.fail(LoadError::KnownMissing { name }, cx);
            return false;
        }

        let store = &cx.shared.store;
        if let Some(existing) = store.find(&name) {
            let resident = existing.has_flags(ObjectFlags::PACKAGE)
                && existing.is_loaded()
                && existing.flags().intersects(ObjectFlags::LOAD_COMPLETED | ObjectFlags::NATIVE);
            if resident {
                debug!(package = %name, "package already resident");
                self.package_object = Some(existing);
                self.already_resident = true;
                return false;
            }
        }

        let path = package_file_path(&self.desc.name_to_load, &cx.shared.config.package_extension);
        let handle = cx.shared.fs.open_async_read(&path);
        let package = {
            let guard = store.gc_guard();
            store.register(&guard, ObjectDesc::new(name, ObjectFlags::PACKAGE | ObjectFlags::NEED_LOAD))
        };
        // A package object left behind by an earlier failed attempt.
        package.clear_flags(ObjectFlags::LOAD_FAILED);
        package.set_flags(ObjectFlags::NEED_LOAD);
        self.package_object = Some(package);

        let callback = cx.shared.incoming.summary_callback(self.weak);
        self.archive = Some(PrecacheArchive::open(handle, cx.shared.config.summary_limits(), callback));
        true
    }

    pub(super) fn event_finish_linker(
        &mut self,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        self.expect_state(PackageState::WaitingForSummary, "WaitingForSummary")?;

        if self.header.is_none() && !self.failed() {
            let poll = match self.archive.as_mut() {
                Some(archive) => {
                    let incoming = cx.shared.incoming.clone();
                    let weak = self.weak;
                    archive.poll_summary(&mut || incoming.summary_callback(weak))
                }
                None => SummaryPoll::Failed(LoadError::Truncated {
                    needed: 0,
                    available: 0,
                }),
            };
            match poll {
                SummaryPoll::Pending => {
                    cx.io.waiting_summaries.insert(self.weak);
                    return Ok(());
                }
                SummaryPoll::Failed(error) => self.fail(error, cx),
                SummaryPoll::Ready => {
                    if let Err(error) = self.parse_header() {
                        self.fail(error, cx);
                    }
                }
            }
        }

        if !self.failed() {
            if !self.add_linker_nodes(cx)? {
                self.queue(cx.events, cx.order, EventKind::FinishLinker, SYSTEM_PRIORITY_MAX);
                return Ok(());
            }
            self.set_state(PackageState::StartImportPackages);
            self.queue(cx.events, cx.order, EventKind::StartImportPackages, SYSTEM_PRIORITY_MAX - 1);
        }
        self.remove_node(self.node(Phase::LoadSummary), cx)?;
        if self.failed() {
            self.finish_early(cx)?;
        }
        Ok(())
    }

    fn parse_header(&mut self) -> Result<(), LoadError> {
        let Some(archive) = self.archive.as_ref() else {
            return Err(LoadError::Truncated {
                needed: 0,
                available: 0,
            });
        };
        let header_size = archive.header_size().unwrap_or(0);
        let bytes = archive.header_bytes().ok_or(LoadError::Truncated {
            needed: header_size,
            available: archive.block_range().1,
        })?;
        let header = PackageHeader::decode(bytes)?;
        header.validate(header_size, archive.file_size().unwrap_or(0))?;
        if let Some(expected) = self.desc.guid {
            if expected != header.guid {
                return Err(LoadError::GuidMismatch {
                    expected,
                    found: header.guid,
                });
            }
        }

        self.imports = (0..header.imports.len() as u32)
            .map(|i| ImportSlot {
                path: header.import_path(i),
                ..Default::default()
            })
            .collect();
        self.exports = Vec::with_capacity(header.exports.len());
        for i in 0..header.exports.len() as u32 {
            let relative = header.export_relative_path(i);
            self.exports.push(ExportSlot {
                path: format!("{}.{}", self.desc.name, relative),
                ..Default::default()
            });
            self.export_by_path.insert(relative, i);
        }
        debug!(
            package = %self.desc.name,
            imports = header.imports.len(),
            exports = header.exports.len(),
            "summary parsed"
        );
        self.header = Some(header);
        Ok(())
    }

    /// Register the package, import and export nodes, a slice at a time.
    /// Returns `false` when the time budget ran out first.
    fn add_linker_nodes(
        &mut self,
        cx: &mut LoadContext<'_>,
    ) -> Result<bool, FatalError> {
        let exports_serialized = self.node(Phase::ExportsSerialized);
        if !self.package_nodes_added {
            cx.add_node(exports_serialized, false)?;
            cx.add_node(self.node(Phase::SetupImports), true)?;
            self.package_nodes_added = true;
        }
        for waiter in std::mem::take(&mut self.waiting_to_link_imports) {
            cx.add_arc_if_live(NodeRef::package_node(waiter, Phase::SetupImports), exports_serialized)?;
        }

        let start = self.import_node_index;
        while self.import_node_index < self.imports.len() {
            if self.import_node_index > start
                && self.import_node_index % IMPORT_NODES_PER_CHECK == 0
                && cx.budget.exceeded()
            {
                return Ok(false);
            }
            let i = self.import_node_index as u32;
            let create = self.import_node(i, Phase::Create);
            let serialize = self.import_node(i, Phase::Serialize);
            cx.add_node(create, false)?;
            cx.add_node(serialize, false)?;
            cx.add_arc(create, serialize)?;
            cx.add_arc(serialize, exports_serialized)?;
            self.import_node_index += 1;
        }

        let start = self.export_node_index;
        while self.export_node_index < self.exports.len() {
            if self.export_node_index > start
                && self.export_node_index % EXPORT_NODES_PER_CHECK == 0
                && cx.budget.exceeded()
            {
                return Ok(false);
            }
            let i = self.export_node_index as u32;
            let create = self.export_node(i, Phase::Create);
            let start_io = self.export_node(i, Phase::StartIo);
            let serialize = self.export_node(i, Phase::Serialize);
            cx.add_node(create, false)?;
            cx.add_node(start_io, false)?;
            cx.add_node(serialize, false)?;
            cx.add_arc(create, start_io)?;
            cx.add_arc(start_io, serialize)?;
            cx.add_arc(serialize, exports_serialized)?;
            self.export_node_index += 1;
        }
        Ok(true)
    }

    /// Record a package-level failure. Only the first reason is kept.
    pub(super) fn fail(
        &mut self,
        error: LoadError,
        cx: &mut LoadContext<'_>,
    ) {
        let quiet = self.desc.flags.contains(LoadFlags::QUIET);
        match &error {
            LoadError::FileNotFound { path } => {
                if cx.known_missing.insert(self.desc.name_to_load.clone()) && !quiet {
                    warn!(package = %self.desc.name, %path, "package file not found");
                } else {
                    debug!(package = %self.desc.name, %path, "package file not found");
                }
            }
            LoadError::KnownMissing { .. } => {
                debug!(package = %self.desc.name, "skipping known missing package");
            }
            other => warn!(package = %self.desc.name, error = %other, "package failed to load"),
        }
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    /// Skip the remaining graph work: go straight to postload.
    pub(super) fn finish_early(
        &mut self,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        self.check_no_nodes_left(cx)?;
        self.waiting_to_link_imports.clear();
        self.set_state(PackageState::PostLoad);
        self.release_postload_waiters(cx);
        cx.ready_for_tick.push_back(self.weak);
        Ok(())
    }

    pub(super) fn check_no_nodes_left(
        &self,
        cx: &LoadContext<'_>,
    ) -> Result<(), FatalError> {
        let count = cx.graph.package_node_count(self.weak);
        if count != 0 {
            return Err(FatalError::LeakedNodes {
                package: self.desc.name.clone(),
                count,
            });
        }
        Ok(())
    }
}
