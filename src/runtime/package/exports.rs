//! Exports: dependency wiring, creation, serialization and precache reads.

use tracing::{debug, trace, warn};

use super::ready::pop;
use super::{ExportIoRequest, PackageLoader, PackageState};
use crate::runtime::dag::{NodeRef, Phase};
use crate::runtime::error::{FatalError, FsError};
use crate::runtime::format::{ExportEntry, PackageIndex};
use crate::runtime::object::{DefaultObject, ExportCreate, ObjectFlags, ObjectRef, SerializeContext};
use crate::runtime::precache::{plan_read, ExportSpan, PrecacheArchive};
use crate::runtime::scheduler::context::LoadContext;
use crate::runtime::scheduler::incoming::ReadToken;
use crate::runtime::scheduler::queue::EventKind;

/// Exports wired between time checks.
const EXPORTS_PER_CHECK: usize = 10;

/// Event system priorities of the processing event.
const PROCESS_PRIORITY: i32 = -1;
const PROCESS_PRIORITY_READY_REQUESTS: i32 = -2;
const PROCESS_PRIORITY_START_IO: i32 = -3;

impl PackageLoader {
    pub(super) fn event_setup_exports(
        &mut self,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        self.expect_state(PackageState::SetupExports, "SetupExports")?;
        let start = self.setup_export_index;
        while self.setup_export_index < self.exports.len() {
            if self.setup_export_index > start
                && self.setup_export_index % EXPORTS_PER_CHECK == 0
                && cx.budget.exceeded()
            {
                self.queue(cx.events, cx.order, EventKind::SetupExports, 0);
                return Ok(());
            }
            let index = self.setup_export_index as u32;
            self.setup_export_index += 1;
            self.wire_object_dependencies(index, cx)?;
            self.wire_preload_dependencies(index, cx)?;
            self.done_adding(self.export_node(index, Phase::Create), false, cx)?;
        }
        self.update_load_percentage(cx);
        self.set_state(PackageState::ProcessingImportsAndExports);
        self.conditional_queue_process(cx);
        Ok(())
    }

    /// An export is created after its outer, class, super class and
    /// template exist. Classes and templates from this package must also
    /// be serialized first.
    fn wire_object_dependencies(
        &self,
        index: u32,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        let Some(entry) = self.header.as_ref().and_then(|h| h.exports.get(index as usize)) else {
            return Ok(());
        };
        let create = self.export_node(index, Phase::Create);
        let own = PackageIndex::Export(index);
        let needs_serialized = [entry.class, entry.super_class, entry.template];
        for dep in [entry.outer, entry.class, entry.super_class, entry.template] {
            if dep.is_null() || dep == own {
                continue;
            }
            cx.add_arc_if_live(NodeRef::item(self.weak, dep, Phase::Create), create)?;
        }
        for dep in needs_serialized {
            if matches!(dep, PackageIndex::Export(_)) && dep != own {
                cx.add_arc_if_live(NodeRef::item(self.weak, dep, Phase::Serialize), create)?;
            }
        }
        Ok(())
    }

    /// Arcs from the four preload dependency categories of one export.
    fn wire_preload_dependencies(
        &self,
        index: u32,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        let Some(header) = self.header.as_ref() else {
            return Ok(());
        };
        let deps = header.preload_dependencies(index);
        let create = self.export_node(index, Phase::Create);
        let start_io = self.export_node(index, Phase::StartIo);
        let runs = [
            (deps.serialize_before_serialize, Phase::Serialize, start_io),
            (deps.create_before_serialize, Phase::Create, start_io),
            (deps.serialize_before_create, Phase::Serialize, create),
            (deps.create_before_create, Phase::Create, create),
        ];
        for (dependencies, phase, dependent) in runs {
            for dep in dependencies {
                if dep.is_null() {
                    continue;
                }
                let prerequisite = NodeRef::item(self.weak, *dep, phase);
                cx.add_arc_if_live(prerequisite, dependent)?;
            }
        }
        Ok(())
    }

    /// Queue the processing event if there is work and none is queued.
    pub(super) fn conditional_queue_process(
        &mut self,
        cx: &mut LoadContext<'_>,
    ) {
        if self.state != PackageState::ProcessingImportsAndExports || self.process_in_flight {
            return;
        }
        let accepting = cx.shared.throttle.accepting();
        let io_startable = !self.ready.exports_io_startable.is_empty();
        let has_work = self.ready.any_work() || !self.ready_requests.is_empty() || (io_startable && accepting);
        if !has_work {
            if io_startable {
                cx.throttled.insert(self.weak);
            }
            return;
        }
        let max_outstanding = cx.shared.config.max_outstanding_precache_requests;
        let priority = if !self.ready_requests.is_empty() {
            PROCESS_PRIORITY_READY_REQUESTS
        } else if io_startable && accepting && self.io_requests.len() < max_outstanding {
            PROCESS_PRIORITY_START_IO
        } else {
            PROCESS_PRIORITY
        };
        self.process_in_flight = true;
        self.queue(cx.events, cx.order, EventKind::ProcessImportsAndExports, priority);
    }

    /// The throttle reopened: look at held-back reads again.
    pub(crate) fn resume_io(
        &mut self,
        cx: &mut LoadContext<'_>,
    ) {
        self.conditional_queue_process(cx);
    }

    pub(super) fn event_process_imports_and_exports(
        &mut self,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        if self.all_exports_serialized {
            self.process_in_flight = false;
            return Ok(());
        }
        self.expect_state(PackageState::ProcessingImportsAndExports, "ProcessingImportsAndExports")?;
        let result = self.process_imports_and_exports(cx);
        self.process_in_flight = false;
        result?;
        self.conditional_queue_process(cx);
        Ok(())
    }

    fn process_imports_and_exports(
        &mut self,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        let loop_limit = cx.shared.config.process_imports_loop_limit.max(1);
        let max_outstanding = cx.shared.config.max_outstanding_precache_requests;
        let mut iterations = 0;
        loop {
            if iterations > 0 && (cx.budget.exceeded() || cx.order.is_randomized()) {
                break;
            }
            iterations += 1;
            if iterations > loop_limit || self.all_exports_serialized {
                break;
            }
            let accepting = cx.shared.throttle.accepting();
            let io_startable = !self.ready.exports_io_startable.is_empty() && accepting;

            if io_startable && self.io_requests.len() < max_outstanding {
                self.start_precache_request(cx)?;
                continue;
            }
            if let Some(index) = pop(&mut self.ready.imports_created, cx.order) {
                self.link_import(index, cx)?;
                self.remove_node(self.import_node(index, Phase::Create), cx)?;
                continue;
            }
            if let Some(index) = pop(&mut self.ready.imports_serialized, cx.order) {
                self.remove_node(self.import_node(index, Phase::Serialize), cx)?;
                continue;
            }
            if let Some(index) = pop(&mut self.ready.exports_creatable, cx.order) {
                self.create_export(index, cx);
                self.remove_node(self.export_node(index, Phase::Create), cx)?;
                continue;
            }
            if io_startable {
                self.start_precache_request(cx)?;
                continue;
            }
            if let Some(index) = pop(&mut self.ready.exports_serializable, cx.order) {
                self.exports_in_block.remove(&index);
                self.serialize_export(index, cx)?;
                self.remove_node(self.export_node(index, Phase::Serialize), cx)?;
                continue;
            }
            if self.exports_in_block.is_empty() {
                if let Some(archive) = self.archive.as_mut() {
                    archive.flush_block();
                }
            }
            if !self.ready_requests.is_empty() {
                self.make_next_precache_request_current(cx)?;
                continue;
            }
            break;
        }
        if !self.ready.exports_io_startable.is_empty() && !cx.shared.throttle.accepting() {
            cx.throttled.insert(self.weak);
        }
        Ok(())
    }

    fn create_export(
        &mut self,
        index: u32,
        cx: &mut LoadContext<'_>,
    ) {
        let slot = &self.exports[index as usize];
        if slot.object.is_some() || slot.failed {
            return;
        }
        let Some(header) = self.header.as_ref() else {
            return;
        };
        let entry = &header.exports[index as usize];
        match self.construct_export(index, entry, cx) {
            Ok(object) => {
                trace!(export = %object.path(), "export created");
                self.exports[index as usize].object = Some(object);
            }
            Err(reason) => {
                warn!(package = %self.desc.name, export = %self.exports[index as usize].path, reason, "export could not be created");
                self.exports[index as usize].failed = true;
            }
        }
    }

    fn construct_export(
        &self,
        index: u32,
        entry: &ExportEntry,
        cx: &mut LoadContext<'_>,
    ) -> Result<ObjectRef, &'static str> {
        let shared = cx.shared;
        let store = &shared.store;
        let class = if entry.class.is_null() {
            store.class_class().clone()
        } else {
            self.index_to_object(entry.class).ok_or("class not found")?
        };
        let outer = if entry.outer.is_null() {
            self.package_object.clone().ok_or("package object missing")?
        } else {
            self.index_to_object(entry.outer).ok_or("outer not found")?
        };
        let path = &self.exports[index as usize].path;

        if let Some(existing) = store.find(path) {
            if existing.class().is_some_and(|c| c.id() == class.id()) {
                if !existing.has_flags(ObjectFlags::LOAD_COMPLETED) {
                    existing.set_flags(ObjectFlags::NEED_LOAD | ObjectFlags::NEED_POST_LOAD);
                }
                return Ok(existing);
            }
            if !existing.has_flags(ObjectFlags::LOAD_FAILED) {
                return Err("an object of a different class already exists at this path");
            }
        }

        if class.has_flags(ObjectFlags::NEED_LOAD) {
            return Err("class is not loaded yet");
        }
        let template = if entry.template.is_null() {
            self.class_default_object(&class, cx)
        } else {
            Some(self.index_to_object(entry.template).ok_or("template not found")?)
        };
        if template.as_ref().is_some_and(|t| t.has_flags(ObjectFlags::NEED_LOAD)) {
            return Err("template is not loaded yet");
        }
        let super_class = match entry.super_class {
            PackageIndex::Null => None,
            other => Some(self.index_to_object(other).ok_or("super class not found")?),
        };

        let guard = store.gc_guard();
        let sc = SerializeContext::new(store, &guard, &self.desc.name, shared);
        let create = ExportCreate {
            path,
            entry,
            class: &class,
            outer: &outer,
            super_class: super_class.as_ref(),
            template: template.as_ref(),
        };
        shared
            .serializer
            .create_export(&sc, &create)
            .ok_or("serializer refused to create the export")
    }

    fn class_default_object(
        &self,
        class: &ObjectRef,
        cx: &mut LoadContext<'_>,
    ) -> Option<ObjectRef> {
        if class.id() == cx.shared.store.class_class().id() {
            return None;
        }
        let shared = cx.shared;
        let guard = shared.store.gc_guard();
        match cx
            .defaults
            .default_object(&shared.store, &guard, shared.serializer.as_ref(), class)
        {
            DefaultObject::Ready(object) => Some(object),
            DefaultObject::Deferred => None,
        }
    }

    fn serialize_export(
        &mut self,
        index: u32,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        self.items_done += 1;
        let Some(object) = self.exports[index as usize].object.clone() else {
            return Ok(());
        };
        if !object.has_flags(ObjectFlags::NEED_LOAD) {
            return Ok(());
        }
        let Some((super_class, offset, size)) = self
            .header
            .as_ref()
            .map(|h| &h.exports[index as usize])
            .map(|e| (e.super_class, e.serial_offset, e.serial_size))
        else {
            return Ok(());
        };
        if !super_class.is_null() && self.index_to_object(super_class).is_none() {
            warn!(package = %self.desc.name, export = %object.path(), "super class of export not found");
            self.exports[index as usize].failed = true;
            return Ok(());
        }
        let Some(archive) = self.archive.as_mut() else {
            return Ok(());
        };

        object.clear_flags(ObjectFlags::NEED_LOAD);
        let read = match serialize_from(archive, &object, offset, size, &self.desc.name, cx) {
            Ok(read) => read,
            Err(error) => {
                warn!(package = %self.desc.name, export = %object.path(), %error, "export payload could not be read");
                object.set_flags(ObjectFlags::LOAD_FAILED);
                self.exports[index as usize].failed = true;
                return Ok(());
            }
        };
        object.set_flags(ObjectFlags::LOAD_COMPLETED);

        if read != size {
            let deprecated = object
                .class()
                .is_some_and(|class| cx.shared.serializer.is_deprecated_class(class));
            if deprecated || object.has_flags(ObjectFlags::DEPRECATED) {
                warn!(export = %object.path(), read, expected = size, "deprecated export read a different size");
            } else {
                return Err(FatalError::SerialSizeMismatch {
                    object: object.path().to_string(),
                    read,
                    expected: size,
                });
            }
        }
        self.update_load_percentage(cx);
        Ok(())
    }

    /// Start one precache read, releasing any startable export whose bytes
    /// need no read.
    fn start_precache_request(
        &mut self,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        let first = loop {
            let Some(index) = pop(&mut self.ready.exports_io_startable, cx.order) else {
                return Ok(());
            };
            let span = self.export_span(index);
            let needs_load = self.exports[index as usize]
                .object
                .as_ref()
                .is_some_and(|o| o.has_flags(ObjectFlags::NEED_LOAD));
            let resident = self
                .archive
                .as_ref()
                .is_some_and(|a| a.is_resident(span.offset, span.size));
            if !needs_load || resident {
                self.remove_node(self.export_node(index, Phase::StartIo), cx)?;
                continue;
            }
            if let Some(token) = self.export_to_request.get(&index).copied() {
                if let Some(request) = self.io_requests.get_mut(&token) {
                    request.exports.push(index);
                    continue;
                }
            }
            break span;
        };

        let following: Vec<ExportSpan> = self
            .ready
            .exports_io_startable
            .iter()
            .map(|&i| self.export_span(i))
            .collect();
        let planned = {
            let archive = self.archive.as_ref();
            let covered = |i: u32| self.export_to_request.contains_key(&i);
            let resident = |s: &ExportSpan| archive.is_some_and(|a| a.is_resident(s.offset, s.size));
            plan_read(
                first,
                &following,
                &cx.shared.config.precache_limits(),
                !cx.order.is_randomized(),
                &covered,
                &resident,
            )
        };
        for merged in &following[..planned.merged] {
            self.ready.exports_io_startable.remove(&merged.index);
        }
        if let Some(index) = planned.resident {
            self.ready.exports_io_startable.remove(&index);
            self.remove_node(self.export_node(index, Phase::StartIo), cx)?;
        }

        let read = planned.read;
        let Some(archive) = self.archive.as_ref() else {
            return Ok(());
        };
        let token = cx.io.next_token();
        let callback = cx.shared.incoming.read_callback(token);
        let request = archive
            .handle()
            .read_request(read.offset, read.len, self.desc.priority, callback);
        debug!(
            package = %self.desc.name,
            offset = read.offset,
            bytes = read.len,
            first = read.first,
            last = read.last,
            "precache read"
        );
        cx.io.waiting_reads.insert(token, self.weak);
        cx.shared.stats.record_read(read.len);
        for index in read.first..=read.last {
            self.export_to_request.insert(index, token);
        }
        self.io_requests.insert(
            token,
            ExportIoRequest {
                offset: read.offset,
                len: read.len,
                first: read.first,
                last: read.last,
                exports: read.exports,
                request,
            },
        );
        Ok(())
    }

    fn export_span(
        &self,
        index: u32,
    ) -> ExportSpan {
        let (offset, size) = self
            .header
            .as_ref()
            .and_then(|h| h.exports.get(index as usize))
            .map(|e| (e.serial_offset, e.serial_size))
            .unwrap_or((0, 0));
        ExportSpan { index, offset, size }
    }

    /// A precache read landed. Returns its size for the throttle, or `None`
    /// if the read is not one of ours.
    pub(crate) fn precache_request_ready(
        &mut self,
        token: ReadToken,
        cx: &mut LoadContext<'_>,
    ) -> Option<u64> {
        let len = self.io_requests.get(&token)?.len;
        self.ready_requests.push(token);
        self.conditional_queue_process(cx);
        Some(len)
    }

    /// Make a landed read the current block and release the exports it
    /// covers.
    fn make_next_precache_request_current(
        &mut self,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        let Some(token) = self.ready_requests.pop() else {
            return Ok(());
        };
        let Some(read) = self.io_requests.shift_remove(&token) else {
            return Ok(());
        };
        cx.shared.throttle.finish_request(read.len);
        read.request.wait_completion(None);
        match read.request.take_bytes() {
            Ok(bytes) => {
                if let Some(archive) = self.archive.as_mut() {
                    archive.adopt_block(read.offset, bytes);
                }
            }
            Err(error) => {
                warn!(package = %self.desc.name, offset = read.offset, %error, "precache read failed");
            }
        }
        self.exports_in_block.clear();
        for index in read.first..=read.last {
            if self.export_to_request.get(&index) == Some(&token) {
                self.export_to_request.remove(&index);
            }
            self.exports_in_block.insert(index);
        }
        for index in read.exports {
            self.remove_node(self.export_node(index, Phase::StartIo), cx)?;
        }
        Ok(())
    }
}

fn serialize_from(
    archive: &mut PrecacheArchive,
    object: &ObjectRef,
    offset: u64,
    size: u64,
    package_name: &str,
    cx: &LoadContext<'_>,
) -> Result<u64, FsError> {
    let payload = archive.read_blocking(offset, size)?;
    let store = &cx.shared.store;
    let guard = store.gc_guard();
    let sc = SerializeContext::new(store, &guard, package_name, cx.shared);
    Ok(cx.shared.serializer.serialize_export(&sc, object, payload))
}
