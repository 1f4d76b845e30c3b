//! After serialization: waiting for in-flight imports, postload and
//! completion.

use indexmap::IndexSet;
use tracing::{debug, trace};

use super::{PackageLoader, PackageState, WeakPackageRef};
use crate::runtime::dag::Phase;
use crate::runtime::error::FatalError;
use crate::runtime::object::{ObjectFlags, ObjectRef, ObjectSerializer};
use crate::runtime::scheduler::context::{LoadContext, TimeBudget};
use crate::runtime::scheduler::incoming::IoRegistry;
use crate::runtime::scheduler::queue::{EventKind, EventQueue, LoadOrder};
use crate::runtime::scheduler::request::{LoadCallback, LoadResult, RequestId};

/// What the foreground needs once a package is finished.
pub struct Completion {
    pub name: String,
    pub object: Option<ObjectRef>,
    pub result: LoadResult,
    pub callbacks: Vec<LoadCallback>,
    pub request_ids: Vec<RequestId>,
    /// Packages this one kept alive; release one reference on each.
    pub imported: Vec<WeakPackageRef>,
}

impl PackageLoader {
    pub(super) fn event_exports_done(
        &mut self,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        self.expect_state(PackageState::ProcessingImportsAndExports, "ProcessingImportsAndExports")?;
        self.all_exports_serialized = true;
        self.remove_node(self.node(Phase::ExportsSerialized), cx)?;
        self.set_state(PackageState::WaitingForPostLoad);
        self.ready.clear();
        self.exports_in_block.clear();
        if let Some(archive) = self.archive.as_mut() {
            archive.flush_block();
        }
        self.update_load_percentage(cx);

        self.conditional_queue_postload_wait(cx.events, cx.order);
        self.release_postload_waiters(cx);
        Ok(())
    }

    /// Packages waiting on this one may look again: it will not hold them up.
    pub(super) fn release_postload_waiters(
        &mut self,
        cx: &mut LoadContext<'_>,
    ) {
        for waiter in std::mem::take(&mut self.waiting_for_me) {
            let Some(other) = cx.packages.get_mut(waiter) else {
                continue;
            };
            other.waiting_for.shift_remove(&self.weak);
            other.may_wait_for.insert(self.weak);
            other.conditional_queue_postload_wait(cx.events, cx.order);
        }
    }

    pub(super) fn conditional_queue_postload_wait(
        &mut self,
        events: &mut EventQueue,
        order: &mut LoadOrder,
    ) {
        if self.state == PackageState::WaitingForPostLoad
            && !self.postload_wait_in_flight
            && self.waiting_for.is_empty()
        {
            self.postload_wait_in_flight = true;
            self.queue(events, order, EventKind::ProcessPostloadWait, 0);
        }
    }

    /// Postload only once every package reachable through in-flight imports
    /// has serialized its exports. The walk stops at the first package still
    /// serializing and resumes when that package reports in.
    pub(super) fn event_process_postload_wait(
        &mut self,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        self.expect_state(PackageState::WaitingForPostLoad, "WaitingForPostLoad")?;
        self.postload_wait_in_flight = false;

        let me = self.weak;
        let mut handled: IndexSet<WeakPackageRef> = IndexSet::new();
        handled.insert(me);
        let mut blocked_by = Vec::new();

        let candidates = std::mem::take(&mut self.may_wait_for);
        for candidate in candidates {
            match cx.packages.get(candidate) {
                Some(other) if candidate != me && other.state() <= PackageState::WaitingForPostLoad => {
                    if other.all_exports_serialized {
                        self.may_wait_for.insert(candidate);
                    } else {
                        handled.insert(candidate);
                        blocked_by.push(candidate);
                    }
                }
                _ => {
                    handled.insert(candidate);
                }
            }
        }

        while blocked_by.is_empty() {
            let Some(popped) = self.may_wait_for.shift_remove_index(0) else {
                break;
            };
            if !handled.insert(popped) {
                continue;
            }
            let Some(other) = cx.packages.get(popped) else {
                continue;
            };
            if other.state() > PackageState::WaitingForPostLoad {
                continue;
            }
            // Everything this one already waits on, we wait on too.
            blocked_by.extend(other.waiting_for.iter().copied().filter(|p| *p != me));
            for next in other.may_wait_for.iter().copied() {
                if handled.contains(&next) || next == me {
                    continue;
                }
                match cx.packages.get(next) {
                    Some(p) if p.state() <= PackageState::WaitingForPostLoad => {
                        if p.all_exports_serialized {
                            self.may_wait_for.insert(next);
                        } else {
                            handled.insert(next);
                            blocked_by.push(next);
                        }
                    }
                    _ => {}
                }
            }
        }

        for blocker in blocked_by {
            if !self.waiting_for.insert(blocker) {
                continue;
            }
            if let Some(other) = cx.packages.get_mut(blocker) {
                other.waiting_for_me.insert(me);
            }
        }

        if self.waiting_for.is_empty() {
            self.may_wait_for.clear();
            self.set_state(PackageState::ReadyForPostLoad);
            self.queue(cx.events, cx.order, EventKind::StartPostLoad, 0);
        } else {
            trace!(
                package = %self.desc.name,
                waiting_for = self.waiting_for.len(),
                "postload waits on other packages"
            );
        }
        Ok(())
    }

    pub(super) fn event_start_post_load(
        &mut self,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        self.expect_state(PackageState::ReadyForPostLoad, "ReadyForPostLoad")?;
        self.set_state(PackageState::PostLoad);
        self.check_no_nodes_left(cx)?;
        self.waiting_to_link_imports.clear();

        // Popped from the back, so store them reversed.
        self.objects_to_postload = self
            .exports
            .iter()
            .rev()
            .filter_map(|slot| slot.object.clone())
            .filter(|object| object.has_flags(ObjectFlags::NEED_POST_LOAD))
            .collect();
        cx.ready_for_tick.push_back(self.weak);
        Ok(())
    }

    /// Objects still waiting for their postload hook.
    pub fn pending_postloads(&self) -> usize {
        self.objects_to_postload.len()
    }

    /// Run postload hooks until done or out of time. Returns `true` when
    /// every object of the package is finished.
    pub fn post_load_objects(
        &mut self,
        serializer: &dyn ObjectSerializer,
        budget: &TimeBudget,
    ) -> bool {
        let mut ran = 0;
        while let Some(object) = self.objects_to_postload.pop() {
            if object.has_flags(ObjectFlags::NEED_POST_LOAD) {
                serializer.post_load(&object);
                object.clear_flags(ObjectFlags::NEED_POST_LOAD);
                ran += 1;
            }
            if ran > 0 && budget.exceeded() && !self.objects_to_postload.is_empty() {
                return false;
            }
        }
        true
    }

    /// Settle the package object and hand back everything the foreground
    /// reports. Leaves the loader in `Complete`.
    pub fn complete(
        &mut self,
        canceled: bool,
    ) -> Completion {
        let result = if canceled {
            LoadResult::Canceled
        } else if self.failed() {
            LoadResult::Failed
        } else {
            LoadResult::Succeeded
        };
        if let Some(package) = &self.package_object {
            if !self.already_resident {
                package.clear_flags(ObjectFlags::NEED_LOAD);
                if result == LoadResult::Succeeded {
                    package.set_flags(ObjectFlags::LOAD_COMPLETED);
                } else {
                    package.set_flags(ObjectFlags::LOAD_FAILED);
                }
            }
        }
        self.set_state(PackageState::Complete);
        self.archive = None;
        self.objects_to_postload.clear();
        debug!(
            package = %self.desc.name,
            %result,
            elapsed_ms = self.load_start_time.map(|t| t.elapsed().as_millis() as u64).unwrap_or(0),
            "package finished"
        );
        Completion {
            name: self.desc.name.clone(),
            object: if result == LoadResult::Succeeded {
                self.package_object.clone()
            } else {
                None
            },
            result,
            callbacks: std::mem::take(&mut self.callbacks),
            request_ids: std::mem::take(&mut self.request_ids),
            imported: std::mem::take(&mut self.imported_packages).into_iter().collect(),
        }
    }

    /// Abandon the load. Outstanding reads are canceled and parked in the
    /// registry until they drain; objects that never finished are marked
    /// failed. Returns the bytes of landed reads that were never consumed.
    pub fn cancel(
        &mut self,
        io: &mut IoRegistry,
    ) -> u64 {
        let unconsumed = self
            .ready_requests
            .iter()
            .filter_map(|token| self.io_requests.get(token))
            .map(|read| read.len)
            .sum();
        if let Some(archive) = self.archive.as_mut() {
            if let Some(request) = archive.cancel() {
                io.tombstones.push(request);
            }
        }
        for (_, read) in self.io_requests.drain(..) {
            read.request.cancel();
            io.tombstones.push(read.request);
        }
        io.forget_package(self.weak);
        self.export_to_request.clear();
        self.ready_requests.clear();
        self.ready.clear();
        for object in self.exports.iter().filter_map(|slot| slot.object.as_ref()) {
            if object.has_flags(ObjectFlags::NEED_LOAD) {
                object.clear_flags(ObjectFlags::NEED_LOAD | ObjectFlags::NEED_POST_LOAD);
                object.set_flags(ObjectFlags::LOAD_FAILED);
            }
        }
        self.waiting_to_link_imports.clear();
        self.may_wait_for.clear();
        self.waiting_for.clear();
        self.waiting_for_me.clear();
        unconsumed
    }
}
