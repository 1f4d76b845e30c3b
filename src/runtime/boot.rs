//! Compiled-in objects during initial load
//!
//! While the process is still booting, compiled-in ("native") objects may
//! exist in the store before they are fully registered. An import of such
//! an object cannot be linked until the bootstrap registry reports it
//! complete; its create node is fired externally and parked here until
//! then.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::runtime::dag::NodeRef;
use crate::runtime::package::WeakPackageRef;

/// The program's registry of compiled-in types.
pub trait BootstrapRegistry: Send + Sync {
    /// A compiled-in object was registered (`completed == false`) or
    /// finished registering.
    fn notify_registration_event(
        &self,
        _package: &str,
        _name: &str,
        _completed: bool,
    ) {
    }

    /// Has the compiled-in object at `path` finished registering?
    fn is_object_complete(
        &self,
        path: &str,
    ) -> bool;

    /// Finish registering one object that is still waiting. Returns
    /// whether anything was constructed.
    fn construct_next_waiting_boot_object(&self) -> bool;
}

/// A registry for programs without compiled-in objects.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBootstrap;

impl BootstrapRegistry for NoBootstrap {
    fn is_object_complete(
        &self,
        _path: &str,
    ) -> bool {
        true
    }

    fn construct_next_waiting_boot_object(&self) -> bool {
        false
    }
}

/// Import create nodes waiting on compiled-in objects.
pub struct BootNotificationManager {
    registry: Arc<dyn BootstrapRegistry>,
    waiting: Mutex<IndexMap<String, Vec<NodeRef>>>,
}

impl BootNotificationManager {
    pub fn new(registry: Arc<dyn BootstrapRegistry>) -> Self {
        Self {
            registry,
            waiting: Mutex::new(IndexMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn BootstrapRegistry> {
        &self.registry
    }

    pub fn is_object_complete(
        &self,
        path: &str,
    ) -> bool {
        self.registry.is_object_complete(path)
    }

    pub fn notify_registration_event(
        &self,
        package: &str,
        name: &str,
        completed: bool,
    ) {
        trace!(package, name, completed, "bootstrap registration");
        self.registry.notify_registration_event(package, name, completed);
    }

    /// Park `node` until `path` completes. Returns `false` if it already
    /// has, in which case the caller fires the node normally.
    pub fn add_waiting(
        &self,
        path: &str,
        node: NodeRef,
    ) -> bool {
        if self.registry.is_object_complete(path) {
            return false;
        }
        debug!(path, %node, "import waits on bootstrap");
        self.waiting.lock().entry(path.to_string()).or_default().push(node);
        true
    }

    /// Nodes whose object has completed since they were parked.
    pub fn take_completed(&self) -> Vec<NodeRef> {
        let mut waiting = self.waiting.lock();
        let mut ready = Vec::new();
        waiting.retain(|path, nodes| {
            if self.registry.is_object_complete(path) {
                ready.append(nodes);
                false
            } else {
                true
            }
        });
        ready
    }

    /// Ask the registry to finish one more object.
    pub fn construct_waiting_boot_objects(&self) -> bool {
        self.registry.construct_next_waiting_boot_object()
    }

    pub fn has_waiting(&self) -> bool {
        !self.waiting.lock().is_empty()
    }

    pub fn waiting_paths(&self) -> Vec<String> {
        self.waiting.lock().keys().cloned().collect()
    }

    /// Drop parked nodes of a canceled package.
    pub fn forget_package(
        &self,
        package: WeakPackageRef,
    ) {
        let mut waiting = self.waiting.lock();
        waiting.retain(|_, nodes| {
            nodes.retain(|n| n.package != package);
            !nodes.is_empty()
        });
    }

    pub fn clear(&self) {
        self.waiting.lock().clear();
    }
}
