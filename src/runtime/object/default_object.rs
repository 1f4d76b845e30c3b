//! Class default object construction
//!
//! A class default object is built from its super class's default object,
//! so building one means building every ancestor's first. Classes can
//! also name other classes whose default objects must exist first, which
//! can form cycles. Construction runs off an explicit worklist; a class
//! already on the in-progress stack is deferred and retried once the
//! outermost request finishes, instead of recursing.

use indexmap::IndexSet;
use tracing::{debug, warn};

use super::{GcGuard, ObjectDesc, ObjectFlags, ObjectId, ObjectRef, ObjectSerializer, ObjectStore};

/// Result of asking for a default object.
#[derive(Debug, Clone)]
pub enum DefaultObject {
    Ready(ObjectRef),
    /// Construction is waiting on a class that is itself being built.
    Deferred,
}

impl DefaultObject {
    pub fn ready(self) -> Option<ObjectRef> {
        match self {
            DefaultObject::Ready(object) => Some(object),
            DefaultObject::Deferred => None,
        }
    }
}

#[derive(Default)]
pub struct DefaultObjectBuilder {
    in_progress: IndexSet<ObjectId>,
    deferred: Vec<ObjectRef>,
    depth: usize,
    built: usize,
}

enum Step {
    Expand(ObjectRef),
    Build(ObjectRef),
}

fn default_object_path(class: &ObjectRef) -> String {
    match class.path().rsplit_once('.') {
        Some((package, name)) => format!("{}.Default__{}", package, name),
        None => format!("{}.Default", class.path()),
    }
}

impl DefaultObjectBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default objects built so far.
    pub fn built(&self) -> usize {
        self.built
    }

    /// Classes waiting for a retry.
    pub fn deferred(&self) -> usize {
        self.deferred.len()
    }

    /// Get or build the default object of `class`.
    pub fn default_object(
        &mut self,
        store: &ObjectStore,
        guard: &GcGuard<'_>,
        serializer: &dyn ObjectSerializer,
        class: &ObjectRef,
    ) -> DefaultObject {
        if let Some(existing) = class.default_object() {
            return DefaultObject::Ready(existing.clone());
        }
        if self.in_progress.contains(&class.id()) {
            self.defer(class);
            return DefaultObject::Deferred;
        }

        self.depth += 1;
        let mut work = vec![Step::Expand(class.clone())];
        while let Some(step) = work.pop() {
            match step {
                Step::Expand(current) => {
                    if current.default_object().is_some() {
                        continue;
                    }
                    if !self.in_progress.insert(current.id()) {
                        // Reached again while its own prerequisites are pending.
                        self.defer(&current);
                        continue;
                    }
                    work.push(Step::Build(current.clone()));
                    if let Some(parent) = current.super_class() {
                        if parent.default_object().is_none() {
                            work.push(Step::Expand(parent.clone()));
                        }
                    }
                    for dependency in serializer.default_object_dependencies(&current) {
                        if dependency.default_object().is_none() {
                            work.push(Step::Expand(dependency));
                        }
                    }
                }
                Step::Build(current) => {
                    self.in_progress.shift_remove(&current.id());
                    if !self.build_one(store, guard, &current) {
                        self.defer(&current);
                    }
                }
            }
        }
        self.depth -= 1;

        if self.depth == 0 {
            self.retry_deferred(store, guard);
        }
        match class.default_object() {
            Some(object) => DefaultObject::Ready(object.clone()),
            None => DefaultObject::Deferred,
        }
    }

    fn defer(
        &mut self,
        class: &ObjectRef,
    ) {
        if !self.deferred.iter().any(|c| c.id() == class.id()) {
            debug!(class = class.path(), "default object deferred");
            self.deferred.push(class.clone());
        }
    }

    /// Build one default object from its parent's. Fails if the parent's
    /// default object does not exist yet.
    fn build_one(
        &mut self,
        store: &ObjectStore,
        guard: &GcGuard<'_>,
        class: &ObjectRef,
    ) -> bool {
        if class.default_object().is_some() {
            return true;
        }
        let template = match class.super_class() {
            Some(parent) => match parent.default_object() {
                Some(template) => Some(template.clone()),
                None => return false,
            },
            None => None,
        };
        let mut flags = ObjectFlags::DEFAULT_OBJECT | ObjectFlags::LOAD_COMPLETED;
        if class.has_flags(ObjectFlags::NATIVE) {
            flags = flags | ObjectFlags::ROOTED;
        }
        let object = store.register(
            guard,
            ObjectDesc::new(default_object_path(class), flags)
                .with_class(Some(class.clone()))
                .with_outer(class.outer().cloned())
                .with_data(template.map(|t| t.data()).unwrap_or_default()),
        );
        if class.install_default_object(object) {
            self.built += 1;
        }
        true
    }

    /// Retry deferred classes until a pass makes no progress.
    fn retry_deferred(
        &mut self,
        store: &ObjectStore,
        guard: &GcGuard<'_>,
    ) {
        loop {
            let pending = std::mem::take(&mut self.deferred);
            if pending.is_empty() {
                return;
            }
            let before = pending.len();
            for class in pending {
                // Ancestors first so a parent deferred behind its child still lands.
                let mut chain = vec![class.clone()];
                while let Some(parent) = chain.last().and_then(|c| c.super_class().cloned()) {
                    if parent.default_object().is_some() || chain.len() > 256 {
                        break;
                    }
                    chain.push(parent);
                }
                let mut ok = true;
                for link in chain.iter().rev() {
                    ok = self.build_one(store, guard, link);
                    if !ok {
                        break;
                    }
                }
                if !ok {
                    self.deferred.push(class);
                }
            }
            if self.deferred.len() == before {
                warn!(count = before, "default objects could not be built");
                return;
            }
        }
    }
}
