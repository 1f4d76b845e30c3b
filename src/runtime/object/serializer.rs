//! Object serializer seam
//!
//! The loader decides *when* an object is created, serialized and
//! post-loaded; an [`ObjectSerializer`] decides *what* that means for the
//! program's object model.

use super::{GcGuard, ObjectDesc, ObjectFlags, ObjectRef, ObjectStore};
use crate::runtime::error::RequestError;
use crate::runtime::format::{export_flags, ExportEntry};
use crate::runtime::scheduler::{PackageRequest, RequestId};

/// Lets serializers request further loads while running.
pub trait LoadRequester: Send + Sync {
    fn request_load(
        &self,
        request: PackageRequest,
    ) -> Result<RequestId, RequestError>;
}

/// Borrowed view of the loader handed to serializer hooks.
pub struct SerializeContext<'a> {
    pub(crate) store: &'a ObjectStore,
    pub(crate) guard: &'a GcGuard<'a>,
    pub(crate) package_name: &'a str,
    pub(crate) requester: &'a dyn LoadRequester,
}

impl<'a> SerializeContext<'a> {
    pub fn new(
        store: &'a ObjectStore,
        guard: &'a GcGuard<'a>,
        package_name: &'a str,
        requester: &'a dyn LoadRequester,
    ) -> Self {
        Self {
            store,
            guard,
            package_name,
            requester,
        }
    }

    pub fn store(&self) -> &ObjectStore {
        self.store
    }

    /// Package currently being loaded.
    pub fn package_name(&self) -> &str {
        self.package_name
    }

    pub fn register(
        &self,
        desc: ObjectDesc,
    ) -> ObjectRef {
        self.store.register(self.guard, desc)
    }

    /// Queue another package load from inside serialization. It is picked
    /// up on a later pass of the loader; never waited for here.
    pub fn request_load(
        &self,
        request: PackageRequest,
    ) -> Result<RequestId, RequestError> {
        self.requester.request_load(request)
    }
}

/// Inputs for creating one export.
#[derive(Debug)]
pub struct ExportCreate<'a> {
    pub path: &'a str,
    pub entry: &'a ExportEntry,
    pub class: &'a ObjectRef,
    pub outer: &'a ObjectRef,
    pub super_class: Option<&'a ObjectRef>,
    pub template: Option<&'a ObjectRef>,
}

pub trait ObjectSerializer: Send + Sync {
    /// Find a resident or compiled-in object for an import.
    fn create_import(
        &self,
        cx: &SerializeContext<'_>,
        path: &str,
    ) -> Option<ObjectRef> {
        cx.store().find(path)
    }

    /// Allocate the object for an export. Returning `None` fails the export.
    fn create_export(
        &self,
        cx: &SerializeContext<'_>,
        create: &ExportCreate<'_>,
    ) -> Option<ObjectRef>;

    /// Fill an export from its payload and return the bytes consumed.
    fn serialize_export(
        &self,
        cx: &SerializeContext<'_>,
        object: &ObjectRef,
        payload: &[u8],
    ) -> u64;

    /// Finish an object on the foreground thread.
    fn post_load(
        &self,
        object: &ObjectRef,
    ) {
        object.clear_flags(ObjectFlags::NEED_POST_LOAD);
    }

    /// Deprecated classes may read fewer bytes than were saved.
    fn is_deprecated_class(
        &self,
        class: &ObjectRef,
    ) -> bool {
        class.has_flags(ObjectFlags::DEPRECATED)
    }

    /// Classes whose default objects must exist before this class's.
    fn default_object_dependencies(
        &self,
        _class: &ObjectRef,
    ) -> Vec<ObjectRef> {
        Vec::new()
    }
}

/// Stores each payload verbatim as the object's data.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSerializer;

impl ObjectSerializer for DefaultSerializer {
    fn create_export(
        &self,
        cx: &SerializeContext<'_>,
        create: &ExportCreate<'_>,
    ) -> Option<ObjectRef> {
        let mut flags = ObjectFlags::NEED_LOAD | ObjectFlags::NEED_POST_LOAD;
        if create.entry.has_flags(export_flags::CLASS) {
            flags = flags | ObjectFlags::CLASS;
        }
        if create.entry.has_flags(export_flags::DEFAULT_OBJECT) {
            flags = flags | ObjectFlags::DEFAULT_OBJECT;
        }
        if create.entry.has_flags(export_flags::DEPRECATED) {
            flags = flags | ObjectFlags::DEPRECATED;
        }
        let object = cx.register(
            ObjectDesc::new(create.path, flags)
                .with_class(Some(create.class.clone()))
                .with_outer(Some(create.outer.clone()))
                .with_super(create.super_class.cloned())
                .with_data(create.template.map(|t| t.data()).unwrap_or_default()),
        );
        // An object left over from an earlier load is reloaded in place.
        if object.is_loaded() {
            object.set_flags(ObjectFlags::NEED_LOAD | ObjectFlags::NEED_POST_LOAD);
        }
        Some(object)
    }

    fn serialize_export(
        &self,
        _cx: &SerializeContext<'_>,
        object: &ObjectRef,
        payload: &[u8],
    ) -> u64 {
        object.set_data(payload.to_vec());
        payload.len() as u64
    }
}
