//! Loaded objects and the store that owns them
//!
//! Objects are shared as [`ObjectRef`] (`Arc<Object>`); flags are atomic so
//! the foreground thread can post-load objects while the loader thread
//! keeps creating others. Creating or linking objects requires a
//! [`GcGuard`], which keeps [`ObjectStore::collect_garbage`] from running
//! in the middle of it.

mod default_object;
mod serializer;

pub use default_object::{DefaultObject, DefaultObjectBuilder};
pub use serializer::{DefaultSerializer, ExportCreate, LoadRequester, ObjectSerializer, SerializeContext};

use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::debug;

/// Bit set describing an object's load state and kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ObjectFlags(u32);

impl ObjectFlags {
    pub const NONE: ObjectFlags = ObjectFlags(0);
    /// Created but not yet serialized.
    pub const NEED_LOAD: ObjectFlags = ObjectFlags(1 << 0);
    /// Serialized but not yet post-loaded.
    pub const NEED_POST_LOAD: ObjectFlags = ObjectFlags(1 << 1);
    pub const LOAD_COMPLETED: ObjectFlags = ObjectFlags(1 << 2);
    pub const DEFAULT_OBJECT: ObjectFlags = ObjectFlags(1 << 3);
    /// Compiled into the program rather than loaded from a package.
    pub const NATIVE: ObjectFlags = ObjectFlags(1 << 4);
    pub const CLASS: ObjectFlags = ObjectFlags(1 << 5);
    pub const PACKAGE: ObjectFlags = ObjectFlags(1 << 6);
    pub const DEPRECATED: ObjectFlags = ObjectFlags(1 << 7);
    /// Never garbage collected.
    pub const ROOTED: ObjectFlags = ObjectFlags(1 << 8);
    pub const LOAD_FAILED: ObjectFlags = ObjectFlags(1 << 9);

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        ObjectFlags(bits)
    }

    #[inline]
    pub const fn contains(
        self,
        other: ObjectFlags,
    ) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(
        self,
        other: ObjectFlags,
    ) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for ObjectFlags {
    type Output = ObjectFlags;

    fn bitor(
        self,
        rhs: ObjectFlags,
    ) -> ObjectFlags {
        ObjectFlags(self.0 | rhs.0)
    }
}

/// Process-unique object identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

pub type ObjectRef = Arc<Object>;

/// A loaded (or loading) object.
pub struct Object {
    id: ObjectId,
    path: String,
    class: Option<ObjectRef>,
    outer: Option<ObjectRef>,
    super_class: Option<ObjectRef>,
    flags: AtomicU32,
    data: RwLock<Vec<u8>>,
    default_object: OnceCell<ObjectRef>,
}

impl Object {
    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        self.path
            .rsplit(['.', '/'])
            .next()
            .unwrap_or(&self.path)
    }

    pub fn class(&self) -> Option<&ObjectRef> {
        self.class.as_ref()
    }

    pub fn outer(&self) -> Option<&ObjectRef> {
        self.outer.as_ref()
    }

    pub fn super_class(&self) -> Option<&ObjectRef> {
        self.super_class.as_ref()
    }

    #[inline]
    pub fn flags(&self) -> ObjectFlags {
        ObjectFlags(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn has_flags(
        &self,
        flags: ObjectFlags,
    ) -> bool {
        self.flags().contains(flags)
    }

    pub fn set_flags(
        &self,
        flags: ObjectFlags,
    ) {
        self.flags.fetch_or(flags.0, Ordering::AcqRel);
    }

    pub fn clear_flags(
        &self,
        flags: ObjectFlags,
    ) {
        self.flags.fetch_and(!flags.0, Ordering::AcqRel);
    }

    /// Fully loaded: not waiting for serialization.
    #[inline]
    pub fn is_loaded(&self) -> bool {
        !self.has_flags(ObjectFlags::NEED_LOAD)
    }

    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    pub fn data_len(&self) -> usize {
        self.data.read().len()
    }

    pub fn set_data(
        &self,
        bytes: Vec<u8>,
    ) {
        *self.data.write() = bytes;
    }

    /// The class default object, if it has been built.
    pub fn default_object(&self) -> Option<&ObjectRef> {
        self.default_object.get()
    }

    pub(crate) fn install_default_object(
        &self,
        object: ObjectRef,
    ) -> bool {
        self.default_object.set(object).is_ok()
    }

    /// Does this class derive from `ancestor` (or equal it)?
    pub fn is_child_of(
        &self,
        ancestor: &Object,
    ) -> bool {
        let mut cursor = Some(self);
        while let Some(class) = cursor {
            if class.id == ancestor.id {
                return true;
            }
            cursor = class.super_class.as_deref();
        }
        false
    }
}

impl fmt::Debug for Object {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("flags", &format_args!("{:#x}", self.flags().bits()))
            .finish()
    }
}

/// Everything needed to register a new object.
#[derive(Debug, Clone, Default)]
pub struct ObjectDesc {
    pub path: String,
    pub class: Option<ObjectRef>,
    pub outer: Option<ObjectRef>,
    pub super_class: Option<ObjectRef>,
    pub flags: ObjectFlags,
    pub data: Vec<u8>,
}

impl ObjectDesc {
    pub fn new(
        path: impl Into<String>,
        flags: ObjectFlags,
    ) -> Self {
        Self {
            path: path.into(),
            flags,
            ..Default::default()
        }
    }

    pub fn with_class(
        mut self,
        class: Option<ObjectRef>,
    ) -> Self {
        self.class = class;
        self
    }

    pub fn with_outer(
        mut self,
        outer: Option<ObjectRef>,
    ) -> Self {
        self.outer = outer;
        self
    }

    pub fn with_super(
        mut self,
        super_class: Option<ObjectRef>,
    ) -> Self {
        self.super_class = super_class;
        self
    }

    pub fn with_data(
        mut self,
        data: Vec<u8>,
    ) -> Self {
        self.data = data;
        self
    }
}

/// Proof that garbage collection cannot run.
pub struct GcGuard<'a> {
    _lock: RwLockReadGuard<'a, ()>,
}

/// Owns every object by path.
pub struct ObjectStore {
    objects: RwLock<HashMap<String, ObjectRef>>,
    gc_lock: RwLock<()>,
    next_id: AtomicU64,
    class_class: ObjectRef,
}

/// Path of the class every class export is an instance of.
pub const CLASS_CLASS_PATH: &str = "/Script/Core.Class";

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore {
    pub fn new() -> Self {
        let core = Arc::new(Object {
            id: ObjectId(0),
            path: "/Script/Core".to_string(),
            class: None,
            outer: None,
            super_class: None,
            flags: AtomicU32::new((ObjectFlags::PACKAGE | ObjectFlags::NATIVE | ObjectFlags::ROOTED).0),
            data: RwLock::new(Vec::new()),
            default_object: OnceCell::new(),
        });
        let class_class = Arc::new(Object {
            id: ObjectId(1),
            path: CLASS_CLASS_PATH.to_string(),
            class: None,
            outer: Some(core.clone()),
            super_class: None,
            flags: AtomicU32::new((ObjectFlags::CLASS | ObjectFlags::NATIVE | ObjectFlags::ROOTED).0),
            data: RwLock::new(Vec::new()),
            default_object: OnceCell::new(),
        });
        let mut objects = HashMap::new();
        objects.insert(core.path.clone(), core);
        objects.insert(class_class.path.clone(), class_class.clone());
        Self {
            objects: RwLock::new(objects),
            gc_lock: RwLock::new(()),
            next_id: AtomicU64::new(2),
            class_class,
        }
    }

    /// The meta class of all classes.
    pub fn class_class(&self) -> &ObjectRef {
        &self.class_class
    }

    /// Block garbage collection for the guard's lifetime.
    pub fn gc_guard(&self) -> GcGuard<'_> {
        GcGuard {
            _lock: self.gc_lock.read(),
        }
    }

    pub fn find(
        &self,
        path: &str,
    ) -> Option<ObjectRef> {
        self.objects.read().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Objects living inside `package`, the package object excluded.
    pub fn objects_in_package(
        &self,
        package: &str,
    ) -> usize {
        let prefix = format!("{}.", package);
        self.objects.read().keys().filter(|path| path.starts_with(&prefix)).count()
    }

    /// Register a new object, replacing nothing: if an object already
    /// lives at the path it is returned instead.
    pub fn register(
        &self,
        _guard: &GcGuard<'_>,
        desc: ObjectDesc,
    ) -> ObjectRef {
        let mut objects = self.objects.write();
        if let Some(existing) = objects.get(&desc.path) {
            return existing.clone();
        }
        let object = Arc::new(Object {
            id: ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            path: desc.path,
            class: desc.class,
            outer: desc.outer,
            super_class: desc.super_class,
            flags: AtomicU32::new(desc.flags.0),
            data: RwLock::new(desc.data),
            default_object: OnceCell::new(),
        });
        objects.insert(object.path.clone(), object.clone());
        object
    }

    /// Register a compiled-in package.
    pub fn register_native_package(
        &self,
        name: &str,
    ) -> ObjectRef {
        let guard = self.gc_guard();
        self.register(
            &guard,
            ObjectDesc::new(name, ObjectFlags::PACKAGE | ObjectFlags::NATIVE | ObjectFlags::ROOTED | ObjectFlags::LOAD_COMPLETED),
        )
    }

    /// Register a compiled-in class inside a compiled-in package.
    pub fn register_native_class(
        &self,
        package: &str,
        name: &str,
        super_class: Option<&ObjectRef>,
    ) -> ObjectRef {
        let outer = self.register_native_package(package);
        let guard = self.gc_guard();
        self.register(
            &guard,
            ObjectDesc::new(
                format!("{}.{}", package, name),
                ObjectFlags::CLASS | ObjectFlags::NATIVE | ObjectFlags::ROOTED | ObjectFlags::LOAD_COMPLETED,
            )
            .with_class(Some(self.class_class.clone()))
            .with_outer(Some(outer))
            .with_super(super_class.cloned()),
        )
    }

    /// Drop objects nobody else references. Native and rooted objects,
    /// and anything still loading, survive.
    ///
    /// Blocks until every outstanding [`GcGuard`] is released.
    pub fn collect_garbage(&self) -> usize {
        let _exclusive = self.gc_lock.write();
        let mut objects = self.objects.write();
        let mut removed = 0;
        loop {
            let before = objects.len();
            objects.retain(|_, object| {
                Arc::strong_count(object) > 1
                    || object.has_flags(ObjectFlags::ROOTED)
                    || object.intersects_loading()
            });
            let dropped = before - objects.len();
            if dropped == 0 {
                break;
            }
            removed += dropped;
        }
        debug!(removed, remaining = objects.len(), "garbage collected");
        removed
    }
}

impl Object {
    fn intersects_loading(&self) -> bool {
        self.flags()
            .intersects(ObjectFlags::NEED_LOAD | ObjectFlags::NEED_POST_LOAD | ObjectFlags::NATIVE)
    }
}
