//! Package file format
//!
//! ```text
//! +----------------------+  offset 0
//! | magic  u32 LE        |
//! | version u32 LE       |
//! | header_size u32 LE   |  total bytes of prologue + tables
//! +----------------------+  offset 12
//! | PackageHeader        |  bincode, standard config
//! | (zero padding)       |
//! +----------------------+  offset header_size
//! | export payloads      |  located by serial_offset / serial_size
//! +----------------------+
//! ```
//!
//! The prologue is fixed size so the loader can learn how much header to
//! read from the first summary read alone.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::runtime::error::LoadError;

/// First four bytes of every package file.
pub const PACKAGE_MAGIC: u32 = 0x9E2A_83C1;

/// Version written by [`PackageWriter`].
pub const CURRENT_FILE_VERSION: u32 = 3;

/// Oldest version the loader accepts.
pub const MIN_FILE_VERSION: u32 = 2;

/// Size of the fixed prologue in bytes.
pub const PROLOGUE_SIZE: usize = 12;

/// Upper bound on memory a header decode may claim.
const DECODE_LIMIT: usize = 64 * 1024 * 1024;

/// Class name used by package imports.
pub const PACKAGE_CLASS: &str = "Package";

/// Reference into a package's tables.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum PackageIndex {
    #[default]
    Null,
    Import(u32),
    Export(u32),
}

impl PackageIndex {
    #[inline]
    pub fn is_null(self) -> bool {
        matches!(self, PackageIndex::Null)
    }

    #[inline]
    pub fn as_import(self) -> Option<u32> {
        match self {
            PackageIndex::Import(i) => Some(i),
            _ => None,
        }
    }

    #[inline]
    pub fn as_export(self) -> Option<u32> {
        match self {
            PackageIndex::Export(i) => Some(i),
            _ => None,
        }
    }
}

impl fmt::Display for PackageIndex {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            PackageIndex::Null => write!(f, "null"),
            PackageIndex::Import(i) => write!(f, "import {}", i),
            PackageIndex::Export(i) => write!(f, "export {}", i),
        }
    }
}

/// Export flag bits stored in [`ExportEntry::flags`].
pub mod export_flags {
    /// Other packages may import this export.
    pub const PUBLIC: u32 = 1 << 0;
    /// The export is the default object of its class.
    pub const DEFAULT_OBJECT: u32 = 1 << 1;
    /// The export defines a class.
    pub const CLASS: u32 = 1 << 2;
    /// The exported class is deprecated; size mismatches are only warned about.
    pub const DEPRECATED: u32 = 1 << 3;
}

/// An object this package needs from elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportEntry {
    pub class_package: String,
    pub class_name: String,
    pub object_name: String,
    pub outer: PackageIndex,
}

impl ImportEntry {
    /// An import of a whole package by name.
    pub fn package(name: impl Into<String>) -> Self {
        Self {
            class_package: "/Script/Core".to_string(),
            class_name: PACKAGE_CLASS.to_string(),
            object_name: name.into(),
            outer: PackageIndex::Null,
        }
    }

    /// An import of an object living inside `outer`.
    pub fn object(
        class_package: impl Into<String>,
        class_name: impl Into<String>,
        object_name: impl Into<String>,
        outer: PackageIndex,
    ) -> Self {
        Self {
            class_package: class_package.into(),
            class_name: class_name.into(),
            object_name: object_name.into(),
            outer,
        }
    }

    #[inline]
    pub fn is_package(&self) -> bool {
        self.outer.is_null() && self.class_name == PACKAGE_CLASS
    }
}

/// An object defined by this package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportEntry {
    pub object_name: String,
    pub class: PackageIndex,
    pub super_class: PackageIndex,
    pub template: PackageIndex,
    pub outer: PackageIndex,
    pub flags: u32,
    pub serial_offset: u64,
    pub serial_size: u64,
    /// Start of this export's run in [`PackageHeader::preload_dependencies`], or -1.
    pub first_dependency: i32,
    pub serialize_before_serialize: u32,
    pub create_before_serialize: u32,
    pub serialize_before_create: u32,
    pub create_before_create: u32,
}

impl ExportEntry {
    #[inline]
    pub fn has_flags(
        &self,
        flags: u32,
    ) -> bool {
        self.flags & flags == flags
    }

    /// End of the payload, or `None` if the entry overflows the offset range.
    #[inline]
    pub fn serial_end(&self) -> Option<u64> {
        self.serial_offset.checked_add(self.serial_size)
    }

    fn dependency_count(&self) -> Option<usize> {
        [
            self.serialize_before_serialize,
            self.create_before_serialize,
            self.serialize_before_create,
            self.create_before_create,
        ]
        .into_iter()
        .try_fold(0usize, |total, count| total.checked_add(count as usize))
    }
}

/// The four preload-dependency categories of one export, in file order.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreloadDependencies<'a> {
    pub serialize_before_serialize: &'a [PackageIndex],
    pub create_before_serialize: &'a [PackageIndex],
    pub serialize_before_create: &'a [PackageIndex],
    pub create_before_create: &'a [PackageIndex],
}

/// Import, export and preload-dependency tables.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PackageHeader {
    pub guid: u128,
    pub imports: Vec<ImportEntry>,
    pub exports: Vec<ExportEntry>,
    pub preload_dependencies: Vec<PackageIndex>,
}

/// The fixed 12 byte start of a package file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prologue {
    pub magic: u32,
    pub version: u32,
    pub header_size: u32,
}

impl Prologue {
    /// Parse and validate the prologue from the first bytes of a file.
    pub fn parse(bytes: &[u8]) -> Result<Self, LoadError> {
        if bytes.len() < PROLOGUE_SIZE {
            return Err(LoadError::Truncated {
                needed: PROLOGUE_SIZE as u64,
                available: bytes.len() as u64,
            });
        }
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let prologue = Prologue {
            magic: word(0),
            version: word(4),
            header_size: word(8),
        };
        if prologue.magic != PACKAGE_MAGIC {
            return Err(LoadError::BadMagic {
                found: prologue.magic,
            });
        }
        if prologue.version < MIN_FILE_VERSION {
            return Err(LoadError::VersionTooOld {
                version: prologue.version,
                min: MIN_FILE_VERSION,
            });
        }
        if prologue.version > CURRENT_FILE_VERSION {
            return Err(LoadError::VersionTooNew {
                version: prologue.version,
                max: CURRENT_FILE_VERSION,
            });
        }
        if (prologue.header_size as usize) < PROLOGUE_SIZE {
            return Err(LoadError::CorruptTables {
                reason: format!("header size {} is smaller than the prologue", prologue.header_size),
            });
        }
        Ok(prologue)
    }

    pub fn to_bytes(self) -> [u8; PROLOGUE_SIZE] {
        let mut out = [0u8; PROLOGUE_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&self.header_size.to_le_bytes());
        out
    }
}

impl PackageHeader {
    /// Decode the tables that follow the prologue.
    ///
    /// `bytes` is the region `[PROLOGUE_SIZE, header_size)`; trailing
    /// padding is ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, LoadError> {
        let config = bincode::config::standard().with_limit::<DECODE_LIMIT>();
        bincode::serde::decode_from_slice(bytes, config)
            .map(|(header, _)| header)
            .map_err(|e| LoadError::CorruptTables {
                reason: e.to_string(),
            })
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
    }

    /// Check every cross reference in the tables against their sizes and
    /// every export payload against the file bounds.
    pub fn validate(
        &self,
        header_size: u64,
        file_size: u64,
    ) -> Result<(), LoadError> {
        if self.exports.is_empty() {
            return Err(LoadError::NoExports);
        }
        let corrupt = |reason: String| Err(LoadError::CorruptTables { reason });
        for (i, import) in self.imports.iter().enumerate() {
            if !self.index_in_range(import.outer) {
                return corrupt(format!("import {} has outer {} out of range", i, import.outer));
            }
            if import.outer.as_export().is_some() {
                return corrupt(format!("import {} is nested inside an export", i));
            }
            if import.outer == PackageIndex::Import(i as u32) {
                return corrupt(format!("import {} is its own outer", i));
            }
        }
        for (i, export) in self.exports.iter().enumerate() {
            for index in [export.class, export.super_class, export.template, export.outer] {
                if !self.index_in_range(index) {
                    return corrupt(format!("export {} references {} out of range", i, index));
                }
            }
            if export.outer == PackageIndex::Export(i as u32) {
                return corrupt(format!("export {} is its own outer", i));
            }
            let Some(serial_end) = export.serial_end() else {
                return corrupt(format!("export {} payload range overflows", i));
            };
            if export.serial_offset < header_size || serial_end > file_size {
                return Err(LoadError::Truncated {
                    needed: serial_end,
                    available: file_size,
                });
            }
            let Some(dependency_count) = export.dependency_count() else {
                return corrupt(format!("export {} preload dependency counts overflow", i));
            };
            if export.first_dependency >= 0 {
                let start = export.first_dependency as usize;
                let Some(end) = start.checked_add(dependency_count) else {
                    return corrupt(format!("export {} preload dependencies run past the table", i));
                };
                if end > self.preload_dependencies.len() {
                    return corrupt(format!("export {} preload dependencies run past the table", i));
                }
                for dep in &self.preload_dependencies[start..end] {
                    if dep.is_null() || !self.index_in_range(*dep) {
                        return corrupt(format!("export {} has an invalid preload dependency {}", i, dep));
                    }
                }
            } else if dependency_count != 0 {
                return corrupt(format!("export {} counts dependencies but has no first dependency", i));
            }
        }
        Ok(())
    }

    fn index_in_range(
        &self,
        index: PackageIndex,
    ) -> bool {
        match index {
            PackageIndex::Null => true,
            PackageIndex::Import(i) => (i as usize) < self.imports.len(),
            PackageIndex::Export(i) => (i as usize) < self.exports.len(),
        }
    }

    /// Split an export's preload run into its four categories.
    pub fn preload_dependencies(
        &self,
        export: u32,
    ) -> PreloadDependencies<'_> {
        let Some(entry) = self.exports.get(export as usize) else {
            return PreloadDependencies::default();
        };
        if entry.first_dependency < 0 {
            return PreloadDependencies::default();
        }
        let counts = [
            entry.serialize_before_serialize,
            entry.create_before_serialize,
            entry.serialize_before_create,
            entry.create_before_create,
        ];
        let table = self.preload_dependencies.as_slice();
        let mut runs: [&[PackageIndex]; 4] = [&[]; 4];
        let mut cursor = (entry.first_dependency as usize).min(table.len());
        for (run, count) in runs.iter_mut().zip(counts) {
            let end = cursor.saturating_add(count as usize).min(table.len());
            *run = &table[cursor..end];
            cursor = end;
        }
        PreloadDependencies {
            serialize_before_serialize: runs[0],
            create_before_serialize: runs[1],
            serialize_before_create: runs[2],
            create_before_create: runs[3],
        }
    }

    /// Full object path of an import: `/Pkg.Outer.Name`.
    pub fn import_path(
        &self,
        index: u32,
    ) -> String {
        let mut parts = Vec::new();
        let mut cursor = PackageIndex::Import(index);
        while let Some(i) = cursor.as_import() {
            let Some(entry) = self.imports.get(i as usize) else {
                break;
            };
            parts.push(entry.object_name.as_str());
            if parts.len() > self.imports.len() {
                break;
            }
            cursor = entry.outer;
        }
        parts.reverse();
        parts.join(".")
    }

    /// The outermost import of an import's outer chain, which names a package.
    pub fn outermost_import(
        &self,
        index: u32,
    ) -> u32 {
        let mut current = index;
        for _ in 0..=self.imports.len() {
            match self.imports.get(current as usize).map(|e| e.outer) {
                Some(PackageIndex::Import(outer)) => current = outer,
                _ => break,
            }
        }
        current
    }

    /// Path of an import relative to its package, `Outer.Name`.
    pub fn import_relative_path(
        &self,
        index: u32,
    ) -> String {
        let full = self.import_path(index);
        match full.split_once('.') {
            Some((_, rest)) => rest.to_string(),
            None => String::new(),
        }
    }

    /// Path of an export relative to its package, `Outer.Name`.
    pub fn export_relative_path(
        &self,
        index: u32,
    ) -> String {
        let mut parts = Vec::new();
        let mut cursor = PackageIndex::Export(index);
        while let Some(i) = cursor.as_export() {
            let Some(entry) = self.exports.get(i as usize) else {
                break;
            };
            parts.push(entry.object_name.as_str());
            if parts.len() > self.exports.len() {
                break;
            }
            cursor = entry.outer;
        }
        parts.reverse();
        parts.join(".")
    }
}

/// Map a package name to the file the loader opens for it.
pub fn package_file_path(
    name: &str,
    extension: &str,
) -> String {
    format!("{}.{}", name, extension)
}

/// One export handed to [`PackageWriter::add_export`].
#[derive(Debug, Clone, Default)]
pub struct ExportSpec {
    pub name: String,
    pub class: PackageIndex,
    pub super_class: PackageIndex,
    pub template: PackageIndex,
    pub outer: PackageIndex,
    pub flags: u32,
    pub payload: Vec<u8>,
    /// Unused bytes written before the payload.
    pub gap_before: u64,
    pub serialize_before_serialize: Vec<PackageIndex>,
    pub create_before_serialize: Vec<PackageIndex>,
    pub serialize_before_create: Vec<PackageIndex>,
    pub create_before_create: Vec<PackageIndex>,
}

impl ExportSpec {
    pub fn new(
        name: impl Into<String>,
        class: PackageIndex,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            name: name.into(),
            class,
            flags: export_flags::PUBLIC,
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_outer(
        mut self,
        outer: PackageIndex,
    ) -> Self {
        self.outer = outer;
        self
    }

    pub fn with_flags(
        mut self,
        flags: u32,
    ) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_super(
        mut self,
        super_class: PackageIndex,
    ) -> Self {
        self.super_class = super_class;
        self
    }

    pub fn with_template(
        mut self,
        template: PackageIndex,
    ) -> Self {
        self.template = template;
        self
    }

    pub fn with_gap(
        mut self,
        bytes: u64,
    ) -> Self {
        self.gap_before = bytes;
        self
    }

    pub fn serialize_before_serialize(
        mut self,
        dep: PackageIndex,
    ) -> Self {
        self.serialize_before_serialize.push(dep);
        self
    }

    pub fn create_before_serialize(
        mut self,
        dep: PackageIndex,
    ) -> Self {
        self.create_before_serialize.push(dep);
        self
    }

    pub fn serialize_before_create(
        mut self,
        dep: PackageIndex,
    ) -> Self {
        self.serialize_before_create.push(dep);
        self
    }

    pub fn create_before_create(
        mut self,
        dep: PackageIndex,
    ) -> Self {
        self.create_before_create.push(dep);
        self
    }
}

/// Builds package files.
///
/// # Example
///
/// ```
/// use asyncload::runtime::format::{ExportSpec, PackageIndex, PackageWriter};
///
/// let mut writer = PackageWriter::new();
/// let script = writer.add_package_import("/Script/Engine");
/// let class = writer.add_object_import("/Script/Core", "Class", "Actor", script);
/// writer.add_export(ExportSpec::new("Door", class, b"payload".to_vec()));
/// let bytes = writer.finish().unwrap();
/// assert!(bytes.len() > 12);
/// ```
#[derive(Debug, Clone)]
pub struct PackageWriter {
    version: u32,
    guid: u128,
    imports: Vec<ImportEntry>,
    exports: Vec<ExportSpec>,
}

impl Default for PackageWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PackageWriter {
    pub fn new() -> Self {
        Self {
            version: CURRENT_FILE_VERSION,
            guid: 0,
            imports: Vec::new(),
            exports: Vec::new(),
        }
    }

    pub fn with_guid(
        mut self,
        guid: u128,
    ) -> Self {
        self.guid = guid;
        self
    }

    /// Override the version stamped into the prologue.
    pub fn with_version(
        mut self,
        version: u32,
    ) -> Self {
        self.version = version;
        self
    }

    pub fn add_import(
        &mut self,
        entry: ImportEntry,
    ) -> PackageIndex {
        self.imports.push(entry);
        PackageIndex::Import(self.imports.len() as u32 - 1)
    }

    pub fn add_package_import(
        &mut self,
        name: impl Into<String>,
    ) -> PackageIndex {
        self.add_import(ImportEntry::package(name))
    }

    pub fn add_object_import(
        &mut self,
        class_package: impl Into<String>,
        class_name: impl Into<String>,
        object_name: impl Into<String>,
        outer: PackageIndex,
    ) -> PackageIndex {
        self.add_import(ImportEntry::object(class_package, class_name, object_name, outer))
    }

    pub fn add_export(
        &mut self,
        spec: ExportSpec,
    ) -> PackageIndex {
        self.exports.push(spec);
        PackageIndex::Export(self.exports.len() as u32 - 1)
    }

    /// Lay out the header and payloads and return the file bytes.
    pub fn finish(self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        let mut header = PackageHeader {
            guid: self.guid,
            imports: self.imports,
            exports: Vec::with_capacity(self.exports.len()),
            preload_dependencies: Vec::new(),
        };
        for spec in &self.exports {
            let count = spec.serialize_before_serialize.len()
                + spec.create_before_serialize.len()
                + spec.serialize_before_create.len()
                + spec.create_before_create.len();
            let first_dependency = if count == 0 {
                -1
            } else {
                header.preload_dependencies.len() as i32
            };
            header.preload_dependencies.extend(
                spec.serialize_before_serialize
                    .iter()
                    .chain(&spec.create_before_serialize)
                    .chain(&spec.serialize_before_create)
                    .chain(&spec.create_before_create),
            );
            header.exports.push(ExportEntry {
                object_name: spec.name.clone(),
                class: spec.class,
                super_class: spec.super_class,
                template: spec.template,
                outer: spec.outer,
                flags: spec.flags,
                serial_offset: 0,
                serial_size: spec.payload.len() as u64,
                first_dependency,
                serialize_before_serialize: spec.serialize_before_serialize.len() as u32,
                create_before_serialize: spec.create_before_serialize.len() as u32,
                serialize_before_create: spec.serialize_before_create.len() as u32,
                create_before_create: spec.create_before_create.len() as u32,
            });
        }

        // Offsets are varint encoded, so the header can grow once they are
        // filled in. Grow the reserved area until the tables fit.
        let mut header_size = (PROLOGUE_SIZE + header.encode()?.len()) as u64;
        let encoded = loop {
            let mut offset = header_size;
            for (entry, spec) in header.exports.iter_mut().zip(&self.exports) {
                offset += spec.gap_before;
                entry.serial_offset = offset;
                offset += spec.payload.len() as u64;
            }
            let encoded = header.encode()?;
            let needed = (PROLOGUE_SIZE + encoded.len()) as u64;
            if needed <= header_size {
                break encoded;
            }
            header_size = needed;
        };

        let prologue = Prologue {
            magic: PACKAGE_MAGIC,
            version: self.version,
            header_size: header_size as u32,
        };
        let mut out = Vec::with_capacity(header_size as usize);
        out.extend_from_slice(&prologue.to_bytes());
        out.extend_from_slice(&encoded);
        out.resize(header_size as usize, 0);
        for spec in &self.exports {
            out.resize(out.len() + spec.gap_before as usize, 0);
            out.extend_from_slice(&spec.payload);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests;
