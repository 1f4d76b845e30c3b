//! Event graph node identity
//!
//! A node is named by the package it belongs to, the table item it is
//! about (an import, an export, or nothing for package-level nodes) and
//! the phase it gates.

use std::fmt;

use crate::runtime::format::PackageIndex;
use crate::runtime::package::WeakPackageRef;

/// What a node gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    /// The package summary has been read and the linker built.
    LoadSummary,
    /// All imported packages have their summaries; imports may be resolved.
    SetupImports,
    /// Every export of the package has been serialized.
    ExportsSerialized,
    /// An import has been linked, or an export object allocated.
    Create,
    /// An export's bytes may be requested.
    StartIo,
    /// An import's source is fully loaded, or an export has been serialized.
    Serialize,
}

impl Phase {
    /// Phases that belong to one import or export rather than the package.
    #[inline]
    pub fn is_item_phase(self) -> bool {
        matches!(self, Phase::Create | Phase::StartIo | Phase::Serialize)
    }
}

impl fmt::Display for Phase {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let name = match self {
            Phase::LoadSummary => "LoadSummary",
            Phase::SetupImports => "SetupImports",
            Phase::ExportsSerialized => "ExportsSerialized",
            Phase::Create => "Create",
            Phase::StartIo => "StartIO",
            Phase::Serialize => "Serialize",
        };
        f.write_str(name)
    }
}

/// Identity of one event graph node.
///
/// # Examples
///
/// ```
/// use asyncload::runtime::dag::{NodeRef, Phase};
/// use asyncload::runtime::format::PackageIndex;
/// use asyncload::runtime::package::WeakPackageRef;
///
/// let package = WeakPackageRef::new(0, 1);
/// let node = NodeRef::item(package, PackageIndex::Export(3), Phase::Serialize);
/// assert_eq!(node.package, package);
/// assert!(NodeRef::package_node(package, Phase::LoadSummary).item.is_null());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef {
    pub package: WeakPackageRef,
    pub item: PackageIndex,
    pub phase: Phase,
}

impl NodeRef {
    #[inline]
    pub fn package_node(
        package: WeakPackageRef,
        phase: Phase,
    ) -> Self {
        debug_assert!(!phase.is_item_phase());
        NodeRef {
            package,
            item: PackageIndex::Null,
            phase,
        }
    }

    #[inline]
    pub fn item(
        package: WeakPackageRef,
        item: PackageIndex,
        phase: Phase,
    ) -> Self {
        debug_assert!(phase.is_item_phase() && !item.is_null());
        NodeRef { package, item, phase }
    }

    #[inline]
    pub fn import(
        package: WeakPackageRef,
        index: u32,
        phase: Phase,
    ) -> Self {
        Self::item(package, PackageIndex::Import(index), phase)
    }

    #[inline]
    pub fn export(
        package: WeakPackageRef,
        index: u32,
        phase: Phase,
    ) -> Self {
        Self::item(package, PackageIndex::Export(index), phase)
    }
}

impl fmt::Display for NodeRef {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        if self.item.is_null() {
            write!(f, "{} {}", self.package, self.phase)
        } else {
            write!(f, "{} {} {}", self.package, self.item, self.phase)
        }
    }
}
