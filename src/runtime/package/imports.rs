//! Import handling: loading imported packages, wiring imports to the
//! exports that satisfy them, and linking.

use tracing::{debug, warn};

use super::{PackageDesc, PackageLoader, PackageState, WeakPackageRef};
use crate::runtime::dag::{NodeRef, Phase};
use crate::runtime::error::FatalError;
use crate::runtime::format::PackageIndex;
use crate::runtime::object::{ObjectFlags, SerializeContext};
use crate::runtime::scheduler::context::LoadContext;
use crate::runtime::scheduler::queue::{EventKind, SYSTEM_PRIORITY_MAX};

impl PackageLoader {
    pub(super) fn event_start_import_packages(
        &mut self,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        self.expect_state(PackageState::StartImportPackages, "StartImportPackages")?;
        if !self.load_imports(cx)? {
            self.queue(cx.events, cx.order, EventKind::StartImportPackages, SYSTEM_PRIORITY_MAX - 1);
            return Ok(());
        }
        self.set_state(PackageState::WaitingForImportPackages);
        self.done_adding(self.node(Phase::SetupImports), true, cx)
    }

    /// Start loading every package an import lives in. Returns `false` when
    /// the time budget ran out first.
    fn load_imports(
        &mut self,
        cx: &mut LoadContext<'_>,
    ) -> Result<bool, FatalError> {
        let start = self.load_import_index;
        while self.load_import_index < self.imports.len() {
            if self.load_import_index > start && cx.budget.exceeded() {
                return Ok(false);
            }
            let index = self.load_import_index as u32;
            self.load_import_index += 1;
            if let Some((name, force)) = self.import_package_to_load(index, cx) {
                self.start_import_package(name, force, cx)?;
            }
        }
        self.update_load_percentage(cx);
        Ok(true)
    }

    /// The package an import needs loaded, once per package, and whether
    /// the import names an object inside it rather than the package itself.
    fn import_package_to_load(
        &mut self,
        index: u32,
        cx: &LoadContext<'_>,
    ) -> Option<(String, bool)> {
        let header = self.header.as_ref()?;
        if let Some(existing) = cx.shared.store.find(&self.imports[index as usize].path) {
            if cx.is_fully_loaded(&existing) {
                return None;
            }
        }
        let outermost = header.outermost_import(index);
        let slot = &mut self.imports[outermost as usize];
        if slot.package_handled {
            return None;
        }
        slot.package_handled = true;
        let entry = &header.imports[outermost as usize];
        if !entry.is_package() || cx.known_missing.contains(&entry.object_name) {
            return None;
        }
        Some((entry.object_name.clone(), outermost != index))
    }

    fn start_import_package(
        &mut self,
        name: String,
        force: bool,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        if name == self.desc.name {
            return Ok(());
        }
        let existing = cx.shared.store.find(&name);
        if existing.as_ref().is_some_and(|p| p.has_flags(ObjectFlags::NATIVE)) {
            return Ok(());
        }
        let pending = match cx.packages.find_by_name(&name) {
            Some(pending) => pending,
            None if existing.is_some() && !force => return Ok(()),
            None => {
                debug!(package = %self.desc.name, import = %name, "loading imported package");
                let desc = PackageDesc::new(name).with_priority(self.desc.priority);
                let root = self.dependency_root.unwrap_or(self.weak);
                cx.insert_package(desc, Some(root))?
            }
        };
        if pending == self.weak {
            return Ok(());
        }
        let Some(other) = cx.packages.get_mut(pending) else {
            return Ok(());
        };
        let other_state = other.state();
        if self.imported_packages.insert(pending) {
            other.add_dependency_ref();
        }
        if other_state <= PackageState::WaitingForSummary {
            other.waiting_to_link_imports.push(self.weak);
            cx.add_arc(NodeRef::package_node(pending, Phase::LoadSummary), self.node(Phase::SetupImports))?;
        } else if other_state < PackageState::WaitingForPostLoad {
            cx.add_arc_if_live(
                self.node(Phase::SetupImports),
                NodeRef::package_node(pending, Phase::ExportsSerialized),
            )?;
        }
        Ok(())
    }

    /// Every imported package has a parsed summary: resolve each import.
    pub(super) fn event_setup_imports(
        &mut self,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        self.expect_state(PackageState::WaitingForImportPackages, "WaitingForImportPackages")?;
        self.set_state(PackageState::SetupImports);
        for index in 0..self.imports.len() as u32 {
            self.setup_import(index, cx)?;
        }
        self.remove_node(self.node(Phase::SetupImports), cx)?;
        self.set_state(PackageState::SetupExports);
        self.queue(cx.events, cx.order, EventKind::SetupExports, 0);
        Ok(())
    }

    fn setup_import(
        &mut self,
        index: u32,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        let create = self.import_node(index, Phase::Create);
        let Some(header) = self.header.as_ref() else {
            return Ok(());
        };
        let entry = &header.imports[index as usize];
        let mut fire = true;

        if entry.outer.is_null() {
            let name = entry.object_name.clone();
            match cx.shared.store.find(&name) {
                None => {
                    debug!(package = %self.desc.name, import = %name, "imported package is missing");
                    self.imports[index as usize].failed = true;
                }
                Some(package) => {
                    if !package.has_flags(ObjectFlags::NATIVE) {
                        if let Some(pending) = cx.packages.find_by_name(&name) {
                            let waitable = cx
                                .packages
                                .get(pending)
                                .is_some_and(|p| p.state() <= PackageState::WaitingForPostLoad);
                            if pending != self.weak && waitable {
                                self.may_wait_for.insert(pending);
                            }
                        }
                    }
                    self.imports[index as usize].found = Some(package);
                }
            }
        } else {
            let path = self.imports[index as usize].path.clone();
            let loaded = cx
                .shared
                .store
                .find(&path)
                .filter(|object| cx.is_fully_loaded(object));
            if loaded.is_some() && !cx.initial_load() {
                self.imports[index as usize].found = loaded;
            } else {
                let outermost = header.outermost_import(index);
                let package_name = header.imports[outermost as usize].object_name.clone();
                let mut inner = index;
                while let PackageIndex::Import(outer) = header.imports[inner as usize].outer {
                    if outer == outermost {
                        break;
                    }
                    inner = outer;
                }
                let boot_path = header.import_path(inner);
                let relative = header.import_relative_path(index);

                match cx.shared.store.find(&package_name) {
                    None => {
                        debug!(package = %self.desc.name, import = %path, "package of import is missing");
                        self.imports[index as usize].failed = true;
                    }
                    Some(package) => {
                        let native = package.has_flags(ObjectFlags::NATIVE);
                        let loader = if native {
                            None
                        } else {
                            cx.packages.find_by_name(&package_name).filter(|q| {
                                *q != self.weak
                                    && cx
                                        .packages
                                        .get(*q)
                                        .is_some_and(|p| p.state() > PackageState::WaitingForSummary)
                            })
                        };
                        match loader {
                            None if native && cx.initial_load() => {
                                fire = !cx.shared.boot.add_waiting(&boot_path, create);
                            }
                            None => match cx.shared.store.find(&path) {
                                Some(object) => self.imports[index as usize].found = Some(object),
                                None => {
                                    warn!(package = %self.desc.name, import = %path, "import not found");
                                    self.imports[index as usize].failed = true;
                                }
                            },
                            Some(other) => self.wire_import_to_export(index, other, &relative, cx)?,
                        }
                    }
                }
            }
        }

        if fire {
            self.done_adding(create, false, cx)
        } else {
            cx.fire_externally(create)
        }
    }

    /// The import is an export of another in-flight package: wait for it
    /// through the graph instead of blocking.
    fn wire_import_to_export(
        &mut self,
        index: u32,
        other: WeakPackageRef,
        relative: &str,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        let Some(loader) = cx.packages.get(other) else {
            self.imports[index as usize].failed = true;
            return Ok(());
        };
        let Some(export) = loader.export_by_path.get(relative).copied() else {
            warn!(
                package = %self.desc.name,
                import = %self.imports[index as usize].path,
                source = %loader.name(),
                exports = ?loader.export_by_path.keys().collect::<Vec<_>>(),
                "import not found among the exports of its package"
            );
            self.imports[index as usize].failed = true;
            return Ok(());
        };
        if loader.export_failed(export) {
            self.imports[index as usize].failed = true;
            return Ok(());
        }
        let object = loader.export_object(export).cloned();
        self.imports[index as usize].source = Some((other, export));

        let my_create = self.import_node(index, Phase::Create);
        let my_serialize = self.import_node(index, Phase::Serialize);
        let serialized = match &object {
            None => {
                cx.add_arc_if_live(NodeRef::export(other, export, Phase::Create), my_create)?;
                cx.add_arc_if_live(my_create, NodeRef::package_node(other, Phase::ExportsSerialized))?;
                false
            }
            Some(object) => cx.is_fully_loaded(object),
        };
        if !serialized {
            cx.add_arc_if_live(NodeRef::export(other, export, Phase::Serialize), my_serialize)?;
        }
        Ok(())
    }

    /// Point an import at its object. Runs once, after its create node fired.
    pub(super) fn link_import(
        &mut self,
        index: u32,
        cx: &mut LoadContext<'_>,
    ) -> Result<(), FatalError> {
        self.items_done += 1;
        let slot = &self.imports[index as usize];
        if slot.failed {
            return Ok(());
        }
        let object = if let Some((other, export)) = slot.source {
            cx.packages.get(other).and_then(|p| p.export_object(export).cloned())
        } else if let Some(found) = &slot.found {
            Some(found.clone())
        } else if self.outer_import_failed(index) {
            None
        } else {
            let store = &cx.shared.store;
            let guard = store.gc_guard();
            let sc = SerializeContext::new(store, &guard, &self.desc.name, cx.shared);
            cx.shared.serializer.create_import(&sc, &slot.path)
        };

        match object {
            Some(object) => {
                if self.imports[index as usize].object.set(object).is_err() {
                    return Err(FatalError::ImportRelinked {
                        package: self.desc.name.clone(),
                        index,
                    });
                }
            }
            None => {
                debug!(package = %self.desc.name, import = %self.imports[index as usize].path, "import could not be linked");
                self.imports[index as usize].failed = true;
            }
        }
        Ok(())
    }

    fn outer_import_failed(
        &self,
        index: u32,
    ) -> bool {
        let Some(header) = self.header.as_ref() else {
            return false;
        };
        let mut cursor = header.imports[index as usize].outer;
        for _ in 0..=self.imports.len() {
            match cursor {
                PackageIndex::Import(outer) => {
                    if self.imports[outer as usize].failed {
                        return true;
                    }
                    cursor = header.imports[outer as usize].outer;
                }
                _ => return false,
            }
        }
        false
    }
}
