//! Package slot table
//!
//! Loaders live in slots addressed by [`WeakPackageRef`]. A handle carries
//! the serial the slot had when it was issued; serials are never reused, so
//! a handle to a freed slot can never resolve to whatever moved in later.
//!
//! A loader executing an event is *checked out* of its slot. Any attempt to
//! reach it through the table meanwhile fails, which is how re-entrant
//! execution of one package is detected.

use std::collections::HashMap;
use std::fmt;

use super::PackageLoader;
use crate::runtime::error::FatalError;

/// Non-owning handle to a package loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WeakPackageRef {
    slot: u32,
    serial: u64,
}

impl WeakPackageRef {
    pub fn new(
        slot: u32,
        serial: u64,
    ) -> Self {
        Self { slot, serial }
    }

    #[inline]
    pub fn slot(self) -> u32 {
        self.slot
    }

    /// Creation order of the loader; doubles as its arrival order.
    #[inline]
    pub fn serial(self) -> u64 {
        self.serial
    }
}

impl fmt::Display for WeakPackageRef {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "pkg#{}", self.serial)
    }
}

enum Slot {
    Vacant,
    Occupied(Box<PackageLoader>),
    CheckedOut { serial: u64, name: String },
}

impl Slot {
    fn serial(&self) -> Option<u64> {
        match self {
            Slot::Vacant => None,
            Slot::Occupied(loader) => Some(loader.weak().serial()),
            Slot::CheckedOut { serial, .. } => Some(*serial),
        }
    }
}

/// Every live loader, the name lookup and the active list.
#[derive(Default)]
pub struct PackageTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    next_serial: u64,
    live: usize,
    by_name: HashMap<String, WeakPackageRef>,
    /// In-flight loaders by descending priority, then arrival.
    active: Vec<(WeakPackageRef, i32)>,
}

impl PackageTable {
    pub fn new() -> Self {
        Self {
            next_serial: 1,
            ..Default::default()
        }
    }

    /// Live loaders, checked out ones included.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Build a loader for a fresh handle and store it.
    pub fn insert_with(
        &mut self,
        build: impl FnOnce(WeakPackageRef) -> PackageLoader,
    ) -> WeakPackageRef {
        let serial = self.next_serial;
        self.next_serial += 1;
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot::Vacant);
                self.slots.len() as u32 - 1
            }
        };
        let weak = WeakPackageRef::new(slot, serial);
        self.slots[slot as usize] = Slot::Occupied(Box::new(build(weak)));
        self.live += 1;
        weak
    }

    pub fn contains(
        &self,
        weak: WeakPackageRef,
    ) -> bool {
        self.slots
            .get(weak.slot as usize)
            .and_then(Slot::serial)
            .is_some_and(|serial| serial == weak.serial)
    }

    pub fn get(
        &self,
        weak: WeakPackageRef,
    ) -> Option<&PackageLoader> {
        match self.slots.get(weak.slot as usize)? {
            Slot::Occupied(loader) if loader.weak() == weak => Some(loader),
            _ => None,
        }
    }

    pub fn get_mut(
        &mut self,
        weak: WeakPackageRef,
    ) -> Option<&mut PackageLoader> {
        match self.slots.get_mut(weak.slot as usize)? {
            Slot::Occupied(loader) if loader.weak() == weak => Some(loader),
            _ => None,
        }
    }

    /// Take a loader out for exclusive execution.
    pub fn check_out(
        &mut self,
        weak: WeakPackageRef,
    ) -> Result<Box<PackageLoader>, FatalError> {
        let stale = FatalError::StalePackage { package: weak };
        let Some(slot) = self.slots.get_mut(weak.slot as usize) else {
            return Err(stale);
        };
        if slot.serial() != Some(weak.serial) {
            return Err(stale);
        }
        if let Slot::CheckedOut { name, .. } = slot {
            return Err(FatalError::Reentrant { package: name.clone() });
        }
        match std::mem::replace(slot, Slot::Vacant) {
            Slot::Occupied(loader) => {
                *slot = Slot::CheckedOut {
                    serial: weak.serial,
                    name: loader.name().to_string(),
                };
                Ok(loader)
            }
            other => {
                *slot = other;
                Err(stale)
            }
        }
    }

    /// Return a loader taken with [`check_out`](Self::check_out).
    pub fn check_in(
        &mut self,
        loader: Box<PackageLoader>,
    ) {
        let weak = loader.weak();
        if let Some(slot) = self.slots.get_mut(weak.slot as usize) {
            if matches!(slot, Slot::CheckedOut { serial, .. } if *serial == weak.serial) {
                *slot = Slot::Occupied(loader);
            }
        }
    }

    /// Drop a loader for good, releasing its name and active entry.
    pub fn remove(
        &mut self,
        weak: WeakPackageRef,
    ) -> Option<Box<PackageLoader>> {
        let slot = self.slots.get_mut(weak.slot as usize)?;
        if slot.serial() != Some(weak.serial) {
            return None;
        }
        let loader = match std::mem::replace(slot, Slot::Vacant) {
            Slot::Occupied(loader) => loader,
            other => {
                *slot = other;
                return None;
            }
        };
        self.free.push(weak.slot);
        self.live -= 1;
        self.release_name(loader.name(), weak);
        self.deactivate(weak);
        Some(loader)
    }

    /// Handles of every live loader in slot order.
    pub fn handles(&self) -> Vec<WeakPackageRef> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.serial().map(|serial| WeakPackageRef::new(i as u32, serial)))
            .collect()
    }

    pub fn find_by_name(
        &self,
        name: &str,
    ) -> Option<WeakPackageRef> {
        self.by_name.get(name).copied()
    }

    pub fn register_name(
        &mut self,
        name: &str,
        weak: WeakPackageRef,
    ) {
        self.by_name.insert(name.to_string(), weak);
    }

    /// Forget the name, unless it was re-registered to another loader.
    pub fn release_name(
        &mut self,
        name: &str,
        weak: WeakPackageRef,
    ) {
        if self.by_name.get(name) == Some(&weak) {
            self.by_name.remove(name);
        }
    }

    /// Add to the active list after every entry of equal or higher priority.
    pub fn activate(
        &mut self,
        weak: WeakPackageRef,
        priority: i32,
    ) {
        self.deactivate(weak);
        let at = self
            .active
            .iter()
            .position(|(_, p)| *p < priority)
            .unwrap_or(self.active.len());
        self.active.insert(at, (weak, priority));
    }

    pub fn deactivate(
        &mut self,
        weak: WeakPackageRef,
    ) -> bool {
        match self.active.iter().position(|(w, _)| *w == weak) {
            Some(at) => {
                self.active.remove(at);
                true
            }
            None => false,
        }
    }

    pub fn is_active(
        &self,
        weak: WeakPackageRef,
    ) -> bool {
        self.active.iter().any(|(w, _)| *w == weak)
    }

    /// Active loaders in scheduling order.
    pub fn active(&self) -> impl Iterator<Item = WeakPackageRef> + '_ {
        self.active.iter().map(|(w, _)| *w)
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }
}
