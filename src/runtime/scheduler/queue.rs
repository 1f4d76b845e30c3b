//! Event queue for the scheduler
//!
//! Ready work is a priority queue of package events. Ordering, highest
//! first:
//!
//! 1. package priority
//! 2. system priority (linker work before import setup before processing)
//! 3. package serial (arrival order), randomized when the load order is
//! 4. insertion order

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::runtime::package::WeakPackageRef;

/// System priority of linker creation and summary processing.
pub const SYSTEM_PRIORITY_MAX: i32 = i32::MAX;

/// What to run on a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CreateLinker,
    FinishLinker,
    StartImportPackages,
    SetupImports,
    SetupExports,
    ProcessImportsAndExports,
    ExportsDone,
    ProcessPostloadWait,
    StartPostLoad,
}

/// A queued event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub package: WeakPackageRef,
    pub kind: EventKind,
}

#[derive(Debug)]
struct Queued {
    event: Event,
    package_priority: i32,
    system_priority: i32,
    serial: u64,
    sequence: u64,
}

impl PartialEq for Queued {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(
        &self,
        other: &Self,
    ) -> Ordering {
        // BinaryHeap pops the greatest element.
        self.package_priority
            .cmp(&other.package_priority)
            .then(self.system_priority.cmp(&other.system_priority))
            .then(other.serial.cmp(&self.serial))
            .then(other.sequence.cmp(&self.sequence))
    }
}

/// Global priority queue of package events.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Queued>,
    sequence: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        event: Event,
        package_priority: i32,
        system_priority: i32,
        serial: u64,
    ) {
        self.sequence += 1;
        self.heap.push(Queued {
            event,
            package_priority,
            system_priority,
            serial,
            sequence: self.sequence,
        });
    }

    /// Queue `kind` for `package`, taking the serial from `order`.
    pub fn schedule(
        &mut self,
        order: &mut LoadOrder,
        package: WeakPackageRef,
        package_priority: i32,
        kind: EventKind,
        system_priority: i32,
    ) {
        let serial = order.serial(package.serial());
        self.push(Event { package, kind }, package_priority, system_priority, serial);
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.heap.pop().map(|q| q.event)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    /// Drop every event of one package.
    pub fn remove_package(
        &mut self,
        package: WeakPackageRef,
    ) {
        self.heap.retain(|q| q.event.package != package);
    }
}

/// Deterministic or seeded-random ordering of ready work.
///
/// The random mode shuffles event serials and the picks out of the ready
/// sets to shake out order-dependent bugs.
#[derive(Debug)]
pub struct LoadOrder {
    rng: Option<StdRng>,
}

impl LoadOrder {
    pub fn deterministic() -> Self {
        Self { rng: None }
    }

    pub fn randomized(seed: u64) -> Self {
        Self {
            rng: Some(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn from_seed(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::randomized(seed),
            None => Self::deterministic(),
        }
    }

    #[inline]
    pub fn is_randomized(&self) -> bool {
        self.rng.is_some()
    }

    /// Queue serial for an event of the package with `package_serial`.
    pub fn serial(
        &mut self,
        package_serial: u64,
    ) -> u64 {
        match &mut self.rng {
            Some(rng) => rng.random_range(0..u64::MAX),
            None => package_serial,
        }
    }

    /// Index to take out of a ready set of `len` entries. The
    /// deterministic order always takes the first.
    pub fn pick(
        &mut self,
        len: usize,
    ) -> usize {
        match &mut self.rng {
            Some(rng) if len > 1 => rng.random_range(0..len),
            _ => 0,
        }
    }
}

impl Default for LoadOrder {
    fn default() -> Self {
        Self::deterministic()
    }
}
