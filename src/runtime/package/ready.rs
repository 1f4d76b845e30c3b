//! Items whose node fired and whose work is waiting to run.

use std::collections::BTreeSet;

use crate::runtime::scheduler::queue::LoadOrder;

#[derive(Debug, Default)]
pub(super) struct ReadySets {
    pub imports_created: BTreeSet<u32>,
    pub imports_serialized: BTreeSet<u32>,
    pub exports_creatable: BTreeSet<u32>,
    pub exports_io_startable: BTreeSet<u32>,
    pub exports_serializable: BTreeSet<u32>,
}

impl ReadySets {
    /// Anything to do besides starting I/O.
    pub fn any_work(&self) -> bool {
        !self.imports_created.is_empty()
            || !self.imports_serialized.is_empty()
            || !self.exports_creatable.is_empty()
            || !self.exports_serializable.is_empty()
    }

    pub fn clear(&mut self) {
        self.imports_created.clear();
        self.imports_serialized.clear();
        self.exports_creatable.clear();
        self.exports_io_startable.clear();
        self.exports_serializable.clear();
    }
}

/// Take the lowest index, or a random one when the load order is randomized.
pub(super) fn pop(
    set: &mut BTreeSet<u32>,
    order: &mut LoadOrder,
) -> Option<u32> {
    if set.is_empty() {
        return None;
    }
    let at = order.pick(set.len());
    let index = set.iter().nth(at).copied()?;
    set.remove(&index);
    Some(index)
}
