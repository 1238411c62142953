//! GC Root Ranges
//!
//! Per-thread lists of memory ranges the garbage collector must treat
//! as roots. Each registered thread owns one [`RootList`]; only the
//! owning thread mutates it, and the collector reads snapshots taken
//! under the registry lock (see `registry::scan_all`), so entries can
//! never be torn mid-scan.
//!
//! Handles are slot indices paired with the owning registration's
//! epoch. A handle issued during one registration is rejected after the
//! thread unregisters and the slot is reused, instead of silently
//! unpinning someone else's root.

/// A contiguous memory range the collector scans for pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootRange {
    /// Start address of the range.
    pub addr: usize,
    /// Length in bytes.
    pub len: usize,
}

/// Handle to a registered root range.
///
/// Valid only for the thread registration that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootHandle {
    pub(crate) slot: usize,
    pub(crate) epoch: u64,
}

/// The collector side of the bridge.
///
/// The runtime never implements collection itself; an embedding GC
/// supplies this and drives scans through `ThreadRegistry::scan_all`.
pub trait Collector {
    /// Ask mutator threads to pause at their next safepoint.
    fn request_safepoint(&self);

    /// Scan one thread's root ranges.
    fn scan_roots(&self, ranges: &[RootRange]);
}

/// Slotted root list with free-slot reuse.
///
/// Registration and removal are O(1) amortized; removal of a stale
/// handle (wrong epoch, freed slot) is an error, never a different
/// entry.
#[derive(Debug)]
pub(crate) struct RootList {
    /// Epoch of the owning thread registration; baked into handles.
    epoch: u64,
    slots: Vec<Option<RootRange>>,
    free: Vec<usize>,
    live: usize,
}

impl RootList {
    pub(crate) fn new(epoch: u64) -> Self {
        Self {
            epoch,
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Insert a range, reusing a freed slot when one exists.
    pub(crate) fn insert(&mut self, range: RootRange) -> RootHandle {
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(range);
                slot
            }
            None => {
                self.slots.push(Some(range));
                self.slots.len() - 1
            }
        };
        self.live += 1;
        RootHandle {
            slot,
            epoch: self.epoch,
        }
    }

    /// Remove a range by handle.
    ///
    /// Returns the range on success; `None` if the handle is stale
    /// (wrong epoch) or names an empty slot.
    pub(crate) fn remove(&mut self, handle: RootHandle) -> Option<RootRange> {
        if handle.epoch != self.epoch || handle.slot >= self.slots.len() {
            return None;
        }
        let range = self.slots[handle.slot].take()?;
        self.free.push(handle.slot);
        self.live -= 1;
        Some(range)
    }

    /// Whether a handle currently names a live entry.
    pub(crate) fn contains(&self, handle: RootHandle) -> bool {
        handle.epoch == self.epoch
            && handle.slot < self.slots.len()
            && self.slots[handle.slot].is_some()
    }

    /// Copy out all live ranges, in slot order.
    pub(crate) fn snapshot(&self) -> Vec<RootRange> {
        self.slots.iter().filter_map(|s| *s).collect()
    }

    /// Number of live ranges.
    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Drop every entry, returning how many were live.
    pub(crate) fn clear(&mut self) -> usize {
        let cleared = self.live;
        self.slots.clear();
        self.free.clear();
        self.live = 0;
        cleared
    }
}
