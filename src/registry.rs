//! Thread Registry
//!
//! Process-wide table of threads participating in GC coordination.
//! A thread must register before it blocks on any GC-aware primitive;
//! registration hands back a [`ThreadHandle`] and installs the calling
//! thread's identity in a thread-local so the runtime can find "the
//! current thread" without a search.
//!
//! # Design
//!
//! - The registry is an explicit object, not a global. Embedders and
//!   tests create as many as they need; the [`crate::Runtime`] owns one.
//! - Slots are reused through a free list. Every registration bumps a
//!   monotonically increasing epoch which is baked into the handle, so
//!   a handle that outlives its registration is detected instead of
//!   silently naming whichever thread inherited the slot.
//! - Thread state transitions are owner-only. The runtime wraps every
//!   native blocking call in a [`BlockGuard`] so the
//!   Active -> BlockedWithRoots -> Active round trip survives every
//!   exit path, including timeouts and unwinding task bodies.
//!
//! Registering the same thread twice without unregistering is a fatal
//! contract violation: tolerating it would leave two descriptors
//! claiming one OS thread and corrupt every scan that follows.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::error::{contract_violation, RuntimeError};
use crate::log;
use crate::platform;
use crate::roots::{Collector, RootHandle, RootList, RootRange};
use crate::stats::RuntimeStats;

thread_local! {
    /// The calling thread's registration, if any.
    static CURRENT_THREAD: Cell<Option<ThreadHandle>> = const { Cell::new(None) };
}

/// Lifecycle state of a registered thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Not registered (never observed on a live descriptor).
    Unregistered = 0,
    /// Running mutator code.
    Active = 1,
    /// Blocked inside a GC-aware primitive; roots remain scannable.
    BlockedWithRoots = 2,
    /// Tearing down; set during unregistration.
    Exiting = 3,
}

impl ThreadState {
    fn from_u8(v: u8) -> ThreadState {
        match v {
            1 => ThreadState::Active,
            2 => ThreadState::BlockedWithRoots,
            3 => ThreadState::Exiting,
            _ => ThreadState::Unregistered,
        }
    }
}

/// Handle to a registered thread.
///
/// Copyable and freely shareable; staleness is detected on use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle {
    pub(crate) slot: usize,
    pub(crate) epoch: u64,
}

/// Registry entry for one thread.
#[derive(Debug)]
pub struct ThreadDescriptor {
    slot: usize,
    epoch: u64,
    os_id: ThreadId,
    state: AtomicU8,
    roots: Mutex<RootList>,
    registered_at_ms: u64,
}

impl ThreadDescriptor {
    /// The handle naming this registration.
    pub fn handle(&self) -> ThreadHandle {
        ThreadHandle {
            slot: self.slot,
            epoch: self.epoch,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of live GC roots owned by this thread.
    pub fn root_count(&self) -> usize {
        self.roots.lock().len()
    }

    /// When this thread registered (process-relative ms).
    pub fn registered_at_ms(&self) -> u64 {
        self.registered_at_ms
    }
}

/// Slot table behind the registry lock.
#[derive(Debug, Default)]
struct RegistryTable {
    slots: Vec<Option<Arc<ThreadDescriptor>>>,
    free: Vec<usize>,
    live: usize,
}

/// Registry of GC-participating threads.
#[derive(Debug)]
pub struct ThreadRegistry {
    table: Mutex<RegistryTable>,
    next_epoch: AtomicU64,
    stats: Arc<RuntimeStats>,
}

impl ThreadRegistry {
    /// Create an empty registry reporting into `stats`.
    pub fn new(stats: Arc<RuntimeStats>) -> Self {
        Self {
            table: Mutex::new(RegistryTable::default()),
            next_epoch: AtomicU64::new(1),
            stats,
        }
    }

    /// The stats sink shared with the rest of the runtime.
    pub fn stats(&self) -> &Arc<RuntimeStats> {
        &self.stats
    }

    /// Register the calling thread.
    ///
    /// The thread comes back `Active` with an empty root list. Fatal if
    /// the calling thread is already registered.
    pub fn register(&self) -> ThreadHandle {
        if CURRENT_THREAD.with(|c| c.get()).is_some() {
            contract_violation("thread registered twice without unregistering");
        }

        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let mut table = self.table.lock();
        let slot = match table.free.pop() {
            Some(slot) => slot,
            None => {
                table.slots.push(None);
                table.slots.len() - 1
            }
        };
        let descriptor = Arc::new(ThreadDescriptor {
            slot,
            epoch,
            os_id: platform::current_os_id(),
            state: AtomicU8::new(ThreadState::Active as u8),
            roots: Mutex::new(RootList::new(epoch)),
            registered_at_ms: platform::timestamp_ms(),
        });
        table.slots[slot] = Some(descriptor);
        table.live += 1;
        drop(table);

        RuntimeStats::incr(&self.stats.threads_registered);
        let handle = ThreadHandle { slot, epoch };
        CURRENT_THREAD.with(|c| c.set(Some(handle)));
        log::debug(format!(
            "thread registered: slot={} epoch={}",
            slot, epoch
        ));
        handle
    }

    /// Unregister the calling thread.
    ///
    /// A non-empty root list is force-cleared with a warning; the
    /// thread is leaving and its stack is about to stop existing, so
    /// keeping the roots would be worse than dropping them. Fatal if
    /// called with another thread's handle.
    pub fn unregister(&self, handle: ThreadHandle) -> Result<(), RuntimeError> {
        let descriptor = self.descriptor(handle)?;
        if descriptor.os_id != platform::current_os_id() {
            contract_violation("thread unregistered by a different thread");
        }

        descriptor
            .state
            .store(ThreadState::Exiting as u8, Ordering::Release);

        {
            let mut roots = descriptor.roots.lock();
            if !roots.is_empty() {
                let cleared = roots.clear();
                log::warn(format!(
                    "thread slot={} unregistered with {} live gc roots (cleared)",
                    handle.slot, cleared
                ));
            }
        }

        let mut table = self.table.lock();
        table.slots[handle.slot] = None;
        table.free.push(handle.slot);
        table.live -= 1;
        drop(table);

        CURRENT_THREAD.with(|c| c.set(None));
        log::debug(format!(
            "thread unregistered: slot={} epoch={}",
            handle.slot, handle.epoch
        ));
        Ok(())
    }

    /// The calling thread's registration, if any.
    pub fn current(&self) -> Option<ThreadHandle> {
        CURRENT_THREAD.with(|c| c.get())
    }

    /// Whether the calling thread is registered.
    pub fn is_registered(&self) -> bool {
        self.current().is_some()
    }

    /// Look up a descriptor, rejecting stale handles.
    pub fn descriptor(&self, handle: ThreadHandle) -> Result<Arc<ThreadDescriptor>, RuntimeError> {
        let table = self.table.lock();
        let descriptor = table
            .slots
            .get(handle.slot)
            .and_then(|s| s.as_ref())
            .ok_or(RuntimeError::InvalidHandle)?;
        if descriptor.epoch != handle.epoch {
            return Err(RuntimeError::InvalidHandle);
        }
        Ok(Arc::clone(descriptor))
    }

    /// Current state of the thread named by `handle`.
    pub fn state_of(&self, handle: ThreadHandle) -> Result<ThreadState, RuntimeError> {
        Ok(self.descriptor(handle)?.state())
    }

    /// Transition the calling thread between `Active` and
    /// `BlockedWithRoots`.
    ///
    /// Only the named thread may transition itself, and only along
    /// those two states; anything else is `InvalidTransition`.
    pub fn set_state(&self, handle: ThreadHandle, to: ThreadState) -> Result<(), RuntimeError> {
        let descriptor = self.descriptor(handle)?;
        let from = descriptor.state();
        if descriptor.os_id != platform::current_os_id() {
            return Err(RuntimeError::InvalidTransition { from, to });
        }
        match (from, to) {
            (ThreadState::Active, ThreadState::BlockedWithRoots)
            | (ThreadState::BlockedWithRoots, ThreadState::Active) => {
                descriptor.state.store(to as u8, Ordering::Release);
                Ok(())
            }
            _ => Err(RuntimeError::InvalidTransition { from, to }),
        }
    }

    /// Register a GC root range for the calling thread.
    pub fn root_register(&self, addr: usize, len: usize) -> Result<RootHandle, RuntimeError> {
        let current = self.current().ok_or(RuntimeError::InvalidThread)?;
        let descriptor = self.descriptor(current)?;
        let handle = descriptor.roots.lock().insert(RootRange { addr, len });
        RuntimeStats::incr(&self.stats.roots_registered);
        Ok(handle)
    }

    /// Remove a GC root range previously registered by the calling
    /// thread. Stale handles are `RootNotFound`.
    pub fn root_unregister(&self, handle: RootHandle) -> Result<(), RuntimeError> {
        let current = self.current().ok_or(RuntimeError::InvalidThread)?;
        let descriptor = self.descriptor(current)?;
        let removed = descriptor.roots.lock().remove(handle);
        removed.map(|_| ()).ok_or(RuntimeError::RootNotFound)
    }

    /// Snapshot one thread's root ranges.
    pub fn root_snapshot(&self, handle: ThreadHandle) -> Result<Vec<RootRange>, RuntimeError> {
        Ok(self.descriptor(handle)?.roots.lock().snapshot())
    }

    /// Visit every registered thread under the registry lock.
    ///
    /// The visitor must not call back into the registry.
    pub fn for_each(&self, mut visitor: impl FnMut(&ThreadDescriptor)) {
        let table = self.table.lock();
        for descriptor in table.slots.iter().flatten() {
            visitor(descriptor);
        }
    }

    /// Drive a full root scan for an external collector.
    ///
    /// Requests a safepoint, then feeds each registered thread's root
    /// snapshot to the collector while holding the registry lock, so no
    /// thread can register or unregister mid-scan.
    pub fn scan_all(&self, collector: &dyn Collector) {
        collector.request_safepoint();
        self.for_each(|descriptor| {
            let ranges = descriptor.roots.lock().snapshot();
            collector.scan_roots(&ranges);
        });
    }

    /// Number of currently registered threads.
    pub fn len(&self) -> usize {
        self.table.lock().live
    }

    /// Whether no threads are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the calling thread blocked for the duration of the guard.
    ///
    /// Every GC-aware blocking entry point uses this around its native
    /// wait. Fatal if the calling thread is not registered: blocking an
    /// unknown thread would stall the collector with no roots to show
    /// for it.
    pub(crate) fn enter_blocking(&self) -> BlockGuard<'_> {
        let handle = match self.current() {
            Some(handle) => handle,
            None => contract_violation("blocking on a gc-aware primitive from an unregistered thread"),
        };
        if let Err(err) = self.set_state(handle, ThreadState::BlockedWithRoots) {
            contract_violation(&format!("could not enter blocked state: {}", err));
        }
        BlockGuard {
            registry: self,
            handle,
        }
    }
}

impl Drop for ThreadRegistry {
    fn drop(&mut self) {
        let table = self.table.get_mut();
        if table.live > 0 {
            log::error(format!(
                "thread registry dropped with {} live registrations",
                table.live
            ));
        }
    }
}

/// RAII marker for a native blocking section.
///
/// Restores `Active` on drop, on every exit path.
#[must_use]
pub(crate) struct BlockGuard<'a> {
    registry: &'a ThreadRegistry,
    handle: ThreadHandle,
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self
            .registry
            .set_state(self.handle, ThreadState::Active)
        {
            // The thread unregistered while its own guard was live;
            // nothing left to restore.
            log::warn(format!("could not restore active state: {}", err));
        }
    }
}
