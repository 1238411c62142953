//! Runtime Statistics
//!
//! Cheap atomic counters updated on the hot paths and snapshotted on
//! demand. Counters only ever increase; a snapshot is a consistent
//! enough view for diagnostics (individual loads are relaxed).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared across the runtime.
#[derive(Debug, Default)]
pub struct RuntimeStats {
    /// Tasks handed to the scheduler.
    pub(crate) tasks_spawned: AtomicU64,
    /// Tasks that reached `Completed`.
    pub(crate) tasks_completed: AtomicU64,
    /// Tasks that reached `Failed` (error return or panic).
    pub(crate) tasks_failed: AtomicU64,
    /// Tasks that reached `Cancelled`.
    pub(crate) tasks_cancelled: AtomicU64,
    /// Completion events accepted by the callback queue.
    pub(crate) callbacks_enqueued: AtomicU64,
    /// Completion events handed to consumers.
    pub(crate) callbacks_processed: AtomicU64,
    /// Completion events rejected because the queue was full.
    pub(crate) callbacks_dropped: AtomicU64,
    /// Thread registrations (cumulative, not live count).
    pub(crate) threads_registered: AtomicU64,
    /// GC root registrations (cumulative).
    pub(crate) roots_registered: AtomicU64,
    /// Mutex acquisitions that had to block.
    pub(crate) mutex_contentions: AtomicU64,
    /// RwLock acquisitions that had to block.
    pub(crate) rwlock_contentions: AtomicU64,
}

impl RuntimeStats {
    /// Create a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tasks_spawned: self.tasks_spawned.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            callbacks_enqueued: self.callbacks_enqueued.load(Ordering::Relaxed),
            callbacks_processed: self.callbacks_processed.load(Ordering::Relaxed),
            callbacks_dropped: self.callbacks_dropped.load(Ordering::Relaxed),
            threads_registered: self.threads_registered.load(Ordering::Relaxed),
            roots_registered: self.roots_registered.load(Ordering::Relaxed),
            mutex_contentions: self.mutex_contentions.load(Ordering::Relaxed),
            rwlock_contentions: self.rwlock_contentions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`RuntimeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Tasks handed to the scheduler.
    pub tasks_spawned: u64,
    /// Tasks that completed successfully.
    pub tasks_completed: u64,
    /// Tasks that failed.
    pub tasks_failed: u64,
    /// Tasks that were cancelled.
    pub tasks_cancelled: u64,
    /// Completion events enqueued.
    pub callbacks_enqueued: u64,
    /// Completion events consumed.
    pub callbacks_processed: u64,
    /// Completion events dropped (queue full).
    pub callbacks_dropped: u64,
    /// Cumulative thread registrations.
    pub threads_registered: u64,
    /// Cumulative GC root registrations.
    pub roots_registered: u64,
    /// Contended mutex acquisitions.
    pub mutex_contentions: u64,
    /// Contended rwlock acquisitions.
    pub rwlock_contentions: u64,
}

impl StatsSnapshot {
    /// Tasks that have reached a terminal state.
    pub fn tasks_terminal(&self) -> u64 {
        self.tasks_completed + self.tasks_failed + self.tasks_cancelled
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "tasks: spawned={} completed={} failed={} cancelled={}",
            self.tasks_spawned, self.tasks_completed, self.tasks_failed, self.tasks_cancelled
        )?;
        writeln!(
            f,
            "callbacks: enqueued={} processed={} dropped={}",
            self.callbacks_enqueued, self.callbacks_processed, self.callbacks_dropped
        )?;
        writeln!(
            f,
            "threads: registered={} gc_roots={}",
            self.threads_registered, self.roots_registered
        )?;
        write!(
            f,
            "contention: mutex={} rwlock={}",
            self.mutex_contentions, self.rwlock_contentions
        )
    }
}
