//! # Asthra Concurrency Runtime
//!
//! GC-aware concurrency bridge for the Asthra language: a thread
//! registry the collector can trust, synchronization primitives that
//! keep blocked threads scannable, and a work-stealing task system
//! with joins, cancellation, and completion callbacks.
//!
//! ## Design
//!
//! Everything hangs off an explicit [`Runtime`] context; there is no
//! global singleton. The load-bearing invariant is the blocking
//! protocol: any thread that blocks inside the runtime is registered
//! and marked `BlockedWithRoots` for exactly the duration of the
//! native wait, so a collector driven through
//! [`registry::ThreadRegistry::scan_all`] always sees a complete set
//! of roots.
//!
//! ## Example
//!
//! ```rust,ignore
//! use asthra_runtime::{Runtime, TaskValue};
//!
//! let runtime = Runtime::new()?;
//! runtime.start();
//!
//! let handle = runtime.spawn(|_ctx| Ok(Box::new(21 * 2) as TaskValue))?;
//! let outcome = handle.join()?;
//!
//! runtime.shutdown();
//! ```

pub mod callbacks;
pub mod cancellation;
pub mod config;
pub mod error;
pub mod ffi;
pub mod log;
pub mod platform;
pub mod registry;
pub mod roots;
pub mod scheduler;
pub mod stats;
pub mod sync;
pub mod task;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use crate::callbacks::{CallbackQueue, CompletionEvent};
pub use crate::cancellation::{CancellationError, CancellationSource, CancellationToken};
pub use crate::config::{ConfigError, RuntimeConfig};
pub use crate::error::RuntimeError;
pub use crate::registry::{ThreadHandle, ThreadRegistry, ThreadState};
pub use crate::roots::{Collector, RootHandle, RootRange};
pub use crate::stats::{RuntimeStats, StatsSnapshot};
pub use crate::sync::{Condvar, Mutex, RwLock, WaitResult};
pub use crate::task::{
    CancelStatus, DeliveryMode, TaskContext, TaskFailure, TaskHandle, TaskId, TaskOutcome,
    TaskState, TaskValue,
};

use crate::scheduler::Scheduler;

/// The runtime context.
///
/// Owns the thread registry, the scheduler, and the callback queue.
/// Embedders create one per GC domain (almost always one per process)
/// and pass it explicitly wherever the runtime is needed.
#[derive(Debug)]
pub struct Runtime {
    config: RuntimeConfig,
    registry: Arc<ThreadRegistry>,
    scheduler: Scheduler,
    callbacks: Arc<CallbackQueue>,
    stats: Arc<RuntimeStats>,
    shut_down: AtomicBool,
}

impl Runtime {
    /// Create a runtime with the default configuration.
    pub fn new() -> Result<Self, ConfigError> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime from `ASTHRA_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::with_config(RuntimeConfig::from_env()?)
    }

    /// Create a runtime with an explicit configuration.
    pub fn with_config(config: RuntimeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        log::set_level(config.log_level);

        let stats = Arc::new(RuntimeStats::new());
        let registry = Arc::new(ThreadRegistry::new(Arc::clone(&stats)));
        let callbacks = Arc::new(CallbackQueue::new(
            Arc::clone(&registry),
            config.max_callbacks,
        ));
        let scheduler = Scheduler::new(
            config.num_workers,
            Arc::clone(&registry),
            Arc::clone(&callbacks),
        );

        Ok(Self {
            config,
            registry,
            scheduler,
            callbacks,
            stats,
            shut_down: AtomicBool::new(false),
        })
    }

    /// The configuration this runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Start the scheduler workers. Idempotent.
    pub fn start(&self) {
        self.scheduler.start();
    }

    /// Shut the runtime down: stop accepting work, join workers, close
    /// the callback queue. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scheduler.shutdown();
        self.callbacks.close();
        log::info(format!(
            "runtime shut down; {}",
            self.stats.snapshot()
        ));
    }

    /// Spawn a task whose result is claimed with `join`.
    pub fn spawn<F>(&self, body: F) -> Result<TaskHandle, RuntimeError>
    where
        F: FnOnce(&TaskContext) -> Result<TaskValue, TaskFailure> + Send + 'static,
    {
        self.scheduler.spawn(body, DeliveryMode::Join)
    }

    /// Spawn a task whose result is delivered to the callback queue.
    pub fn spawn_with_callback<F>(&self, body: F) -> Result<TaskHandle, RuntimeError>
    where
        F: FnOnce(&TaskContext) -> Result<TaskValue, TaskFailure> + Send + 'static,
    {
        self.scheduler.spawn(body, DeliveryMode::Callback)
    }

    /// Create a GC-aware mutex bound to this runtime's registry.
    pub fn new_mutex(&self, name: Option<&str>) -> Mutex {
        Mutex::new(Arc::clone(&self.registry), name)
    }

    /// Create a condition variable.
    pub fn new_condvar(&self, name: Option<&str>) -> Condvar {
        Condvar::new(name)
    }

    /// Create a GC-aware reader-writer lock.
    pub fn new_rwlock(&self, name: Option<&str>) -> RwLock {
        RwLock::new(Arc::clone(&self.registry), name)
    }

    /// The thread registry.
    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    /// The completion callback queue.
    pub fn callbacks(&self) -> &Arc<CallbackQueue> {
        &self.callbacks
    }

    /// Snapshot the runtime counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
