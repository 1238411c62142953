//! Completion Callback Queue
//!
//! Bounded FIFO of task completion events, for embedders that consume
//! results from a dedicated thread instead of joining. Events arrive in
//! completion order (the order tasks finished, not the order they were
//! spawned).
//!
//! The queue is a bounded crossbeam channel. A full queue rejects the
//! push (`QueueFull`) and counts the drop; completion itself is never
//! blocked by a slow consumer. `close()` drops the send side, which
//! lets consumers drain what is left and then observe `QueueShutdown`.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;

use crate::error::RuntimeError;
use crate::registry::ThreadRegistry;
use crate::stats::RuntimeStats;
use crate::task::{TaskId, TaskOutcome};

/// One task completion, in the order it happened.
#[derive(Debug)]
pub struct CompletionEvent {
    /// The task that finished.
    pub task: TaskId,
    /// How it finished.
    pub outcome: TaskOutcome,
}

/// Bounded queue of completion events.
pub struct CallbackQueue {
    /// Send side; `None` after close.
    tx: Mutex<Option<Sender<CompletionEvent>>>,
    rx: Receiver<CompletionEvent>,
    registry: Arc<ThreadRegistry>,
    capacity: usize,
}

impl CallbackQueue {
    /// Create a queue with the given capacity.
    pub fn new(registry: Arc<ThreadRegistry>, capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
            registry,
            capacity,
        }
    }

    /// Enqueue a completion event.
    ///
    /// Never blocks: `QueueFull` if at capacity, `QueueShutdown` after
    /// close.
    pub fn push(&self, event: CompletionEvent) -> Result<(), RuntimeError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(RuntimeError::QueueShutdown)?;
        match tx.try_send(event) {
            Ok(()) => {
                RuntimeStats::incr(&self.registry.stats().callbacks_enqueued);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                RuntimeStats::incr(&self.registry.stats().callbacks_dropped);
                Err(RuntimeError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(RuntimeError::QueueShutdown),
        }
    }

    /// Block until an event is available.
    ///
    /// GC-cooperative: the calling thread must be registered and is
    /// `BlockedWithRoots` while parked. After `close()`, remaining
    /// events are still drained; then `QueueShutdown`.
    pub fn pop_blocking(&self) -> Result<CompletionEvent, RuntimeError> {
        let event = match self.rx.try_recv() {
            Ok(event) => event,
            Err(TryRecvError::Disconnected) => return Err(RuntimeError::QueueShutdown),
            Err(TryRecvError::Empty) => {
                let _blocked = self.registry.enter_blocking();
                self.rx.recv().map_err(|_| RuntimeError::QueueShutdown)?
            }
        };
        RuntimeStats::incr(&self.registry.stats().callbacks_processed);
        Ok(event)
    }

    /// Block for at most `timeout`. `Ok(None)` on timeout.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<CompletionEvent>, RuntimeError> {
        let event = match self.rx.try_recv() {
            Ok(event) => event,
            Err(TryRecvError::Disconnected) => return Err(RuntimeError::QueueShutdown),
            Err(TryRecvError::Empty) => {
                let _blocked = self.registry.enter_blocking();
                match self.rx.recv_timeout(timeout) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => return Ok(None),
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(RuntimeError::QueueShutdown)
                    }
                }
            }
        };
        RuntimeStats::incr(&self.registry.stats().callbacks_processed);
        Ok(Some(event))
    }

    /// Take an event if one is immediately available.
    pub fn try_pop(&self) -> Option<CompletionEvent> {
        let event = self.rx.try_recv().ok()?;
        RuntimeStats::incr(&self.registry.stats().callbacks_processed);
        Some(event)
    }

    /// Stop accepting events.
    ///
    /// Blocked consumers wake once the queue drains. Idempotent.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Events currently waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether no events are waiting.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Maximum queued events.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for CallbackQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}
