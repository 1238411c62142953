//! Task Records and Handles
//!
//! A task is a unit of work with a lifecycle the embedder can observe:
//!
//! ```text
//! Pending -> Running -> Completed | Failed | Cancelled
//! Pending -> Cancelled                  (cancelled before dequeue)
//! ```
//!
//! Terminal states are permanent, and the result is delivered exactly
//! once: either through `join` or through the callback queue, chosen at
//! spawn time, never both.
//!
//! Cancellation is a CAS race on `Pending`. Whoever wins the
//! `Pending -> {Running, Cancelled}` transition decides: a canceller
//! that wins delivers `Cancelled` itself; a worker that wins checks the
//! token once before executing the body and honors a pending request
//! without running user code. A task already `Running` is only marked
//! on its token and must cooperate.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::cancellation::{CancellationError, CancellationSource, CancellationToken};
use crate::error::RuntimeError;
use crate::platform;
use crate::registry::{ThreadHandle, ThreadRegistry};
use crate::stats::RuntimeStats;

/// Counter for task ids.
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique (per process) task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Queued, not yet picked up by a worker.
    Pending = 0,
    /// Executing on a worker thread.
    Running = 1,
    /// Finished with a value.
    Completed = 2,
    /// Finished with an error or a panic.
    Failed = 3,
    /// Cancelled before or during execution.
    Cancelled = 4,
}

impl TaskState {
    /// Whether this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    fn from_u8(v: u8) -> TaskState {
        match v {
            1 => TaskState::Running,
            2 => TaskState::Completed,
            3 => TaskState::Failed,
            4 => TaskState::Cancelled,
            _ => TaskState::Pending,
        }
    }
}

/// A task's successful result.
pub type TaskValue = Box<dyn Any + Send>;

/// A task's failure: an error return or a captured panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Human-readable failure description.
    pub message: String,
    /// Whether the body panicked (vs returning an error).
    pub panicked: bool,
}

impl TaskFailure {
    /// Failure from an ordinary error return.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            panicked: false,
        }
    }

    /// Failure from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked".to_string()
        };
        Self {
            message,
            panicked: true,
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.panicked {
            write!(f, "task panicked: {}", self.message)
        } else {
            write!(f, "task failed: {}", self.message)
        }
    }
}

/// Terminal result of a task: a value, a failure, or a cancellation,
/// never more than one.
pub enum TaskOutcome {
    /// The body returned a value.
    Completed(TaskValue),
    /// The body returned an error or panicked.
    Failed(TaskFailure),
    /// Cancelled, with the canceller's reason if given.
    Cancelled(Option<String>),
}

impl TaskOutcome {
    /// Whether this is `Completed`.
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed(_))
    }

    /// Whether this is `Failed`.
    pub fn is_failed(&self) -> bool {
        matches!(self, TaskOutcome::Failed(_))
    }

    /// Whether this is `Cancelled`.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskOutcome::Cancelled(_))
    }

    /// Extract the value, if completed.
    pub fn into_value(self) -> Option<TaskValue> {
        match self {
            TaskOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    fn terminal_state(&self) -> TaskState {
        match self {
            TaskOutcome::Completed(_) => TaskState::Completed,
            TaskOutcome::Failed(_) => TaskState::Failed,
            TaskOutcome::Cancelled(_) => TaskState::Cancelled,
        }
    }
}

impl fmt::Debug for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Completed(_) => write!(f, "Completed(<value>)"),
            TaskOutcome::Failed(failure) => write!(f, "Failed({:?})", failure),
            TaskOutcome::Cancelled(reason) => write!(f, "Cancelled({:?})", reason),
        }
    }
}

/// How a task's result leaves the runtime. Chosen at spawn, fixed for
/// the task's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The result waits for a `join` / `join_timeout`.
    Join,
    /// The result is pushed onto the runtime's callback queue.
    Callback,
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStatus {
    /// The request was recorded (task may still be finishing).
    Requested,
    /// The task was already terminal; nothing to do.
    AlreadyTerminal,
}

/// Context handed to a running task body.
pub struct TaskContext {
    id: TaskId,
    token: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(id: TaskId, token: CancellationToken) -> Self {
        Self { id, token }
    }

    /// This task's id.
    pub fn task_id(&self) -> TaskId {
        self.id
    }

    /// A clone of this task's cancellation token.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Bail out early if cancellation has been requested.
    pub fn check(&self) -> Result<(), CancellationError> {
        self.token.check()
    }
}

/// The boxed body of a task.
pub(crate) type TaskBody =
    Box<dyn FnOnce(&TaskContext) -> Result<TaskValue, TaskFailure> + Send + 'static>;

/// Join-side rendezvous state.
struct JoinState {
    complete: bool,
    consumed: bool,
    outcome: Option<TaskOutcome>,
}

/// Shared task record.
pub(crate) struct TaskInner {
    id: TaskId,
    state: AtomicU8,
    delivery: DeliveryMode,
    body: Mutex<Option<TaskBody>>,
    join: Mutex<JoinState>,
    join_cv: Condvar,
    cancel: CancellationSource,
    /// Worker currently executing the body, for diagnostics.
    owning_thread: Mutex<Option<ThreadHandle>>,
    registry: Arc<ThreadRegistry>,
    /// Set for `DeliveryMode::Callback` tasks.
    callbacks: Option<Arc<crate::callbacks::CallbackQueue>>,
    spawned_at_ms: u64,
}

impl TaskInner {
    pub(crate) fn new(
        registry: Arc<ThreadRegistry>,
        delivery: DeliveryMode,
        callbacks: Option<Arc<crate::callbacks::CallbackQueue>>,
        body: TaskBody,
    ) -> Arc<Self> {
        debug_assert_eq!(delivery == DeliveryMode::Callback, callbacks.is_some());
        Arc::new(Self {
            id: TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)),
            state: AtomicU8::new(TaskState::Pending as u8),
            delivery,
            body: Mutex::new(Some(body)),
            join: Mutex::new(JoinState {
                complete: false,
                consumed: false,
                outcome: None,
            }),
            join_cv: Condvar::new(),
            cancel: CancellationSource::new(),
            owning_thread: Mutex::new(None),
            registry,
            callbacks,
            spawned_at_ms: platform::timestamp_ms(),
        })
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.token()
    }

    /// Claim the task for execution. False means a canceller got to the
    /// `Pending` state first and already delivered.
    pub(crate) fn transition_running(&self) -> bool {
        self.state
            .compare_exchange(
                TaskState::Pending as u8,
                TaskState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn set_owning_thread(&self, handle: Option<ThreadHandle>) {
        *self.owning_thread.lock() = handle;
    }

    pub(crate) fn take_body(&self) -> Option<TaskBody> {
        self.body.lock().take()
    }

    /// Enter a terminal state and deliver the outcome exactly once.
    pub(crate) fn finish(&self, outcome: TaskOutcome) {
        let terminal = outcome.terminal_state();
        self.state.store(terminal as u8, Ordering::Release);

        let stats = self.registry.stats();
        match terminal {
            TaskState::Completed => RuntimeStats::incr(&stats.tasks_completed),
            TaskState::Failed => RuntimeStats::incr(&stats.tasks_failed),
            TaskState::Cancelled => RuntimeStats::incr(&stats.tasks_cancelled),
            _ => {}
        }

        match self.delivery {
            DeliveryMode::Join => {
                let mut join = self.join.lock();
                join.complete = true;
                join.outcome = Some(outcome);
                self.join_cv.notify_all();
            }
            DeliveryMode::Callback => {
                if let Some(queue) = &self.callbacks {
                    if let Err(err) = queue.push(crate::callbacks::CompletionEvent {
                        task: self.id,
                        outcome,
                    }) {
                        crate::log::warn(format!(
                            "completion event for {} dropped: {}",
                            self.id, err
                        ));
                    }
                }
                let mut join = self.join.lock();
                join.complete = true;
                self.join_cv.notify_all();
            }
        }
    }

    /// Request cancellation.
    pub(crate) fn cancel_with_reason(&self, reason: Option<String>) -> CancelStatus {
        if self.state().is_terminal() {
            return CancelStatus::AlreadyTerminal;
        }
        self.cancel.cancel_with_reason(reason);

        // If the task is still queued, take it out of the race: the
        // worker that eventually dequeues it will see a non-Pending
        // state and skip.
        if self
            .state
            .compare_exchange(
                TaskState::Pending as u8,
                TaskState::Cancelled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.finish(TaskOutcome::Cancelled(self.cancel.token().reason()));
        }
        CancelStatus::Requested
    }

    pub(crate) fn spawned_at_ms(&self) -> u64 {
        self.spawned_at_ms
    }
}

/// Handle to a spawned task.
///
/// Cloneable; all clones observe the same task. The result itself is
/// single-consumer.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
}

impl TaskHandle {
    pub(crate) fn new(inner: Arc<TaskInner>) -> Self {
        Self { inner }
    }

    /// This task's id.
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.inner.state()
    }

    /// How this task's result is delivered.
    pub fn delivery(&self) -> DeliveryMode {
        self.inner.delivery
    }

    /// Whether the task has reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.inner.state().is_terminal()
    }

    /// The worker currently executing this task, if any.
    pub fn owning_thread(&self) -> Option<ThreadHandle> {
        *self.inner.owning_thread.lock()
    }

    /// When this task was spawned (process-relative ms).
    pub fn spawned_at_ms(&self) -> u64 {
        self.inner.spawned_at_ms()
    }

    /// Request cancellation.
    pub fn cancel(&self) -> CancelStatus {
        self.inner.cancel_with_reason(None)
    }

    /// Request cancellation with a reason.
    pub fn cancel_with_reason(&self, reason: impl Into<String>) -> CancelStatus {
        self.inner.cancel_with_reason(Some(reason.into()))
    }

    /// Block until the task is terminal and take its outcome.
    ///
    /// GC-cooperative: a registered caller is `BlockedWithRoots` while
    /// parked. `AlreadyConsumed` if the outcome was already taken or
    /// the task delivers through the callback queue.
    pub fn join(&self) -> Result<TaskOutcome, RuntimeError> {
        if self.inner.delivery == DeliveryMode::Callback {
            return Err(RuntimeError::AlreadyConsumed);
        }
        let mut join = self.inner.join.lock();
        if join.consumed {
            return Err(RuntimeError::AlreadyConsumed);
        }
        if !join.complete {
            let _blocked = self.inner.registry.enter_blocking();
            while !join.complete {
                self.inner.join_cv.wait(&mut join);
            }
        }
        join.consumed = true;
        Ok(join
            .outcome
            .take()
            .expect("terminal join-mode task must hold an outcome"))
    }

    /// Like [`join`](Self::join) with an upper bound.
    ///
    /// `Ok(None)` on timeout; the outcome stays claimable.
    pub fn join_timeout(&self, timeout: Duration) -> Result<Option<TaskOutcome>, RuntimeError> {
        if self.inner.delivery == DeliveryMode::Callback {
            return Err(RuntimeError::AlreadyConsumed);
        }
        let deadline = platform::deadline_after(timeout);
        let mut join = self.inner.join.lock();
        if join.consumed {
            return Err(RuntimeError::AlreadyConsumed);
        }
        if !join.complete {
            let _blocked = self.inner.registry.enter_blocking();
            while !join.complete {
                if self.inner.join_cv.wait_until(&mut join, deadline).timed_out() {
                    break;
                }
            }
        }
        if !join.complete {
            return Ok(None);
        }
        join.consumed = true;
        Ok(Some(join.outcome.take().expect(
            "terminal join-mode task must hold an outcome",
        )))
    }

    pub(crate) fn inner(&self) -> &Arc<TaskInner> {
        &self.inner
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .field("delivery", &self.inner.delivery)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_registry() -> Arc<ThreadRegistry> {
        Arc::new(ThreadRegistry::new(Arc::new(RuntimeStats::new())))
    }

    fn join_task(registry: &Arc<ThreadRegistry>) -> (Arc<TaskInner>, TaskHandle) {
        let inner = TaskInner::new(
            Arc::clone(registry),
            DeliveryMode::Join,
            None,
            Box::new(|_ctx| Ok(Box::new(42u32) as TaskValue)),
        );
        let handle = TaskHandle::new(Arc::clone(&inner));
        (inner, handle)
    }

    #[test]
    fn test_task_ids_unique() {
        let registry = new_registry();
        let (a, _) = join_task(&registry);
        let (b, _) = join_task(&registry);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_finish_delivers_to_join() {
        let registry = new_registry();
        let (inner, handle) = join_task(&registry);
        assert_eq!(handle.state(), TaskState::Pending);
        assert!(!handle.is_complete());

        assert!(inner.transition_running());
        inner.finish(TaskOutcome::Completed(Box::new(7u32)));

        assert_eq!(handle.state(), TaskState::Completed);
        let outcome = handle.join().unwrap();
        let value = outcome.into_value().unwrap();
        assert_eq!(*value.downcast::<u32>().unwrap(), 7);
        assert_eq!(registry.stats().snapshot().tasks_completed, 1);
    }

    #[test]
    fn test_second_join_already_consumed() {
        let registry = new_registry();
        let (inner, handle) = join_task(&registry);
        inner.finish(TaskOutcome::Completed(Box::new(1u32)));

        assert!(handle.join().is_ok());
        assert_eq!(handle.join().unwrap_err(), RuntimeError::AlreadyConsumed);
        assert_eq!(
            handle.join_timeout(Duration::from_millis(1)).unwrap_err(),
            RuntimeError::AlreadyConsumed
        );
    }

    #[test]
    fn test_join_timeout_leaves_outcome_claimable() {
        let registry = new_registry();
        let main = registry.register();
        let (inner, handle) = join_task(&registry);

        // Still pending: the wait must time out without consuming.
        let result = handle.join_timeout(Duration::from_millis(10)).unwrap();
        assert!(result.is_none());

        inner.finish(TaskOutcome::Completed(Box::new(5u32)));
        let outcome = handle.join_timeout(Duration::from_millis(10)).unwrap();
        assert!(outcome.unwrap().is_completed());

        registry.unregister(main).unwrap();
    }

    #[test]
    fn test_cancel_pending_delivers_cancelled() {
        let registry = new_registry();
        let (inner, handle) = join_task(&registry);

        assert_eq!(
            handle.cancel_with_reason("not needed"),
            CancelStatus::Requested
        );
        assert_eq!(handle.state(), TaskState::Cancelled);
        // The canceller delivered; a worker that later dequeues must
        // not claim it.
        assert!(!inner.transition_running());

        match handle.join().unwrap() {
            TaskOutcome::Cancelled(reason) => assert_eq!(reason.as_deref(), Some("not needed")),
            other => panic!("expected cancelled outcome, got {:?}", other),
        }
        assert_eq!(registry.stats().snapshot().tasks_cancelled, 1);
    }

    #[test]
    fn test_cancel_running_only_marks_token() {
        let registry = new_registry();
        let (inner, handle) = join_task(&registry);
        assert!(inner.transition_running());

        assert_eq!(handle.cancel(), CancelStatus::Requested);
        assert_eq!(handle.state(), TaskState::Running);
        assert!(inner.cancel_token().is_cancelled());
    }

    #[test]
    fn test_cancel_terminal_is_noop() {
        let registry = new_registry();
        let (inner, handle) = join_task(&registry);
        inner.finish(TaskOutcome::Completed(Box::new(1u32)));

        assert_eq!(handle.cancel(), CancelStatus::AlreadyTerminal);
        assert_eq!(handle.state(), TaskState::Completed);
        assert!(handle.join().unwrap().is_completed());
    }

    #[test]
    fn test_failure_from_panic_payload() {
        let failure = TaskFailure::from_panic(Box::new("boom"));
        assert!(failure.panicked);
        assert_eq!(failure.message, "boom");

        let failure = TaskFailure::from_panic(Box::new(String::from("owned")));
        assert_eq!(failure.message, "owned");

        let failure = TaskFailure::from_panic(Box::new(17u8));
        assert_eq!(failure.message, "task panicked");
    }

    #[test]
    fn test_outcome_debug_and_accessors() {
        let completed = TaskOutcome::Completed(Box::new(1u8));
        assert!(completed.is_completed());
        assert_eq!(format!("{:?}", completed), "Completed(<value>)");

        let failed = TaskOutcome::Failed(TaskFailure::new("nope"));
        assert!(failed.is_failed());
        assert!(failed.into_value().is_none());

        let cancelled = TaskOutcome::Cancelled(None);
        assert!(cancelled.is_cancelled());
    }
}
