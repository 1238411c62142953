//! Work-Stealing Task Scheduler
//!
//! Fixed pool of worker threads draining a global injection queue with
//! per-worker deques and work-stealing for load balance.
//!
//! Every worker registers itself with the thread registry before its
//! loop and unregisters on the way out, so workers are ordinary
//! GC-participating threads: a worker blocked in `join` or a GC-aware
//! mutex inside a task body is scannable like any other thread.
//!
//! Task bodies run under `catch_unwind`. A panicking body becomes a
//! `Failed` outcome; the worker thread itself never dies from user
//! code.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_deque::{Injector, Steal, Stealer, Worker as Deque};
use parking_lot::Mutex;

use crate::callbacks::CallbackQueue;
use crate::error::RuntimeError;
use crate::log;
use crate::registry::ThreadRegistry;
use crate::stats::RuntimeStats;
use crate::task::{
    DeliveryMode, TaskContext, TaskFailure, TaskHandle, TaskInner, TaskOutcome, TaskValue,
};

/// Work-stealing scheduler for tasks.
pub struct Scheduler {
    num_workers: usize,
    /// Global injection queue.
    injector: Arc<Injector<Arc<TaskInner>>>,
    /// Stealers for every worker deque.
    stealers: Vec<Stealer<Arc<TaskInner>>>,
    /// Worker threads and their (pre-start) deques.
    workers: Mutex<Vec<WorkerHandle>>,
    registry: Arc<ThreadRegistry>,
    callbacks: Arc<CallbackQueue>,
    started: AtomicBool,
    shutdown: Arc<AtomicBool>,
    active_workers: Arc<AtomicUsize>,
}

/// Handle to a worker thread.
struct WorkerHandle {
    id: usize,
    /// Local deque; taken by `start()`.
    deque: Option<Deque<Arc<TaskInner>>>,
    thread: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Create a scheduler with `num_workers` workers (not yet running).
    pub fn new(
        num_workers: usize,
        registry: Arc<ThreadRegistry>,
        callbacks: Arc<CallbackQueue>,
    ) -> Self {
        let mut workers = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);
        for id in 0..num_workers {
            let deque = Deque::new_fifo();
            stealers.push(deque.stealer());
            workers.push(WorkerHandle {
                id,
                deque: Some(deque),
                thread: None,
            });
        }

        Self {
            num_workers,
            injector: Arc::new(Injector::new()),
            stealers,
            workers: Mutex::new(workers),
            registry,
            callbacks,
            started: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
            active_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Get the number of workers.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Number of workers currently inside their loop.
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Start the worker threads. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut workers = self.workers.lock();
        for worker in workers.iter_mut() {
            let deque = match worker.deque.take() {
                Some(deque) => deque,
                None => continue,
            };
            let ctx = Worker {
                id: worker.id,
                injector: Arc::clone(&self.injector),
                stealers: self.stealers.clone(),
                registry: Arc::clone(&self.registry),
                shutdown: Arc::clone(&self.shutdown),
                active_workers: Arc::clone(&self.active_workers),
            };
            let handle = thread::Builder::new()
                .name(format!("asthra-worker-{}", worker.id))
                .spawn(move || ctx.run_loop(deque))
                .expect("failed to spawn worker thread");
            worker.thread = Some(handle);
        }
        log::info(format!("scheduler started with {} workers", self.num_workers));
    }

    /// Flag shutdown, join every worker, and cancel whatever never got
    /// dequeued. Idempotent.
    ///
    /// Every task accepted by `spawn` still reaches a terminal state:
    /// tasks left in the injector (or, if the scheduler never started,
    /// in the pre-start deques) are finished as `Cancelled` so joiners
    /// wake and callback events fire instead of waiting forever.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let mut workers = self.workers.lock();
        for worker in workers.iter_mut() {
            if let Some(handle) = worker.thread.take() {
                let _ = handle.join();
            }
        }

        // Workers are gone; nothing races these queues now.
        loop {
            match self.injector.steal() {
                Steal::Success(task) => cancel_stranded(&task),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        for worker in workers.iter() {
            if let Some(deque) = &worker.deque {
                while let Some(task) = deque.pop() {
                    cancel_stranded(&task);
                }
            }
        }
    }

    /// Queue a task for execution.
    ///
    /// Never blocks. `ShuttingDown` once shutdown has begun.
    pub fn spawn<F>(&self, body: F, delivery: DeliveryMode) -> Result<TaskHandle, RuntimeError>
    where
        F: FnOnce(&TaskContext) -> Result<TaskValue, TaskFailure> + Send + 'static,
    {
        if self.is_shutting_down() {
            return Err(RuntimeError::ShuttingDown);
        }
        let callbacks = match delivery {
            DeliveryMode::Callback => Some(Arc::clone(&self.callbacks)),
            DeliveryMode::Join => None,
        };
        let inner = TaskInner::new(
            Arc::clone(&self.registry),
            delivery,
            callbacks,
            Box::new(body),
        );
        RuntimeStats::incr(&self.registry.stats().tasks_spawned);
        self.injector.push(Arc::clone(&inner));
        Ok(TaskHandle::new(inner))
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("num_workers", &self.num_workers)
            .field("active_workers", &self.active_workers())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

/// Deliver a `Cancelled` outcome to a task shutdown left undequeued.
///
/// The `Pending -> Cancelled` transition inside `cancel_with_reason` is
/// a CAS, so a task that was cancelled or finished concurrently is left
/// alone and delivery stays exactly-once.
fn cancel_stranded(task: &Arc<TaskInner>) {
    task.cancel_with_reason(Some("scheduler shut down".to_string()));
}

/// A worker thread in the scheduler.
struct Worker {
    #[allow(dead_code)]
    id: usize,
    injector: Arc<Injector<Arc<TaskInner>>>,
    stealers: Vec<Stealer<Arc<TaskInner>>>,
    registry: Arc<ThreadRegistry>,
    shutdown: Arc<AtomicBool>,
    active_workers: Arc<AtomicUsize>,
}

impl Worker {
    /// Run the worker loop.
    fn run_loop(self, local: Deque<Arc<TaskInner>>) {
        let handle = self.registry.register();
        self.active_workers.fetch_add(1, Ordering::AcqRel);

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            if let Some(task) = self.find_work(&local) {
                self.run_task(task);
            } else {
                thread::yield_now();
            }
        }

        // Tasks batch-stolen into the local deque but never run would
        // otherwise vanish with it.
        while let Some(task) = local.pop() {
            cancel_stranded(&task);
        }

        self.active_workers.fetch_sub(1, Ordering::AcqRel);
        if let Err(err) = self.registry.unregister(handle) {
            log::warn(format!("worker failed to unregister: {}", err));
        }
    }

    /// Find work: local deque, then global queue, then steal.
    fn find_work(&self, local: &Deque<Arc<TaskInner>>) -> Option<Arc<TaskInner>> {
        if let Some(task) = local.pop() {
            return Some(task);
        }

        loop {
            match self.injector.steal_batch_and_pop(local) {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        for stealer in &self.stealers {
            loop {
                match stealer.steal() {
                    Steal::Success(task) => return Some(task),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    /// Execute one task to a terminal state.
    fn run_task(&self, task: Arc<TaskInner>) {
        if !task.transition_running() {
            // A canceller won the Pending race and already delivered.
            return;
        }

        let token = task.cancel_token();
        if token.is_cancelled() {
            // Cancelled between spawn and dequeue, but we claimed the
            // Pending slot first: honor the request without running the
            // body.
            task.finish(TaskOutcome::Cancelled(token.reason()));
            return;
        }

        task.set_owning_thread(self.registry.current());
        let outcome = match task.take_body() {
            Some(body) => {
                let ctx = TaskContext::new(task.id(), token.clone());
                match panic::catch_unwind(AssertUnwindSafe(|| body(&ctx))) {
                    Ok(Ok(value)) => TaskOutcome::Completed(value),
                    Ok(Err(failure)) => {
                        if token.is_cancelled() {
                            // The body bailed out in response to the
                            // token; that is a cancellation, not a
                            // failure.
                            TaskOutcome::Cancelled(token.reason())
                        } else {
                            TaskOutcome::Failed(failure)
                        }
                    }
                    Err(payload) => {
                        let failure = TaskFailure::from_panic(payload);
                        log::warn(format!("{}: {}", task.id(), failure));
                        TaskOutcome::Failed(failure)
                    }
                }
            }
            None => {
                log::error(format!("{}: body missing at execution", task.id()));
                TaskOutcome::Failed(TaskFailure::new("task body missing"))
            }
        };
        task.set_owning_thread(None);
        task.finish(outcome);
    }
}
