//! C ABI Surface
//!
//! The compiler runtime talks to this crate through an opaque
//! `AsthraRuntime*` and small-integer object handles, never raw
//! pointers to runtime objects. Destroying an object removes its
//! handle-table entry, so any later use of the handle is *detected*
//! (logged, then abort) instead of being undefined behavior.
//!
//! # Conventions
//!
//! - `0` (`ASTHRA_OK`) is success; negative codes are recoverable
//!   errors; small positive codes are distinguished non-error results
//!   (timeout, busy).
//! - Contract violations (double registration, blocking while
//!   unregistered) panic, and panics crossing this `extern "C"`
//!   boundary abort the process. That is the intended crash-over-
//!   corruption behavior.
//! - All functions are thread-safe. Handles may be shared across
//!   threads.

use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as TableLock;

use crate::error::RuntimeError;
use crate::log;
use crate::roots::RootHandle;
use crate::sync::{Condvar, Mutex, RwLock, WaitResult};
use crate::task::{TaskFailure, TaskHandle, TaskOutcome, TaskValue};
use crate::{Runtime, RuntimeConfig};

/// Success.
pub const ASTHRA_OK: c_int = 0;
/// A timed wait elapsed (not an error).
pub const ASTHRA_TIMED_OUT: c_int = 1;
/// A try-acquire found the primitive held (not an error).
pub const ASTHRA_BUSY: c_int = 2;
/// A cancel request found the task already terminal (not an error).
pub const ASTHRA_ALREADY_TERMINAL: c_int = 3;

/// Null pointer, bad flag, or unknown task handle.
pub const ASTHRA_ERR_INVALID_ARG: c_int = -1;
/// Caller does not hold the primitive.
pub const ASTHRA_ERR_NOT_OWNER: c_int = -2;
/// Callback queue at capacity.
pub const ASTHRA_ERR_QUEUE_FULL: c_int = -3;
/// Callback queue closed.
pub const ASTHRA_ERR_QUEUE_SHUTDOWN: c_int = -4;
/// Runtime is shutting down.
pub const ASTHRA_ERR_SHUTTING_DOWN: c_int = -5;
/// Task result already consumed.
pub const ASTHRA_ERR_ALREADY_CONSUMED: c_int = -6;
/// Calling thread is not registered.
pub const ASTHRA_ERR_NOT_REGISTERED: c_int = -7;
/// Stale root or thread handle.
pub const ASTHRA_ERR_STALE_HANDLE: c_int = -8;

/// Task finished with a value.
pub const ASTHRA_TASK_COMPLETED: c_int = 0;
/// Task finished with an error or panic.
pub const ASTHRA_TASK_FAILED: c_int = 1;
/// Task was cancelled.
pub const ASTHRA_TASK_CANCELLED: c_int = 2;

fn error_code(err: &RuntimeError) -> c_int {
    match err {
        RuntimeError::InvalidThread => ASTHRA_ERR_NOT_REGISTERED,
        RuntimeError::RootNotFound => ASTHRA_ERR_STALE_HANDLE,
        RuntimeError::InvalidHandle => ASTHRA_ERR_STALE_HANDLE,
        RuntimeError::InvalidTransition { .. } => ASTHRA_ERR_INVALID_ARG,
        RuntimeError::NotOwner => ASTHRA_ERR_NOT_OWNER,
        RuntimeError::AlreadyConsumed => ASTHRA_ERR_ALREADY_CONSUMED,
        RuntimeError::QueueFull => ASTHRA_ERR_QUEUE_FULL,
        RuntimeError::QueueShutdown => ASTHRA_ERR_QUEUE_SHUTDOWN,
        RuntimeError::ShuttingDown => ASTHRA_ERR_SHUTTING_DOWN,
    }
}

/// Use of a destroyed or never-issued primitive handle.
///
/// The handle table no longer knows the object, so the caller is
/// holding a dangling reference; continuing would be the C
/// use-after-free this layer exists to catch.
fn stale_primitive(kind: &str, handle: u64) -> ! {
    log::error(format!(
        "fatal: {} handle {} used after destroy (or never created)",
        kind, handle
    ));
    std::process::abort();
}

/// Opaque runtime object handed across the C boundary.
pub struct AsthraRuntime {
    runtime: Runtime,
    mutexes: TableLock<HashMap<u64, Arc<Mutex>>>,
    condvars: TableLock<HashMap<u64, Arc<Condvar>>>,
    rwlocks: TableLock<HashMap<u64, Arc<RwLock>>>,
    tasks: TableLock<HashMap<u64, TaskHandle>>,
    roots: TableLock<HashMap<u64, RootHandle>>,
    next_handle: AtomicU64,
}

impl AsthraRuntime {
    fn new(runtime: Runtime) -> Self {
        Self {
            runtime,
            mutexes: TableLock::new(HashMap::new()),
            condvars: TableLock::new(HashMap::new()),
            rwlocks: TableLock::new(HashMap::new()),
            tasks: TableLock::new(HashMap::new()),
            roots: TableLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn issue_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn mutex(&self, handle: u64) -> Arc<Mutex> {
        match self.mutexes.lock().get(&handle) {
            Some(mutex) => Arc::clone(mutex),
            None => stale_primitive("mutex", handle),
        }
    }

    fn condvar(&self, handle: u64) -> Arc<Condvar> {
        match self.condvars.lock().get(&handle) {
            Some(cond) => Arc::clone(cond),
            None => stale_primitive("condvar", handle),
        }
    }

    fn rwlock(&self, handle: u64) -> Arc<RwLock> {
        match self.rwlocks.lock().get(&handle) {
            Some(rwlock) => Arc::clone(rwlock),
            None => stale_primitive("rwlock", handle),
        }
    }
}

unsafe fn runtime_ref<'a>(rt: *mut AsthraRuntime) -> Option<&'a AsthraRuntime> {
    unsafe { rt.as_ref() }
}

unsafe fn name_arg<'a>(name: *const c_char) -> Option<&'a str> {
    if name.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(name) }.to_str().ok()
}

/// Pointer argument smuggled into a task body.
///
/// The embedder guarantees `arg` stays valid and is safe to touch from
/// the worker thread; this mirrors the usual C callback contract.
struct SendPtr(*mut c_void);
unsafe impl Send for SendPtr {}

// ---------------------------------------------------------------------------
// Runtime lifecycle
// ---------------------------------------------------------------------------

/// Create a runtime and start its workers.
///
/// `num_workers == 0` means "number of CPUs". Returns null if the
/// configuration is invalid.
///
/// # Safety
/// The returned pointer must be released with
/// [`asthra_runtime_destroy`].
#[no_mangle]
pub unsafe extern "C" fn asthra_runtime_init(num_workers: usize) -> *mut AsthraRuntime {
    let mut builder = RuntimeConfig::builder();
    if num_workers > 0 {
        builder = builder.num_workers(num_workers);
    }
    let config = match builder.build() {
        Ok(config) => config,
        Err(err) => {
            log::error(format!("runtime init failed: {}", err));
            return std::ptr::null_mut();
        }
    };
    match Runtime::with_config(config) {
        Ok(runtime) => {
            runtime.start();
            Box::into_raw(Box::new(AsthraRuntime::new(runtime)))
        }
        Err(err) => {
            log::error(format!("runtime init failed: {}", err));
            std::ptr::null_mut()
        }
    }
}

/// Stop accepting work and join the workers. The pointer stays valid
/// until [`asthra_runtime_destroy`].
///
/// # Safety
/// `rt` must be null or a pointer from [`asthra_runtime_init`].
#[no_mangle]
pub unsafe extern "C" fn asthra_runtime_shutdown(rt: *mut AsthraRuntime) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    rt.runtime.shutdown();
    ASTHRA_OK
}

/// Shut down (if not already) and free the runtime.
///
/// # Safety
/// `rt` must be null or a pointer from [`asthra_runtime_init`], and
/// must not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn asthra_runtime_destroy(rt: *mut AsthraRuntime) {
    if rt.is_null() {
        return;
    }
    let rt = unsafe { Box::from_raw(rt) };
    rt.runtime.shutdown();
}

// ---------------------------------------------------------------------------
// Thread registry
// ---------------------------------------------------------------------------

/// Register the calling thread for GC coordination.
///
/// Fatal (abort) if the thread is already registered.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer.
#[no_mangle]
pub unsafe extern "C" fn asthra_thread_register(rt: *mut AsthraRuntime) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    rt.runtime.registry().register();
    ASTHRA_OK
}

/// Unregister the calling thread.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer.
#[no_mangle]
pub unsafe extern "C" fn asthra_thread_unregister(rt: *mut AsthraRuntime) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    let registry = rt.runtime.registry();
    let Some(handle) = registry.current() else {
        return ASTHRA_ERR_NOT_REGISTERED;
    };
    match registry.unregister(handle) {
        Ok(()) => ASTHRA_OK,
        Err(err) => error_code(&err),
    }
}

/// Register `[addr, addr+len)` as a GC root range for the calling
/// thread. Writes a root handle to `out_root`.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer; `out_root` must be
/// null or writable.
#[no_mangle]
pub unsafe extern "C" fn asthra_root_register(
    rt: *mut AsthraRuntime,
    addr: *mut c_void,
    len: usize,
    out_root: *mut u64,
) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    if out_root.is_null() {
        return ASTHRA_ERR_INVALID_ARG;
    }
    match rt.runtime.registry().root_register(addr as usize, len) {
        Ok(root) => {
            let handle = rt.issue_handle();
            rt.roots.lock().insert(handle, root);
            unsafe { *out_root = handle };
            ASTHRA_OK
        }
        Err(err) => error_code(&err),
    }
}

/// Remove a GC root range registered by the calling thread.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer.
#[no_mangle]
pub unsafe extern "C" fn asthra_root_unregister(rt: *mut AsthraRuntime, root: u64) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    let Some(root_handle) = rt.roots.lock().remove(&root) else {
        return ASTHRA_ERR_STALE_HANDLE;
    };
    match rt.runtime.registry().root_unregister(root_handle) {
        Ok(()) => ASTHRA_OK,
        Err(err) => error_code(&err),
    }
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

/// Create a GC-aware mutex. Writes the handle to `out_mutex`.
///
/// Recursive mutexes are not supported; `recursive != 0` is rejected.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer; `name` must be null
/// or a NUL-terminated string; `out_mutex` must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn asthra_mutex_create(
    rt: *mut AsthraRuntime,
    name: *const c_char,
    recursive: c_int,
    out_mutex: *mut u64,
) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    if out_mutex.is_null() {
        return ASTHRA_ERR_INVALID_ARG;
    }
    if recursive != 0 {
        log::error("recursive mutexes are not supported");
        return ASTHRA_ERR_INVALID_ARG;
    }
    let name = unsafe { name_arg(name) };
    let mutex = Arc::new(rt.runtime.new_mutex(name));
    let handle = rt.issue_handle();
    rt.mutexes.lock().insert(handle, mutex);
    unsafe { *out_mutex = handle };
    ASTHRA_OK
}

/// Acquire a mutex, blocking GC-cooperatively.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer.
#[no_mangle]
pub unsafe extern "C" fn asthra_mutex_lock(rt: *mut AsthraRuntime, mutex: u64) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    rt.mutex(mutex).lock();
    ASTHRA_OK
}

/// Try to acquire a mutex. `ASTHRA_BUSY` if already held.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer.
#[no_mangle]
pub unsafe extern "C" fn asthra_mutex_trylock(rt: *mut AsthraRuntime, mutex: u64) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    if rt.mutex(mutex).try_lock() {
        ASTHRA_OK
    } else {
        ASTHRA_BUSY
    }
}

/// Release a mutex held by the calling thread.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer.
#[no_mangle]
pub unsafe extern "C" fn asthra_mutex_unlock(rt: *mut AsthraRuntime, mutex: u64) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    match rt.mutex(mutex).unlock() {
        Ok(()) => ASTHRA_OK,
        Err(err) => error_code(&err),
    }
}

/// Destroy a mutex. Any later use of the handle aborts.
///
/// Destroying a mutex somebody still holds is fatal: the holder's
/// unlock would operate on freed state.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer.
#[no_mangle]
pub unsafe extern "C" fn asthra_mutex_destroy(rt: *mut AsthraRuntime, mutex: u64) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    match rt.mutexes.lock().remove(&mutex) {
        Some(m) => {
            if m.is_locked() {
                log::error(format!("fatal: mutex handle {} destroyed while held", mutex));
                std::process::abort();
            }
            ASTHRA_OK
        }
        None => stale_primitive("mutex", mutex),
    }
}

// ---------------------------------------------------------------------------
// Condition variable
// ---------------------------------------------------------------------------

/// Create a condition variable. Writes the handle to `out_cond`.
///
/// # Safety
/// Same contracts as [`asthra_mutex_create`].
#[no_mangle]
pub unsafe extern "C" fn asthra_cond_create(
    rt: *mut AsthraRuntime,
    name: *const c_char,
    out_cond: *mut u64,
) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    if out_cond.is_null() {
        return ASTHRA_ERR_INVALID_ARG;
    }
    let name = unsafe { name_arg(name) };
    let cond = Arc::new(rt.runtime.new_condvar(name));
    let handle = rt.issue_handle();
    rt.condvars.lock().insert(handle, cond);
    unsafe { *out_cond = handle };
    ASTHRA_OK
}

/// Wait on a condition variable; `mutex` must be held by the caller.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer.
#[no_mangle]
pub unsafe extern "C" fn asthra_cond_wait(
    rt: *mut AsthraRuntime,
    cond: u64,
    mutex: u64,
) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    match rt.condvar(cond).wait(&rt.mutex(mutex)) {
        Ok(()) => ASTHRA_OK,
        Err(err) => error_code(&err),
    }
}

/// Wait with a timeout in milliseconds.
///
/// `ASTHRA_TIMED_OUT` when the time elapses; the mutex is re-acquired
/// either way.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer.
#[no_mangle]
pub unsafe extern "C" fn asthra_cond_wait_timeout(
    rt: *mut AsthraRuntime,
    cond: u64,
    mutex: u64,
    timeout_ms: u64,
) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    let timeout = Duration::from_millis(timeout_ms);
    match rt.condvar(cond).wait_timeout(&rt.mutex(mutex), timeout) {
        Ok(WaitResult::Signaled) => ASTHRA_OK,
        Ok(WaitResult::TimedOut) => ASTHRA_TIMED_OUT,
        Err(err) => error_code(&err),
    }
}

/// Wake one waiter.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer.
#[no_mangle]
pub unsafe extern "C" fn asthra_cond_signal(rt: *mut AsthraRuntime, cond: u64) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    rt.condvar(cond).signal();
    ASTHRA_OK
}

/// Wake all waiters.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer.
#[no_mangle]
pub unsafe extern "C" fn asthra_cond_broadcast(rt: *mut AsthraRuntime, cond: u64) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    rt.condvar(cond).broadcast();
    ASTHRA_OK
}

/// Destroy a condition variable. Any later use of the handle aborts.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer.
#[no_mangle]
pub unsafe extern "C" fn asthra_cond_destroy(rt: *mut AsthraRuntime, cond: u64) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    match rt.condvars.lock().remove(&cond) {
        Some(c) => {
            if c.waiter_count() > 0 {
                log::error(format!(
                    "fatal: condvar handle {} destroyed with waiters",
                    cond
                ));
                std::process::abort();
            }
            ASTHRA_OK
        }
        None => stale_primitive("condvar", cond),
    }
}

// ---------------------------------------------------------------------------
// Reader-writer lock
// ---------------------------------------------------------------------------

/// Create a GC-aware reader-writer lock. Writes the handle to
/// `out_rwlock`.
///
/// # Safety
/// Same contracts as [`asthra_mutex_create`].
#[no_mangle]
pub unsafe extern "C" fn asthra_rwlock_create(
    rt: *mut AsthraRuntime,
    name: *const c_char,
    out_rwlock: *mut u64,
) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    if out_rwlock.is_null() {
        return ASTHRA_ERR_INVALID_ARG;
    }
    let name = unsafe { name_arg(name) };
    let rwlock = Arc::new(rt.runtime.new_rwlock(name));
    let handle = rt.issue_handle();
    rt.rwlocks.lock().insert(handle, rwlock);
    unsafe { *out_rwlock = handle };
    ASTHRA_OK
}

/// Acquire a shared read lock.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer.
#[no_mangle]
pub unsafe extern "C" fn asthra_rwlock_read_lock(rt: *mut AsthraRuntime, rwlock: u64) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    rt.rwlock(rwlock).read_lock();
    ASTHRA_OK
}

/// Acquire the exclusive write lock.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer.
#[no_mangle]
pub unsafe extern "C" fn asthra_rwlock_write_lock(rt: *mut AsthraRuntime, rwlock: u64) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    rt.rwlock(rwlock).write_lock();
    ASTHRA_OK
}

/// Release a read lock.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer.
#[no_mangle]
pub unsafe extern "C" fn asthra_rwlock_read_unlock(rt: *mut AsthraRuntime, rwlock: u64) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    match rt.rwlock(rwlock).read_unlock() {
        Ok(()) => ASTHRA_OK,
        Err(err) => error_code(&err),
    }
}

/// Release the write lock.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer.
#[no_mangle]
pub unsafe extern "C" fn asthra_rwlock_write_unlock(rt: *mut AsthraRuntime, rwlock: u64) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    match rt.rwlock(rwlock).write_unlock() {
        Ok(()) => ASTHRA_OK,
        Err(err) => error_code(&err),
    }
}

/// Destroy a reader-writer lock. Any later use of the handle aborts.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer.
#[no_mangle]
pub unsafe extern "C" fn asthra_rwlock_destroy(rt: *mut AsthraRuntime, rwlock: u64) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    match rt.rwlocks.lock().remove(&rwlock) {
        Some(rw) => {
            if rw.is_write_locked() || rw.reader_count() > 0 {
                log::error(format!(
                    "fatal: rwlock handle {} destroyed while held",
                    rwlock
                ));
                std::process::abort();
            }
            ASTHRA_OK
        }
        None => stale_primitive("rwlock", rwlock),
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Spawn a task running `func(arg)`.
///
/// A zero return from `func` completes the task; nonzero fails it with
/// the return code in the failure message. With `use_callback != 0`
/// the outcome goes to the runtime's callback queue and the task
/// cannot be joined. Writes a task handle to `out_task`.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer; `arg` must remain
/// valid until the task finishes and be safe to use from another
/// thread; `out_task` must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn asthra_task_spawn(
    rt: *mut AsthraRuntime,
    func: Option<extern "C" fn(*mut c_void) -> c_int>,
    arg: *mut c_void,
    use_callback: c_int,
    out_task: *mut u64,
) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    let Some(func) = func else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    if out_task.is_null() {
        return ASTHRA_ERR_INVALID_ARG;
    }

    let arg = SendPtr(arg);
    let body = move |_ctx: &crate::TaskContext| -> Result<TaskValue, TaskFailure> {
        let arg = arg;
        let code = func(arg.0);
        if code == 0 {
            Ok(Box::new(code) as TaskValue)
        } else {
            Err(TaskFailure::new(format!("task returned {}", code)))
        }
    };

    let spawned = if use_callback != 0 {
        rt.runtime.spawn_with_callback(body)
    } else {
        rt.runtime.spawn(body)
    };
    match spawned {
        Ok(task) => {
            let handle = rt.issue_handle();
            rt.tasks.lock().insert(handle, task);
            unsafe { *out_task = handle };
            ASTHRA_OK
        }
        Err(err) => error_code(&err),
    }
}

fn outcome_status(outcome: &TaskOutcome) -> c_int {
    match outcome {
        TaskOutcome::Completed(_) => ASTHRA_TASK_COMPLETED,
        TaskOutcome::Failed(_) => ASTHRA_TASK_FAILED,
        TaskOutcome::Cancelled(_) => ASTHRA_TASK_CANCELLED,
    }
}

/// Join a task, blocking GC-cooperatively.
///
/// On success writes the terminal status (`ASTHRA_TASK_*`) to
/// `out_status` and retires the task handle.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer; `out_status` must be
/// null or writable.
#[no_mangle]
pub unsafe extern "C" fn asthra_task_join(
    rt: *mut AsthraRuntime,
    task: u64,
    out_status: *mut c_int,
) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    if out_status.is_null() {
        return ASTHRA_ERR_INVALID_ARG;
    }
    let Some(handle) = rt.tasks.lock().get(&task).cloned() else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    match handle.join() {
        Ok(outcome) => {
            unsafe { *out_status = outcome_status(&outcome) };
            rt.tasks.lock().remove(&task);
            ASTHRA_OK
        }
        Err(err) => error_code(&err),
    }
}

/// Join with a timeout in milliseconds. `ASTHRA_TIMED_OUT` leaves the
/// task handle and its result intact.
///
/// # Safety
/// Same contracts as [`asthra_task_join`].
#[no_mangle]
pub unsafe extern "C" fn asthra_task_join_timeout(
    rt: *mut AsthraRuntime,
    task: u64,
    timeout_ms: u64,
    out_status: *mut c_int,
) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    if out_status.is_null() {
        return ASTHRA_ERR_INVALID_ARG;
    }
    let Some(handle) = rt.tasks.lock().get(&task).cloned() else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    match handle.join_timeout(Duration::from_millis(timeout_ms)) {
        Ok(Some(outcome)) => {
            unsafe { *out_status = outcome_status(&outcome) };
            rt.tasks.lock().remove(&task);
            ASTHRA_OK
        }
        Ok(None) => ASTHRA_TIMED_OUT,
        Err(err) => error_code(&err),
    }
}

/// Request cancellation of a task.
///
/// `ASTHRA_ALREADY_TERMINAL` if the task had already finished.
///
/// # Safety
/// `rt` must be null or a valid runtime pointer.
#[no_mangle]
pub unsafe extern "C" fn asthra_task_cancel(rt: *mut AsthraRuntime, task: u64) -> c_int {
    let Some(rt) = (unsafe { runtime_ref(rt) }) else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    let Some(handle) = rt.tasks.lock().get(&task).cloned() else {
        return ASTHRA_ERR_INVALID_ARG;
    };
    match handle.cancel() {
        crate::CancelStatus::Requested => ASTHRA_OK,
        crate::CancelStatus::AlreadyTerminal => ASTHRA_ALREADY_TERMINAL,
    }
}
