//! GC-Aware Synchronization Primitives
//!
//! Mutex, condition variable, and reader-writer lock that keep the
//! garbage collector informed: every path that can block the calling
//! OS thread first flips the thread to `BlockedWithRoots` through a
//! `BlockGuard`, so the collector can scan a blocked thread's roots
//! instead of waiting for it.
//!
//! # Design
//!
//! These are monitors, not wrappers around `std::sync` locks handed to
//! callers. Each primitive keeps its logical state (held flag, owner,
//! reader count) inside a small `std::sync::Mutex` cell and parks
//! waiters on `std::sync::Condvar`s against that cell. This keeps
//! lock/unlock as explicit operations with owner checks, which is what
//! the C ABI needs, while `lock_guard()` offers RAII to Rust callers.
//!
//! Unlocking a primitive you do not hold is a recoverable `NotOwner`
//! error, not a fatal one: it is detected before any state changes.
//!
//! Recursive mutexes are deliberately absent.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar as StdCondvar, Mutex as StdMutex, PoisonError};
use std::thread::ThreadId;
use std::time::Duration;

use crate::error::RuntimeError;
use crate::platform;
use crate::registry::ThreadRegistry;
use crate::stats::RuntimeStats;

/// Counter for primitive ids (shared by mutexes, condvars, rwlocks).
static NEXT_SYNC_ID: AtomicU64 = AtomicU64::new(1);

fn next_sync_id() -> u64 {
    NEXT_SYNC_ID.fetch_add(1, Ordering::Relaxed)
}

/// Recover a poisoned std guard.
///
/// The state cells hold plain counters and flags that are updated
/// atomically with respect to the cell lock, so a panic elsewhere
/// cannot leave them torn.
fn recover<T>(result: Result<T, PoisonError<T>>) -> T {
    result.unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of a timed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Woken by a signal or broadcast (or spuriously).
    Signaled,
    /// The timeout elapsed first. Not an error.
    TimedOut,
}

/// Logical mutex state.
#[derive(Debug)]
struct MutexState {
    locked: bool,
    owner: Option<ThreadId>,
}

/// GC-aware mutual exclusion lock.
pub struct Mutex {
    id: u64,
    name: Option<String>,
    registry: Arc<ThreadRegistry>,
    state: StdMutex<MutexState>,
    /// Parked acquirers; also used by `Condvar` re-acquisition.
    available: StdCondvar,
    lock_count: AtomicU64,
}

impl Mutex {
    /// Create a mutex bound to `registry`.
    pub fn new(registry: Arc<ThreadRegistry>, name: Option<&str>) -> Self {
        Self {
            id: next_sync_id(),
            name: name.map(str::to_string),
            registry,
            state: StdMutex::new(MutexState {
                locked: false,
                owner: None,
            }),
            available: StdCondvar::new(),
            lock_count: AtomicU64::new(0),
        }
    }

    /// Unique id of this primitive.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Diagnostic name, if one was given at creation.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Acquire the lock, blocking GC-cooperatively if contended.
    pub fn lock(&self) {
        let mut state = recover(self.state.lock());
        if state.locked {
            RuntimeStats::incr(&self.registry.stats().mutex_contentions);
            let _blocked = self.registry.enter_blocking();
            while state.locked {
                state = recover(self.available.wait(state));
            }
        }
        state.locked = true;
        state.owner = Some(platform::current_os_id());
        self.lock_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Acquire without blocking. Returns whether the lock was taken.
    pub fn try_lock(&self) -> bool {
        let mut state = recover(self.state.lock());
        if state.locked {
            return false;
        }
        state.locked = true;
        state.owner = Some(platform::current_os_id());
        self.lock_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Release the lock.
    ///
    /// `NotOwner` if the calling thread does not hold it.
    pub fn unlock(&self) -> Result<(), RuntimeError> {
        let mut state = recover(self.state.lock());
        if !state.locked || state.owner != Some(platform::current_os_id()) {
            return Err(RuntimeError::NotOwner);
        }
        state.locked = false;
        state.owner = None;
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// RAII acquisition for Rust callers.
    pub fn lock_guard(&self) -> MutexGuard<'_> {
        self.lock();
        MutexGuard { mutex: self }
    }

    /// Whether the mutex is currently held (by anyone).
    pub fn is_locked(&self) -> bool {
        recover(self.state.lock()).locked
    }

    /// Total successful acquisitions.
    pub fn lock_count(&self) -> u64 {
        self.lock_count.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// RAII guard returned by [`Mutex::lock_guard`].
#[must_use]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        // Held by construction; NotOwner is unreachable here.
        let _ = self.mutex.unlock();
    }
}

/// GC-aware condition variable.
///
/// Waits release and re-acquire an associated [`Mutex`]. Using one
/// condvar with two different mutexes at the same time is a caller bug
/// and panics in the underlying std primitive.
pub struct Condvar {
    id: u64,
    name: Option<String>,
    inner: StdCondvar,
    waiters: AtomicUsize,
    signal_count: AtomicU64,
    broadcast_count: AtomicU64,
}

impl Condvar {
    /// Create a condition variable.
    pub fn new(name: Option<&str>) -> Self {
        Self {
            id: next_sync_id(),
            name: name.map(str::to_string),
            inner: StdCondvar::new(),
            waiters: AtomicUsize::new(0),
            signal_count: AtomicU64::new(0),
            broadcast_count: AtomicU64::new(0),
        }
    }

    /// Unique id of this primitive.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Diagnostic name, if one was given at creation.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Number of threads currently waiting.
    pub fn waiter_count(&self) -> usize {
        self.waiters.load(Ordering::Relaxed)
    }

    /// Release `mutex`, wait for a wakeup, re-acquire `mutex`.
    ///
    /// `NotOwner` if the calling thread does not hold `mutex`. Subject
    /// to spurious wakeups; callers loop on their predicate.
    pub fn wait(&self, mutex: &Mutex) -> Result<(), RuntimeError> {
        self.wait_inner(mutex, None).map(|_| ())
    }

    /// Like [`wait`](Self::wait) with an upper bound.
    ///
    /// On `TimedOut` the mutex has still been re-acquired and the
    /// thread restored to `Active`; a timeout is a result, not an
    /// error.
    pub fn wait_timeout(
        &self,
        mutex: &Mutex,
        timeout: Duration,
    ) -> Result<WaitResult, RuntimeError> {
        self.wait_inner(mutex, Some(timeout))
    }

    fn wait_inner(
        &self,
        mutex: &Mutex,
        timeout: Option<Duration>,
    ) -> Result<WaitResult, RuntimeError> {
        let me = platform::current_os_id();
        let mut state = recover(mutex.state.lock());
        if !state.locked || state.owner != Some(me) {
            return Err(RuntimeError::NotOwner);
        }

        // Logically release the monitor before parking.
        state.locked = false;
        state.owner = None;
        mutex.available.notify_one();

        self.waiters.fetch_add(1, Ordering::Relaxed);
        let result = {
            let _blocked = mutex.registry.enter_blocking();
            let result = match timeout {
                Some(timeout) => {
                    let (guard, timed_out) = recover(self.inner.wait_timeout(state, timeout));
                    state = guard;
                    if timed_out.timed_out() {
                        WaitResult::TimedOut
                    } else {
                        WaitResult::Signaled
                    }
                }
                None => {
                    state = recover(self.inner.wait(state));
                    WaitResult::Signaled
                }
            };
            // Re-acquire the monitor on every exit path, timeout
            // included.
            while state.locked {
                state = recover(mutex.available.wait(state));
            }
            result
        };
        self.waiters.fetch_sub(1, Ordering::Relaxed);

        state.locked = true;
        state.owner = Some(me);
        mutex.lock_count.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    /// Wake one waiter.
    pub fn signal(&self) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
        self.inner.notify_one();
    }

    /// Wake all waiters.
    pub fn broadcast(&self) {
        self.broadcast_count.fetch_add(1, Ordering::Relaxed);
        self.inner.notify_all();
    }

    /// Total signals issued.
    pub fn signal_count(&self) -> u64 {
        self.signal_count.load(Ordering::Relaxed)
    }

    /// Total broadcasts issued.
    pub fn broadcast_count(&self) -> u64 {
        self.broadcast_count.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Condvar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condvar")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("waiters", &self.waiter_count())
            .finish()
    }
}

/// Logical rwlock state.
#[derive(Debug)]
struct RwState {
    readers: usize,
    writer: Option<ThreadId>,
    /// Writers parked or about to park; readers yield to them.
    waiting_writers: usize,
}

/// GC-aware reader-writer lock with writer preference.
///
/// New readers hold back while a writer is waiting, so a steady reader
/// stream cannot starve writers.
pub struct RwLock {
    id: u64,
    name: Option<String>,
    registry: Arc<ThreadRegistry>,
    state: StdMutex<RwState>,
    readers_cv: StdCondvar,
    writers_cv: StdCondvar,
    read_lock_count: AtomicU64,
    write_lock_count: AtomicU64,
}

impl RwLock {
    /// Create a reader-writer lock bound to `registry`.
    pub fn new(registry: Arc<ThreadRegistry>, name: Option<&str>) -> Self {
        Self {
            id: next_sync_id(),
            name: name.map(str::to_string),
            registry,
            state: StdMutex::new(RwState {
                readers: 0,
                writer: None,
                waiting_writers: 0,
            }),
            readers_cv: StdCondvar::new(),
            writers_cv: StdCondvar::new(),
            read_lock_count: AtomicU64::new(0),
            write_lock_count: AtomicU64::new(0),
        }
    }

    /// Unique id of this primitive.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Diagnostic name, if one was given at creation.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Acquire a shared read lock.
    pub fn read_lock(&self) {
        let mut state = recover(self.state.lock());
        if state.writer.is_some() || state.waiting_writers > 0 {
            RuntimeStats::incr(&self.registry.stats().rwlock_contentions);
            let _blocked = self.registry.enter_blocking();
            while state.writer.is_some() || state.waiting_writers > 0 {
                state = recover(self.readers_cv.wait(state));
            }
        }
        state.readers += 1;
        self.read_lock_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Acquire a read lock without blocking.
    pub fn try_read_lock(&self) -> bool {
        let mut state = recover(self.state.lock());
        if state.writer.is_some() || state.waiting_writers > 0 {
            return false;
        }
        state.readers += 1;
        self.read_lock_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Release a read lock.
    ///
    /// `NotOwner` if no read lock is held at all. Reader identity is
    /// not tracked per thread; releasing a read lock you did not take
    /// while other readers exist cannot be detected here.
    pub fn read_unlock(&self) -> Result<(), RuntimeError> {
        let mut state = recover(self.state.lock());
        if state.readers == 0 || state.writer.is_some() {
            return Err(RuntimeError::NotOwner);
        }
        state.readers -= 1;
        let wake_writer = state.readers == 0 && state.waiting_writers > 0;
        drop(state);
        if wake_writer {
            self.writers_cv.notify_one();
        }
        Ok(())
    }

    /// Acquire the exclusive write lock.
    pub fn write_lock(&self) {
        let mut state = recover(self.state.lock());
        if state.writer.is_some() || state.readers > 0 {
            RuntimeStats::incr(&self.registry.stats().rwlock_contentions);
            // The counter moves only once blocking entry is granted; a
            // fatal registration check cannot leave writer preference
            // switched on.
            let _blocked = self.registry.enter_blocking();
            state.waiting_writers += 1;
            while state.writer.is_some() || state.readers > 0 {
                state = recover(self.writers_cv.wait(state));
            }
            state.waiting_writers -= 1;
        }
        state.writer = Some(platform::current_os_id());
        self.write_lock_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Acquire the write lock without blocking.
    pub fn try_write_lock(&self) -> bool {
        let mut state = recover(self.state.lock());
        if state.writer.is_some() || state.readers > 0 {
            return false;
        }
        state.writer = Some(platform::current_os_id());
        self.write_lock_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Release the write lock.
    ///
    /// `NotOwner` if the calling thread is not the writer.
    pub fn write_unlock(&self) -> Result<(), RuntimeError> {
        let mut state = recover(self.state.lock());
        if state.writer != Some(platform::current_os_id()) {
            return Err(RuntimeError::NotOwner);
        }
        state.writer = None;
        let wake_writer = state.waiting_writers > 0;
        drop(state);
        if wake_writer {
            self.writers_cv.notify_one();
        } else {
            self.readers_cv.notify_all();
        }
        Ok(())
    }

    /// Current number of read holders.
    pub fn reader_count(&self) -> usize {
        recover(self.state.lock()).readers
    }

    /// Whether a writer currently holds the lock.
    pub fn is_write_locked(&self) -> bool {
        recover(self.state.lock()).writer.is_some()
    }

    /// Total successful read acquisitions.
    pub fn read_lock_count(&self) -> u64 {
        self.read_lock_count.load(Ordering::Relaxed)
    }

    /// Total successful write acquisitions.
    pub fn write_lock_count(&self) -> u64 {
        self.write_lock_count.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RwLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = recover(self.state.lock());
        f.debug_struct("RwLock")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("readers", &state.readers)
            .field("writer", &state.writer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ThreadState;
    use std::sync::mpsc;
    use std::thread;

    fn new_registry() -> Arc<ThreadRegistry> {
        Arc::new(ThreadRegistry::new(Arc::new(RuntimeStats::new())))
    }

    #[test]
    fn test_mutex_lock_unlock() {
        let registry = new_registry();
        let mutex = Mutex::new(registry, Some("test"));

        assert!(!mutex.is_locked());
        mutex.lock();
        assert!(mutex.is_locked());
        mutex.unlock().unwrap();
        assert!(!mutex.is_locked());
        assert_eq!(mutex.lock_count(), 1);
        assert_eq!(mutex.name(), Some("test"));
    }

    #[test]
    fn test_mutex_unlock_not_owner() {
        let registry = new_registry();
        let mutex = Arc::new(Mutex::new(registry, None));

        // Unlocked: nobody owns it.
        assert_eq!(mutex.unlock().unwrap_err(), RuntimeError::NotOwner);

        mutex.lock();
        let mutex2 = Arc::clone(&mutex);
        let err = thread::spawn(move || mutex2.unlock().unwrap_err())
            .join()
            .unwrap();
        assert_eq!(err, RuntimeError::NotOwner);
        assert!(mutex.is_locked());
        mutex.unlock().unwrap();
    }

    #[test]
    fn test_mutex_try_lock() {
        let registry = new_registry();
        let mutex = Mutex::new(registry, None);

        assert!(mutex.try_lock());
        assert!(!mutex.try_lock());
        mutex.unlock().unwrap();
        assert!(mutex.try_lock());
        mutex.unlock().unwrap();
    }

    #[test]
    fn test_mutex_guard() {
        let registry = new_registry();
        let mutex = Mutex::new(registry, None);
        {
            let _guard = mutex.lock_guard();
            assert!(mutex.is_locked());
        }
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_contended_lock_marks_thread_blocked() {
        let registry = new_registry();
        let mutex = Arc::new(Mutex::new(Arc::clone(&registry), None));
        mutex.lock();

        let (handle_tx, handle_rx) = mpsc::channel();
        let registry2 = Arc::clone(&registry);
        let mutex2 = Arc::clone(&mutex);
        let waiter = thread::spawn(move || {
            let handle = registry2.register();
            handle_tx.send(handle).unwrap();
            mutex2.lock(); // blocks until main unlocks
            mutex2.unlock().unwrap();
            assert_eq!(
                registry2.state_of(handle).unwrap(),
                ThreadState::Active
            );
            registry2.unregister(handle).unwrap();
        });

        let handle = handle_rx.recv().unwrap();
        // Wait for the contender to park.
        let mut blocked = false;
        for _ in 0..500 {
            if registry.state_of(handle).unwrap() == ThreadState::BlockedWithRoots {
                blocked = true;
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert!(blocked, "contender never reached BlockedWithRoots");
        assert!(registry.stats().snapshot().mutex_contentions >= 1);

        mutex.unlock().unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_blocking_while_unregistered_is_fatal() {
        let registry = new_registry();
        let mutex = Arc::new(Mutex::new(registry, None));
        mutex.lock();

        let mutex2 = Arc::clone(&mutex);
        let result = thread::spawn(move || {
            // Contended lock from an unregistered thread must panic.
            let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                mutex2.lock();
            }));
            caught.is_err()
        })
        .join()
        .unwrap();
        assert!(result);
        mutex.unlock().unwrap();
    }

    #[test]
    fn test_condvar_wait_requires_ownership() {
        let registry = new_registry();
        let mutex = Mutex::new(registry, None);
        let cond = Condvar::new(None);
        assert_eq!(cond.wait(&mutex).unwrap_err(), RuntimeError::NotOwner);
    }

    #[test]
    fn test_condvar_signal_wakes_waiter() {
        let registry = new_registry();
        let mutex = Arc::new(Mutex::new(Arc::clone(&registry), None));
        let cond = Arc::new(Condvar::new(Some("test-cv")));
        let flag = Arc::new(StdMutex::new(false));

        let registry2 = Arc::clone(&registry);
        let mutex2 = Arc::clone(&mutex);
        let cond2 = Arc::clone(&cond);
        let flag2 = Arc::clone(&flag);
        let waiter = thread::spawn(move || {
            let handle = registry2.register();
            mutex2.lock();
            while !*recover(flag2.lock()) {
                cond2.wait(&mutex2).unwrap();
            }
            mutex2.unlock().unwrap();
            registry2.unregister(handle).unwrap();
        });

        // Wait until the waiter has parked, then flip and signal.
        let mut parked = false;
        for _ in 0..500 {
            if cond.waiter_count() == 1 {
                parked = true;
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert!(parked, "waiter never parked");

        *recover(flag.lock()) = true;
        cond.signal();
        waiter.join().unwrap();
        assert_eq!(cond.signal_count(), 1);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_condvar_wait_timeout() {
        let registry = new_registry();
        let handle = registry.register();
        let mutex = Mutex::new(Arc::clone(&registry), None);
        let cond = Condvar::new(None);

        mutex.lock();
        let result = cond
            .wait_timeout(&mutex, Duration::from_millis(20))
            .unwrap();
        assert_eq!(result, WaitResult::TimedOut);
        // Mutex re-acquired and thread restored on the timeout path.
        assert!(mutex.is_locked());
        assert_eq!(registry.state_of(handle).unwrap(), ThreadState::Active);
        mutex.unlock().unwrap();

        registry.unregister(handle).unwrap();
    }

    #[test]
    fn test_rwlock_shared_readers() {
        let registry = new_registry();
        let rwlock = RwLock::new(registry, None);

        rwlock.read_lock();
        rwlock.read_lock();
        assert_eq!(rwlock.reader_count(), 2);
        assert!(!rwlock.try_write_lock());
        rwlock.read_unlock().unwrap();
        rwlock.read_unlock().unwrap();
        assert_eq!(rwlock.read_unlock().unwrap_err(), RuntimeError::NotOwner);
    }

    #[test]
    fn test_rwlock_writer_excludes() {
        let registry = new_registry();
        let rwlock = RwLock::new(registry, None);

        rwlock.write_lock();
        assert!(rwlock.is_write_locked());
        assert!(!rwlock.try_read_lock());
        assert!(!rwlock.try_write_lock());
        rwlock.write_unlock().unwrap();
        assert!(!rwlock.is_write_locked());
    }

    #[test]
    fn test_rwlock_write_unlock_not_owner() {
        let registry = new_registry();
        let rwlock = Arc::new(RwLock::new(registry, None));
        assert_eq!(rwlock.write_unlock().unwrap_err(), RuntimeError::NotOwner);

        rwlock.write_lock();
        let rwlock2 = Arc::clone(&rwlock);
        let err = thread::spawn(move || rwlock2.write_unlock().unwrap_err())
            .join()
            .unwrap();
        assert_eq!(err, RuntimeError::NotOwner);
        rwlock.write_unlock().unwrap();
    }

    #[test]
    fn test_fatal_write_lock_leaves_no_writer_preference() {
        let registry = new_registry();
        let rwlock = Arc::new(RwLock::new(registry, None));
        rwlock.read_lock();

        // Contended write lock from an unregistered thread is fatal...
        let rwlock2 = Arc::clone(&rwlock);
        let panicked = thread::spawn(move || {
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                rwlock2.write_lock();
            }))
            .is_err()
        })
        .join()
        .unwrap();
        assert!(panicked);

        // ...and must not leave `waiting_writers` elevated, which would
        // turn away every future reader.
        assert!(rwlock.try_read_lock());
        rwlock.read_unlock().unwrap();
        rwlock.read_unlock().unwrap();
    }

    #[test]
    fn test_rwlock_waiting_writer_blocks_new_readers() {
        let registry = new_registry();
        let rwlock = Arc::new(RwLock::new(Arc::clone(&registry), None));
        rwlock.read_lock();

        let registry2 = Arc::clone(&registry);
        let rwlock2 = Arc::clone(&rwlock);
        let writer = thread::spawn(move || {
            let handle = registry2.register();
            rwlock2.write_lock();
            rwlock2.write_unlock().unwrap();
            registry2.unregister(handle).unwrap();
        });

        // Once the writer is parked, a new reader must not slip in.
        let mut writer_waiting = false;
        for _ in 0..500 {
            if !rwlock.try_read_lock() {
                writer_waiting = true;
                break;
            }
            rwlock.read_unlock().unwrap();
            thread::sleep(Duration::from_millis(2));
        }
        assert!(writer_waiting, "writer never registered as waiting");

        rwlock.read_unlock().unwrap();
        writer.join().unwrap();
    }
}
