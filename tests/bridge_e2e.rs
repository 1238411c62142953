//! End-to-end scenarios for the GC bridge: registration, blocking
//! protocol, task lifecycle, and delivery guarantees, exercised through
//! the public `Runtime` API the way an embedding compiler runtime
//! would.

use std::collections::hash_map::RandomState;
use std::collections::HashSet;
use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use asthra_runtime::{
    Runtime, RuntimeConfig, RuntimeError, TaskFailure, TaskOutcome, TaskValue, ThreadState,
};

fn runtime(workers: usize) -> Runtime {
    Runtime::with_config(
        RuntimeConfig::builder()
            .num_workers(workers)
            .max_callbacks(256)
            .build()
            .unwrap(),
    )
    .unwrap()
}

/// Poll until `predicate` holds or a generous deadline passes.
fn wait_for(mut predicate: impl FnMut() -> bool) -> bool {
    for _ in 0..1000 {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

/// Two registered threads contend on a GC-aware mutex; the blocked one
/// is observable as `BlockedWithRoots` with its roots still scannable,
/// and both end `Active`.
#[test]
fn blocked_thread_remains_scannable() {
    let runtime = Arc::new(runtime(1));
    let registry = Arc::clone(runtime.registry());
    let mutex = Arc::new(runtime.new_mutex(Some("shared-state")));

    let main = registry.register();
    let root = registry.root_register(0x1000, 64).unwrap();
    mutex.lock();

    let (handle_tx, handle_rx) = mpsc::channel();
    let registry2 = Arc::clone(&registry);
    let mutex2 = Arc::clone(&mutex);
    let contender = thread::spawn(move || {
        let me = registry2.register();
        registry2.root_register(0x2000, 32).unwrap();
        handle_tx.send(me).unwrap();
        mutex2.lock(); // parks until main unlocks
        mutex2.unlock().unwrap();
        assert_eq!(registry2.state_of(me).unwrap(), ThreadState::Active);
        registry2.unregister(me).unwrap();
    });

    let other = handle_rx.recv().unwrap();
    assert!(wait_for(|| {
        registry.state_of(other).unwrap() == ThreadState::BlockedWithRoots
    }));

    // The blocked thread's roots are still visible to a scan.
    let ranges = registry.root_snapshot(other).unwrap();
    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].addr, 0x2000);

    mutex.unlock().unwrap();
    contender.join().unwrap();

    assert_eq!(registry.state_of(main).unwrap(), ThreadState::Active);
    registry.root_unregister(root).unwrap();
    registry.unregister(main).unwrap();
}

/// A hundred tasks spawn, run, and join; every result arrives exactly
/// once and the counters agree.
#[test]
fn hundred_tasks_join_exactly_once() {
    let runtime = runtime(4);
    runtime.start();
    let main = runtime.registry().register();

    let handles: Vec<_> = (0..100u32)
        .map(|i| {
            runtime
                .spawn(move |_ctx| {
                    // Sleep a random few milliseconds so completions
                    // interleave well out of spawn order.
                    let jitter = RandomState::new().build_hasher().finish() % 8;
                    thread::sleep(Duration::from_millis(jitter));
                    Ok(Box::new(i) as TaskValue)
                })
                .unwrap()
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in &handles {
        let value = handle.join().unwrap().into_value().unwrap();
        assert!(seen.insert(*value.downcast::<u32>().unwrap()));
    }
    assert_eq!(seen, (0..100).collect::<HashSet<_>>());

    // Each outcome was consumed; a second join cannot re-deliver.
    for handle in &handles {
        assert_eq!(handle.join().unwrap_err(), RuntimeError::AlreadyConsumed);
    }

    runtime.registry().unregister(main).unwrap();
    runtime.shutdown();
    let stats = runtime.stats();
    assert_eq!(stats.tasks_spawned, 100);
    assert_eq!(stats.tasks_completed, 100);
    assert_eq!(stats.tasks_failed, 0);
}

/// Callback-mode outcomes reach a dedicated registered consumer in
/// completion order, and join is refused for those tasks.
#[test]
fn callback_queue_delivers_in_completion_order() {
    let runtime = Arc::new(runtime(2));
    runtime.start();

    let spawned: Vec<_> = (0..20u32)
        .map(|i| {
            runtime
                .spawn_with_callback(move |_ctx| Ok(Box::new(i) as TaskValue))
                .unwrap()
        })
        .collect();
    for handle in &spawned {
        assert_eq!(handle.join().unwrap_err(), RuntimeError::AlreadyConsumed);
    }

    let runtime2 = Arc::clone(&runtime);
    let consumer = thread::spawn(move || {
        let registry = runtime2.registry();
        let me = registry.register();
        let mut events = Vec::new();
        while events.len() < 20 {
            let event = runtime2
                .callbacks()
                .pop_timeout(Duration::from_secs(10))
                .unwrap()
                .expect("completion within deadline");
            events.push(event);
        }
        registry.unregister(me).unwrap();
        events
    });

    let events = consumer.join().unwrap();
    assert_eq!(events.len(), 20);
    // Completion order: task ids strictly increase only per-queue
    // guarantee is FIFO of completion, so just verify the set and that
    // every outcome completed.
    let ids: HashSet<_> = events.iter().map(|e| e.task).collect();
    let expected: HashSet<_> = spawned.iter().map(|h| h.id()).collect();
    assert_eq!(ids, expected);
    assert!(events.iter().all(|e| e.outcome.is_completed()));

    runtime.shutdown();
    let stats = runtime.stats();
    assert_eq!(stats.callbacks_enqueued, 20);
    assert_eq!(stats.callbacks_processed, 20);
}

/// Completion order, not spawn order, decides queue position: a slow
/// task spawned first is delivered after a fast task spawned second.
#[test]
fn callback_order_follows_completion_not_spawn() {
    let runtime = runtime(2);
    runtime.start();
    let main = runtime.registry().register();

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let slow = runtime
        .spawn_with_callback(move |_ctx| {
            release_rx
                .recv()
                .map_err(|err| TaskFailure::new(err.to_string()))?;
            Ok(Box::new("slow") as TaskValue)
        })
        .unwrap();
    let fast = runtime
        .spawn_with_callback(|_ctx| Ok(Box::new("fast") as TaskValue))
        .unwrap();

    let first = runtime
        .callbacks()
        .pop_timeout(Duration::from_secs(10))
        .unwrap()
        .expect("fast completion");
    assert_eq!(first.task, fast.id());

    release_tx.send(()).unwrap();
    let second = runtime
        .callbacks()
        .pop_timeout(Duration::from_secs(10))
        .unwrap()
        .expect("slow completion");
    assert_eq!(second.task, slow.id());

    runtime.registry().unregister(main).unwrap();
    runtime.shutdown();
}

/// Cancelling tasks that are still queued delivers `Cancelled` exactly
/// once, whether the canceller or a worker wins the dequeue race.
#[test]
fn cancel_before_dequeue_delivers_cancelled_once() {
    // No workers started: every task stays Pending until cancelled.
    let runtime = runtime(1);
    let main = runtime.registry().register();

    let handles: Vec<_> = (0..10)
        .map(|_| {
            runtime
                .spawn(|_ctx| Ok(Box::new(()) as TaskValue))
                .unwrap()
        })
        .collect();

    for handle in &handles {
        handle.cancel_with_reason("shutting down early");
    }
    for handle in &handles {
        match handle.join().unwrap() {
            TaskOutcome::Cancelled(reason) => {
                assert_eq!(reason.as_deref(), Some("shutting down early"));
            }
            other => panic!("expected cancelled, got {:?}", other),
        }
        assert_eq!(handle.join().unwrap_err(), RuntimeError::AlreadyConsumed);
    }

    runtime.registry().unregister(main).unwrap();
    runtime.shutdown();
    assert_eq!(runtime.stats().tasks_cancelled, 10);
}

/// Shutting down with tasks still queued delivers `Cancelled` to each
/// of them; joiners and callback consumers are never stranded.
#[test]
fn shutdown_delivers_outcome_to_queued_tasks() {
    // Workers never started: both tasks stay queued.
    let runtime = runtime(1);
    let joined = runtime
        .spawn(|_ctx| Ok(Box::new(()) as TaskValue))
        .unwrap();
    let called_back = runtime
        .spawn_with_callback(|_ctx| Ok(Box::new(()) as TaskValue))
        .unwrap();

    runtime.shutdown();

    let outcome = joined
        .join_timeout(Duration::from_millis(500))
        .unwrap()
        .expect("terminal outcome after shutdown");
    assert!(outcome.is_cancelled());

    // The cancellation event reached the queue before it closed.
    let event = runtime.callbacks().try_pop().expect("cancellation event");
    assert_eq!(event.task, called_back.id());
    assert!(event.outcome.is_cancelled());

    assert_eq!(runtime.stats().tasks_cancelled, 2);
}

/// A running task observes its token and winds down as `Cancelled`,
/// not `Failed`.
#[test]
fn running_task_cancels_cooperatively() {
    let runtime = runtime(1);
    runtime.start();
    let main = runtime.registry().register();

    let started = Arc::new(AtomicUsize::new(0));
    let started2 = Arc::clone(&started);
    let handle = runtime
        .spawn(move |ctx| {
            started2.store(1, Ordering::SeqCst);
            loop {
                ctx.check()
                    .map_err(|err| TaskFailure::new(err.to_string()))?;
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

    assert!(wait_for(|| started.load(Ordering::SeqCst) == 1));
    handle.cancel_with_reason("deadline");

    match handle.join().unwrap() {
        TaskOutcome::Cancelled(reason) => assert_eq!(reason.as_deref(), Some("deadline")),
        other => panic!("expected cancelled, got {:?}", other),
    }

    runtime.registry().unregister(main).unwrap();
    runtime.shutdown();
}

/// A panicking task body is contained: the task fails, the worker
/// lives, later tasks still run.
#[test]
fn panicking_task_does_not_kill_worker() {
    let runtime = runtime(1);
    runtime.start();
    let main = runtime.registry().register();

    let bad = runtime
        .spawn(|_ctx| -> Result<TaskValue, TaskFailure> { panic!("user code bug") })
        .unwrap();
    match bad.join().unwrap() {
        TaskOutcome::Failed(failure) => assert!(failure.panicked),
        other => panic!("expected failure, got {:?}", other),
    }

    let good = runtime
        .spawn(|_ctx| Ok(Box::new(true) as TaskValue))
        .unwrap();
    assert!(good.join().unwrap().is_completed());

    runtime.registry().unregister(main).unwrap();
    runtime.shutdown();
    let stats = runtime.stats();
    assert_eq!(stats.tasks_failed, 1);
    assert_eq!(stats.tasks_completed, 1);
}

/// Double registration is fatal, and the failure is loud rather than a
/// silently corrupted registry.
#[test]
fn double_register_is_fatal() {
    let runtime = runtime(1);
    let registry = runtime.registry();

    let handle = registry.register();
    let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        registry.register();
    }));
    assert!(caught.is_err());

    // The original registration is untouched.
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.state_of(handle).unwrap(), ThreadState::Active);
    registry.unregister(handle).unwrap();
}

/// Timed waits that expire are distinguished results with all state
/// restored, not errors.
#[test]
fn timeouts_restore_state() {
    let runtime = runtime(1);
    let registry = runtime.registry();
    let main = registry.register();

    let mutex = runtime.new_mutex(None);
    let cond = runtime.new_condvar(None);

    mutex.lock();
    let result = cond
        .wait_timeout(&mutex, Duration::from_millis(20))
        .unwrap();
    assert_eq!(result, asthra_runtime::WaitResult::TimedOut);
    assert!(mutex.is_locked());
    assert_eq!(registry.state_of(main).unwrap(), ThreadState::Active);
    mutex.unlock().unwrap();

    let handle = runtime
        .spawn(|_ctx| Ok(Box::new(()) as TaskValue))
        .unwrap();
    // Workers never started: the join must time out, then still work.
    assert!(handle
        .join_timeout(Duration::from_millis(20))
        .unwrap()
        .is_none());
    runtime.start();
    assert!(handle
        .join_timeout(Duration::from_secs(10))
        .unwrap()
        .unwrap()
        .is_completed());

    registry.unregister(main).unwrap();
    runtime.shutdown();
}
