//! Runtime Error Taxonomy
//!
//! Three failure classes, kept strictly apart:
//!
//! - **Contract violations** (double registration, cross-thread root
//!   mutation, blocking while unregistered) are programming errors in
//!   the embedding program. They are fatal: [`contract_violation`]
//!   logs and panics rather than letting the process limp along with a
//!   corrupt registry. When the panic crosses the C ABI the process
//!   aborts.
//! - **Recoverable conditions** (stale handles, exhausted queues,
//!   shutdown races) are ordinary [`RuntimeError`] values.
//! - **Timeouts** are not errors at all. Timed operations return
//!   distinguished values (`WaitResult::TimedOut`, `Ok(None)`).

use thiserror::Error;

use crate::registry::ThreadState;

/// Recoverable runtime errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The calling thread is not registered with the runtime.
    #[error("calling thread is not registered with the runtime")]
    InvalidThread,

    /// A root handle is stale or was never issued for this thread.
    #[error("gc root handle is stale or unknown")]
    RootNotFound,

    /// A thread handle does not name a currently registered thread.
    #[error("thread handle is stale or unknown")]
    InvalidHandle,

    /// A thread state transition outside the allowed protocol.
    #[error("invalid thread state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// State the thread was in.
        from: ThreadState,
        /// State the caller asked for.
        to: ThreadState,
    },

    /// The calling thread does not hold the primitive it tried to release.
    #[error("calling thread does not own this primitive")]
    NotOwner,

    /// The task result was already delivered (joined or sent to a callback).
    #[error("task result was already consumed")]
    AlreadyConsumed,

    /// The callback queue is at capacity.
    #[error("callback queue is full")]
    QueueFull,

    /// The callback queue has been closed.
    #[error("callback queue has been shut down")]
    QueueShutdown,

    /// The runtime is shutting down and no longer accepts work.
    #[error("runtime is shutting down")]
    ShuttingDown,
}

/// Report a contract violation and panic.
///
/// Used for caller bugs that would corrupt runtime state if tolerated.
pub(crate) fn contract_violation(msg: &str) -> ! {
    crate::log::error(format!("contract violation: {}", msg));
    panic!("contract violation: {}", msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            RuntimeError::InvalidThread.to_string(),
            "calling thread is not registered with the runtime"
        );
        let e = RuntimeError::InvalidTransition {
            from: ThreadState::Active,
            to: ThreadState::Exiting,
        };
        assert!(e.to_string().contains("Active"));
        assert!(e.to_string().contains("Exiting"));
    }

    #[test]
    #[should_panic(expected = "contract violation: boom")]
    fn test_contract_violation_panics() {
        contract_violation("boom");
    }
}
