//! Cooperative Cancellation
//!
//! Cancellation tokens for tasks. Cancellation is cooperative: a
//! running task keeps running until it checks its token (typically at
//! loop heads or before expensive steps) and unwinds on its own.
//! Nothing in the runtime ever kills a thread.
//!
//! # Components
//!
//! - `CancellationToken`: a read-only, cheaply clonable flag
//! - `CancellationSource`: the side that can trigger cancellation
//!
//! # Example
//!
//! ```rust,ignore
//! let source = CancellationSource::new();
//! let token = source.token();
//!
//! std::thread::spawn(move || {
//!     while !token.is_cancelled() {
//!         // Do work...
//!     }
//! });
//!
//! source.cancel_with_reason(Some("deadline exceeded".into()));
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::platform;

/// Shared state behind a source and its tokens.
#[derive(Debug)]
struct CancellationState {
    /// Whether cancellation has been requested.
    cancelled: AtomicBool,
    /// Cancellation reason (optional message).
    reason: Mutex<Option<String>>,
    /// Timestamp when cancellation was requested (process-relative ms).
    cancelled_at_ms: Mutex<Option<u64>>,
}

/// A cancellation token that can be checked for cancellation.
///
/// Tokens are created by [`CancellationSource`] and can be cloned
/// cheaply; all clones observe the same flag.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    state: Arc<CancellationState>,
}

impl CancellationToken {
    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Get the cancellation reason, if one was supplied.
    pub fn reason(&self) -> Option<String> {
        self.state.reason.lock().clone()
    }

    /// Get when cancellation was requested (process-relative ms).
    pub fn cancelled_at_ms(&self) -> Option<u64> {
        *self.state.cancelled_at_ms.lock()
    }

    /// Check cancellation and return an error if cancelled.
    ///
    /// Convenience for `token.check()?` inside task bodies.
    pub fn check(&self) -> Result<(), CancellationError> {
        if self.is_cancelled() {
            Err(CancellationError {
                reason: self.reason(),
            })
        } else {
            Ok(())
        }
    }
}

/// A cancellation source that creates and controls tokens.
///
/// The source owns the ability to trigger cancellation; tokens derived
/// from it can only observe.
#[derive(Debug)]
pub struct CancellationSource {
    token: CancellationToken,
}

impl CancellationSource {
    /// Create a new cancellation source.
    pub fn new() -> Self {
        Self {
            token: CancellationToken {
                state: Arc::new(CancellationState {
                    cancelled: AtomicBool::new(false),
                    reason: Mutex::new(None),
                    cancelled_at_ms: Mutex::new(None),
                }),
            },
        }
    }

    /// Get a token from this source.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel all tokens from this source.
    pub fn cancel(&self) {
        self.cancel_with_reason(None);
    }

    /// Cancel all tokens with a reason.
    ///
    /// The first call wins; later calls keep the original reason.
    pub fn cancel_with_reason(&self, reason: Option<String>) {
        if self
            .token
            .state
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.token.state.reason.lock() = reason;
            *self.token.state.cancelled_at_ms.lock() = Some(platform::timestamp_ms());
        }
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Error returned when an operation is cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationError {
    /// The cancellation reason, if provided.
    pub reason: Option<String>,
}

impl std::fmt::Display for CancellationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "operation cancelled: {}", reason),
            None => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for CancellationError {}
