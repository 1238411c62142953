//! Platform Helpers
//!
//! Small shims over std for the platform facts the runtime needs:
//! monotonic time, deadlines, CPU count, and OS thread identity.

use std::sync::OnceLock;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// Milliseconds since the first call into this module.
///
/// Monotonic and process-relative, suitable for log timestamps and
/// durations, not for wall-clock time.
pub fn timestamp_ms() -> u64 {
    let start = *PROCESS_START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/// Absolute deadline `timeout` from now, saturating on overflow.
pub fn deadline_after(timeout: Duration) -> Instant {
    Instant::now()
        .checked_add(timeout)
        .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400 * 365))
}

/// Number of CPUs available to this process, at least 1.
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1)
}

/// The calling OS thread's identity.
pub fn current_os_id() -> ThreadId {
    std::thread::current().id()
}
