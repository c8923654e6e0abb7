// crates/pw-orchestrator/src/pool/semaphore.rs
// ============================================================================
// Module: Counting Semaphore
// Description: A blocking counting semaphore over `Mutex<usize>` +
// `Condvar`, the concurrency primitive `PooledExecutor` acquires inside
// each worker thread (§4.10).
// Purpose: `std` has no semaphore type, and pulling in an async runtime
// purely to bound a synchronous, thread-based pool would contradict the
// engine's own synchronous style; this is the minimal primitive the
// pooled executor needs, with none of a crate's extra surface.
// Dependencies: none
// ============================================================================

//! ## Overview
//! [`Semaphore::acquire`]/[`Semaphore::release`] are the only operations.
//! `PooledExecutor` acquires a permit *inside* each worker, never in the
//! dispatcher, and releases it before sleeping out a throttle backoff —
//! the deadlock-avoidance discipline documented on [`crate::pool::executor`].

use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;

/// A blocking counting semaphore.
pub struct Semaphore {
    /// Permits currently available.
    permits: Mutex<usize>,
    /// Signaled whenever a permit is released.
    released: Condvar,
}

impl Semaphore {
    /// Builds a semaphore with `permits` initially available.
    #[must_use]
    pub const fn new(permits: usize) -> Self {
        Self { permits: Mutex::new(permits), released: Condvar::new() }
    }

    /// Blocks until a permit is available, then takes it.
    pub fn acquire(&self) {
        let mut guard = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        while *guard == 0 {
            guard = self.released.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
        *guard -= 1;
    }

    /// Returns a permit, waking one waiter blocked in [`Semaphore::acquire`].
    pub fn release(&self) {
        let mut guard = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += 1;
        self.released.notify_one();
    }

    /// Permits currently available without blocking.
    #[must_use]
    pub fn available(&self) -> usize {
        *self.permits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    //! Test-only lint relaxations for panic-based assertions and debug output.
    #![allow(
        clippy::panic,
        clippy::print_stdout,
        clippy::print_stderr,
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::use_debug,
        clippy::dbg_macro,
        clippy::panic_in_result_fn,
        clippy::unwrap_in_result,
        reason = "Test-only output and panic-based assertions are permitted."
    )]

    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::Semaphore;

    #[test]
    fn acquire_and_release_round_trip_leaves_permits_unchanged() {
        let sem = Semaphore::new(2);
        assert_eq!(sem.available(), 2);
        sem.acquire();
        assert_eq!(sem.available(), 1);
        sem.release();
        assert_eq!(sem.available(), 2);
    }

    #[test]
    fn acquire_blocks_until_a_permit_is_released() {
        let sem = Arc::new(Semaphore::new(1));
        sem.acquire();

        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || {
                sem.acquire();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(sem.available(), 0);
        sem.release();
        waiter.join().expect("waiter joins");
    }
}
