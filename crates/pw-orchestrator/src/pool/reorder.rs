// crates/pw-orchestrator/src/pool/reorder.rs
// ============================================================================
// Module: Reorder Buffer
// Description: A ticket-based FIFO reorder buffer: work may complete out of
// order, but callers only ever release results in submission order (§4.9,
// §5's "1 mutex + 1 CV for backpressure + 1 for release signaling" locking
// discipline).
// Purpose: `PooledExecutor` dispatches rows to worker threads that race
// each other to finish; the pipeline downstream of a pooled aggregation
// still needs rows to reappear in the order they were submitted.
// Dependencies: none
// Grounding: examples/original_source/tests/plugins/batching/
// test_row_reorder_buffer.py's implied API (submit/complete/
// wait_for_next_release/evict/shutdown/pending_count/get_metrics).
// ============================================================================

//! ## Overview
//! [`ReorderBuffer::submit`] reserves the next sequence number and blocks if
//! `max_pending` entries are already outstanding (backpressure, signaled by
//! the `submit_ready` condvar once a release frees a slot).
//! [`ReorderBuffer::complete`] attaches a result to a reserved ticket, in
//! any order. [`ReorderBuffer::wait_for_next_release`] blocks until the
//! entry at the current release cursor has a result, then returns it,
//! advancing the cursor — this is what gives callers strict FIFO output
//! despite out-of-order completion. [`ReorderBuffer::evict`] lets a caller
//! abandon a reserved-but-never-to-be-completed slot (a superseded retry)
//! without deadlocking every release waiting behind it.

use std::collections::BTreeMap;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

/// A reservation returned by [`ReorderBuffer::submit`], redeemed by
/// [`ReorderBuffer::complete`] or [`ReorderBuffer::evict`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    /// Monotonic submission order; the order results are released in.
    sequence: u64,
    /// Caller-supplied label identifying the submitted work.
    row_id: String,
}

impl Ticket {
    /// This ticket's submission sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The label this ticket was submitted under.
    #[must_use]
    pub fn row_id(&self) -> &str {
        &self.row_id
    }
}

/// A released result, in submission order.
#[derive(Debug, Clone)]
pub struct ReleasedEntry<T> {
    /// The completed result.
    pub result: T,
    /// The label this entry was submitted under.
    pub row_id: String,
    /// This entry's submission sequence number.
    pub sequence: u64,
}

/// A snapshot of buffer occupancy, for attaching to executor/node-state
/// statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReorderMetrics {
    /// Entries reserved but not yet released.
    pub pending: usize,
    /// Of those, how many already have a result waiting to be released.
    pub completed_waiting: usize,
    /// The next sequence number [`ReorderBuffer::submit`] will assign.
    pub next_sequence: u64,
    /// The sequence number the next release will return.
    pub next_release: u64,
}

/// Failure modes for every `ReorderBuffer` operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReorderError {
    /// `submit` found the buffer at `max_pending` and no slot freed before
    /// the timeout (or immediately, with no timeout given).
    #[error("reorder buffer is full ({max_pending} pending)")]
    BufferFull {
        /// The buffer's configured capacity.
        max_pending: usize,
    },
    /// The buffer was shut down while a caller was blocked, or after.
    #[error("reorder buffer was shut down")]
    ShutDown,
    /// `complete` was called on a ticket that was already completed or
    /// evicted.
    #[error("ticket for '{row_id}' (sequence {sequence}) was already completed or evicted")]
    AlreadyCompleted {
        /// The offending ticket's label.
        row_id: String,
        /// The offending ticket's sequence number.
        sequence: u64,
    },
    /// A blocking call exceeded its timeout.
    #[error("timed out waiting for {what}")]
    TimedOut {
        /// What the caller was waiting for.
        what: &'static str,
    },
}

/// One reserved slot: either still awaiting a result, or holding one ready
/// to be released once the cursor reaches it.
enum Slot<T> {
    /// Reserved by `submit`, no result yet.
    Waiting {
        /// The label this slot was submitted under.
        row_id: String,
    },
    /// Completed by `complete`, awaiting release.
    Completed {
        /// The label this slot was submitted under.
        row_id: String,
        /// The completed result.
        result: T,
    },
}

/// Mutex-guarded state shared between submit/complete/release/evict.
struct Inner<T> {
    /// Next sequence number `submit` will assign.
    next_sequence: u64,
    /// Sequence number the next release will return.
    next_release: u64,
    /// Reserved slots, keyed by sequence number.
    slots: BTreeMap<u64, Slot<T>>,
    /// Maximum outstanding (reserved-but-not-released) slots.
    max_pending: usize,
    /// Once set, every blocked and future caller is rejected.
    shut_down: bool,
}

impl<T> Inner<T> {
    /// Advances `next_release` past any sequence numbers with no slot at
    /// all (evicted), stopping at the first still-present slot or at
    /// `next_sequence`.
    fn skip_evicted(&mut self) {
        while self.next_release < self.next_sequence && !self.slots.contains_key(&self.next_release) {
            self.next_release += 1;
        }
    }
}

/// A ticket-based FIFO reorder buffer (§4.9).
pub struct ReorderBuffer<T> {
    /// Shared mutable state.
    inner: Mutex<Inner<T>>,
    /// Signaled when a release frees backpressure for a blocked `submit`.
    submit_ready: Condvar,
    /// Signaled when a slot at the release cursor becomes completed, or on
    /// shutdown.
    release_ready: Condvar,
}

impl<T> ReorderBuffer<T> {
    /// Builds an empty buffer admitting at most `max_pending` outstanding
    /// entries at once.
    #[must_use]
    pub fn new(max_pending: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_sequence: 0,
                next_release: 0,
                slots: BTreeMap::new(),
                max_pending: max_pending.max(1),
                shut_down: false,
            }),
            submit_ready: Condvar::new(),
            release_ready: Condvar::new(),
        }
    }

    /// Reserves the next sequence number for `row_id`, blocking if the
    /// buffer is at capacity.
    ///
    /// # Errors
    ///
    /// Returns [`ReorderError::ShutDown`] if the buffer has been shut
    /// down, or [`ReorderError::BufferFull`] if `timeout` elapses (or is
    /// `None` and the buffer is already full, which surfaces immediately
    /// as [`ReorderError::TimedOut`] is never produced without a timeout).
    pub fn submit(&self, row_id: impl Into<String>, timeout: Option<Duration>) -> Result<Ticket, ReorderError> {
        let row_id = row_id.into();
        let deadline = timeout.map(|duration| Instant::now() + duration);
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            if guard.shut_down {
                return Err(ReorderError::ShutDown);
            }
            if guard.slots.len() < guard.max_pending {
                break;
            }
            match deadline {
                None => return Err(ReorderError::BufferFull { max_pending: guard.max_pending }),
                Some(deadline) => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        return Err(ReorderError::TimedOut { what: "buffer space" });
                    };
                    let (next_guard, timed_out) =
                        self.submit_ready.wait_timeout(guard, remaining).unwrap_or_else(PoisonError::into_inner);
                    guard = next_guard;
                    if timed_out.timed_out() && guard.slots.len() >= guard.max_pending && !guard.shut_down {
                        return Err(ReorderError::TimedOut { what: "buffer space" });
                    }
                }
            }
        }

        let sequence = guard.next_sequence;
        guard.next_sequence += 1;
        guard.slots.insert(sequence, Slot::Waiting { row_id: row_id.clone() });
        Ok(Ticket { sequence, row_id })
    }

    /// Attaches `result` to a previously reserved `ticket`.
    ///
    /// # Errors
    ///
    /// Returns [`ReorderError::AlreadyCompleted`] if `ticket` was already
    /// completed or evicted.
    pub fn complete(&self, ticket: Ticket, result: T) -> Result<(), ReorderError> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.slots.get(&ticket.sequence) {
            Some(Slot::Waiting { .. }) => {
                guard.slots.insert(ticket.sequence, Slot::Completed { row_id: ticket.row_id, result });
                self.release_ready.notify_all();
                Ok(())
            }
            Some(Slot::Completed { .. }) | None => {
                Err(ReorderError::AlreadyCompleted { row_id: ticket.row_id, sequence: ticket.sequence })
            }
        }
    }

    /// Blocks until the entry at the release cursor is completed, then
    /// returns it, advancing the cursor past it (and past any entries
    /// evicted ahead of it).
    ///
    /// # Errors
    ///
    /// Returns [`ReorderError::ShutDown`] if the buffer is shut down with
    /// nothing left to release, or [`ReorderError::TimedOut`] if `timeout`
    /// elapses first.
    pub fn wait_for_next_release(&self, timeout: Option<Duration>) -> Result<ReleasedEntry<T>, ReorderError> {
        let deadline = timeout.map(|duration| Instant::now() + duration);
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            guard.skip_evicted();
            if let Some(Slot::Completed { .. }) = guard.slots.get(&guard.next_release) {
                let sequence = guard.next_release;
                let Some(Slot::Completed { row_id, result }) = guard.slots.remove(&sequence) else {
                    return Err(ReorderError::ShutDown);
                };
                guard.next_release += 1;
                self.submit_ready.notify_all();
                return Ok(ReleasedEntry { result, row_id, sequence });
            }
            if guard.shut_down {
                return Err(ReorderError::ShutDown);
            }
            match deadline {
                None => {
                    guard = self.release_ready.wait(guard).unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        return Err(ReorderError::TimedOut { what: "next release" });
                    };
                    let (next_guard, timed_out) =
                        self.release_ready.wait_timeout(guard, remaining).unwrap_or_else(PoisonError::into_inner);
                    guard = next_guard;
                    if timed_out.timed_out() {
                        guard.skip_evicted();
                        if !matches!(guard.slots.get(&guard.next_release), Some(Slot::Completed { .. })) {
                            return Err(ReorderError::TimedOut { what: "next release" });
                        }
                    }
                }
            }
        }
    }

    /// Abandons a reserved slot that will never be completed (e.g. a retry
    /// that superseded it), so releases behind it are not blocked forever.
    ///
    /// Returns `true` if the slot was evicted, `false` if it was already
    /// completed (and so cannot be evicted) or no longer tracked at all.
    pub fn evict(&self, ticket: Ticket) -> bool {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.slots.get(&ticket.sequence) {
            Some(Slot::Waiting { .. }) => {
                guard.slots.remove(&ticket.sequence);
                self.release_ready.notify_all();
                self.submit_ready.notify_all();
                true
            }
            Some(Slot::Completed { .. }) | None => false,
        }
    }

    /// Wakes every blocked `submit` and `wait_for_next_release` caller, and
    /// rejects every future call.
    pub fn shutdown(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.shut_down = true;
        self.submit_ready.notify_all();
        self.release_ready.notify_all();
    }

    /// Entries reserved but not yet released.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).slots.len()
    }

    /// A snapshot of buffer occupancy.
    #[must_use]
    pub fn get_metrics(&self) -> ReorderMetrics {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let completed_waiting = guard.slots.values().filter(|slot| matches!(slot, Slot::Completed { .. })).count();
        ReorderMetrics {
            pending: guard.slots.len(),
            completed_waiting,
            next_sequence: guard.next_sequence,
            next_release: guard.next_release,
        }
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
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use super::ReorderBuffer;
    use super::ReorderError;

    #[test]
    fn single_entry_submit_complete_release() {
        let buffer: ReorderBuffer<&'static str> = ReorderBuffer::new(10);
        let ticket = buffer.submit("row-1", None).expect("submits");
        assert_eq!(ticket.sequence(), 0);
        assert_eq!(ticket.row_id(), "row-1");

        buffer.complete(ticket, "result-1").expect("completes");
        let entry = buffer.wait_for_next_release(Some(Duration::from_secs(1))).expect("releases");
        assert_eq!(entry.result, "result-1");
        assert_eq!(entry.sequence, 0);
    }

    #[test]
    fn releases_in_submission_order_even_when_completed_in_reverse() {
        let buffer: ReorderBuffer<&'static str> = ReorderBuffer::new(10);
        let t1 = buffer.submit("row-1", None).expect("submits");
        let t2 = buffer.submit("row-2", None).expect("submits");
        let t3 = buffer.submit("row-3", None).expect("submits");

        buffer.complete(t3, "result-3").expect("completes");
        buffer.complete(t2, "result-2").expect("completes");
        buffer.complete(t1, "result-1").expect("completes");

        let timeout = Some(Duration::from_secs(1));
        assert_eq!(buffer.wait_for_next_release(timeout).expect("releases").result, "result-1");
        assert_eq!(buffer.wait_for_next_release(timeout).expect("releases").result, "result-2");
        assert_eq!(buffer.wait_for_next_release(timeout).expect("releases").result, "result-3");
    }

    #[test]
    fn metrics_report_pending_and_completed_waiting() {
        let buffer: ReorderBuffer<&'static str> = ReorderBuffer::new(10);
        assert_eq!(buffer.pending_count(), 0);

        let t1 = buffer.submit("row-1", None).expect("submits");
        let t2 = buffer.submit("row-2", None).expect("submits");
        assert_eq!(buffer.pending_count(), 2);

        buffer.complete(t2, "result-2").expect("completes");
        let metrics = buffer.get_metrics();
        assert_eq!(metrics.completed_waiting, 1);

        buffer.complete(t1, "result-1").expect("completes");
        buffer.wait_for_next_release(Some(Duration::from_secs(1))).expect("releases");
        assert_eq!(buffer.pending_count(), 1);
    }

    #[test]
    fn submit_blocks_when_full_and_unblocks_on_release() {
        let buffer: Arc<ReorderBuffer<&'static str>> = Arc::new(ReorderBuffer::new(2));
        let t1 = buffer.submit("row-1", None).expect("submits");
        buffer.submit("row-2", None).expect("submits");

        let barrier = Arc::new(Barrier::new(2));
        let handle = {
            let buffer = Arc::clone(&buffer);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                buffer.submit("row-3", Some(Duration::from_secs(2)))
            })
        };
        barrier.wait();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(buffer.pending_count(), 2);

        buffer.complete(t1, "result-1").expect("completes");
        buffer.wait_for_next_release(Some(Duration::from_secs(1))).expect("releases");

        let ticket = handle.join().expect("thread joins").expect("submits after space frees");
        assert_eq!(ticket.row_id(), "row-3");
    }

    #[test]
    fn submit_times_out_when_buffer_stays_full() {
        let buffer: ReorderBuffer<&'static str> = ReorderBuffer::new(1);
        buffer.submit("row-1", None).expect("submits");
        let err = buffer.submit("row-2", Some(Duration::from_millis(50))).expect_err("times out");
        assert!(matches!(err, ReorderError::TimedOut { .. }));
    }

    #[test]
    fn evicting_a_waiting_slot_unblocks_the_release_behind_it() {
        let buffer: ReorderBuffer<&'static str> = ReorderBuffer::new(10);
        let t1 = buffer.submit("row-1", None).expect("submits");
        let t2 = buffer.submit("row-2", None).expect("submits");

        buffer.complete(t2, "result-2").expect("completes");
        assert!(buffer.evict(t1));

        let entry = buffer.wait_for_next_release(Some(Duration::from_secs(1))).expect("releases");
        assert_eq!(entry.result, "result-2");
        assert_eq!(entry.sequence, 1);
    }

    #[test]
    fn evicting_an_already_completed_slot_fails() {
        let buffer: ReorderBuffer<&'static str> = ReorderBuffer::new(10);
        let t1 = buffer.submit("row-1", None).expect("submits");
        let t1_clone = super::Ticket { sequence: t1.sequence(), row_id: t1.row_id().to_owned() };
        buffer.complete(t1, "result-1").expect("completes");
        assert!(!buffer.evict(t1_clone));
    }

    #[test]
    fn double_complete_is_rejected() {
        let buffer: ReorderBuffer<&'static str> = ReorderBuffer::new(10);
        let ticket = buffer.submit("row-1", None).expect("submits");
        let duplicate = super::Ticket { sequence: ticket.sequence(), row_id: ticket.row_id().to_owned() };
        buffer.complete(ticket, "result-1").expect("completes");
        let err = buffer.complete(duplicate, "result-1-again").expect_err("already completed");
        assert!(matches!(err, ReorderError::AlreadyCompleted { .. }));
    }

    #[test]
    fn shutdown_wakes_blocked_submit_and_release_waiters() {
        let buffer: Arc<ReorderBuffer<&'static str>> = Arc::new(ReorderBuffer::new(1));
        buffer.submit("row-1", None).expect("submits");

        let barrier = Arc::new(Barrier::new(3));
        let submit_waiter = {
            let buffer = Arc::clone(&buffer);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                buffer.submit("row-2", Some(Duration::from_secs(5)))
            })
        };
        let release_waiter = {
            let buffer = Arc::clone(&buffer);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                buffer.wait_for_next_release(Some(Duration::from_secs(5)))
            })
        };
        barrier.wait();
        thread::sleep(Duration::from_millis(50));
        buffer.shutdown();

        assert!(matches!(submit_waiter.join().expect("thread joins"), Err(ReorderError::ShutDown)));
        assert!(matches!(release_waiter.join().expect("thread joins"), Err(ReorderError::ShutDown)));
    }

    #[test]
    fn five_threads_fifty_rows_release_in_submission_order() {
        let buffer: Arc<ReorderBuffer<usize>> = Arc::new(ReorderBuffer::new(64));
        let tickets: Vec<_> = (0 .. 50).map(|i| buffer.submit(format!("row-{i}"), None).expect("submits")).collect();

        let handles: Vec<_> = tickets
            .into_iter()
            .enumerate()
            .map(|(i, ticket)| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    thread::sleep(Duration::from_micros(u64::try_from((i * 37) % 500).unwrap_or(0)));
                    buffer.complete(ticket, i).expect("completes");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker joins");
        }

        for expected in 0 .. 50 {
            let entry = buffer.wait_for_next_release(Some(Duration::from_secs(2))).expect("releases");
            assert_eq!(entry.result, expected);
        }
    }
}
