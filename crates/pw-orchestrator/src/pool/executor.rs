// crates/pw-orchestrator/src/pool/executor.rs
// ============================================================================
// Module: Pooled Executor
// Description: Runs a batch of rows through a plugin's process function
// across a bounded worker pool, retrying transient capacity errors under
// throttle control, and returning results in submission order (§4.10).
// Purpose: Pooled transforms and aggregations call out to external systems
// that can be temporarily over capacity; a fixed-size worker pool with
// cooperative backoff gets throughput without either serializing every row
// or hammering a struggling downstream system.
// Dependencies: pw-core (TransformResult), serde_json
// Grounding: examples/original_source/src/elspeth/plugins/pooling/executor.py
// (`PooledExecutor.execute_batch`/`_execute_single`) — the deadlock-avoidance
// discipline (semaphore released before the retry sleep, reacquired after)
// is preserved verbatim; `std::thread::scope` substitutes for
// `ThreadPoolExecutor` + `as_completed`, which needs no async runtime given
// this engine is synchronous throughout (§0's "no async runtime" stance).
// ============================================================================

//! ## Overview
//! [`PooledExecutor::execute_batch`] submits every row to the
//! [`crate::pool::reorder::ReorderBuffer`] up front (so release order is
//! pinned to submission order), then spawns a bounded pool of worker
//! threads via [`std::thread::scope`] that pull from a shared queue and a
//! collector thread that drains the reorder buffer concurrently — mirroring
//! the teacher's dispatch-while-draining shape without needing futures.
//! Each row's single attempt loop lives in [`PooledExecutor::execute_single`]
//! and never holds the pool semaphore while sleeping out a throttle backoff.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use pw_core::protocol::TransformResult;
use serde_json::json;

use crate::pool::reorder::ReorderBuffer;
use crate::pool::semaphore::Semaphore;
use crate::pool::throttle::AimdThrottle;
use crate::pool::throttle::ThrottleConfig;
use crate::pool::throttle::ThrottleStats;

/// One row dispatched into a [`PooledExecutor`], carrying enough context to
/// report errors against the right batch position.
#[derive(Debug, Clone)]
pub struct RowContext<T> {
    /// The row's payload.
    pub row: T,
    /// The batch state this row belongs to, used as the reorder buffer's
    /// submission label.
    pub state_id: String,
    /// The row's position within its batch.
    pub row_index: usize,
}

/// Signals that a plugin's process function hit a transient capacity limit
/// and should be retried after a throttle backoff, rather than failed
/// outright.
#[derive(Debug, Clone, thiserror::Error)]
#[error("capacity exceeded: {message}")]
pub struct CapacityError {
    /// Human-readable description of the capacity failure.
    pub message: String,
    /// The downstream system's reported status code, if any.
    pub status_code: Option<u16>,
}

/// Tuning for one [`PooledExecutor`].
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Worker threads (and semaphore permits) available to a batch.
    pub pool_size: usize,
    /// Ceiling on how long a single row may spend retrying capacity errors
    /// before it is failed with `retryable: false`.
    pub max_capacity_retry_seconds: u64,
    /// Throttle tuning shared by every row in this pool.
    pub throttle: ThrottleConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { pool_size: 4, max_capacity_retry_seconds: 60, throttle: ThrottleConfig::default() }
    }
}

/// A snapshot of this pool's configuration, echoed back by [`PooledExecutor::stats`].
#[derive(Debug, Clone, Copy)]
pub struct PoolConfigSnapshot {
    /// Worker threads configured for this pool.
    pub pool_size: usize,
    /// Configured capacity-retry ceiling, in seconds.
    pub max_capacity_retry_seconds: u64,
}

/// A full statistics snapshot, mirroring the teacher's
/// `get_stats() -> {"pool_config": ..., "pool_stats": ...}` shape.
#[derive(Debug, Clone, Copy)]
pub struct PooledExecutorStats {
    /// This pool's configuration.
    pub pool_config: PoolConfigSnapshot,
    /// The throttle's activity counters.
    pub pool_stats: ThrottleStats,
}

/// Runs batches of rows through a plugin callback across a bounded worker
/// pool, retrying capacity errors under throttle control.
pub struct PooledExecutor {
    /// Tuning this executor was built with.
    config: PoolConfig,
    /// Bounds concurrent in-flight attempts to `config.pool_size`.
    semaphore: Semaphore,
    /// Shared backoff delay across every row this executor processes.
    throttle: AimdThrottle,
}

impl PooledExecutor {
    /// Builds a pool with the given tuning.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let semaphore = Semaphore::new(config.pool_size.max(1));
        let throttle = AimdThrottle::new(config.throttle);
        Self { config, semaphore, throttle }
    }

    /// Processes every row in `rows` through `process_fn`, returning results
    /// in the same order `rows` was given in regardless of which worker
    /// finishes which row first.
    ///
    /// `process_fn` returns `Ok(TransformResult)` for any outcome the
    /// pipeline itself should record (including a non-retryable failure),
    /// and `Err(CapacityError)` only for a transient condition this
    /// executor should retry under throttle control.
    pub fn execute_batch<T, F>(&self, rows: Vec<RowContext<T>>, process_fn: &F) -> Vec<TransformResult>
    where
        T: Send,
        F: Fn(&RowContext<T>) -> Result<TransformResult, CapacityError> + Sync,
    {
        let total = rows.len();
        if total == 0 {
            return Vec::new();
        }

        let reorder: ReorderBuffer<TransformResult> = ReorderBuffer::new(total);
        let tickets_and_rows: VecDeque<_> = rows
            .into_iter()
            .map(|row| {
                let ticket = reorder
                    .submit(row.state_id.clone(), None)
                    .unwrap_or_else(|err| unreachable!("buffer sized to {total} rows up front: {err}"));
                (ticket, row)
            })
            .collect();
        let work = Mutex::new(tickets_and_rows);

        thread::scope(|scope| {
            let worker_count = self.config.pool_size.max(1).min(total);
            for _ in 0 .. worker_count {
                scope.spawn(|| self.worker_loop(&work, &reorder, process_fn));
            }

            let collector = scope.spawn(|| {
                let mut results = Vec::with_capacity(total);
                for _ in 0 .. total {
                    match reorder.wait_for_next_release(None) {
                        Ok(entry) => results.push(entry.result),
                        Err(_) => break,
                    }
                }
                results
            });
            collector.join().unwrap_or_else(|_| Vec::new())
        })
    }

    /// One worker's loop: pull a row, run it to completion (including any
    /// capacity retries), complete its ticket, repeat until the queue is
    /// drained.
    fn worker_loop<T, F>(
        &self,
        work: &Mutex<VecDeque<(crate::pool::reorder::Ticket, RowContext<T>)>>,
        reorder: &ReorderBuffer<TransformResult>,
        process_fn: &F,
    ) where
        F: Fn(&RowContext<T>) -> Result<TransformResult, CapacityError> + Sync,
    {
        loop {
            let next = { work.lock().unwrap_or_else(PoisonError::into_inner).pop_front() };
            let Some((ticket, row_ctx)) = next else {
                return;
            };
            let result = self.execute_single(&row_ctx, process_fn);
            let _ = reorder.complete(ticket, result);
        }
    }

    /// Runs a single row to completion: acquire a pool permit, attempt
    /// `process_fn`, and on a capacity error back off and retry without
    /// holding the permit, until either it succeeds, fails outright, or the
    /// retry ceiling is reached.
    fn execute_single<T>(
        &self,
        row_ctx: &RowContext<T>,
        process_fn: &(impl Fn(&RowContext<T>) -> Result<TransformResult, CapacityError> + Sync),
    ) -> TransformResult {
        let start = Instant::now();
        let mut just_retried = false;
        self.semaphore.acquire();
        let result = loop {
            if !just_retried {
                self.throttle.wait();
            }
            match process_fn(row_ctx) {
                Ok(transform_result) => {
                    self.throttle.on_success();
                    break transform_result;
                }
                Err(capacity_error) => {
                    self.throttle.on_capacity_error();
                    let elapsed = start.elapsed();
                    #[allow(
                        clippy::cast_precision_loss,
                        reason = "max_capacity_retry_seconds stays far below f64's exact-integer range."
                    )]
                    let ceiling = self.config.max_capacity_retry_seconds as f64;
                    if elapsed.as_secs_f64() >= ceiling {
                        break TransformResult::Error {
                            reason: json!({
                                "reason": "capacity_retry_timeout",
                                "error": capacity_error.message,
                                "status_code": capacity_error.status_code,
                                "elapsed_seconds": elapsed.as_secs_f64(),
                                "max_seconds": self.config.max_capacity_retry_seconds,
                                "row_index": row_ctx.row_index,
                            }),
                            retryable: false,
                        };
                    }
                    self.semaphore.release();
                    self.throttle.wait();
                    self.semaphore.acquire();
                    just_retried = true;
                }
            }
        };
        self.semaphore.release();
        result
    }

    /// A snapshot of this pool's configuration and throttle activity.
    #[must_use]
    pub fn stats(&self) -> PooledExecutorStats {
        PooledExecutorStats {
            pool_config: PoolConfigSnapshot {
                pool_size: self.config.pool_size,
                max_capacity_retry_seconds: self.config.max_capacity_retry_seconds,
            },
            pool_stats: self.throttle.stats(),
        }
    }

    /// The delay a worker would sleep right now, without sleeping it.
    #[must_use]
    pub fn current_delay(&self) -> Duration {
        self.throttle.current_delay()
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

    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use pw_core::protocol::TransformResult;
    use serde_json::json;

    use super::CapacityError;
    use super::PoolConfig;
    use super::PooledExecutor;
    use super::RowContext;
    use super::ThrottleConfig;

    fn fast_throttle_config() -> PoolConfig {
        PoolConfig {
            pool_size: 3,
            max_capacity_retry_seconds: 5,
            throttle: ThrottleConfig { initial_delay_ms: 1, min_delay_ms: 0, max_delay_ms: 20, increase_factor: 2.0, decrease_step_ms: 1 },
        }
    }

    fn rows(count: usize) -> Vec<RowContext<usize>> {
        (0 .. count).map(|i| RowContext { row: i, state_id: format!("row-{i}"), row_index: i }).collect()
    }

    #[test]
    fn processes_every_row_and_preserves_submission_order() {
        let executor = PooledExecutor::new(fast_throttle_config());
        let results = executor.execute_batch(rows(20), &|ctx: &RowContext<usize>| {
            Ok(TransformResult::Success { row: json!({ "value": ctx.row }), success_reason: None })
        });

        assert_eq!(results.len(), 20);
        for (i, result) in results.iter().enumerate() {
            let TransformResult::Success { row, .. } = result else { panic!("expected success") };
            assert_eq!(row.get("value").and_then(serde_json::Value::as_u64), Some(u64::try_from(i).unwrap()));
        }
    }

    #[test]
    fn retries_capacity_errors_until_success() {
        let executor = PooledExecutor::new(fast_throttle_config());
        let attempts = AtomicUsize::new(0);

        let results = executor.execute_batch(rows(1), &|_ctx: &RowContext<usize>| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                Err(CapacityError { message: "over capacity".to_owned(), status_code: Some(429) })
            } else {
                Ok(TransformResult::Success { row: json!({}), success_reason: None })
            }
        });

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(matches!(results.first(), Some(TransformResult::Success { .. })));
        assert!(executor.stats().pool_stats.capacity_retries >= 2);
    }

    #[test]
    fn gives_up_after_the_capacity_retry_ceiling() {
        let mut config = fast_throttle_config();
        config.max_capacity_retry_seconds = 0;
        let executor = PooledExecutor::new(config);

        let results = executor.execute_batch(rows(1), &|_ctx: &RowContext<usize>| {
            Err(CapacityError { message: "always over capacity".to_owned(), status_code: Some(503) })
        });

        let TransformResult::Error { retryable, reason } = &results[0] else { panic!("expected error") };
        assert!(!retryable);
        assert_eq!(reason.get("reason").and_then(serde_json::Value::as_str), Some("capacity_retry_timeout"));
    }

    #[test]
    fn empty_batch_returns_empty_results() {
        let executor = PooledExecutor::new(fast_throttle_config());
        let results: Vec<TransformResult> =
            executor.execute_batch(Vec::<RowContext<usize>>::new(), &|_ctx: &RowContext<usize>| {
                Ok(TransformResult::Success { row: json!({}), success_reason: None })
            });
        assert!(results.is_empty());
    }
}
