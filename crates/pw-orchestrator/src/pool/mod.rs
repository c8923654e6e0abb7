// crates/pw-orchestrator/src/pool/mod.rs
// ============================================================================
// Module: Pool
// Description: The worker-pool subsystem pooled transforms and aggregations
// run through — semaphore, reorder buffer, throttle, and the executor that
// ties them together (§4.9-§4.10).
// ============================================================================

//! ## Overview
//! [`semaphore`] bounds concurrent in-flight attempts, [`reorder`] restores
//! submission order over out-of-order completion, [`throttle`] paces
//! retries under sustained capacity pressure, and [`executor`] composes all
//! three into [`executor::PooledExecutor`], the type pooled plugin stages
//! actually call.

pub mod executor;
pub mod reorder;
pub mod semaphore;
pub mod throttle;

pub use executor::CapacityError;
pub use executor::PoolConfig;
pub use executor::PoolConfigSnapshot;
pub use executor::PooledExecutor;
pub use executor::PooledExecutorStats;
pub use executor::RowContext;
pub use reorder::ReleasedEntry;
pub use reorder::ReorderBuffer;
pub use reorder::ReorderError;
pub use reorder::ReorderMetrics;
pub use reorder::Ticket;
pub use semaphore::Semaphore;
pub use throttle::AimdThrottle;
pub use throttle::ThrottleConfig;
pub use throttle::ThrottleStats;
