//! Tunable constants. Mirrors the scattered `var X = ...` knobs of the
//! original indexer so they stay in one place and are overridable in tests.

use std::time::Duration;

/// How often the schedule-create token monitor polls the metadata store.
pub const SCHED_TOKEN_CHECK_INTERVAL: Duration = Duration::from_millis(5000);

/// How often the processor loop drains the priority queue.
pub const SCHED_TOKEN_PROCESS_INTERVAL: Duration = Duration::from_millis(5000);

/// How often the stop-token cleaner scans for reclaimable stop-tokens.
pub const STOP_TOKEN_CLEANER_INTERVAL: Duration = Duration::from_secs(60);

/// Minimum age of a stop-token before the cleaner will remove it.
pub const STOP_TOKEN_RETENTION: Duration = Duration::from_secs(600);

pub const RETRYABLE_ERROR_BACKOFF: Duration = Duration::from_secs(5);
pub const NON_RETRYABLE_ERROR_BACKOFF: Duration = Duration::from_secs(5);
pub const NETWORK_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Uniform random backoff bounds used when another index creation is in
/// flight against the same metadata.
pub const RANDOM_BACKOFF_START_MS: u64 = 50;
pub const RANDOM_BACKOFF_END_MS: u64 = 5000;

pub const MAX_CREATION_RETRIES: u32 = 100;

/// Depth of the Mutation Manager's internal worker-message buffer, which
/// bridges the fast listener loop and the (potentially slow) supervisor
/// response forwarder.
pub const WORKER_MSG_QUEUE_LEN: usize = 2000;

/// Default pool sizes for the scan client connection pool.
pub const DEFAULT_POOL_SIZE: usize = 5;
pub const DEFAULT_POOL_OVERFLOW: usize = 5;
pub const DEFAULT_MAX_PAYLOAD: usize = 1 << 20;
