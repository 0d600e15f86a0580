//! Fixed configuration record (spec §9, "Enumerated config keys"). The
//! original indexer reads configuration by string key through typed
//! getters (`config["numVbuckets"].Int()`); we model the same set of
//! recognized options as a plain struct with a `Default` impl instead of
//! re-creating the stringly-typed lookup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-storage-mode overrides. The original keys these by storage mode
/// string (`"plasma"`, `"forestdb"`, ...); we key by an explicit enum so
/// a typo can't silently fall back to a default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageMode {
	ForestDb,
	Plasma,
	MemoryOptimized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
	pub num_vbuckets: u16,

	/// Hard cap on total bytes buffered across every mutation queue.
	pub max_queue_mem: i64,

	/// Fraction of `settings.memory_quota` to devote to mutation queues,
	/// per storage mode. The effective cap is
	/// `min(quota * fraction, max_queue_mem)`.
	pub frac_mutation_queue_mem: f64,

	/// Stream reader worker pool size, per storage mode.
	pub num_workers: usize,

	pub settings_memory_quota: i64,
	pub settings_num_replica: u32,

	pub conn_pool_timeout: Duration,
	pub conn_pool_avail_wait_timeout: Duration,
	pub read_deadline: Duration,
	pub write_deadline: Duration,
	pub pool_size: usize,
	pub pool_overflow: usize,
	pub max_payload: usize,

	pub cluster_addr: String,

	/// If true, enqueue blocks the producer until a concurrent flush
	/// frees space; if false, enqueue drops the mutation and counts the
	/// failure. See spec §4.1 and the "Queue at memory cap" boundary
	/// behavior in §8.
	pub block_on_queue_full: bool,
}

impl IndexerConfig {
	/// Effective mutation-queue memory cap given the current quota,
	/// per the CONFIG_SETTINGS_UPDATE handler in spec §4.4.
	pub fn effective_max_queue_mem(&self) -> i64 {
		let from_quota = (self.settings_memory_quota as f64 * self.frac_mutation_queue_mem) as i64;
		from_quota.min(self.max_queue_mem)
	}
}

impl Default for IndexerConfig {
	fn default() -> Self {
		Self {
			num_vbuckets: 1024,
			max_queue_mem: 1 << 30,
			frac_mutation_queue_mem: 0.5,
			num_workers: 8,
			settings_memory_quota: 2 << 30,
			settings_num_replica: 0,
			conn_pool_timeout: Duration::from_secs(1),
			conn_pool_avail_wait_timeout: Duration::from_millis(1000),
			read_deadline: Duration::from_secs(10),
			write_deadline: Duration::from_secs(10),
			pool_size: crate::cnf::DEFAULT_POOL_SIZE,
			pool_overflow: crate::cnf::DEFAULT_POOL_OVERFLOW,
			max_payload: crate::cnf::DEFAULT_MAX_PAYLOAD,
			cluster_addr: "127.0.0.1:9000".to_string(),
			block_on_queue_full: true,
		}
	}
}
