//! Durable token types and the metadata-store seam (spec §3, §4.5). The
//! metadata repository itself is an external collaborator (spec §1, out
//! of scope); `MetadataStore` is the trait a real client binds to it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{DefnId, IndexDefn};

/// Durable descriptor of a pending deferred index creation.
#[derive(Debug, Clone)]
pub struct ScheduleCreateToken {
	pub definition: IndexDefn,
	pub bucket_uuid: String,
	pub scope_id: String,
	pub collection_id: String,
	pub plan: serde_json::Value,
	/// ctime in nanoseconds; see [`super::queue::ScheduledIndex`] for why
	/// this crate keeps nanosecond precision rather than truncating.
	pub ctime_nanos: u128,
	pub indexer_id: String,
}

/// Durable marker that a scheduled create has terminally failed.
#[derive(Debug, Clone)]
pub struct StopScheduleCreateToken {
	pub defn_id: DefnId,
	pub reason: String,
	pub ctime_nanos: u128,
}

/// What the token monitor, the attempt protocol and the stop-token
/// cleaner all read from and write to. A real implementation forwards to
/// the cluster metadata repository; tests supply an in-memory fake.
#[async_trait]
pub trait MetadataStore: Send + Sync {
	/// Newly posted tokens addressed to `indexer_id`, excluding ones the
	/// caller has already seen (tracked by the caller, not the store).
	async fn list_schedule_create_tokens(&self, indexer_id: &str) -> Vec<ScheduleCreateToken>;

	async fn get_stop_schedule_create_token(&self, defn_id: DefnId) -> Option<StopScheduleCreateToken>;

	async fn post_stop_schedule_create_token(&self, token: StopScheduleCreateToken);

	async fn delete_schedule_create_token(&self, defn_id: DefnId);

	/// All stop-tokens currently posted, for the cleaner's sweep.
	async fn list_stop_schedule_create_tokens(&self) -> Vec<StopScheduleCreateToken>;

	async fn delete_stop_schedule_create_token(&self, defn_id: DefnId);

	/// Whether a delete-command token exists for `defn_id` (step 2 of the
	/// attempt protocol); an external admin signal, not owned by this crate.
	async fn has_delete_command_token(&self, defn_id: DefnId) -> bool;

	/// Whether the token's schedule-create entry is itself still present
	/// (used by the stop-token cleaner's liveness check).
	async fn has_schedule_create_token(&self, defn_id: DefnId) -> bool;
}

/// What `tryCreateIndex` calls through to actually build the index. An
/// external collaborator (spec §1): the cluster metadata provider and
/// planner/placement module.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
	async fn index_exists(&self, defn_id: DefnId) -> bool;

	async fn create_index_with_defn_and_plan(&self, definition: &IndexDefn, plan: &serde_json::Value) -> Result<(), String>;
}

/// Lazily acquires a [`MetadataProvider`], invalidated on rebalance start
/// per spec §4.5's state machine. The concrete acquisition strategy (e.g.
/// dialing the cluster) lives outside this crate; this type only holds
/// the cached handle and the hook spec §9 calls for ("the exact contract
/// for rebalance-done resetting the provider is stubbed ... leave a hook").
pub struct ProviderCache {
	factory: Arc<dyn Fn() -> Arc<dyn MetadataProvider> + Send + Sync>,
	cached: parking_lot::Mutex<Option<Arc<dyn MetadataProvider>>>,
}

impl ProviderCache {
	pub fn new(factory: Arc<dyn Fn() -> Arc<dyn MetadataProvider> + Send + Sync>) -> Self {
		Self {
			factory,
			cached: parking_lot::Mutex::new(None),
		}
	}

	pub fn get(&self) -> Arc<dyn MetadataProvider> {
		let mut guard = self.cached.lock();
		if let Some(p) = guard.as_ref() {
			return p.clone();
		}
		let p = (self.factory)();
		*guard = Some(p.clone());
		p
	}

	/// Called on rebalance start; the next `get()` re-runs the factory.
	pub fn invalidate(&self) {
		*self.cached.lock() = None;
	}
}
