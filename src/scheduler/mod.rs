//! Scheduled Index Creator (spec §4.5, component E): a durable,
//! token-driven work queue that retries index-creation attempts across
//! network and peer failures with classified backoff and mutual
//! exclusion against cluster rebalance.

pub mod backoff;
pub mod queue;
pub mod token;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::cnf;
use crate::types::DefnId;

use queue::{ScheduleQueue, ScheduledIndex};
use token::{MetadataProvider, MetadataStore, ProviderCache, StopScheduleCreateToken};

/// allowDDL ∈ {true, false} (spec §4.5). Rebalance start clears it;
/// rebalance end sets it and invalidates the cached metadata provider.
#[derive(Clone)]
pub struct RebalanceGate {
	allow_ddl: Arc<AtomicBool>,
}

impl RebalanceGate {
	fn new() -> Self {
		Self {
			allow_ddl: Arc::new(AtomicBool::new(true)),
		}
	}

	pub fn allow_ddl(&self) -> bool {
		self.allow_ddl.load(Ordering::Acquire)
	}
}

/// Handle to a running Scheduled Index Creator: the rebalance hooks and
/// the join handles of its four tasks (spec §5: "3 long-lived tasks ...
/// plus one token-monitor updater").
pub struct SchedulerHandle {
	gate: RebalanceGate,
	provider_cache: Arc<ProviderCache>,
	pub monitor: JoinHandle<()>,
	pub processor: JoinHandle<()>,
	pub cleaner: JoinHandle<()>,
}

impl SchedulerHandle {
	/// Rebalance start: block new DDL.
	pub fn on_rebalance_start(&self) {
		self.gate.allow_ddl.store(false, Ordering::Release);
	}

	/// Rebalance end: allow DDL again and drop the cached provider, per
	/// spec §9's "leave a hook and not invent semantics" instruction —
	/// the provider is only invalidated here, never re-dialed eagerly.
	pub fn on_rebalance_end(&self) {
		self.provider_cache.invalidate();
		self.gate.allow_ddl.store(true, Ordering::Release);
	}

	pub fn allow_ddl(&self) -> bool {
		self.gate.allow_ddl()
	}
}

struct SchedulerState {
	gate: RebalanceGate,
	queue: Mutex<ScheduleQueue>,
	provider_cache: Arc<ProviderCache>,
	store: Arc<dyn MetadataStore>,
	indexer_id: String,
	seen: Mutex<HashSet<DefnId>>,
}

/// Spawns the token monitor, processor, and stop-token cleaner loops.
pub fn spawn(
	indexer_id: String,
	store: Arc<dyn MetadataStore>,
	provider_factory: Arc<dyn Fn() -> Arc<dyn MetadataProvider> + Send + Sync>,
) -> SchedulerHandle {
	let gate = RebalanceGate::new();
	let provider_cache = Arc::new(ProviderCache::new(provider_factory));
	let state = Arc::new(SchedulerState {
		gate: gate.clone(),
		queue: Mutex::new(ScheduleQueue::new()),
		provider_cache: provider_cache.clone(),
		store,
		indexer_id,
		seen: Mutex::new(HashSet::new()),
	});

	let monitor = tokio::spawn(run_token_monitor(state.clone()));
	let processor = tokio::spawn(run_processor(state.clone()));
	let cleaner = tokio::spawn(run_stop_token_cleaner(state));

	SchedulerHandle { gate, provider_cache, monitor, processor, cleaner }
}

async fn run_token_monitor(state: Arc<SchedulerState>) {
	let mut ticker = tokio::time::interval(cnf::SCHED_TOKEN_CHECK_INTERVAL);
	loop {
		ticker.tick().await;
		let tokens = state.store.list_schedule_create_tokens(&state.indexer_id).await;
		for token in tokens {
			let defn_id = token.definition.defn_id;
			let already_processed = {
				let mut seen = state.seen.lock();
				!seen.insert(defn_id)
			};
			if already_processed {
				continue;
			}
			if state.store.get_stop_schedule_create_token(defn_id).await.is_some() {
				continue;
			}
			trace!(defn = ?defn_id, "scheduled index creator accepted new token");
			state.queue.lock().push(ScheduledIndex::new(token));
		}
	}
}

async fn run_processor(state: Arc<SchedulerState>) {
	let mut ticker = tokio::time::interval(cnf::SCHED_TOKEN_PROCESS_INTERVAL);
	loop {
		ticker.tick().await;
		while state.gate.allow_ddl() {
			let item = state.queue.lock().pop();
			let Some(item) = item else { break };
			if let Some(retry) = try_create_index(&state, item).await {
				state.queue.lock().push(retry);
			}
		}
	}
}

/// One pass of the attempt protocol (spec §4.5). Returns `Some` if the
/// item should be re-enqueued after a backoff sleep, `None` if it was
/// terminally resolved (success, non-retryable drop, or retries exhausted).
async fn try_create_index(state: &Arc<SchedulerState>, mut item: ScheduledIndex) -> Option<ScheduledIndex> {
	let defn_id = item.defn_id();

	// Step 1: stop-token already posted -> abandon, no retry.
	if state.store.get_stop_schedule_create_token(defn_id).await.is_some() {
		state.seen.lock().remove(&defn_id);
		return None;
	}
	// Step 2: delete-command token -> abandon.
	if state.store.has_delete_command_token(defn_id).await {
		state.seen.lock().remove(&defn_id);
		return None;
	}

	// Step 3 (backoff) is applied by the caller in `handle_creation_error`
	// before an item is ever re-enqueued, so by the time an item reaches
	// here its backoff has already elapsed.

	// Step 4: cached provider.
	let provider = state.provider_cache.get();

	// Step 5: already present -> treat as success.
	if provider.index_exists(defn_id).await {
		info!(defn = ?defn_id, "scheduled index already present, treating as success");
		state.store.delete_schedule_create_token(defn_id).await;
		state.seen.lock().remove(&defn_id);
		return None;
	}

	// Step 6: copy bucket/scope/collection from the token into the
	// definition, defending against a concurrent keyspace drop.
	item.token.definition.bucket_uuid = item.token.bucket_uuid.clone();
	item.token.definition.scope_id = item.token.scope_id.clone();
	item.token.definition.collection_id = item.token.collection_id.clone();

	// Step 7: create.
	match provider.create_index_with_defn_and_plan(&item.token.definition, &item.token.plan).await {
		Ok(()) => {
			info!(defn = ?defn_id, "scheduled index created");
			state.store.delete_schedule_create_token(defn_id).await;
			state.seen.lock().remove(&defn_id);
			None
		}
		Err(e) => handle_creation_error(state, item, e).await,
	}
}

async fn handle_creation_error(state: &Arc<SchedulerState>, mut item: ScheduledIndex, error: String) -> Option<ScheduledIndex> {
	let defn_id = item.defn_id();
	let classification = backoff::classify(&error, item.retry_count);
	item.last_error = Some(error.clone());

	match classification {
		backoff::Classification::NonRetryable { keyspace_deleted } => {
			item.non_retryable_retry_count += 1;
			warn!(defn = ?defn_id, keyspace_deleted, "non-retryable index creation failure: {error}");
			if keyspace_deleted {
				state.store.delete_schedule_create_token(defn_id).await;
			} else {
				state
					.store
					.post_stop_schedule_create_token(StopScheduleCreateToken {
						defn_id,
						reason: error,
						ctime_nanos: item.token.ctime_nanos,
					})
					.await;
			}
			state.seen.lock().remove(&defn_id);
			None
		}
		backoff::Classification::RetriesExhausted => {
			warn!(defn = ?defn_id, "scheduled index exceeded max creation retries, posting stop-token");
			state
				.store
				.post_stop_schedule_create_token(StopScheduleCreateToken {
					defn_id,
					reason: error,
					ctime_nanos: item.token.ctime_nanos,
				})
				.await;
			state.seen.lock().remove(&defn_id);
			None
		}
		backoff::Classification::Retryable { backoff: delay } => {
			item.retry_count += 1;
			tokio::time::sleep(delay).await;
			Some(item)
		}
	}
}

async fn run_stop_token_cleaner(state: Arc<SchedulerState>) {
	let mut ticker = tokio::time::interval(cnf::STOP_TOKEN_CLEANER_INTERVAL);
	loop {
		ticker.tick().await;
		let now_nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
		for stop_token in state.store.list_stop_schedule_create_tokens().await {
			let age = Duration::from_nanos(now_nanos.saturating_sub(stop_token.ctime_nanos).min(u128::from(u64::MAX)) as u64);
			if age < cnf::STOP_TOKEN_RETENTION {
				continue;
			}
			if state.store.has_schedule_create_token(stop_token.defn_id).await {
				continue;
			}
			// Best-effort: contention between multiple indexers is
			// tolerated (spec §9).
			state.store.delete_stop_schedule_create_token(stop_token.defn_id).await;
		}
	}
}
