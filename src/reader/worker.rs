//! Per-worker routing logic for the Stream Reader.

use std::sync::Arc;

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::queue::MutationQueue;
use crate::types::{KeyspaceId, Mutation, SessionId, StreamId, TsVbuuid, Vbucket};

/// Everything a worker needs to know about one open keyspace: where to
/// enqueue accepted mutations, which session is current, and the
/// restart point below which mutations are stale.
pub struct KeyspaceFilter {
	pub queue: Arc<MutationQueue>,
	pub session_id: SessionId,
	pub restart_ts: TsVbuuid,
}

pub type KeyspaceFilterMap = HashMap<KeyspaceId, KeyspaceFilter>;

/// State shared between the reader's command loop and its workers. The
/// command loop replaces the whole map under the lock on every
/// ADD/REMOVE_INDEX_LIST/REMOVE_KEYSPACE command; workers only ever
/// take a read lock, so it is uncontended on the hot path.
pub struct SharedState {
	pub keyspaces: RwLock<KeyspaceFilterMap>,
}

impl SharedState {
	pub fn new() -> Self {
		Self {
			keyspaces: RwLock::new(HashMap::new()),
		}
	}
}

/// One unit of work dispatched to a worker, already assigned by vbucket.
pub enum WorkItem {
	Mutation { mutation: Mutation, session_id: SessionId },
	StreamBegin { vbucket: Vbucket, keyspace_id: KeyspaceId, node: Option<String> },
	StreamEnd { vbucket: Vbucket, keyspace_id: KeyspaceId },
	SystemEvent { vbucket: Vbucket, keyspace_id: KeyspaceId },
}

/// Outcome of processing one [`WorkItem::Mutation`], reported back to the
/// reader's main loop so it can forward the right [`super::WorkerMessage`].
pub enum MutationOutcome {
	Enqueued,
	Dropped,
	SessionMismatch,
	BelowRestartPoint,
	UnknownKeyspace,
}

/// Worker loop body: filters by session and restart point, then enqueues.
/// Split out of the task spawn site so it's directly unit-testable.
pub async fn process_mutation(state: &SharedState, mutation: Mutation, session_id: SessionId) -> MutationOutcome {
	// Clone what we need and drop the read guard before the (possibly
	// blocking-on-backpressure) enqueue call, so an update command isn't
	// starved by a slow producer holding the lock across an await.
	let filter_queue;
	let expected_session;
	let restart_seqno;
	{
		let guard = state.keyspaces.read();
		let Some(filter) = guard.get(&mutation.keyspace_id) else {
			return MutationOutcome::UnknownKeyspace;
		};
		filter_queue = filter.queue.clone();
		expected_session = filter.session_id;
		restart_seqno = filter.restart_ts.seqno(mutation.vbucket);
	}

	if session_id != expected_session {
		return MutationOutcome::SessionMismatch;
	}
	if mutation.seqno <= restart_seqno {
		return MutationOutcome::BelowRestartPoint;
	}

	match filter_queue.enqueue(mutation).await {
		crate::queue::EnqueueOutcome::Enqueued => MutationOutcome::Enqueued,
		crate::queue::EnqueueOutcome::Dropped => MutationOutcome::Dropped,
	}
}

pub async fn worker_loop(
	stream_id: StreamId,
	state: Arc<SharedState>,
	rx: channel::Receiver<WorkItem>,
	raw_tx: channel::Sender<super::WorkerMessage>,
) {
	use super::WorkerMessage;

	while let Ok(item) = rx.recv().await {
		match item {
			WorkItem::Mutation { mutation, session_id } => {
				let keyspace_id = mutation.keyspace_id.clone();
				match process_mutation(&state, mutation, session_id).await {
					MutationOutcome::Dropped => {
						let _ = raw_tx
							.send(WorkerMessage::StreamDropData {
								stream_id,
								keyspace_id,
								reason: "mutation queue memory cap reached".into(),
							})
							.await;
					}
					MutationOutcome::Enqueued | MutationOutcome::SessionMismatch | MutationOutcome::BelowRestartPoint | MutationOutcome::UnknownKeyspace => {}
				}
			}
			WorkItem::StreamBegin { vbucket, keyspace_id, node } => {
				let _ = raw_tx
					.send(WorkerMessage::StreamBegin {
						stream_id,
						keyspace_id,
						vbucket,
						node,
					})
					.await;
			}
			WorkItem::StreamEnd { vbucket, keyspace_id } => {
				let _ = raw_tx
					.send(WorkerMessage::StreamEnd {
						stream_id,
						keyspace_id,
						vbucket,
					})
					.await;
			}
			WorkItem::SystemEvent { vbucket, keyspace_id } => {
				let _ = raw_tx
					.send(WorkerMessage::SystemEvent {
						stream_id,
						keyspace_id,
						vbucket,
					})
					.await;
			}
		}
	}
}
