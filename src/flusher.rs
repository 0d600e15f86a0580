//! Flusher (spec §4.3, component C): drains a [`MutationQueue`] up to a
//! target [`TsVbuuid`], either persisting each mutation to the storage
//! engine or discarding it, and reports completion on a single-message
//! response channel.

use std::sync::Arc;

use crate::err::{Error, Result};
use crate::queue::MutationQueue;
use crate::types::{ChangeVector, IndexInstMap, IndexPartitionMap, KeyspaceId, Mutation, MutationOp, StreamId, TsVbuuid};

/// The storage engine is an external collaborator (spec §1, out of
/// scope); this trait is the seam the flusher calls through. A real
/// implementation forwards to the key/value storage engine keyed by
/// partition; tests supply an in-memory fake.
pub trait StorageSink: Send + Sync {
	fn insert(&self, keyspace: &KeyspaceId, partition: u64, mutation: &Mutation);
	fn update(&self, keyspace: &KeyspaceId, partition: u64, mutation: &Mutation);
	fn delete(&self, keyspace: &KeyspaceId, partition: u64, mutation: &Mutation);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
	/// `PersistUptoTS`: apply mutations to the storage engine.
	Persist,
	/// `DrainUptoTS`: discard mutations without touching storage.
	Drain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
	Success,
	Aborted,
}

pub struct FlushRequest {
	pub stream_id: StreamId,
	pub keyspace_id: KeyspaceId,
	pub mode: FlushMode,
	pub target: TsVbuuid,
	pub change_vector: ChangeVector,
	/// Maps an index instance's partitions to a partition id for storage
	/// calls; simplified to a single partition-id-per-vbucket function
	/// here since the partition scheme itself is out of scope (spec §1).
	pub partition_of_vb: Arc<dyn Fn(u16) -> u64 + Send + Sync>,
}

/// Drains `queue` per `req`, consulting `stop` for early cancellation.
/// For every vb where `req.change_vector` is set, every mutation with
/// `seqno <= target[vb]` is processed exactly once before returning
/// `FlushStatus::Success`. Closing `stop` causes an early return with
/// `FlushStatus::Aborted` without touching mutations beyond what was
/// already drained from the queue in this call.
pub async fn run_flush(
	queue: Arc<MutationQueue>,
	req: FlushRequest,
	sink: Option<Arc<dyn StorageSink>>,
	stop: channel::Receiver<()>,
	_instances: Arc<IndexInstMap>,
	_partitions: Arc<IndexPartitionMap>,
) -> Result<FlushStatus> {
	if req.mode == FlushMode::Persist && sink.is_none() {
		return Err(Error::ManagerInternal("persist flush requires a storage sink".into()));
	}

	for vb in req.change_vector.iter_enabled() {
		if let Err(channel::TryRecvError::Closed) = stop.try_recv() {
			warn!(stream = %req.stream_id, keyspace = %req.keyspace_id, "flush aborted via stop-channel");
			return Ok(FlushStatus::Aborted);
		}

		let target_seqno = req.target.seqno(vb);
		let mutations = queue.dequeue_until(vb, target_seqno);
		if req.mode == FlushMode::Persist {
			let sink = sink.as_ref().unwrap();
			let partition = (req.partition_of_vb)(vb);
			for m in &mutations {
				match m.op {
					MutationOp::Insert => sink.insert(&req.keyspace_id, partition, m),
					MutationOp::Upsert => sink.update(&req.keyspace_id, partition, m),
					MutationOp::Delete => sink.delete(&req.keyspace_id, partition, m),
				}
			}
		}
	}

	info!(stream = %req.stream_id, keyspace = %req.keyspace_id, mode = ?req.mode, "flush complete");
	Ok(FlushStatus::Success)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::queue::{MemoryCounter, OverflowPolicy};
	use parking_lot::Mutex;
	use std::collections::HashMap;

	#[derive(Default)]
	struct RecordingSink {
		inserts: Mutex<Vec<(u64, u64)>>, // (partition, seqno)
	}

	impl StorageSink for RecordingSink {
		fn insert(&self, _keyspace: &KeyspaceId, partition: u64, mutation: &Mutation) {
			self.inserts.lock().push((partition, mutation.seqno));
		}
		fn update(&self, _keyspace: &KeyspaceId, partition: u64, mutation: &Mutation) {
			self.inserts.lock().push((partition, mutation.seqno));
		}
		fn delete(&self, _keyspace: &KeyspaceId, _partition: u64, _mutation: &Mutation) {}
	}

	fn mutation(vb: u16, seqno: u64) -> Mutation {
		Mutation {
			vbucket: vb,
			seqno,
			vbuuid: 1,
			keyspace_id: KeyspaceId::from("b/s/c"),
			op: MutationOp::Upsert,
			document_key: b"k".to_vec(),
			payload: vec![0u8; 4],
		}
	}

	// S1 from spec §8.
	#[tokio::test]
	async fn persist_upto_target_leaves_remainder_and_applies_in_order() {
		let mem = MemoryCounter::new(1 << 20);
		let queue = Arc::new(MutationQueue::new(KeyspaceId::from("b/s/c"), 4, mem.clone(), OverflowPolicy::Block));
		for seqno in [10, 20, 30] {
			queue.enqueue(mutation(0, seqno)).await;
		}
		let used_before = mem.used();

		let mut target = TsVbuuid::new(4);
		target.set(0, 20, 1);
		let mut cv = ChangeVector::new(4);
		cv.set(0, true);

		let sink = Arc::new(RecordingSink::default());
		let (_stop_tx, stop_rx) = channel::bounded::<()>(1);

		let req = FlushRequest {
			stream_id: StreamId::Init,
			keyspace_id: KeyspaceId::from("b/s/c"),
			mode: FlushMode::Persist,
			target,
			change_vector: cv,
			partition_of_vb: Arc::new(|_vb| 0),
		};

		let status = run_flush(
			queue.clone(),
			req,
			Some(sink.clone()),
			stop_rx,
			Arc::new(HashMap::new()),
			Arc::new(HashMap::new()),
		)
		.await
		.unwrap();

		assert_eq!(status, FlushStatus::Success);
		assert_eq!(sink.inserts.lock().iter().map(|(_, s)| *s).collect::<Vec<_>>(), vec![10, 20]);
		assert_eq!(queue.low_water_ts()[0], 30);
		let remaining = queue.dequeue_until(0, 30);
		let freed_by_flush = used_before - mem.used() - remaining[0].byte_size() as i64;
		assert!(freed_by_flush > 0);
	}

	#[tokio::test]
	async fn drain_mode_discards_without_touching_sink() {
		let mem = MemoryCounter::new(1 << 20);
		let queue = Arc::new(MutationQueue::new(KeyspaceId::from("b/s/c"), 1, mem, OverflowPolicy::Block));
		queue.enqueue(mutation(0, 5)).await;

		let mut target = TsVbuuid::new(1);
		target.set(0, 5, 1);
		let mut cv = ChangeVector::new(1);
        cv.set(0, true);
		let (_stop_tx, stop_rx) = channel::bounded::<()>(1);

		let req = FlushRequest {
			stream_id: StreamId::Init,
			keyspace_id: KeyspaceId::from("b/s/c"),
			mode: FlushMode::Drain,
			target,
			change_vector: cv,
			partition_of_vb: Arc::new(|_vb| 0),
		};
		let status = run_flush(queue, req, None, stop_rx, Arc::new(HashMap::new()), Arc::new(HashMap::new()))
			.await
			.unwrap();
		assert_eq!(status, FlushStatus::Success);
	}

	#[tokio::test]
	async fn closing_stop_channel_aborts_without_processing_remaining_vbs() {
		let mem = MemoryCounter::new(1 << 20);
		let queue = Arc::new(MutationQueue::new(KeyspaceId::from("b/s/c"), 2, mem, OverflowPolicy::Block));
		queue.enqueue(mutation(0, 1)).await;
		queue.enqueue(mutation(1, 1)).await;

		let mut target = TsVbuuid::new(2);
		target.set(0, 1, 1);
		target.set(1, 1, 1);
		let cv = ChangeVector::all(2);

		let (stop_tx, stop_rx) = channel::bounded::<()>(1);
		stop_tx.close();

		let req = FlushRequest {
			stream_id: StreamId::Init,
			keyspace_id: KeyspaceId::from("b/s/c"),
			mode: FlushMode::Drain,
			target,
			change_vector: cv,
			partition_of_vb: Arc::new(|_vb| 0),
		};
		let status = run_flush(queue, req, None, stop_rx, Arc::new(HashMap::new()), Arc::new(HashMap::new()))
			.await
			.unwrap();
		assert_eq!(status, FlushStatus::Aborted);
	}
}
