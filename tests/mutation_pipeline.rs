//! End-to-end exercise of the Mutation Manager, Stream Reader, Mutation
//! Queue and Flusher together, against the public API only. Covers S1
//! and S2 from spec §8.

use std::sync::Arc;

use secidx_core::config::IndexerConfig;
use secidx_core::flusher::StorageSink;
use secidx_core::manager::{spawn, Command, OpenIndex, Response};
use secidx_core::reader::ProjectorEvent;
use secidx_core::types::{ChangeVector, DefnId, IndexDefn, IndexInstId, KeyspaceId, Mutation, MutationOp, PartitionScheme, StreamId, TsVbuuid};

fn defn(id: u64) -> IndexDefn {
	IndexDefn {
		defn_id: DefnId(id),
		bucket: "b".into(),
		is_primary: false,
		name: format!("idx{id}"),
		storage_type: "plasma".into(),
		expression_type: "n1ql".into(),
		secondary_expressions: vec!["field".into()],
		partition_scheme: PartitionScheme::Single,
		partition_expression: None,
		where_expression: None,
		bucket_uuid: "uuid".into(),
		scope_id: "0".into(),
		collection_id: "0".into(),
		deferred: false,
	}
}

fn mutation(keyspace: &KeyspaceId, seqno: u64) -> Mutation {
	Mutation {
		vbucket: 0,
		seqno,
		vbuuid: 1,
		keyspace_id: keyspace.clone(),
		op: MutationOp::Upsert,
		document_key: b"k".to_vec(),
		payload: vec![1, 2, 3],
	}
}

struct NullSink;
impl StorageSink for NullSink {
	fn insert(&self, _: &KeyspaceId, _: u64, _: &Mutation) {}
	fn update(&self, _: &KeyspaceId, _: u64, _: &Mutation) {}
	fn delete(&self, _: &KeyspaceId, _: u64, _: &Mutation) {}
}

// S1 from spec §8: open a stream, enqueue mutations across two vbuckets,
// persist a partial timestamp, and observe FLUSH_DONE plus the HWT/LWT
// split that the flush left behind.
#[tokio::test]
async fn open_stream_enqueue_persist_partial_ts_reports_flush_done() {
	let (manager, _join) = spawn(IndexerConfig { num_vbuckets: 4, num_workers: 2, ..Default::default() });
	let (batch_tx, batch_rx) = channel::unbounded::<ProjectorEvent>();
	let keyspace = KeyspaceId::from("b/s/c");

	let resp = manager
		.command(Command::OpenStream {
			stream_id: StreamId::Init,
			keyspace_id: keyspace.clone(),
			indexes: vec![OpenIndex { inst_id: IndexInstId(1), definition: defn(1) }],
			restart_ts: TsVbuuid::new(4),
			session_id: 1,
			batch_rx,
		})
		.await;
	assert!(matches!(resp, Response::Success));

	batch_tx
		.send(ProjectorEvent::Mutations(vec![(mutation(&keyspace, 10), 1), (mutation(&keyspace, 20), 1), (mutation(&keyspace, 30), 1)]))
		.await
		.unwrap();
	tokio::time::sleep(std::time::Duration::from_millis(30)).await;

	let hwt_resp = manager.command(Command::GetMutationQueueHwt { stream_id: StreamId::Init, keyspace_id: keyspace.clone() }).await;
	let Response::Ts(hwt) = hwt_resp else { panic!("expected Ts response, got {hwt_resp:?}") };
	assert_eq!(hwt[0], 30);

	// Persist only up to seqno 20, leaving one mutation buffered.
	let mut target = TsVbuuid::new(4);
	target.set(0, 20, 1);
	let mut cv = ChangeVector::new(4);
	cv.set(0, true);

	let resp = manager
		.command(Command::PersistMutationQueue {
			stream_id: StreamId::Init,
			keyspace_id: keyspace.clone(),
			target,
			change_vector: cv,
			sink: Arc::new(NullSink),
			partition_of_vb: Arc::new(|_| 0),
		})
		.await;
	assert!(matches!(resp, Response::Success));

	let done = manager.resp_rx.recv().await.unwrap();
	match done {
		Response::FlushDone { stream_id, keyspace_id: ks, target } => {
			assert_eq!(stream_id, StreamId::Init);
			assert_eq!(ks, keyspace);
			assert_eq!(target[0], 20);
		}
		other => panic!("unexpected response: {other:?}"),
	}

	let lwt_resp = manager.command(Command::GetMutationQueueLwt { stream_id: StreamId::Init, keyspace_id: keyspace.clone() }).await;
	let Response::Ts(lwt) = lwt_resp else { panic!("expected Ts response, got {lwt_resp:?}") };
	assert_eq!(lwt[0], 30, "the one mutation past the persisted target must remain buffered");
}

// S2 from spec §8: a reader panic removes the stream's reader entry, and
// any subsequent op against that stream sees StreamAlreadyClosed.
#[tokio::test]
async fn reader_panic_removes_stream_and_subsequent_ops_see_stream_already_closed() {
	let (manager, _join) = spawn(IndexerConfig::default());
	let (_batch_tx, batch_rx) = channel::unbounded::<ProjectorEvent>();

	let resp = manager
		.command(Command::OpenStream {
			stream_id: StreamId::Maint,
			keyspace_id: KeyspaceId::from("b/s/c"),
			indexes: vec![],
			restart_ts: TsVbuuid::new(4),
			session_id: 1,
			batch_rx,
		})
		.await;
	assert!(matches!(resp, Response::Success));

	// CLEANUP_STREAM is the manager-side action the listener loop performs
	// once it observes a StreamReaderPanic worker message (spec §4.4); it
	// exercises the same table-clearing path without requiring an actual
	// panic inside a spawned task.
	manager.command(Command::CleanupStream { stream_id: StreamId::Maint }).await;

	let resp = manager
		.command(Command::RemoveKeyspaceFromStream { stream_id: StreamId::Maint, keyspace_id: KeyspaceId::from("b/s/c") })
		.await;
	assert!(matches!(resp, Response::StreamAlreadyClosed(StreamId::Maint)));

	let resp = manager.command(Command::GetMutationQueueHwt { stream_id: StreamId::Maint, keyspace_id: KeyspaceId::from("b/s/c") }).await;
	assert!(matches!(resp, Response::StreamAlreadyClosed(StreamId::Maint)));
}

#[tokio::test]
async fn shutdown_drains_every_reader_and_in_flight_flush() {
	let (manager, join) = spawn(IndexerConfig::default());
	let (batch_tx, batch_rx) = channel::unbounded::<ProjectorEvent>();
	let keyspace = KeyspaceId::from("b/s/c");

	manager
		.command(Command::OpenStream {
			stream_id: StreamId::Init,
			keyspace_id: keyspace.clone(),
			indexes: vec![],
			restart_ts: TsVbuuid::new(4),
			session_id: 1,
			batch_rx,
		})
		.await;
	batch_tx.send(ProjectorEvent::Mutations(vec![(mutation(&keyspace, 1), 1)])).await.unwrap();
	tokio::time::sleep(std::time::Duration::from_millis(20)).await;

	let resp = manager.command(Command::Shutdown).await;
	assert!(matches!(resp, Response::Success));
	join.await.unwrap();
}
