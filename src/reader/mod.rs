//! Stream Reader (spec §4.2, component B): accepts framed mutation
//! batches from the external projector (out of scope, spec §1) and
//! routes them into per-keyspace queues through a pool of worker tasks.

mod worker;

pub use worker::{KeyspaceFilter, KeyspaceFilterMap, SharedState};

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::types::{KeyspaceId, Mutation, SessionId, StreamId, Vbucket};
use worker::{worker_loop, WorkItem};

/// One frame arriving from the projector transport. The wire codec
/// itself is out of scope (spec §1); this is what's left after framing.
pub enum ProjectorEvent {
	Mutations(Vec<(Mutation, SessionId)>),
	StreamBegin { vbucket: Vbucket, keyspace_id: KeyspaceId, node: Option<String> },
	StreamEnd { vbucket: Vbucket, keyspace_id: KeyspaceId },
	ConnError(String),
	SystemEvent { vbucket: Vbucket, keyspace_id: KeyspaceId },
}

/// Messages a reader (or one of its workers) reports to the Mutation
/// Manager. Named after the Go `STREAM_READER_*` message family.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
	StreamDropData { stream_id: StreamId, keyspace_id: KeyspaceId, reason: String },
	StreamEnd { stream_id: StreamId, keyspace_id: KeyspaceId, vbucket: Vbucket },
	StreamBegin { stream_id: StreamId, keyspace_id: KeyspaceId, vbucket: Vbucket, node: Option<String> },
	ConnError { stream_id: StreamId, reason: String },
	Hwt { stream_id: StreamId, keyspace_id: KeyspaceId },
	SystemEvent { stream_id: StreamId, keyspace_id: KeyspaceId, vbucket: Vbucket },
	Error { stream_id: StreamId, code: ErrorCode, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
	StreamReaderPanic,
	Generic,
}

/// Admin commands the Mutation Manager sends to a running reader. Each
/// is paired with a dedicated reply sender so the manager can wait for
/// the ack on that same logical exchange (spec §9 "Command/response"
/// design note): reimplemented here as a command channel plus a
/// per-call reply channel plus a shared exit channel, instead of one
/// channel serving double duty.
pub enum ReaderCommand {
	UpdateKeyspaces(KeyspaceFilterMap),
	Pause,
	Resume,
	SecurityChange,
	Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderReply {
	Ack,
	Error(String),
}

/// What the Mutation Manager holds for a running reader.
pub struct ReaderHandle {
	pub cmd_tx: channel::Sender<(ReaderCommand, channel::Sender<ReaderReply>)>,
	pub exit_rx: channel::Receiver<()>,
}

impl ReaderHandle {
	/// Sends `cmd` and awaits its reply, but never blocks past the
	/// reader's exit — a dead reader can't hang the caller. Per spec §5
	/// "Locking discipline": this helper is the only way the manager
	/// talks to a reader, so the select-against-exit rule is applied in
	/// exactly one place.
	pub async fn send(&self, cmd: ReaderCommand) -> Result<ReaderReply, crate::err::Error> {
		let (reply_tx, reply_rx) = channel::bounded(1);
		tokio::select! {
			biased;
			_ = self.exit_rx.recv() => Err(crate::err::Error::ChannelClosed("reader exit channel")),
			send_res = self.cmd_tx.send((cmd, reply_tx)) => {
				send_res.map_err(|_| crate::err::Error::ChannelClosed("reader command channel"))?;
				tokio::select! {
					biased;
					_ = self.exit_rx.recv() => Err(crate::err::Error::ChannelClosed("reader exit channel")),
					reply = reply_rx.recv() => reply.map_err(|_| crate::err::Error::ChannelClosed("reader reply channel")),
				}
			}
		}
	}
}

/// Guard that turns an unexpected panic inside the reader's run loop
/// into a fatal [`WorkerMessage::Error`] plus a closed exit channel —
/// the async equivalent of the Go indexer's `recover()`-based
/// `panicHandler`. A normal shutdown drops this guard too, but by then
/// `armed` has been disarmed so it's a no-op.
struct PanicGuard {
	stream_id: StreamId,
	raw_tx: channel::Sender<WorkerMessage>,
	armed: bool,
}

impl Drop for PanicGuard {
	fn drop(&mut self) {
		if self.armed && std::thread::panicking() {
			error!(stream = %self.stream_id, "stream reader panicked");
			let _ = self.raw_tx.try_send(WorkerMessage::Error {
				stream_id: self.stream_id,
				code: ErrorCode::StreamReaderPanic,
				message: "stream reader panic".to_string(),
			});
		}
	}
}

/// Spawns a reader for `stream_id`: one main command/dispatch loop plus
/// `num_workers` worker tasks. `batch_rx` stands in for the projector
/// transport (out of scope). `raw_tx` is the manager's raw receive
/// channel (spec §4.4, component 3 "listener loop").
pub fn spawn(
	stream_id: StreamId,
	num_workers: usize,
	batch_rx: channel::Receiver<ProjectorEvent>,
	raw_tx: channel::Sender<WorkerMessage>,
) -> (ReaderHandle, JoinHandle<()>) {
	let (cmd_tx, cmd_rx) = channel::unbounded();
	let (exit_tx, exit_rx) = channel::bounded::<()>(1);

	let state = Arc::new(SharedState::new());
	let mut worker_txs = Vec::with_capacity(num_workers);
	let mut worker_handles = Vec::with_capacity(num_workers);
	for _ in 0..num_workers {
		let (tx, rx) = channel::unbounded::<WorkItem>();
		worker_txs.push(tx);
		let state = state.clone();
		let raw_tx = raw_tx.clone();
		worker_handles.push(tokio::spawn(worker_loop(stream_id, state, rx, raw_tx)));
	}

	let join = tokio::spawn(run_reader(stream_id, state, cmd_rx, batch_rx, worker_txs, raw_tx, exit_tx));

	(ReaderHandle { cmd_tx, exit_rx }, join)
}

fn worker_index_for(vb: Vbucket, num_workers: usize) -> usize {
	vb as usize % num_workers
}

async fn run_reader(
	stream_id: StreamId,
	state: Arc<SharedState>,
	cmd_rx: channel::Receiver<(ReaderCommand, channel::Sender<ReaderReply>)>,
	batch_rx: channel::Receiver<ProjectorEvent>,
	worker_txs: Vec<channel::Sender<WorkItem>>,
	raw_tx: channel::Sender<WorkerMessage>,
	exit_tx: channel::Sender<()>,
) {
	let mut guard = PanicGuard {
		stream_id,
		raw_tx: raw_tx.clone(),
		armed: true,
	};
	let mut paused = false;

	'outer: loop {
		tokio::select! {
			cmd = cmd_rx.recv() => {
				let Ok((cmd, reply_tx)) = cmd else { break 'outer };
				match cmd {
					ReaderCommand::UpdateKeyspaces(map) => {
						*state.keyspaces.write() = map;
						let _ = reply_tx.send(ReaderReply::Ack).await;
					}
					ReaderCommand::Pause => {
						paused = true;
						let _ = reply_tx.send(ReaderReply::Ack).await;
					}
					ReaderCommand::Resume => {
						paused = false;
						let _ = reply_tx.send(ReaderReply::Ack).await;
					}
					ReaderCommand::SecurityChange => {
						let _ = reply_tx.send(ReaderReply::Ack).await;
					}
					ReaderCommand::Shutdown => {
						let _ = reply_tx.send(ReaderReply::Ack).await;
						break 'outer;
					}
				}
			}
			event = batch_rx.recv(), if !paused => {
				let Ok(event) = event else { break 'outer };
				dispatch(&worker_txs, &raw_tx, stream_id, event).await;
			}
		}
	}

	guard.armed = false;
	drop(guard);
	exit_tx.close();
}

async fn dispatch(worker_txs: &[channel::Sender<WorkItem>], raw_tx: &channel::Sender<WorkerMessage>, stream_id: StreamId, event: ProjectorEvent) {
	let n = worker_txs.len();
	match event {
		ProjectorEvent::Mutations(batch) => {
			for (mutation, session_id) in batch {
				let idx = worker_index_for(mutation.vbucket, n);
				let _ = worker_txs[idx].send(WorkItem::Mutation { mutation, session_id }).await;
			}
		}
		ProjectorEvent::StreamBegin { vbucket, keyspace_id, node } => {
			let idx = worker_index_for(vbucket, n);
			let _ = worker_txs[idx].send(WorkItem::StreamBegin { vbucket, keyspace_id, node }).await;
		}
		ProjectorEvent::StreamEnd { vbucket, keyspace_id } => {
			let idx = worker_index_for(vbucket, n);
			let _ = worker_txs[idx].send(WorkItem::StreamEnd { vbucket, keyspace_id }).await;
		}
		ProjectorEvent::SystemEvent { vbucket, keyspace_id } => {
			let idx = worker_index_for(vbucket, n);
			let _ = worker_txs[idx].send(WorkItem::SystemEvent { vbucket, keyspace_id }).await;
		}
		ProjectorEvent::ConnError(reason) => {
			let _ = raw_tx.send(WorkerMessage::ConnError { stream_id, reason }).await;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::queue::{MemoryCounter, MutationQueue, OverflowPolicy};
	use crate::types::{MutationOp, TsVbuuid};

	fn mutation(vb: Vbucket, seqno: u64) -> Mutation {
		Mutation {
			vbucket: vb,
			seqno,
			vbuuid: 1,
			keyspace_id: KeyspaceId::from("b/s/c"),
			op: MutationOp::Upsert,
			document_key: b"k".to_vec(),
			payload: vec![1, 2, 3, 4],
		}
	}

	#[tokio::test]
	async fn open_reader_enqueues_mutations_delivered_to_matching_keyspace() {
		let (batch_tx, batch_rx) = channel::unbounded();
		let (raw_tx, raw_rx) = channel::unbounded();
		let (handle, _join) = spawn(StreamId::Maint, 2, batch_rx, raw_tx);

		let mem = MemoryCounter::new(1 << 20);
		let queue = Arc::new(MutationQueue::new(KeyspaceId::from("b/s/c"), 4, mem, OverflowPolicy::Block));
		let mut map = KeyspaceFilterMap::new();
		map.insert(
			KeyspaceId::from("b/s/c"),
			KeyspaceFilter {
				queue: queue.clone(),
				session_id: 1,
				restart_ts: TsVbuuid::new(4),
			},
		);
		handle.send(ReaderCommand::UpdateKeyspaces(map)).await.unwrap();

		batch_tx.send(ProjectorEvent::Mutations(vec![(mutation(0, 10), 1), (mutation(0, 20), 1)])).await.unwrap();

		// Give the worker a chance to drain the channel.
		tokio::time::sleep(std::time::Duration::from_millis(20)).await;
		let hwt = queue.high_water_ts();
		assert_eq!(hwt[0], 20);

		handle.send(ReaderCommand::Shutdown).await.unwrap();
		drop(raw_rx);
	}

	#[tokio::test]
	async fn shutdown_closes_exit_channel() {
		let (_batch_tx, batch_rx) = channel::unbounded();
		let (raw_tx, _raw_rx) = channel::unbounded();
		let (handle, join) = spawn(StreamId::Init, 1, batch_rx, raw_tx);
		handle.send(ReaderCommand::Shutdown).await.unwrap();
		join.await.unwrap();
		assert!(handle.exit_rx.recv().await.is_err());
	}
}
