//! Mutation Manager (spec §4.4, component D): the sole point of control
//! over every stream, queue, reader and flusher. Exactly three
//! long-lived tasks per instance — supervisor, worker-message forwarder,
//! raw listener — funnel into each other the way spec §4.4 describes.

pub mod command;
mod latency;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::IndexerConfig;
use crate::flusher::{self, FlushMode, FlushRequest, FlushStatus};
use crate::queue::{MemoryCounter, MutationQueue, OverflowPolicy};
use crate::reader::{self, KeyspaceFilter, KeyspaceFilterMap, ReaderCommand, ReaderHandle, WorkerMessage};
use crate::types::{IndexInstId, IndexInstMap, IndexPartitionMap, KeyspaceId, SessionId, StreamId, TsVbuuid};

pub use command::{Command, OpenIndex, Response};
use latency::LatencyTable;

#[derive(Default)]
struct Streams {
	readers: HashMap<StreamId, ReaderHandle>,
	queues: HashMap<StreamId, HashMap<KeyspaceId, Arc<MutationQueue>>>,
	sessions: HashMap<StreamId, HashMap<KeyspaceId, SessionId>>,
	restarts: HashMap<StreamId, HashMap<KeyspaceId, TsVbuuid>>,
	indexes: HashMap<StreamId, HashMap<KeyspaceId, Vec<IndexInstId>>>,
}

impl Streams {
	fn is_open(&self, stream_id: StreamId) -> bool {
		self.readers.contains_key(&stream_id)
	}

	fn snapshot_filters(&self, stream_id: StreamId) -> KeyspaceFilterMap {
		let mut map = KeyspaceFilterMap::new();
		let Some(queues) = self.queues.get(&stream_id) else {
			return map;
		};
		for (ks, queue) in queues {
			let session_id = self.sessions.get(&stream_id).and_then(|m| m.get(ks)).copied().unwrap_or(0);
			let restart_ts = self
				.restarts
				.get(&stream_id)
				.and_then(|m| m.get(ks))
				.cloned()
				.unwrap_or_else(|| TsVbuuid::new(queue.num_vbuckets()));
			map.insert(ks.clone(), KeyspaceFilter { queue: queue.clone(), session_id, restart_ts });
		}
		map
	}
}

type FlusherStopMap = HashMap<StreamId, HashMap<KeyspaceId, channel::Sender<()>>>;

/// What callers hold: a command channel and the manager's async response
/// stream (FLUSH_DONE, forwarded worker messages, fatal errors).
pub struct ManagerHandle {
	cmd_tx: channel::Sender<(Command, channel::Sender<Response>)>,
	pub resp_rx: channel::Receiver<Response>,
}

impl ManagerHandle {
	/// Sends `cmd` and awaits its synchronous ack, per spec §4.4: "every
	/// command is acknowledged on the same channel before the next is
	/// accepted."
	pub async fn command(&self, cmd: Command) -> Response {
		let (reply_tx, reply_rx) = channel::bounded(1);
		if self.cmd_tx.send((cmd, reply_tx)).await.is_err() {
			return Response::Fatal("supervisor command channel closed".into());
		}
		reply_rx.recv().await.unwrap_or(Response::Fatal("supervisor reply channel closed".into()))
	}
}

struct ManagerState {
	streams: Mutex<Streams>,
	flusher_stop: Mutex<FlusherStopMap>,
	mem: MemoryCounter,
	config: RwLock<IndexerConfig>,
	index_inst_map: RwLock<Arc<IndexInstMap>>,
	index_partition_map: RwLock<Arc<IndexPartitionMap>>,
	latency: LatencyTable,
	flushers: Mutex<Vec<JoinHandle<()>>>,
	raw_tx: channel::Sender<WorkerMessage>,
	resp_tx: channel::Sender<Response>,
}

/// Spawns a Mutation Manager: the supervisor loop, the worker-message
/// forwarder, and the raw listener loop (spec §4.4 and §5).
pub fn spawn(config: IndexerConfig) -> (ManagerHandle, JoinHandle<()>) {
	let (cmd_tx, cmd_rx) = channel::unbounded::<(Command, channel::Sender<Response>)>();
	let (resp_tx, resp_rx) = channel::unbounded::<Response>();
	let (raw_tx, raw_rx) = channel::unbounded::<WorkerMessage>();
	let (internal_tx, internal_rx) = channel::bounded::<WorkerMessage>(crate::cnf::WORKER_MSG_QUEUE_LEN);

	let mem = MemoryCounter::new(config.effective_max_queue_mem());
	let state = Arc::new(ManagerState {
		streams: Mutex::new(Streams::default()),
		flusher_stop: Mutex::new(HashMap::new()),
		mem,
		config: RwLock::new(config),
		index_inst_map: RwLock::new(Arc::new(HashMap::new())),
		index_partition_map: RwLock::new(Arc::new(HashMap::new())),
		latency: LatencyTable::new(),
		flushers: Mutex::new(Vec::new()),
		raw_tx,
		resp_tx: resp_tx.clone(),
	});

	// Listener loop: classifies high-priority worker messages (a reader
	// panic), then funnels everything into the buffered internal queue.
	{
		let state = state.clone();
		let internal_tx = internal_tx.clone();
		tokio::spawn(async move {
			while let Ok(msg) = raw_rx.recv().await {
				if let WorkerMessage::Error { stream_id, code: reader::ErrorCode::StreamReaderPanic, .. } = &msg {
					error!(stream = %stream_id, "mutation manager observed stream reader panic");
					let mut streams = state.streams.lock();
					streams.readers.remove(stream_id);
				}
				if let WorkerMessage::StreamBegin { stream_id, keyspace_id, vbucket, node: Some(node) } = &msg {
					state.latency.record_stream_begin(*stream_id, keyspace_id.clone(), *vbucket, node.clone());
				}
				if internal_tx.send(msg).await.is_err() {
					break;
				}
			}
		});
	}

	// Worker-message forwarder: bridges the fast listener and the
	// potentially slow supervisor response consumer.
	{
		let resp_tx = resp_tx.clone();
		tokio::spawn(async move {
			while let Ok(msg) = internal_rx.recv().await {
				if resp_tx.send(Response::Worker(msg)).await.is_err() {
					break;
				}
			}
		});
	}

	let supervisor = {
		let state = state.clone();
		tokio::spawn(run_supervisor(state, cmd_rx))
	};

	(ManagerHandle { cmd_tx, resp_rx }, supervisor)
}

async fn run_supervisor(state: Arc<ManagerState>, cmd_rx: channel::Receiver<(Command, channel::Sender<Response>)>) {
	info!("mutation manager supervisor loop started");
	while let Ok((cmd, reply_tx)) = cmd_rx.recv().await {
		let is_shutdown = matches!(cmd, Command::Shutdown);
		let response = handle_command(&state, cmd).await;
		let _ = reply_tx.send(response).await;
		if is_shutdown {
			break;
		}
	}
	info!("mutation manager supervisor loop exiting");
}

async fn handle_command(state: &Arc<ManagerState>, cmd: Command) -> Response {
	match cmd {
		Command::OpenStream { stream_id, keyspace_id, indexes, restart_ts, session_id, batch_rx } => {
			handle_open_stream(state, stream_id, keyspace_id, indexes, restart_ts, session_id, batch_rx).await
		}
		Command::AddIndexListToStream { stream_id, keyspace_id, indexes, restart_ts, session_id } => {
			handle_add_index_list(state, stream_id, keyspace_id, indexes, restart_ts, session_id).await
		}
		Command::RemoveIndexListFromStream { stream_id, keyspace_id, inst_ids } => handle_remove_index_list(state, stream_id, keyspace_id, inst_ids).await,
		Command::RemoveKeyspaceFromStream { stream_id, keyspace_id } => handle_remove_keyspace(state, stream_id, keyspace_id).await,
		Command::CloseStream { stream_id } => handle_close_stream(state, stream_id).await,
		Command::CleanupStream { stream_id } => {
			cleanup_stream_tables(state, stream_id);
			Response::Success
		}
		Command::PersistMutationQueue { stream_id, keyspace_id, target, change_vector, sink, partition_of_vb } => {
			handle_flush(state, stream_id, keyspace_id, FlushMode::Persist, target, change_vector, Some(sink), partition_of_vb)
		}
		Command::DrainMutationQueue { stream_id, keyspace_id, target, change_vector } => {
			handle_flush(state, stream_id, keyspace_id, FlushMode::Drain, target, change_vector, None, Arc::new(|_| 0))
		}
		Command::AbortPersist { stream_id, keyspace_id } => handle_abort_persist(state, stream_id, keyspace_id),
		Command::GetMutationQueueHwt { stream_id, keyspace_id } => handle_get_ts(state, stream_id, keyspace_id, true),
		Command::GetMutationQueueLwt { stream_id, keyspace_id } => handle_get_ts(state, stream_id, keyspace_id, false),
		Command::UpdateIndexInstanceMap(map) => {
			*state.index_inst_map.write() = map;
			Response::Success
		}
		Command::UpdateIndexPartitionMap(map) => {
			*state.index_partition_map.write() = map;
			Response::Success
		}
		Command::ConfigSettingsUpdate(new_config) => {
			let cap = new_config.effective_max_queue_mem();
			*state.config.write() = new_config;
			state.mem.set_cap(cap);
			Response::Success
		}
		Command::IndexerPause => broadcast_to_readers(state, ReaderCommand::Pause).await,
		Command::IndexerResume => broadcast_to_readers(state, ReaderCommand::Resume).await,
		Command::IndexerSecurityChange => broadcast_to_readers(state, ReaderCommand::SecurityChange).await,
		Command::Shutdown => handle_shutdown(state).await,
	}
}

async fn handle_open_stream(
	state: &Arc<ManagerState>,
	stream_id: StreamId,
	keyspace_id: KeyspaceId,
	indexes: Vec<OpenIndex>,
	restart_ts: TsVbuuid,
	session_id: SessionId,
	batch_rx: channel::Receiver<reader::ProjectorEvent>,
) -> Response {
	let already_open = state.streams.lock().is_open(stream_id);
	if already_open {
		return handle_add_index_list(state, stream_id, keyspace_id, indexes, restart_ts, session_id).await;
	}

	let (num_vbuckets, num_workers, overflow) = {
		let cfg = state.config.read();
		(cfg.num_vbuckets as usize, cfg.num_workers, if cfg.block_on_queue_full { OverflowPolicy::Block } else { OverflowPolicy::Drop })
	};

	let queue = Arc::new(MutationQueue::new(keyspace_id.clone(), num_vbuckets, state.mem.clone(), overflow));
	let (handle, _join) = reader::spawn(stream_id, num_workers, batch_rx, state.raw_tx.clone());

	let mut filters = KeyspaceFilterMap::new();
	filters.insert(keyspace_id.clone(), KeyspaceFilter { queue: queue.clone(), session_id, restart_ts: restart_ts.clone() });
	if let Err(e) = handle.send(ReaderCommand::UpdateKeyspaces(filters)).await {
		return Response::from(e);
	}

	let inst_ids = indexes.iter().map(|i| i.inst_id).collect();
	let mut streams = state.streams.lock();
	streams.readers.insert(stream_id, handle);
	streams.queues.entry(stream_id).or_default().insert(keyspace_id.clone(), queue);
	streams.sessions.entry(stream_id).or_default().insert(keyspace_id.clone(), session_id);
	streams.restarts.entry(stream_id).or_default().insert(keyspace_id.clone(), restart_ts);
	streams.indexes.entry(stream_id).or_default().insert(keyspace_id, inst_ids);
	Response::Success
}

async fn handle_add_index_list(
	state: &Arc<ManagerState>,
	stream_id: StreamId,
	keyspace_id: KeyspaceId,
	indexes: Vec<OpenIndex>,
	restart_ts: TsVbuuid,
	session_id: SessionId,
) -> Response {
	let (num_vbuckets, overflow) = {
		let cfg = state.config.read();
		(cfg.num_vbuckets as usize, if cfg.block_on_queue_full { OverflowPolicy::Block } else { OverflowPolicy::Drop })
	};

	let reader_handle = {
		let streams = state.streams.lock();
		if !streams.is_open(stream_id) {
			return Response::StreamAlreadyClosed(stream_id);
		}
		// Cloning the sender is cheap; the handle itself stays owned by
		// the manager's table.
		match streams.readers.get(&stream_id) {
			Some(h) => ReaderHandle { cmd_tx: h.cmd_tx.clone(), exit_rx: h.exit_rx.clone() },
			None => return Response::StreamAlreadyClosed(stream_id),
		}
	};

	let existing_queue = state.streams.lock().queues.get(&stream_id).and_then(|m| m.get(&keyspace_id)).cloned();
	let queue = existing_queue.unwrap_or_else(|| Arc::new(MutationQueue::new(keyspace_id.clone(), num_vbuckets, state.mem.clone(), overflow)));

	let mut tentative = state.streams.lock().snapshot_filters(stream_id);
	tentative.insert(keyspace_id.clone(), KeyspaceFilter { queue: queue.clone(), session_id, restart_ts: restart_ts.clone() });

	if let Err(e) = reader_handle.send(ReaderCommand::UpdateKeyspaces(tentative)).await {
		return Response::from(e);
	}

	let inst_ids = indexes.iter().map(|i| i.inst_id).collect();
	let mut streams = state.streams.lock();
	streams.queues.entry(stream_id).or_default().insert(keyspace_id.clone(), queue);
	streams.sessions.entry(stream_id).or_default().insert(keyspace_id.clone(), session_id);
	streams.restarts.entry(stream_id).or_default().insert(keyspace_id.clone(), restart_ts);
	streams.indexes.entry(stream_id).or_default().insert(keyspace_id, inst_ids);
	Response::Success
}

async fn handle_remove_index_list(state: &Arc<ManagerState>, stream_id: StreamId, keyspace_id: KeyspaceId, inst_ids: Vec<IndexInstId>) -> Response {
	let reader_handle = {
		let streams = state.streams.lock();
		if !streams.is_open(stream_id) {
			return Response::StreamAlreadyClosed(stream_id);
		}
		streams.readers.get(&stream_id).map(|h| ReaderHandle { cmd_tx: h.cmd_tx.clone(), exit_rx: h.exit_rx.clone() })
	};
	let Some(reader_handle) = reader_handle else {
		return Response::StreamAlreadyClosed(stream_id);
	};

	let queue_still_referenced;
	{
		let mut streams = state.streams.lock();
		if let Some(list) = streams.indexes.get_mut(&stream_id).and_then(|m| m.get_mut(&keyspace_id)) {
			list.retain(|id| !inst_ids.contains(id));
			queue_still_referenced = !list.is_empty();
		} else {
			queue_still_referenced = false;
		}
		if !queue_still_referenced {
			if let Some(q) = streams.queues.get(&stream_id).and_then(|m| m.get(&keyspace_id)) {
				q.destroy();
			}
			streams.queues.get_mut(&stream_id).map(|m| m.remove(&keyspace_id));
			streams.sessions.get_mut(&stream_id).map(|m| m.remove(&keyspace_id));
			streams.restarts.get_mut(&stream_id).map(|m| m.remove(&keyspace_id));
			streams.indexes.get_mut(&stream_id).map(|m| m.remove(&keyspace_id));
		}
	}

	let snapshot = state.streams.lock().snapshot_filters(stream_id);
	match reader_handle.send(ReaderCommand::UpdateKeyspaces(snapshot)).await {
		Ok(_) => Response::Success,
		Err(e) => Response::from(e),
	}
}

async fn handle_remove_keyspace(state: &Arc<ManagerState>, stream_id: StreamId, keyspace_id: KeyspaceId) -> Response {
	let reader_handle = {
		let streams = state.streams.lock();
		if !streams.is_open(stream_id) {
			return Response::StreamAlreadyClosed(stream_id);
		}
		streams.readers.get(&stream_id).map(|h| ReaderHandle { cmd_tx: h.cmd_tx.clone(), exit_rx: h.exit_rx.clone() })
	};
	let Some(reader_handle) = reader_handle else {
		return Response::StreamAlreadyClosed(stream_id);
	};

	let remaining_after_removal = {
		let mut streams = state.streams.lock();
		if let Some(q) = streams.queues.get(&stream_id).and_then(|m| m.get(&keyspace_id)) {
			q.destroy();
		}
		streams.queues.get_mut(&stream_id).map(|m| m.remove(&keyspace_id));
		streams.sessions.get_mut(&stream_id).map(|m| m.remove(&keyspace_id));
		streams.restarts.get_mut(&stream_id).map(|m| m.remove(&keyspace_id));
		streams.indexes.get_mut(&stream_id).map(|m| m.remove(&keyspace_id));
		streams.queues.get(&stream_id).map(|m| !m.is_empty()).unwrap_or(false)
	};

	if !remaining_after_removal {
		return shutdown_one_reader(state, stream_id, reader_handle).await;
	}

	let snapshot = state.streams.lock().snapshot_filters(stream_id);
	match reader_handle.send(ReaderCommand::UpdateKeyspaces(snapshot)).await {
		Ok(_) => Response::Success,
		Err(e) => Response::from(e),
	}
}

async fn handle_close_stream(state: &Arc<ManagerState>, stream_id: StreamId) -> Response {
	let reader_handle = {
		let mut streams = state.streams.lock();
		if !streams.is_open(stream_id) {
			return Response::StreamAlreadyClosed(stream_id);
		}
		streams.readers.remove(&stream_id)
	};
	if let Some(handle) = reader_handle {
		let _ = handle.send(ReaderCommand::Shutdown).await;
	}
	cleanup_stream_tables(state, stream_id);
	Response::Success
}

async fn shutdown_one_reader(state: &Arc<ManagerState>, stream_id: StreamId, reader_handle: ReaderHandle) -> Response {
	let _ = reader_handle.send(ReaderCommand::Shutdown).await;
	state.streams.lock().readers.remove(&stream_id);
	cleanup_stream_tables(state, stream_id);
	Response::Success
}

fn cleanup_stream_tables(state: &Arc<ManagerState>, stream_id: StreamId) {
	let mut streams = state.streams.lock();
	streams.readers.remove(&stream_id);
	streams.queues.remove(&stream_id);
	streams.sessions.remove(&stream_id);
	streams.restarts.remove(&stream_id);
	streams.indexes.remove(&stream_id);
	drop(streams);
	state.flusher_stop.lock().remove(&stream_id);
	state.latency.cleanup_stream(stream_id);
}

fn handle_flush(
	state: &Arc<ManagerState>,
	stream_id: StreamId,
	keyspace_id: KeyspaceId,
	mode: FlushMode,
	target: TsVbuuid,
	change_vector: crate::types::ChangeVector,
	sink: Option<Arc<dyn flusher::StorageSink>>,
	partition_of_vb: Arc<dyn Fn(u16) -> u64 + Send + Sync>,
) -> Response {
	let Some(queue) = state.streams.lock().queues.get(&stream_id).and_then(|m| m.get(&keyspace_id)).cloned() else {
		return Response::StreamAlreadyClosed(stream_id);
	};

	let (stop_tx, stop_rx) = channel::bounded::<()>(1);
	{
		let mut stop_map = state.flusher_stop.lock();
		stop_map.entry(stream_id).or_default().insert(keyspace_id.clone(), stop_tx);
	}

	let instances = state.index_inst_map.read().clone();
	let partitions = state.index_partition_map.read().clone();
	let resp_tx = state.resp_tx.clone();
	let target_for_msg: Vec<u64> = (0..target.len() as u16).map(|vb| target.seqno(vb)).collect();
	let flusher_state = state.clone();

	let req = FlushRequest {
		stream_id,
		keyspace_id: keyspace_id.clone(),
		mode,
		target,
		change_vector,
		partition_of_vb,
	};

	let join = tokio::spawn(async move {
		let result = flusher::run_flush(queue, req, sink, stop_rx, instances, partitions).await;
		flusher_state.flusher_stop.lock().get_mut(&stream_id).map(|m| m.remove(&keyspace_id));
		let response = match result {
			Ok(FlushStatus::Success) => Response::FlushDone { stream_id, keyspace_id, target: target_for_msg },
			Ok(FlushStatus::Aborted) => Response::FlushAborted { stream_id, keyspace_id },
			Err(e) => Response::Error(e.to_string()),
		};
		let _ = resp_tx.send(response).await;
	});
	state.flushers.lock().push(join);

	Response::Success
}

fn handle_abort_persist(state: &Arc<ManagerState>, stream_id: StreamId, keyspace_id: KeyspaceId) -> Response {
	let stop_tx = state.flusher_stop.lock().get_mut(&stream_id).and_then(|m| m.remove(&keyspace_id));
	match stop_tx {
		Some(tx) => {
			tx.close();
			Response::Success
		}
		None => Response::Error(format!("no in-flight flush for {stream_id:?}/{keyspace_id}")),
	}
}

fn handle_get_ts(state: &Arc<ManagerState>, stream_id: StreamId, keyspace_id: KeyspaceId, high: bool) -> Response {
	let Some(queue) = state.streams.lock().queues.get(&stream_id).and_then(|m| m.get(&keyspace_id)).cloned() else {
		return Response::StreamAlreadyClosed(stream_id);
	};
	let ts = if high { queue.high_water_ts() } else { queue.low_water_ts() };
	Response::Ts(ts)
}

async fn broadcast_to_readers(state: &Arc<ManagerState>, cmd_template: ReaderCommand) -> Response {
	let handles: Vec<(StreamId, ReaderHandle)> = {
		let streams = state.streams.lock();
		streams.readers.iter().map(|(id, h)| (*id, ReaderHandle { cmd_tx: h.cmd_tx.clone(), exit_rx: h.exit_rx.clone() })).collect()
	};

	let is_pause = matches!(cmd_template, ReaderCommand::Pause);
	let mut first_error: Option<String> = None;
	for (stream_id, handle) in handles {
		let cmd = match cmd_template {
			ReaderCommand::Pause => ReaderCommand::Pause,
			ReaderCommand::Resume => ReaderCommand::Resume,
			ReaderCommand::SecurityChange => ReaderCommand::SecurityChange,
			_ => unreachable!("broadcast_to_readers only used for pause/resume/security"),
		};
		if let Err(e) = handle.send(cmd).await {
			error!(stream = %stream_id, "broadcast failed: {e}");
			first_error.get_or_insert(e.to_string());
		}
	}

	match first_error {
		Some(e) if is_pause => Response::Fatal(e),
		Some(e) => Response::Error(e),
		None => Response::Success,
	}
}

async fn handle_shutdown(state: &Arc<ManagerState>) -> Response {
	info!("mutation manager shutting down");
	let handles: Vec<ReaderHandle> = {
		let mut streams = state.streams.lock();
		streams.readers.drain().map(|(_, h)| h).collect()
	};

	let mut unclean = 0usize;
	for handle in handles {
		if handle.send(ReaderCommand::Shutdown).await.is_err() {
			unclean += 1;
		}
	}

	let stop_senders: Vec<channel::Sender<()>> = {
		let mut stop_map = state.flusher_stop.lock();
		stop_map.drain().flat_map(|(_, m)| m.into_values()).collect()
	};
	for tx in stop_senders {
		tx.close();
	}

	let joins: Vec<JoinHandle<()>> = state.flushers.lock().drain(..).collect();
	for j in joins {
		let _ = j.await;
	}

	if unclean > 0 {
		Response::UncleanShutdown(unclean)
	} else {
		Response::Success
	}
}
