//! Supervisor command/response vocabulary (spec §4.4 table). Every
//! command is paired with a dedicated reply channel by the caller (see
//! [`super::ManagerHandle::command`]), mirroring the reader's
//! command/reply/exit triple instead of overloading one channel.

use std::sync::Arc;

use crate::err::Error;
use crate::flusher::StorageSink;
use crate::reader::ProjectorEvent;
use crate::types::{ChangeVector, IndexDefn, IndexInstId, IndexInstMap, IndexPartitionMap, KeyspaceId, SessionId, StreamId, TsVbuuid};

pub struct OpenIndex {
	pub inst_id: IndexInstId,
	pub definition: IndexDefn,
}

pub enum Command {
	OpenStream {
		stream_id: StreamId,
		keyspace_id: KeyspaceId,
		indexes: Vec<OpenIndex>,
		restart_ts: TsVbuuid,
		session_id: SessionId,
		batch_rx: channel::Receiver<ProjectorEvent>,
	},
	AddIndexListToStream {
		stream_id: StreamId,
		keyspace_id: KeyspaceId,
		indexes: Vec<OpenIndex>,
		restart_ts: TsVbuuid,
		session_id: SessionId,
	},
	RemoveIndexListFromStream {
		stream_id: StreamId,
		keyspace_id: KeyspaceId,
		inst_ids: Vec<IndexInstId>,
	},
	RemoveKeyspaceFromStream {
		stream_id: StreamId,
		keyspace_id: KeyspaceId,
	},
	CloseStream {
		stream_id: StreamId,
	},
	CleanupStream {
		stream_id: StreamId,
	},
	PersistMutationQueue {
		stream_id: StreamId,
		keyspace_id: KeyspaceId,
		target: TsVbuuid,
		change_vector: ChangeVector,
		sink: Arc<dyn StorageSink>,
		partition_of_vb: Arc<dyn Fn(u16) -> u64 + Send + Sync>,
	},
	DrainMutationQueue {
		stream_id: StreamId,
		keyspace_id: KeyspaceId,
		target: TsVbuuid,
		change_vector: ChangeVector,
	},
	AbortPersist {
		stream_id: StreamId,
		keyspace_id: KeyspaceId,
	},
	GetMutationQueueHwt {
		stream_id: StreamId,
		keyspace_id: KeyspaceId,
	},
	GetMutationQueueLwt {
		stream_id: StreamId,
		keyspace_id: KeyspaceId,
	},
	UpdateIndexInstanceMap(Arc<IndexInstMap>),
	UpdateIndexPartitionMap(Arc<IndexPartitionMap>),
	ConfigSettingsUpdate(crate::config::IndexerConfig),
	IndexerPause,
	IndexerResume,
	IndexerSecurityChange,
	Shutdown,
}

#[derive(Debug, Clone)]
pub enum Response {
	Success,
	Ts(Vec<u64>),
	FlushDone { stream_id: StreamId, keyspace_id: KeyspaceId, target: Vec<u64> },
	FlushAborted { stream_id: StreamId, keyspace_id: KeyspaceId },
	StreamAlreadyClosed(StreamId),
	Error(String),
	UncleanShutdown(usize),
	/// Pass-through of a worker message the supervisor needs to see
	/// (spec §4.4 worker-message loop), e.g. STREAM_BEGIN/STREAM_END.
	Worker(crate::reader::WorkerMessage),
	Fatal(String),
}

impl From<Error> for Response {
	fn from(e: Error) -> Self {
		match e {
			Error::StreamAlreadyClosed(s) => Response::StreamAlreadyClosed(s),
			Error::UncleanShutdown(n) => Response::UncleanShutdown(n),
			other => Response::Error(other.to_string()),
		}
	}
}
