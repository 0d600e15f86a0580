//! Crate-wide error type. One enum covers every subsystem boundary named
//! in spec §7; subsystem-local errors (scheduler, scan client) convert
//! into and out of it at their seams, the way `RpcError`/`err::Error`
//! convert into one another in the teacher crate.

use thiserror::Error;

use crate::types::{KeyspaceId, StreamId};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
	/// A stream reader task panicked. Fatal for that stream; the manager
	/// has already closed the reader's exit channel and dropped it from
	/// its tables by the time this is observed.
	#[error("stream reader for {0:?} panicked: {1}")]
	StreamReaderPanic(StreamId, String),

	/// An admin operation was issued against a stream that does not
	/// exist (or was already closed). Normal severity, not fatal.
	#[error("stream {0:?} is not open")]
	StreamAlreadyClosed(StreamId),

	/// The mutation queue for a keyspace could not be allocated.
	#[error("failed to initialize mutation queue for {stream:?}/{keyspace}: {reason}")]
	MutationQueueInit {
		stream: StreamId,
		keyspace: KeyspaceId,
		reason: String,
	},

	/// Internal invariant broken: a reply channel was dropped before a
	/// response could be delivered, a command arrived with a mismatched
	/// stream, etc.
	#[error("mutation manager internal error: {0}")]
	ManagerInternal(String),

	/// At least one stream reader failed to acknowledge shutdown within
	/// its own close sequence.
	#[error("unclean shutdown: {0} reader(s) did not acknowledge shutdown")]
	UncleanShutdown(usize),

	/// A flush was aborted via its stop-channel before reaching its
	/// target timestamp.
	#[error("flush of {stream:?}/{keyspace} aborted before reaching target ts")]
	FlushAborted { stream: StreamId, keyspace: KeyspaceId },

	#[error("channel closed unexpectedly: {0}")]
	ChannelClosed(&'static str),

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
