//! Scan Client (spec §4.6, component F): a pooled streaming RPC client
//! for lookup/range/multi-scan/aggregate queries against the index
//! server. Unlike the other components, it owns no long-lived tasks —
//! every call runs on the caller's task, except the detached drain task
//! spawned for graceful mid-stream cancellation (spec §5).

pub mod client;
pub mod pool;
pub mod request;

pub use client::{FrameHandler, GsiScanClient, ScanTransport};
pub use pool::{Connection, ConnectionPool, PooledConnection};
pub use request::*;

/// Errors raised at or below the query-port client boundary (spec §7).
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ScanError {
	/// Unary call received an unexpected extra frame after its single
	/// response, or any other framing contract violation.
	#[error("protocol error: unexpected frame")]
	Protocol,
	/// Deadline expiry, EOF, or connection reset.
	#[error("transport error: {0}")]
	Transport(String),
	/// No connection became available within the configured acquire
	/// timeout.
	#[error("connection pool exhausted")]
	Pool,
}
