//! Pooled streaming query-port client (spec §4.6, component F).
//!
//! The framed-packet codec and the bytes-on-the-wire layer are external
//! collaborators (spec §1); [`ScanTransport`] is the seam a concrete
//! codec binds to. Everything above that seam — the Helo/version
//! handshake, the unary extra-frame check, the four-step streaming loop,
//! and graceful mid-stream cancellation — is implemented here.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::pool::{Connection, ConnectionPool, PooledConnection};
use super::request::*;
use super::ScanError;

/// What a concrete wire codec implements on behalf of this client. One
/// instance is bound to exactly one pooled connection.
#[async_trait::async_trait]
pub trait ScanTransport: Connection {
	async fn helo(&mut self, req: HeloRequest) -> Result<HeloResponse, ScanError>;
	async fn statistics(&mut self, req: StatisticsRequest) -> Result<StatisticsResponse, ScanError>;
	async fn count(&mut self, req: CountRequest) -> Result<CountResponse, ScanError>;
	async fn start_scan(&mut self, req: ScanRequest) -> Result<(), ScanError>;
	async fn start_scan_all(&mut self, req: ScanAllRequest) -> Result<(), ScanError>;
	async fn start_multi_scan(&mut self, req: MultiScanRequest) -> Result<(), ScanError>;
	async fn start_scan3(&mut self, req: Scan3Request) -> Result<(), ScanError>;
	/// Receives one streaming response frame, re-arming the read
	/// deadline each call. `Ok(None)` is the framing-layer nil marking
	/// end-of-stream; `Err` covers I/O error or deadline expiry.
	async fn recv_frame(&mut self, deadline: Duration) -> Result<Option<Vec<IndexEntry>>, ScanError>;
	async fn end_stream(&mut self, req: EndStreamRequest) -> Result<(), ScanError>;
}

/// A handler invoked once per streamed frame (including the synthetic
/// `StreamEnd` frame); returning `false` requests graceful cancellation.
pub trait FrameHandler: Send {
	fn on_frame(&mut self, frame: &ResponseFrame) -> bool;
}

impl<F: FnMut(&ResponseFrame) -> bool + Send> FrameHandler for F {
	fn on_frame(&mut self, frame: &ResponseFrame) -> bool {
		self(frame)
	}
}

type ConnectFuture<T> = Pin<Box<dyn Future<Output = Result<T, ScanError>> + Send>>;

/// Pooled, version-aware scan client. Generic over the concrete
/// transport so tests can substitute an in-memory fake.
pub struct GsiScanClient<T: ScanTransport> {
	pool: ConnectionPool<T>,
	server_version: AtomicU64,
	read_deadline: Duration,
}

impl<T: ScanTransport> GsiScanClient<T> {
	/// Builds the pool, performs the one-time Helo handshake, and caches
	/// the server's version atomically (spec §4.6 "Version handshake").
	pub async fn connect(
		pool_size: usize,
		pool_overflow: usize,
		acquire_timeout: Duration,
		read_deadline: Duration,
		client_version: u64,
		connect: Arc<dyn Fn() -> ConnectFuture<T> + Send + Sync>,
	) -> Result<Self, ScanError> {
		let pool = ConnectionPool::new(pool_size, pool_overflow, acquire_timeout, connect);
		let client = Self {
			pool,
			server_version: AtomicU64::new(0),
			read_deadline,
		};
		client.refresh_server_version(client_version).await?;
		Ok(client)
	}

	/// Re-issues Helo and updates the cached version (supplemental
	/// `RefreshServerVersion` behavior beyond the one-time handshake).
	pub async fn refresh_server_version(&self, client_version: u64) -> Result<u64, ScanError> {
		let mut conn = self.pool.acquire().await?;
		let resp = conn.get_mut().helo(HeloRequest { client_version }).await;
		let version = match resp {
			Ok(r) => r.server_version,
			Err(e) => {
				conn.mark_unhealthy();
				conn.finish().await;
				return Err(e);
			}
		};
		// Helo is unary: a response followed by a stream-end marker, same
		// extra-frame contract as Statistics/Count.
		match conn.get_mut().recv_frame(self.read_deadline).await {
			Ok(None) => {
				self.server_version.store(version, Ordering::SeqCst);
				conn.finish().await;
				Ok(version)
			}
			Ok(Some(_)) => {
				conn.mark_unhealthy();
				conn.finish().await;
				Err(ScanError::Protocol)
			}
			Err(e) => {
				conn.mark_unhealthy();
				conn.finish().await;
				Err(e)
			}
		}
	}

	/// Backward-compat behavior: a cached version of zero means the
	/// server predates session-consistency vectors, so the client adds
	/// one to every request.
	pub fn needs_session_cons_vector(&self) -> bool {
		self.server_version.load(Ordering::SeqCst) == 0
	}

	pub fn cached_server_version(&self) -> u64 {
		self.server_version.load(Ordering::SeqCst)
	}

	/// Explicit teardown distinct from `Drop`; the pool's idle
	/// connections are simply let go (their own `Drop` closes them).
	pub async fn close(&self) {
		// Nothing additional to flush: pooled connections close themselves
		// when dropped. This exists as its own method to mirror the
		// original client's explicit `Close() error`.
	}

	async fn unary<R, F>(&self, call: F) -> Result<R, ScanError>
	where
		F: for<'a> FnOnce(&'a mut T) -> Pin<Box<dyn Future<Output = Result<R, ScanError>> + Send + 'a>>,
	{
		let mut conn = self.pool.acquire().await?;
		let result = call(conn.get_mut()).await;
		match result {
			Ok(r) => {
				// Unary calls expect exactly one response followed by a
				// stream-end marker; a second data frame is a protocol
				// violation (spec §4.6, §8).
				match conn.get_mut().recv_frame(self.read_deadline).await {
					Ok(None) => {
						conn.finish().await;
						Ok(r)
					}
					Ok(Some(_)) => {
						conn.mark_unhealthy();
						conn.finish().await;
						Err(ScanError::Protocol)
					}
					Err(e) => {
						conn.mark_unhealthy();
						conn.finish().await;
						Err(e)
					}
				}
			}
			Err(e) => {
				conn.mark_unhealthy();
				conn.finish().await;
				Err(e)
			}
		}
	}

	pub async fn statistics(&self, req: StatisticsRequest) -> Result<StatisticsResponse, ScanError> {
		self.unary(|c| c.statistics(req)).await
	}

	pub async fn count(&self, req: CountRequest) -> Result<CountResponse, ScanError> {
		self.unary(|c| c.count(req)).await
	}

	/// Drives a streaming call to completion per the four-step loop
	/// (spec §4.6), returning `(result, partial)`. `partial` is true once
	/// at least one frame reached `handler` before any stop condition.
	async fn drive_stream(&self, mut conn: PooledConnection<T>, mut handler: impl FrameHandler + 'static) -> (Result<(), ScanError>, bool) {
		let mut partial = false;
		loop {
			match conn.get_mut().recv_frame(self.read_deadline).await {
				Err(e) => {
					conn.mark_unhealthy();
					conn.finish().await;
					return (Err(e), partial);
				}
				Ok(None) => {
					handler.on_frame(&ResponseFrame::StreamEnd);
					conn.finish().await;
					return (Ok(()), partial);
				}
				Ok(Some(entries)) => {
					partial = true;
					let keep_going = handler.on_frame(&ResponseFrame::Entries(entries));
					if !keep_going {
						self.cancel_and_return(conn);
						return (Ok(()), partial);
					}
				}
			}
		}
	}

	/// Graceful cancellation (spec §9): sends `EndStreamRequest` and
	/// drains until nil/error on a detached task, only then returning the
	/// connection to the pool, so the caller's path never blocks on
	/// drain.
	fn cancel_and_return(&self, mut conn: PooledConnection<T>) {
		let read_deadline = self.read_deadline;
		tokio::spawn(async move {
			if conn.get_mut().end_stream(EndStreamRequest { request_id_hash: 0 }).await.is_err() {
				conn.mark_unhealthy();
				conn.finish().await;
				return;
			}
			loop {
				match conn.get_mut().recv_frame(read_deadline).await {
					Ok(None) => break,
					Ok(Some(_)) => continue,
					Err(_) => {
						conn.mark_unhealthy();
						break;
					}
				}
			}
			conn.finish().await;
		});
	}

	pub async fn scan(&self, req: ScanRequest, handler: impl FrameHandler + 'static) -> (Result<(), ScanError>, bool) {
		let mut conn = match self.pool.acquire().await {
			Ok(c) => c,
			Err(e) => return (Err(e), false),
		};
		if let Err(e) = conn.get_mut().start_scan(req).await {
			conn.mark_unhealthy();
			conn.finish().await;
			return (Err(e), false);
		}
		self.drive_stream(conn, handler).await
	}

	pub async fn scan_all(&self, req: ScanAllRequest, handler: impl FrameHandler + 'static) -> (Result<(), ScanError>, bool) {
		let mut conn = match self.pool.acquire().await {
			Ok(c) => c,
			Err(e) => return (Err(e), false),
		};
		if let Err(e) = conn.get_mut().start_scan_all(req).await {
			conn.mark_unhealthy();
			conn.finish().await;
			return (Err(e), false);
		}
		self.drive_stream(conn, handler).await
	}

	pub async fn multi_scan(&self, req: MultiScanRequest, handler: impl FrameHandler + 'static) -> (Result<(), ScanError>, bool) {
		let mut conn = match self.pool.acquire().await {
			Ok(c) => c,
			Err(e) => return (Err(e), false),
		};
		if let Err(e) = conn.get_mut().start_multi_scan(req).await {
			conn.mark_unhealthy();
			conn.finish().await;
			return (Err(e), false);
		}
		self.drive_stream(conn, handler).await
	}

	pub async fn scan3(&self, req: Scan3Request, handler: impl FrameHandler + 'static) -> (Result<(), ScanError>, bool) {
		let mut conn = match self.pool.acquire().await {
			Ok(c) => c,
			Err(e) => return (Err(e), false),
		};
		if let Err(e) = conn.get_mut().start_scan3(req).await {
			conn.mark_unhealthy();
			conn.finish().await;
			return (Err(e), false);
		}
		self.drive_stream(conn, handler).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex as StdMutex;
	use std::time::Duration;

	/// Scripted transport for the streaming scenarios: yields a fixed
	/// sequence of frames, then nil.
	struct ScriptedTransport {
		frames: StdMutex<Vec<Vec<IndexEntry>>>,
		end_stream_called: Arc<std::sync::atomic::AtomicBool>,
		scan_started: std::sync::atomic::AtomicBool,
	}

	#[async_trait::async_trait]
	impl Connection for ScriptedTransport {
		async fn close(&mut self) {}
	}

	#[async_trait::async_trait]
	impl ScanTransport for ScriptedTransport {
		async fn helo(&mut self, _req: HeloRequest) -> Result<HeloResponse, ScanError> {
			Ok(HeloResponse { server_version: 7 })
		}
		async fn statistics(&mut self, _req: StatisticsRequest) -> Result<StatisticsResponse, ScanError> {
			unimplemented!()
		}
		async fn count(&mut self, _req: CountRequest) -> Result<CountResponse, ScanError> {
			unimplemented!()
		}
		async fn start_scan(&mut self, _req: ScanRequest) -> Result<(), ScanError> {
			self.scan_started.store(true, Ordering::SeqCst);
			Ok(())
		}
		async fn start_scan_all(&mut self, _req: ScanAllRequest) -> Result<(), ScanError> {
			unimplemented!()
		}
		async fn start_multi_scan(&mut self, _req: MultiScanRequest) -> Result<(), ScanError> {
			unimplemented!()
		}
		async fn start_scan3(&mut self, _req: Scan3Request) -> Result<(), ScanError> {
			unimplemented!()
		}
		async fn recv_frame(&mut self, _deadline: Duration) -> Result<Option<Vec<IndexEntry>>, ScanError> {
			if !self.scan_started.load(Ordering::SeqCst) {
				// Helo's own stream-end marker; the scripted data frames
				// belong to the scan started later on this connection.
				return Ok(None);
			}
			let mut frames = self.frames.lock().unwrap();
			if frames.is_empty() {
				Ok(None)
			} else {
				Ok(Some(frames.remove(0)))
			}
		}
		async fn end_stream(&mut self, _req: EndStreamRequest) -> Result<(), ScanError> {
			self.end_stream_called.store(true, Ordering::SeqCst);
			Ok(())
		}
	}

	fn entry(k: &str) -> IndexEntry {
		IndexEntry {
			entry_key: k.as_bytes().to_vec(),
			primary_key: k.as_bytes().to_vec(),
		}
	}

	async fn client_with_frames(frames: Vec<Vec<IndexEntry>>, end_stream_called: Arc<std::sync::atomic::AtomicBool>) -> GsiScanClient<ScriptedTransport> {
		let frames = Arc::new(StdMutex::new(frames));
		let esc = end_stream_called.clone();
		GsiScanClient::connect(
			1,
			0,
			Duration::from_millis(500),
			Duration::from_millis(500),
			1,
			Arc::new(move || {
				let frames = frames.clone();
				let esc = esc.clone();
				Box::pin(async move {
					Ok(ScriptedTransport {
						frames: StdMutex::new(std::mem::take(&mut *frames.lock().unwrap())),
						end_stream_called: esc,
						scan_started: std::sync::atomic::AtomicBool::new(false),
					})
				})
			}),
		)
		.await
		.unwrap()
	}

	// S5 from spec §8.
	#[tokio::test]
	async fn handler_accepting_every_frame_drains_to_completion() {
		let end_stream_called = Arc::new(std::sync::atomic::AtomicBool::new(false));
		let client = client_with_frames(vec![vec![entry("B")], vec![entry("C")]], end_stream_called.clone()).await;
		let req = ScanRequest {
			envelope: envelope(),
			scans: vec![],
			projection: None,
			reverse: false,
			distinct: false,
			offset: 0,
			limit: 1000,
			sorted: false,
		};
		let (result, partial) = client.scan(req, |_f: &ResponseFrame| true).await;
		assert!(result.is_ok());
		assert!(partial);
		assert!(!end_stream_called.load(Ordering::SeqCst));
	}

	// S6 from spec §8.
	#[tokio::test]
	async fn handler_stopping_after_first_frame_triggers_graceful_cancel() {
		let end_stream_called = Arc::new(std::sync::atomic::AtomicBool::new(false));
		let client = client_with_frames(vec![vec![entry("B")], vec![entry("C")]], end_stream_called.clone()).await;
		let req = ScanRequest {
			envelope: envelope(),
			scans: vec![],
			projection: None,
			reverse: false,
			distinct: false,
			offset: 0,
			limit: 1000,
			sorted: false,
		};
		let (result, partial) = client.scan(req, |_f: &ResponseFrame| false).await;
		assert!(result.is_ok());
		assert!(partial);
		// Cancellation drains on a detached task; give it a moment.
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert!(end_stream_called.load(Ordering::SeqCst));
	}

	#[tokio::test]
	async fn needs_session_cons_vector_reflects_cached_version() {
		let end_stream_called = Arc::new(std::sync::atomic::AtomicBool::new(false));
		let client = client_with_frames(vec![], end_stream_called).await;
		assert!(!client.needs_session_cons_vector());
		assert_eq!(client.cached_server_version(), 7);
	}

	fn envelope() -> RequestEnvelope {
		RequestEnvelope {
			defn_id: crate::types::DefnId(1),
			request_id: "r1".into(),
			partition_ids: vec![],
			consistency: ConsistencyLevel::SessionConsistency,
			rollback_time: 0,
			ts_consistency: None,
		}
	}
}
