//! Connection pool (spec §4.6 "Connection pool contract", §9 "Connection
//! pool cancellation"): a fixed-size pool with overflow and a bounded
//! acquire wait, handing back connections marked healthy or unhealthy.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::ScanError;

/// Anything the pool can hand out. A concrete transport owns the
/// framed-packet codec and its fixed maximum payload size at
/// construction, per spec §4.6.
#[async_trait::async_trait]
pub trait Connection: Send + Sync + 'static {
	async fn close(&mut self);
}

struct Inner<C: Connection> {
	idle: parking_lot::Mutex<Vec<C>>,
	overflow: Arc<Semaphore>,
}

/// One pooled connection. Returned to the pool once [`PooledConnection::
/// finish`] runs, or — if dropped without an explicit `finish` — on a
/// detached task, so a caller that abandons the connection never blocks
/// on the return.
pub struct PooledConnection<C: Connection> {
	conn: Option<C>,
	pool: Arc<Inner<C>>,
	healthy: bool,
	_permit: OwnedSemaphorePermit,
}

impl<C: Connection> std::fmt::Debug for PooledConnection<C> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PooledConnection")
			.field("healthy", &self.healthy)
			.field("has_conn", &self.conn.is_some())
			.finish()
	}
}

impl<C: Connection> PooledConnection<C> {
	pub fn get_mut(&mut self) -> &mut C {
		self.conn.as_mut().expect("connection present until returned")
	}

	pub fn mark_unhealthy(&mut self) {
		self.healthy = false;
	}

	/// Returns the connection to the pool now (if healthy) or closes it
	/// (if not), releasing its slot. Used directly by unary calls and by
	/// the streaming-cancellation detached task once drain completes
	/// (spec §9 "no use-after-return").
	pub async fn finish(mut self) {
		let mut conn = self.conn.take().expect("connection present until returned");
		if self.healthy {
			self.pool.idle.lock().push(conn);
		} else {
			conn.close().await;
		}
	}
}

impl<C: Connection> Drop for PooledConnection<C> {
	fn drop(&mut self) {
		if let Some(conn) = self.conn.take() {
			let pool = self.pool.clone();
			let healthy = self.healthy;
			tokio::spawn(async move {
				let mut conn = conn;
				if healthy {
					pool.idle.lock().push(conn);
				} else {
					conn.close().await;
				}
			});
		}
	}
}

type ConnectFn<C> = dyn Fn() -> futures::future::BoxFuture<'static, Result<C, ScanError>> + Send + Sync;

/// Fixed-size pool of `pool_size` warm connections plus up to
/// `pool_overflow` additional connections created on demand.
pub struct ConnectionPool<C: Connection> {
	inner: Arc<Inner<C>>,
	connect: Arc<ConnectFn<C>>,
	acquire_timeout: Duration,
}

impl<C: Connection> ConnectionPool<C> {
	pub fn new(pool_size: usize, pool_overflow: usize, acquire_timeout: Duration, connect: Arc<ConnectFn<C>>) -> Self {
		Self {
			inner: Arc::new(Inner {
				idle: parking_lot::Mutex::new(Vec::with_capacity(pool_size)),
				overflow: Arc::new(Semaphore::new(pool_size + pool_overflow)),
			}),
			connect,
			acquire_timeout,
		}
	}

	/// Acquires a connection, reusing an idle one or dialing a fresh one,
	/// up to `pool_size + pool_overflow` concurrently outstanding. Blocks
	/// up to `acquire_timeout`, then fails with [`ScanError::Pool`].
	pub async fn acquire(&self) -> Result<PooledConnection<C>, ScanError> {
		let permit = tokio::time::timeout(self.acquire_timeout, self.inner.overflow.clone().acquire_owned())
			.await
			.map_err(|_| ScanError::Pool)?
			.expect("semaphore is never closed");
		let existing = self.inner.idle.lock().pop();
		let conn = match existing {
			Some(c) => c,
			None => (self.connect)().await?,
		};
		Ok(PooledConnection {
			conn: Some(conn),
			pool: self.inner.clone(),
			healthy: true,
			_permit: permit,
		})
	}

	pub fn idle_count(&self) -> usize {
		self.inner.idle.lock().len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	struct FakeConn(u32);

	#[async_trait::async_trait]
	impl Connection for FakeConn {
		async fn close(&mut self) {}
	}

	fn counting_connect(counter: Arc<AtomicU32>) -> Arc<ConnectFn<FakeConn>> {
		Arc::new(move || {
			let c = counter.clone();
			Box::pin(async move {
				let n = c.fetch_add(1, Ordering::SeqCst);
				Ok(FakeConn(n))
			})
		})
	}

	#[tokio::test]
	async fn acquire_reuses_a_connection_returned_via_finish() {
		let counter = Arc::new(AtomicU32::new(0));
		let pool: ConnectionPool<FakeConn> = ConnectionPool::new(1, 0, Duration::from_millis(200), counting_connect(counter.clone()));
		let conn = pool.acquire().await.unwrap();
		conn.finish().await;
		assert_eq!(pool.idle_count(), 1);
		let _conn2 = pool.acquire().await.unwrap();
		assert_eq!(counter.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn acquire_times_out_once_pool_and_overflow_are_exhausted() {
		let counter = Arc::new(AtomicU32::new(0));
		let pool: ConnectionPool<FakeConn> = ConnectionPool::new(1, 0, Duration::from_millis(20), counting_connect(counter));
		let held = pool.acquire().await.unwrap();
		let err = pool.acquire().await.unwrap_err();
		assert!(matches!(err, ScanError::Pool));
		drop(held);
	}

	#[tokio::test]
	async fn unhealthy_connection_is_closed_not_returned() {
		let counter = Arc::new(AtomicU32::new(0));
		let pool: ConnectionPool<FakeConn> = ConnectionPool::new(1, 0, Duration::from_millis(200), counting_connect(counter.clone()));
		let mut conn = pool.acquire().await.unwrap();
		conn.mark_unhealthy();
		conn.finish().await;
		assert_eq!(pool.idle_count(), 0);
		let _conn2 = pool.acquire().await.unwrap();
		assert_eq!(counter.load(Ordering::SeqCst), 2);
	}
}
