//! Mutation Queue (spec §4.1, component A): a per-keyspace buffer of
//! [`Mutation`]s, one ordered list per vbucket, accounted against a
//! process-wide shared byte counter.
//!
//! The per-vbucket lists are guarded by individual `parking_lot::Mutex`es
//! rather than true lock-free structures — with exactly one producer
//! (the stream reader) and at most one consumer (a flusher) per
//! vbucket the lock is never contended, which gets the same practical
//! throughput as a lock-free SPSC ring without reaching for `unsafe`.
//! See `DESIGN.md` for the tradeoff.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::{KeyspaceId, Mutation, Vbucket};

/// Behavior when [`MutationQueue::enqueue`] would push the shared memory
/// counter past its configured cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
	/// Caller awaits `capacity` notifications until enough space frees up.
	Block,
	/// The mutation is dropped and the drop is counted.
	Drop,
}

/// Result of an `enqueue` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
	Enqueued,
	Dropped,
}

struct VbQueue {
	items: Mutex<VecDeque<Mutation>>,
}

impl VbQueue {
	fn new() -> Self {
		Self {
			items: Mutex::new(VecDeque::new()),
		}
	}
}

/// Shared memory accounting across every queue in the process. One
/// instance is created per Mutation Manager and handed to every
/// [`MutationQueue`] it allocates.
#[derive(Clone)]
pub struct MemoryCounter {
	used: Arc<AtomicI64>,
	cap: Arc<AtomicI64>,
	notify: Arc<tokio::sync::Notify>,
}

impl MemoryCounter {
	pub fn new(cap: i64) -> Self {
		Self {
			used: Arc::new(AtomicI64::new(0)),
			cap: Arc::new(AtomicI64::new(cap)),
			notify: Arc::new(tokio::sync::Notify::new()),
		}
	}

	pub fn used(&self) -> i64 {
		self.used.load(Ordering::Acquire)
	}

	pub fn set_cap(&self, cap: i64) {
		self.cap.store(cap, Ordering::Release);
		self.notify.notify_waiters();
	}

	fn would_fit(&self, n: i64) -> bool {
		self.used.load(Ordering::Acquire) + n <= self.cap.load(Ordering::Acquire)
	}

	/// Whether `n` could ever fit under the current cap, regardless of
	/// how much space a flush frees up — false for a single item larger
	/// than the whole queue.
	fn fits_within_cap(&self, n: i64) -> bool {
		n <= self.cap.load(Ordering::Acquire)
	}

	fn add(&self, n: i64) {
		self.used.fetch_add(n, Ordering::AcqRel);
	}

	fn sub(&self, n: i64) {
		self.used.fetch_sub(n, Ordering::AcqRel);
		self.notify.notify_waiters();
	}

	/// Waits for a `sub`/`set_cap` notification, but only if `n` still
	/// doesn't fit by the time the waiter is registered. The `Notified`
	/// future must be created *before* this re-check: `notify_waiters`
	/// stores no permit, so a `sub` landing between the caller's own
	/// `would_fit` check and registration would otherwise be missed and
	/// the waiter would block forever with no further `sub` coming.
	async fn wait_for_space(&self, n: i64) {
		let notified = self.notify.notified();
		if self.would_fit(n) {
			return;
		}
		notified.await;
	}
}

/// Per-keyspace buffer of mutations, ordered per vbucket.
pub struct MutationQueue {
	keyspace_id: KeyspaceId,
	num_vbuckets: usize,
	vbs: Vec<VbQueue>,
	mem: MemoryCounter,
	overflow: OverflowPolicy,
	dropped: Arc<std::sync::atomic::AtomicU64>,
}

impl MutationQueue {
	pub fn new(keyspace_id: KeyspaceId, num_vbuckets: usize, mem: MemoryCounter, overflow: OverflowPolicy) -> Self {
		let vbs = (0..num_vbuckets).map(|_| VbQueue::new()).collect();
		Self {
			keyspace_id,
			num_vbuckets,
			vbs,
			mem,
			overflow,
			dropped: Arc::new(std::sync::atomic::AtomicU64::new(0)),
		}
	}

	pub fn keyspace_id(&self) -> &KeyspaceId {
		&self.keyspace_id
	}

	pub fn dropped_count(&self) -> u64 {
		self.dropped.load(Ordering::Relaxed)
	}

	/// Adds `mutation` to the tail of its vbucket's list, accounting its
	/// bytes against the shared counter. Blocks (if `overflow ==
	/// Block`) or drops with a counted failure (if `Drop`) when the cap
	/// would be exceeded.
	pub async fn enqueue(&self, mutation: Mutation) -> EnqueueOutcome {
		let n = mutation.byte_size() as i64;
		loop {
			if self.mem.would_fit(n) {
				self.mem.add(n);
				let vb = &self.vbs[mutation.vbucket as usize];
				vb.items.lock().push_back(mutation);
				return EnqueueOutcome::Enqueued;
			}
			// A mutation larger than the whole cap can never fit no
			// matter how much a flush frees up — fail fast instead of
			// blocking (or spinning on Drop) forever.
			if !self.mem.fits_within_cap(n) {
				self.dropped.fetch_add(1, Ordering::Relaxed);
				return EnqueueOutcome::Dropped;
			}
			match self.overflow {
				OverflowPolicy::Block => self.mem.wait_for_space(n).await,
				OverflowPolicy::Drop => {
					self.dropped.fetch_add(1, Ordering::Relaxed);
					return EnqueueOutcome::Dropped;
				}
			}
		}
	}

	/// Removes and returns every buffered mutation for `vb` whose seqno
	/// is `<= seqno`, in producer order, subtracting their bytes from
	/// the shared counter.
	pub fn dequeue_until(&self, vb: Vbucket, seqno: u64) -> Vec<Mutation> {
		let mut guard = self.vbs[vb as usize].items.lock();
		let mut out = Vec::new();
		let mut freed = 0i64;
		while let Some(front) = guard.front() {
			if front.seqno > seqno {
				break;
			}
			let m = guard.pop_front().unwrap();
			freed += m.byte_size() as i64;
			out.push(m);
		}
		drop(guard);
		if freed > 0 {
			self.mem.sub(freed);
		}
		out
	}

	/// Largest per-vbucket seqno currently buffered, one entry per vb
	/// (0 where a vbucket holds nothing).
	pub fn high_water_ts(&self) -> Vec<u64> {
		self.vbs.iter().map(|q| q.items.lock().back().map(|m| m.seqno).unwrap_or(0)).collect()
	}

	/// Smallest per-vbucket seqno currently buffered (0 where a vbucket
	/// holds nothing).
	pub fn low_water_ts(&self) -> Vec<u64> {
		self.vbs.iter().map(|q| q.items.lock().front().map(|m| m.seqno).unwrap_or(0)).collect()
	}

	pub fn num_vbuckets(&self) -> usize {
		self.num_vbuckets
	}

	/// Atomically empties every vbucket's list and subtracts its bytes
	/// from the shared counter.
	pub fn destroy(&self) {
		let mut freed = 0i64;
		for q in &self.vbs {
			let mut guard = q.items.lock();
			for m in guard.drain(..) {
				freed += m.byte_size() as i64;
			}
		}
		if freed > 0 {
			self.mem.sub(freed);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::MutationOp;
	use std::time::Duration;

	fn mutation(vb: Vbucket, seqno: u64) -> Mutation {
		Mutation {
			vbucket: vb,
			seqno,
			vbuuid: 1,
			keyspace_id: KeyspaceId::from("b/s/c"),
			op: MutationOp::Upsert,
			document_key: b"k".to_vec(),
			payload: vec![0u8; 10],
		}
	}

	#[tokio::test]
	async fn enqueue_then_dequeue_until_hwt_is_order_preserving() {
		let mem = MemoryCounter::new(1 << 20);
		let q = MutationQueue::new(KeyspaceId::from("b/s/c"), 4, mem.clone(), OverflowPolicy::Block);
		for seqno in [10, 20, 30] {
			q.enqueue(mutation(0, seqno)).await;
		}
		let hwt = q.high_water_ts();
		let drained = q.dequeue_until(0, hwt[0]);
		let seqnos: Vec<u64> = drained.iter().map(|m| m.seqno).collect();
		assert_eq!(seqnos, vec![10, 20, 30]);
		assert_eq!(mem.used(), 0);
	}

	#[tokio::test]
	async fn dequeue_until_stops_at_target_and_retains_remainder() {
		let mem = MemoryCounter::new(1 << 20);
		let q = MutationQueue::new(KeyspaceId::from("b/s/c"), 1, mem.clone(), OverflowPolicy::Block);
		for seqno in [10, 20, 30] {
			q.enqueue(mutation(0, seqno)).await;
		}
		let before = mem.used();
		let drained = q.dequeue_until(0, 20);
		let seqnos: Vec<u64> = drained.iter().map(|m| m.seqno).collect();
		assert_eq!(seqnos, vec![10, 20]);
		assert_eq!(q.low_water_ts()[0], 30);
		let freed: i64 = drained.iter().map(|m| m.byte_size() as i64).sum();
		assert_eq!(mem.used(), before - freed);
	}

	#[tokio::test]
	async fn drop_policy_counts_failures_instead_of_blocking() {
		let mem = MemoryCounter::new(5); // smaller than one mutation
		let q = MutationQueue::new(KeyspaceId::from("b/s/c"), 1, mem, OverflowPolicy::Drop);
		let outcome = q.enqueue(mutation(0, 1)).await;
		assert_eq!(outcome, EnqueueOutcome::Dropped);
		assert_eq!(q.dropped_count(), 1);
	}

	#[tokio::test]
	async fn blocked_enqueue_observes_a_notify_that_races_registration() {
		// Regresses a lost-wakeup: the waiter must see a `sub` that fires
		// between its failed `would_fit` check and `Notified` registration.
		let mem = MemoryCounter::new(11);
		let q = Arc::new(MutationQueue::new(KeyspaceId::from("b/s/c"), 1, mem.clone(), OverflowPolicy::Block));
		q.enqueue(mutation(0, 1)).await; // fills the cap (byte_size == 11)

		let q2 = q.clone();
		let waiter = tokio::spawn(async move { q2.enqueue(mutation(0, 2)).await });
		// Give the waiter task a chance to observe `would_fit == false`
		// before the free-up below runs.
		tokio::task::yield_now().await;
		tokio::task::yield_now().await;

		let drained = q.dequeue_until(0, 1);
		assert_eq!(drained.len(), 1);

		let outcome = tokio::time::timeout(Duration::from_millis(500), waiter)
			.await
			.expect("waiter must wake once space frees up")
			.unwrap();
		assert_eq!(outcome, EnqueueOutcome::Enqueued);
	}

	#[tokio::test]
	async fn oversized_mutation_fails_fast_under_block_policy() {
		let mem = MemoryCounter::new(5); // smaller than one mutation
		let q = MutationQueue::new(KeyspaceId::from("b/s/c"), 1, mem, OverflowPolicy::Block);
		let outcome = tokio::time::timeout(Duration::from_millis(200), q.enqueue(mutation(0, 1)))
			.await
			.expect("oversized mutation must fail fast instead of blocking forever");
		assert_eq!(outcome, EnqueueOutcome::Dropped);
		assert_eq!(q.dropped_count(), 1);
	}

	#[tokio::test]
	async fn destroy_zeroes_memory_contribution() {
		let mem = MemoryCounter::new(1 << 20);
		let q = MutationQueue::new(KeyspaceId::from("b/s/c"), 2, mem.clone(), OverflowPolicy::Block);
		q.enqueue(mutation(0, 1)).await;
		q.enqueue(mutation(1, 2)).await;
		assert!(mem.used() > 0);
		q.destroy();
		assert_eq!(mem.used(), 0);
	}
}
