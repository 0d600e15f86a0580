//! Priority queue on token ctime (spec §4.5 "Priority queue"): a min-heap
//! giving first-come-first-served ordering across scheduled index
//! creation attempts.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::types::DefnId;

use super::token::ScheduleCreateToken;

/// In-memory work item wrapping a durable token (spec §3 "ScheduledIndex").
#[derive(Debug, Clone)]
pub struct ScheduledIndex {
	pub token: ScheduleCreateToken,
	pub retry_count: u32,
	pub non_retryable_retry_count: u32,
	pub last_error: Option<String>,
}

impl ScheduledIndex {
	pub fn new(token: ScheduleCreateToken) -> Self {
		Self {
			token,
			retry_count: 0,
			non_retryable_retry_count: 0,
			last_error: None,
		}
	}

	pub fn defn_id(&self) -> DefnId {
		self.token.definition.defn_id
	}

	/// Priority equals the token's ctime in nanoseconds. Spec §9 notes
	/// that narrow-integer platforms would truncate to seconds and lose
	/// sub-second tie-breaking; on the 64-bit targets this crate builds
	/// for, nanoseconds are kept directly.
	fn priority(&self) -> u128 {
		self.token.ctime_nanos
	}
}

/// Reverses the natural integer ordering so `BinaryHeap` (a max-heap)
/// behaves as a min-heap on ctime.
struct HeapEntry(ScheduledIndex);

impl PartialEq for HeapEntry {
	fn eq(&self, other: &Self) -> bool {
		self.0.priority() == other.0.priority()
	}
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for HeapEntry {
	fn cmp(&self, other: &Self) -> Ordering {
		other.0.priority().cmp(&self.0.priority())
	}
}

/// Min-heap on ctime, guarded by its own mutex per spec §5 ("the cached
/// metadata provider ... is guarded by its own mutex; the priority queue
/// by a third mutex").
#[derive(Default)]
pub struct ScheduleQueue {
	heap: BinaryHeap<HeapEntry>,
}

impl ScheduleQueue {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, item: ScheduledIndex) {
		self.heap.push(HeapEntry(item));
	}

	/// Pops the earliest-ctime item. Returns `None` on an empty heap.
	pub fn pop(&mut self) -> Option<ScheduledIndex> {
		self.heap.pop().map(|e| e.0)
	}

	pub fn is_empty(&self) -> bool {
		self.heap.is_empty()
	}

	pub fn len(&self) -> usize {
		self.heap.len()
	}

	pub fn contains(&self, defn_id: DefnId) -> bool {
		self.heap.iter().any(|e| e.0.defn_id() == defn_id)
	}
}
