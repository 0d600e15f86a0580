//! Latency accounting (spec §4.4): attributes each vbucket to the node
//! currently streaming it, and keeps a per-node reference count so a
//! node's latency aggregator can be dropped once it owns nothing.
//!
//! The vb->node table is an immutable map behind a `parking_lot::RwLock`,
//! cloned-then-swapped on write and read-then-used on read — the
//! reimplementation of the original's atomic-pointer `VbMap` called for
//! in spec §9's "Unsafe pointer holders" design note, without the
//! `unsafe` atomic-pointer swap itself.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{KeyspaceId, StreamId, Vbucket};

type StreamKeyspace = (StreamId, KeyspaceId);

#[derive(Default)]
pub struct LatencyTable {
	/// (stream, keyspace) -> vbucket -> node currently owning it.
	vb_owner: RwLock<Arc<HashMap<StreamKeyspace, HashMap<Vbucket, String>>>>,
	/// node -> number of vbuckets it currently owns, across all streams.
	node_counts: RwLock<HashMap<String, u64>>,
}

impl LatencyTable {
	pub fn new() -> Self {
		Self::default()
	}

	/// Records that `vb` in `(stream, keyspace)` is now owned by `node`
	/// (a STREAM_BEGIN observation). Adjusts the old and new node's
	/// counters and drops any node aggregator that reaches zero.
	pub fn record_stream_begin(&self, stream: StreamId, keyspace: KeyspaceId, vb: Vbucket, node: String) {
		let key = (stream, keyspace);
		let mut map = (**self.vb_owner.read()).clone();
		let entry = map.entry(key).or_default();
		let previous = entry.insert(vb, node.clone());

		let mut counts = self.node_counts.write();
		if let Some(prev_node) = previous {
			if prev_node != node {
				Self::decrement(&mut counts, &prev_node);
			}
		}
		*counts.entry(node).or_insert(0) += 1;
		drop(counts);

		*self.vb_owner.write() = Arc::new(map);
	}

	fn decrement(counts: &mut HashMap<String, u64>, node: &str) {
		if let Some(c) = counts.get_mut(node) {
			*c = c.saturating_sub(1);
			if *c == 0 {
				counts.remove(node);
			}
		}
	}

	/// Count of distinct nodes currently tracked with at least one vb.
	pub fn active_node_count(&self) -> usize {
		self.node_counts.read().len()
	}

	pub fn node_vb_count(&self, node: &str) -> u64 {
		self.node_counts.read().get(node).copied().unwrap_or(0)
	}

	/// Removes every latency aggregator belonging to `stream` (all of
	/// its keyspaces), decrementing node counters accordingly. Called
	/// when a stream is closed/cleaned up.
	pub fn cleanup_stream(&self, stream: StreamId) {
		let mut map = (**self.vb_owner.read()).clone();
		let keys_to_remove: Vec<StreamKeyspace> = map.keys().filter(|(s, _)| *s == stream).cloned().collect();

		let mut counts = self.node_counts.write();
		for key in &keys_to_remove {
			if let Some(vbs) = map.remove(key) {
				for node in vbs.values() {
					Self::decrement(&mut counts, node);
				}
			}
		}
		drop(counts);

		*self.vb_owner.write() = Arc::new(map);
	}
}
