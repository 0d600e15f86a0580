//! Core data model (spec §3). Plain value types shared by every
//! subsystem; no behavior lives here beyond small constructors and
//! `Display` impls, matching how the teacher crate keeps `cf::mutations`
//! and `key::*` as inert value types consumed by the stateful modules.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical mutation stream. A service runs at most one [`reader::StreamReader`]
/// per `StreamId` at a time.
///
/// [`reader::StreamReader`]: crate::reader::StreamReader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamId {
	Init,
	Maint,
	Catchup,
}

impl fmt::Display for StreamId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			StreamId::Init => "INIT_STREAM",
			StreamId::Maint => "MAINT_STREAM",
			StreamId::Catchup => "CATCHUP_STREAM",
		};
		write!(f, "{s}")
	}
}

/// Opaque bucket/scope/collection triple naming a set of documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyspaceId(pub String);

impl KeyspaceId {
	pub fn new(bucket: &str, scope: &str, collection: &str) -> Self {
		Self(format!("{bucket}/{scope}/{collection}"))
	}
}

impl fmt::Display for KeyspaceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<&str> for KeyspaceId {
	fn from(s: &str) -> Self {
		Self(s.to_string())
	}
}

/// Monotonic per-keyspace generation number. The stream reader drops any
/// mutation whose session does not match the keyspace's current session.
pub type SessionId = u64;

/// Partition of the document keyspace used by the projector for ordering.
pub type Vbucket = u16;

/// A single mutation produced by the external projector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
	pub vbucket: Vbucket,
	pub seqno: u64,
	pub vbuuid: u64,
	pub keyspace_id: KeyspaceId,
	pub op: MutationOp,
	pub document_key: Vec<u8>,
	pub payload: Vec<u8>,
}

impl Mutation {
	/// Bytes counted against the process-wide memory cap: key plus
	/// payload, the resident cost of holding the mutation in a queue.
	pub fn byte_size(&self) -> usize {
		self.document_key.len() + self.payload.len()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
	Insert,
	Upsert,
	Delete,
}

/// Vector timestamp indexed by vbucket, carrying `{seqno, vbuuid}` pairs.
/// Sized to `num_vbuckets` at construction; entries default to `(0, 0)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsVbuuid {
	seqnos: Vec<u64>,
	vbuuids: Vec<u64>,
}

impl TsVbuuid {
	pub fn new(num_vbuckets: usize) -> Self {
		Self {
			seqnos: vec![0; num_vbuckets],
			vbuuids: vec![0; num_vbuckets],
		}
	}

	pub fn len(&self) -> usize {
		self.seqnos.len()
	}

	pub fn is_empty(&self) -> bool {
		self.seqnos.is_empty()
	}

	pub fn seqno(&self, vb: Vbucket) -> u64 {
		self.seqnos[vb as usize]
	}

	pub fn vbuuid(&self, vb: Vbucket) -> u64 {
		self.vbuuids[vb as usize]
	}

	pub fn set(&mut self, vb: Vbucket, seqno: u64, vbuuid: u64) {
		self.seqnos[vb as usize] = seqno;
		self.vbuuids[vb as usize] = vbuuid;
	}
}

/// Per-vb boolean mask selecting which vbuckets a flush request should
/// process.
#[derive(Debug, Clone)]
pub struct ChangeVector(Vec<bool>);

impl ChangeVector {
	pub fn new(num_vbuckets: usize) -> Self {
		Self(vec![false; num_vbuckets])
	}

	pub fn all(num_vbuckets: usize) -> Self {
		Self(vec![true; num_vbuckets])
	}

	pub fn set(&mut self, vb: Vbucket, flag: bool) {
		self.0[vb as usize] = flag;
	}

	pub fn get(&self, vb: Vbucket) -> bool {
		self.0[vb as usize]
	}

	pub fn iter_enabled(&self) -> impl Iterator<Item = Vbucket> + '_ {
		self.0
			.iter()
			.enumerate()
			.filter(|(_, &on)| on)
			.map(|(vb, _)| vb as Vbucket)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexInstId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DefnId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
	Initial,
	Pending,
	Loading,
	Active,
	Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionScheme {
	Single,
	Hash,
	Range,
}

#[derive(Debug, Clone)]
pub struct IndexDefn {
	pub defn_id: DefnId,
	pub bucket: String,
	pub is_primary: bool,
	pub name: String,
	pub storage_type: String,
	pub expression_type: String,
	pub secondary_expressions: Vec<String>,
	pub partition_scheme: PartitionScheme,
	pub partition_expression: Option<String>,
	pub where_expression: Option<String>,
	/// Filled in from the owning [`ScheduleCreateToken`] immediately before
	/// creation to defend against a concurrent keyspace drop.
	pub bucket_uuid: String,
	pub scope_id: String,
	pub collection_id: String,
	pub deferred: bool,
}

#[derive(Debug, Clone)]
pub struct IndexInst {
	pub inst_id: IndexInstId,
	pub definition: IndexDefn,
	pub state: IndexState,
	pub partition_scheme: PartitionScheme,
}

pub type IndexInstMap = HashMap<IndexInstId, IndexInst>;
/// Partition assignment for an index instance: partition id -> node/host.
pub type IndexPartitionMap = HashMap<IndexInstId, HashMap<u64, String>>;
