//! Wire vocabulary for the query-port protocol (spec §4.6, §6). Framing
//! and serialization live below this crate's boundary; these are the
//! typed request/response values the client builds and consumes.

use crate::types::DefnId;

/// One side of a composite element filter bound. `Unbounded` bounds are
/// skipped entirely at encoding time rather than sent as sentinel bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bound {
	Unbounded,
	Value(Vec<u8>),
}

impl Bound {
	pub fn is_unbounded(&self) -> bool {
		matches!(self, Bound::Unbounded)
	}
}

/// Which side(s) of a range are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inclusion {
	Neither,
	Low,
	High,
	Both,
}

/// One composite-key span within a scan request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeElementFilter {
	pub low: Bound,
	pub high: Bound,
	pub inclusion: Inclusion,
}

impl CompositeElementFilter {
	/// True if the low bound sorts after every primary key a primary
	/// index could hold, or the high bound sorts before every primary
	/// key — the two conditions the "cure" step drops a span for.
	///
	/// Primary keys are always non-empty, so an empty low bound never
	/// sorts after them and an empty high bound never sorts before them;
	/// a filter only needs curing when a *non-empty* low bound exceeds
	/// every key's natural upper bound, or a non-empty high bound is
	/// below every key's natural lower bound. Since this crate has no
	/// concrete primary-key collation to compare against, the concrete
	/// rule this crate applies is the one the original scan client
	/// applies at the same seam: a low bound equal to the high sentinel
	/// byte `0xFF` sorts after all keys, and a high bound equal to the
	/// empty byte string sorts before all keys.
	fn needs_curing(&self) -> bool {
		let low_after_all = matches!(&self.low, Bound::Value(v) if v == &[0xFFu8]);
		let high_before_all = matches!(&self.high, Bound::Value(v) if v.is_empty());
		low_after_all || high_before_all
	}
}

/// Scan range: an ordered list of composite element filters, one per
/// index key position.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Scan {
	pub filters: Vec<CompositeElementFilter>,
}

/// The canonical empty-span scan substituted when curing would otherwise
/// leave a primary scan with no spans at all (spec §4.6
/// `getEmptySpanForPrimary`).
pub fn empty_span_for_primary() -> Scan {
	Scan {
		filters: vec![CompositeElementFilter {
			low: Bound::Value(Vec::new()),
			high: Bound::Value(Vec::new()),
			inclusion: Inclusion::Neither,
		}],
	}
}

/// Applies the primary-index cure step to a list of scans: drops any
/// scan whose sole filter needs curing, then substitutes the empty-span
/// scan if that emptied the list.
pub fn cure_primary_scans(scans: Vec<Scan>) -> Vec<Scan> {
	let cured: Vec<Scan> = scans.into_iter().filter(|s| !s.filters.iter().any(CompositeElementFilter::needs_curing)).collect();
	if cured.is_empty() {
		vec![empty_span_for_primary()]
	} else {
		cured
	}
}

/// Aggregate function applied to one group (spec §4.6 "Aggregation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
	Sum,
	Count,
	Min,
	Max,
	CountN,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
	pub function: AggregateFn,
	pub entry_key_id: i32,
	pub key_pos: i32,
	pub expr: Option<String>,
	pub distinct: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupAggr {
	pub group_keys: Vec<String>,
	pub aggregates: Vec<Aggregate>,
	pub index_key_names: Vec<String>,
	pub depends_on_index_keys: Vec<i32>,
	pub allow_partial_aggr: bool,
}

/// Vector timestamp pinning a query to a point in the mutation stream
/// (spec §6 "Consistency vector format").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TsConsistency {
	pub vbnos: Vec<u32>,
	pub seqnos: Vec<u64>,
	pub vbuuids: Vec<u64>,
	pub crc64: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyLevel {
	AnyConsistency,
	SessionConsistency,
	QueryConsistency,
}

/// Common envelope carried by every request to the index server.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
	pub defn_id: DefnId,
	pub request_id: String,
	pub partition_ids: Vec<u64>,
	pub consistency: ConsistencyLevel,
	pub rollback_time: i64,
	pub ts_consistency: Option<TsConsistency>,
}

#[derive(Debug, Clone)]
pub struct HeloRequest {
	pub client_version: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct HeloResponse {
	pub server_version: u64,
}

#[derive(Debug, Clone)]
pub struct StatisticsRequest {
	pub envelope: RequestEnvelope,
	pub scans: Vec<Scan>,
}

#[derive(Debug, Clone)]
pub struct StatisticsResponse {
	pub count: u64,
	pub min: Option<Vec<u8>>,
	pub max: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct CountRequest {
	pub envelope: RequestEnvelope,
	pub scans: Vec<Scan>,
}

#[derive(Debug, Clone, Copy)]
pub struct CountResponse {
	pub count: i64,
}

#[derive(Debug, Clone)]
pub struct ScanRequest {
	pub envelope: RequestEnvelope,
	pub scans: Vec<Scan>,
	pub projection: Option<Vec<i32>>,
	pub reverse: bool,
	pub distinct: bool,
	pub offset: i64,
	pub limit: i64,
	pub sorted: bool,
}

#[derive(Debug, Clone)]
pub struct ScanAllRequest {
	pub envelope: RequestEnvelope,
	pub limit: i64,
}

#[derive(Debug, Clone)]
pub struct MultiScanRequest {
	pub envelope: RequestEnvelope,
	pub scans: Vec<Scan>,
	pub projection: Option<Vec<i32>>,
	pub reverse: bool,
	pub distinct: bool,
	pub offset: i64,
	pub limit: i64,
	pub sorted: bool,
}

#[derive(Debug, Clone)]
pub struct Scan3Request {
	pub envelope: RequestEnvelope,
	pub scans: Vec<Scan>,
	pub projection: Option<Vec<i32>>,
	pub reverse: bool,
	pub distinct: bool,
	pub offset: i64,
	pub limit: i64,
	pub sorted: bool,
	pub group_aggr: Option<GroupAggr>,
}

#[derive(Debug, Clone)]
pub struct IndexEntry {
	pub entry_key: Vec<u8>,
	pub primary_key: Vec<u8>,
}

/// One frame of a streaming response. The framing layer's nil marker is
/// represented by the iterator/loop returning `None`, not by a variant
/// here; `StreamEnd` is the synthetic frame the client hands the caller's
/// handler once that nil has been observed (spec §4.6 step 3).
#[derive(Debug, Clone)]
pub enum ResponseFrame {
	Entries(Vec<IndexEntry>),
	StreamEnd,
}

#[derive(Debug, Clone, Copy)]
pub struct EndStreamRequest {
	pub request_id_hash: u64,
}
