//! Error classification for creation attempts (spec §4.5 "Error
//! classification on creation failure"), grounded on the original
//! indexer's `handleError` substring matching.

use std::time::Duration;

use rand::Rng;

use crate::cnf;

const NON_RETRYABLE_SUBSTRINGS: &[&str] = &["index already exist", "bucket is not found", "scope not found", "collection not found", "not authorized"];

/// Substrings that additionally mean the owning keyspace is gone, so the
/// schedule token itself (not just a stop-token) should be deleted.
const KEYSPACE_DELETED_SUBSTRINGS: &[&str] = &["bucket is not found", "scope not found", "collection not found", "keyspace not found"];

const ANOTHER_CREATION_IN_PROGRESS_SUBSTRINGS: &[&str] = &["another index creation", "build already in progress"];

const NETWORK_SUBSTRINGS: &[&str] = &["eof", "econnreset", "epipe", "i/o timeout", "connection refused"];

/// What the attempt protocol does next after a failed creation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
	/// Drop the item; if `keyspace_deleted`, the schedule token is
	/// deleted instead of a stop-token being posted.
	NonRetryable { keyspace_deleted: bool },
	/// Retry-count exceeded; post a stop-token and drop the item.
	RetriesExhausted,
	/// Retry after `backoff`.
	Retryable { backoff: Duration },
}

/// Classifies `error` given the item's current retry count, per spec
/// §4.5. `retry_count` is the count *before* this failure (the caller
/// increments after classifying).
pub fn classify(error: &str, retry_count: u32) -> Classification {
	let lower = error.to_ascii_lowercase();

	if NON_RETRYABLE_SUBSTRINGS.iter().any(|s| lower.contains(s)) {
		let keyspace_deleted = KEYSPACE_DELETED_SUBSTRINGS.iter().any(|s| lower.contains(s));
		return Classification::NonRetryable { keyspace_deleted };
	}

	if retry_count + 1 > cnf::MAX_CREATION_RETRIES {
		return Classification::RetriesExhausted;
	}

	if ANOTHER_CREATION_IN_PROGRESS_SUBSTRINGS.iter().any(|s| lower.contains(s)) {
		let ms = rand::thread_rng().gen_range(cnf::RANDOM_BACKOFF_START_MS..=cnf::RANDOM_BACKOFF_END_MS);
		return Classification::Retryable { backoff: Duration::from_millis(ms) };
	}

	if NETWORK_SUBSTRINGS.iter().any(|s| lower.contains(s)) {
		return Classification::Retryable { backoff: cnf::NETWORK_ERROR_BACKOFF };
	}

	Classification::Retryable { backoff: cnf::RETRYABLE_ERROR_BACKOFF }
}

#[cfg(test)]
mod tests {
	use super::*;

	// S4 from spec §8.
	#[test]
	fn io_timeout_gets_network_backoff() {
		let c = classify("read tcp: i/o timeout", 3);
		assert_eq!(c, Classification::Retryable { backoff: cnf::NETWORK_ERROR_BACKOFF });
	}

	#[test]
	fn keyspace_deleted_is_non_retryable_with_flag_set() {
		let c = classify("collection not found for this request", 0);
		assert_eq!(c, Classification::NonRetryable { keyspace_deleted: true });
	}

	#[test]
	fn non_retryable_without_keyspace_deletion_keeps_flag_false() {
		let c = classify("index already exist on this bucket", 0);
		assert_eq!(c, Classification::NonRetryable { keyspace_deleted: false });
	}

	#[test]
	fn exceeding_max_retries_is_reported_even_for_an_otherwise_retryable_message() {
		let c = classify("connection reset by peer", cnf::MAX_CREATION_RETRIES);
		assert_eq!(c, Classification::RetriesExhausted);
	}

	#[test]
	fn another_creation_in_progress_gets_randomized_backoff_within_bounds() {
		let c = classify("another index creation is in progress", 0);
		match c {
			Classification::Retryable { backoff } => {
				assert!(backoff.as_millis() as u64 >= cnf::RANDOM_BACKOFF_START_MS);
				assert!(backoff.as_millis() as u64 <= cnf::RANDOM_BACKOFF_END_MS);
			}
			other => panic!("expected retryable, got {other:?}"),
		}
	}

	#[test]
	fn generic_error_gets_default_retryable_backoff() {
		let c = classify("internal server error", 0);
		assert_eq!(c, Classification::Retryable { backoff: cnf::RETRYABLE_ERROR_BACKOFF });
	}
}
