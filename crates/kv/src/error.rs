//! Store error type.

use thiserror::Error;

/// Errors surfaced by store mutations and codecs.
#[derive(Debug, Error)]
pub enum KvError {
	/// A private record was accessed by a non-owner.
	#[error("module {owner} can't access value with key {key} which is private and attached to {holder}")]
	AccessDenied {
		/// Key under mutation.
		key: String,
		/// Owner attempting the access.
		owner: String,
		/// Owner holding the record.
		holder: String,
	},
	/// A protected record was overwritten by a non-owner.
	#[error("module {owner} can't overwrite value with key {key} which is protected and attached to {holder}")]
	Permission {
		/// Key under mutation.
		key: String,
		/// Owner attempting the overwrite.
		owner: String,
		/// Owner holding the record.
		holder: String,
	},
	/// A reserved key was taken or released by a non-owner.
	#[error("module {owner} can't take key {key} which is reserved by {holder}")]
	Busy {
		/// Key under mutation.
		key: String,
		/// Owner attempting the operation.
		owner: String,
		/// Owner holding the reservation.
		holder: String,
	},
	/// No record under the requested key.
	#[error("key not found")]
	NotFound,
	/// Malformed input to a codec or mutation.
	#[error("invalid input: {0}")]
	InvalidInput(String),
}
