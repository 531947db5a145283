//! Protocol error type.

use thiserror::Error;

/// Errors raised while encoding or decoding SID wire traffic.
#[derive(Debug, Error)]
pub enum ProtoError {
	/// Underlying I/O failure.
	#[error(transparent)]
	Io(#[from] std::io::Error),
	/// A frame exceeded the transport limit.
	#[error("message too large: {0} bytes")]
	FrameTooLarge(usize),
	/// A message was shorter than its fixed header.
	#[error("incorrect message header size")]
	ShortHeader,
	/// The peer speaks a different protocol version.
	#[error("protocol version unsupported: {got} (expected {expected})")]
	ProtocolMismatch {
		/// Version this side implements.
		expected: u8,
		/// Version the peer sent.
		got: u8,
	},
	/// A `DATA_EXT` message arrived without its ancillary file descriptor.
	#[error("no file descriptor in ancillary data")]
	NoFdReceived,
}
