//! Bridge error type.

use thiserror::Error;

/// Errors surfaced by the orchestration core.
#[derive(Debug, Error)]
pub enum UbridgeError {
	/// Underlying I/O failure.
	#[error(transparent)]
	Io(#[from] std::io::Error),
	/// Store failure (includes the ownership refusal kinds).
	#[error(transparent)]
	Kv(#[from] sid_kv::KvError),
	/// Wire-level failure.
	#[error(transparent)]
	Proto(#[from] sid_proto::ProtoError),
	/// Worker-control failure.
	#[error(transparent)]
	Worker(#[from] sid_worker::WorkerError),
	/// Malformed request or argument.
	#[error("invalid input: {0}")]
	InvalidInput(String),
	/// Requested record does not exist.
	#[error("not found")]
	NotFound,
	/// An operation was attempted in a phase lacking the capability.
	#[error("operation {op} not permitted in {phase} phase")]
	PhaseCapability {
		/// Attempted operation.
		op: &'static str,
		/// Phase it was attempted in.
		phase: &'static str,
	},
	/// Group destroy refused while members remain.
	#[error("group {0} still has members")]
	NotEmpty(String),
	/// The client speaks a different protocol version.
	#[error("protocol version unsupported: {0}")]
	ProtocolMismatch(u8),
	/// A module failed a scan phase.
	#[error("{phase} phase failed")]
	PhaseFailed {
		/// Failed phase.
		phase: &'static str,
	},
	/// The parent process is gone.
	#[error("parent process exited")]
	ParentGone,
	/// Invariant violation inside the core.
	#[error("internal error: {0}")]
	Internal(String),
}
