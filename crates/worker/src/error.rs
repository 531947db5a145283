//! Worker-control error type.

use thiserror::Error;

/// Errors raised by worker control and channels.
#[derive(Debug, Error)]
pub enum WorkerError {
	/// Underlying I/O failure.
	#[error(transparent)]
	Io(#[from] std::io::Error),
	/// Wire-level failure.
	#[error(transparent)]
	Proto(#[from] sid_proto::ProtoError),
	/// No channel with the requested id.
	#[error("no channel with id {0}")]
	UnknownChannel(String),
	/// No worker with the requested id.
	#[error("no worker with id {0}")]
	UnknownWorker(String),
	/// The peer closed the channel.
	#[error("peer closed channel {0}")]
	ChannelClosed(String),
	/// A send was attempted on a receive-only wire or vice versa.
	#[error("channel {0} does not carry traffic in this direction")]
	WrongDirection(String),
	/// Worker process creation failed.
	#[error("failed to spawn worker: {0}")]
	Spawn(String),
	/// The worker environment is missing or malformed.
	#[error("worker environment incomplete: {0}")]
	Environment(String),
	/// The parent process is gone.
	#[error("parent process exited")]
	ParentGone,
}
