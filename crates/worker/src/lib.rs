#![warn(missing_docs)]

//! SID worker control.
//!
//! The parent process owns a pool of worker processes, each represented
//! on the parent side by a proxy. Worker and proxy communicate over
//! typed channels created before spawn; internal channels carry
//! length-prefixed frames with a single-byte command, external channels
//! carry plain byte streams delimited by EOF. Sockets may additionally
//! pass one file descriptor per `DATA_EXT` message.

pub mod channel;
pub mod control;
pub mod error;
pub mod spawn;

pub use channel::{Channel, ChannelReader, ChannelSpec, ChannelWriter, Framing, Message, WireKind};
pub use control::{ProxyCommand, WorkerControl, WorkerEvent, WorkerState};
pub use error::WorkerError;
pub use nix::sys::signal::Signal;
pub use spawn::{
	ExternalParams, TimeoutSpec, WorkerEnv, WorkerParams, WorkerType, worker_env, yield_worker,
};
