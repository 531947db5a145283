#![warn(missing_docs)]

//! Shared wire types and low-level comms for the SID daemon.
//!
//! This crate defines the client-facing request/response protocol, the
//! internal worker <-> proxy channel protocol, length-prefixed framing,
//! file-descriptor passing over unix sockets and memfd-backed buffers.

pub mod error;
pub mod fdpass;
pub mod frame;
pub mod memfd;
pub mod paths;
pub mod types;

pub use error::ProtoError;
