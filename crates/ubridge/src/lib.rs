#![warn(missing_docs)]

//! SID orchestration core.
//!
//! The parent process (the bridge) owns the authoritative key-value
//! store, accepts client connections and hands each request to a worker
//! process together with the accepted descriptor. The worker imports the
//! udev environment into its store snapshot, drives the scan pipeline
//! over the registered block and type modules, exports its committed
//! changes back to the parent for merge, and answers the client.

pub mod cmd;
pub mod common;
pub mod error;
pub mod export;
pub mod fmt;
pub mod merge;
pub mod module;
pub mod resources;
pub mod scan;
pub mod service;
pub mod udev;
pub mod worker_entry;

pub use error::UbridgeError;
pub use module::{ModuleRegistry, Registries, UcmdModule};

/// Id of the single proxy <-> worker channel.
pub const MAIN_CHANNEL_ID: &str = "main";
