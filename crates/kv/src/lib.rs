#![warn(missing_docs)]

//! The SID key-value store.
//!
//! Records are addressed by a structured seven-field key, carry ownership
//! and generation/sequence bookkeeping, and hold either a scalar byte
//! value or an ordered vector of byte items. Mutations go through
//! compare-and-update callbacks so that overwrite, reservation, merge and
//! delta semantics compose from one primitive. Vector-valued relation
//! keys are maintained through an incremental delta algebra that keeps
//! symmetric cross-references consistent.

pub mod delta;
pub mod error;
pub mod key;
pub mod policy;
pub mod record;
pub mod snapshot;
pub mod store;

pub use error::KvError;
pub use key::{KeyPart, KeySpec, Namespace, Op};
pub use record::{KvFlags, Payload, Record, ValueHeader};
pub use store::{DbStats, Decision, KvStore};
