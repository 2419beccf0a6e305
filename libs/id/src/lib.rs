//! # cloudfleet-id
//!
//! Typed identifiers for cloudfleet.
//!
//! Cloud nodes and agents keep the opaque ids their driver hands out. The ids
//! in this crate are the ones cloudfleet mints itself: a termination ledger
//! needs a name that is unique across restarts so its durable record can be
//! told apart from every other record in the data directory, provisioning
//! batches need a handle for log correlation, and a build's supplemental
//! instances need a handle it can tear them down by.
//!
//! ## ID Format
//!
//! `{prefix}_{ulid}`, e.g. `ledger_01HV4Z2WQXKJNM8GPQY6VBKC3D`.
//!
//! ULIDs carry 80 bits of randomness and sort by creation time, so two
//! ledgers written in the same millisecond still get distinct record names.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
