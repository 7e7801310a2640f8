//! Node layer of an embedded B-tree storage engine.
//!
//! Internal nodes (INs) route searches, bottom internal nodes (BINs) hold the
//! slots of leaf records (LNs). Nodes are written to an append-only log, BINs
//! either in full or as deltas of their dirty slots, and are read back on
//! demand. [`Tree`] drives the node layer for record-level operations.

pub mod bloom;
pub mod cache;
pub mod comparator;
pub mod env;
pub mod error;
pub mod ln;
pub mod lsn;
pub mod memory;
pub mod node;
pub mod options;
pub mod tree;
pub mod ttl;
pub mod verify;

#[cfg(test)]
mod test;

pub use comparator::{BytewiseComparator, Comparator};
pub use env::{
	EntryKind, ExtinctPrefixes, LockTable, LogManager, LogPosition, MemoryLog, NodeEnv, NodeHooks,
};
pub use error::{Error, Result};
pub use ln::{Ln, LnPayload};
pub use lsn::{Lsn, NULL_LSN};
pub use node::{Level, Node, NodeRef, SlotEntry, SlotState};
pub use options::Options;
pub use tree::{Cursor, DeleteMode, Tree};
pub use ttl::Expiration;
pub use verify::{VerifyError, VerifyReport};
