use std::{fmt, io, sync::Arc};

use crate::lsn::Lsn;

/// Result returning Error
pub type Result<T> = std::result::Result<T, Error>;

/// `Error` is the error type for the node layer.
///
/// Variants fall in three groups: structural-invariant violations, which leave
/// the environment in an unknown state, log/integrity failures, which are
/// either swallowed or escalated depending on the slot they were read for, and
/// plain argument or I/O errors.
#[derive(Clone, Debug)]
pub enum Error {
	Io(Arc<io::Error>),  // An I/O error occurred
	NodeFull(usize),     // Insertion into a node that has no free slot
	NotFullNode,         // A full node was required but a BIN-delta was given
	CursorLost(Vec<u8>), // A cursor key vanished while merging a BIN-delta
	LogEntryNotFound(Lsn),
	ChecksumMismatch(Lsn),
	UnexpectedEntry(Lsn),
	Corruption(String), // Data corruption detected
	Serialization(String),
	Deserialization(String),
	InvalidArgument(String),
	Internal(String),
}

impl Error {
	/// Returns true if the error invalidates the environment that owns the
	/// node. Structural violations and escalated log failures are fatal.
	pub fn is_fatal(&self) -> bool {
		matches!(
			self,
			Error::NodeFull(_)
				| Error::NotFullNode
				| Error::CursorLost(_)
				| Error::Corruption(_)
				| Error::Internal(_)
		)
	}

	/// Returns true for failures reading a logged entry. These may be swallowed
	/// when the referencing slot is known to be deleted, expired or extinct.
	pub fn is_log_integrity(&self) -> bool {
		matches!(
			self,
			Error::LogEntryNotFound(_)
				| Error::ChecksumMismatch(_)
				| Error::UnexpectedEntry(_)
				| Error::Deserialization(_)
		)
	}
}

// Implementation of Display trait for Error
impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Io(err) => write!(f, "IO error: {err}"),
			Error::NodeFull(n) => write!(f, "Node is full ({n} entries), split before inserting"),
			Error::NotFullNode => write!(f, "Operation requires a full BIN, found a BIN-delta"),
			Error::CursorLost(key) => {
				write!(f, "Cursor key {key:?} not found after BIN-delta merge")
			}
			Error::LogEntryNotFound(lsn) => write!(f, "Log entry not found at {lsn}"),
			Error::ChecksumMismatch(lsn) => write!(f, "Checksum mismatch for log entry at {lsn}"),
			Error::UnexpectedEntry(lsn) => write!(f, "Unexpected log entry type at {lsn}"),
			Error::Corruption(err) => write!(f, "Data corruption detected: {err}"),
			Error::Serialization(err) => write!(f, "Serialization error: {err}"),
			Error::Deserialization(err) => write!(f, "Deserialization error: {err}"),
			Error::InvalidArgument(err) => write!(f, "Invalid argument: {err}"),
			Error::Internal(err) => write!(f, "Internal error: {err}"),
		}
	}
}

// Implementation of Error trait for Error
impl std::error::Error for Error {}

// Implementation to convert io::Error into Error
impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		Error::Io(Arc::new(e))
	}
}

#[cfg(test)]
mod tests {
	use test_log::test;

	use super::*;

	#[test]
	fn fatal_classification() {
		assert!(Error::NodeFull(4).is_fatal());
		assert!(Error::CursorLost(b"k".to_vec()).is_fatal());
		assert!(Error::Corruption("x".into()).is_fatal());
		assert!(!Error::ChecksumMismatch(Lsn::new(1, 2)).is_fatal());
		assert!(!Error::InvalidArgument("x".into()).is_fatal());
	}

	#[test]
	fn integrity_classification() {
		assert!(Error::LogEntryNotFound(Lsn::new(0, 10)).is_log_integrity());
		assert!(Error::ChecksumMismatch(Lsn::new(0, 10)).is_log_integrity());
		assert!(!Error::NodeFull(1).is_log_integrity());
	}

	#[test]
	fn io_conversion() {
		let err: Error = io::Error::other("disk gone").into();
		assert!(matches!(err, Error::Io(_)));
		assert_eq!(err.to_string(), "IO error: disk gone");
	}
}
