//! Log positions.
//!
//! An [`Lsn`] names a durable location handed out by the log manager. The high
//! 32 bits hold the log file number and the low 32 bits the offset inside that
//! file, so positions order the same way the log was written.

use std::fmt;

/// Version sequence number meaning "not recorded".
pub const NULL_VLSN: u64 = 0;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(u64);

/// The position of nothing: a slot that was never logged.
pub const NULL_LSN: Lsn = Lsn(u64::MAX);

impl Lsn {
	pub const fn new(file_number: u32, file_offset: u32) -> Self {
		Lsn(((file_number as u64) << 32) | file_offset as u64)
	}

	pub const fn from_raw(raw: u64) -> Self {
		Lsn(raw)
	}

	pub const fn raw(self) -> u64 {
		self.0
	}

	pub const fn file_number(self) -> u32 {
		(self.0 >> 32) as u32
	}

	pub const fn file_offset(self) -> u32 {
		self.0 as u32
	}

	pub const fn is_null(self) -> bool {
		self.0 == NULL_LSN.0
	}

	/// Value written to the log: NULL becomes 0 so the common case stays a
	/// short varint.
	pub(crate) fn to_persisted(self) -> u64 {
		self.0.wrapping_add(1)
	}

	pub(crate) fn from_persisted(v: u64) -> Self {
		Lsn(v.wrapping_sub(1))
	}
}

impl Default for Lsn {
	fn default() -> Self {
		NULL_LSN
	}
}

impl fmt::Display for Lsn {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_null() {
			write!(f, "<null>")
		} else {
			write!(f, "0x{:x}/0x{:x}", self.file_number(), self.file_offset())
		}
	}
}

impl fmt::Debug for Lsn {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}
