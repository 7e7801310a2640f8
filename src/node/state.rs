//! Per-slot state bits and node levels.

use std::fmt;

/// The state byte kept for every slot.
#[derive(Copy, Clone, PartialEq, Eq, Default, Hash)]
pub struct SlotState(u8);

impl SlotState {
	/// Deletion is unconditionally known: committed, or never completed.
	pub const KNOWN_DELETED: SlotState = SlotState(0x01);
	/// Slot changed since the last full write of its node.
	pub const DIRTY: SlotState = SlotState(0x02);
	/// IN only: refresh the key from the child's identifier key when logging.
	pub const UPDATE_KEY_ON_LOG: SlotState = SlotState(0x04);
	/// Deleted by a transaction that has not committed yet.
	pub const PENDING_DELETED: SlotState = SlotState(0x08);
	/// Record data is stored with the key.
	pub const EMBEDDED: SlotState = SlotState(0x10);
	/// The record has no data at all (key-only database).
	pub const NO_DATA: SlotState = SlotState(0x20);
	/// The record was written as a deletion marker.
	pub const TOMBSTONE: SlotState = SlotState(0x40);
	/// The record should be migrated by the log cleaner on next write.
	pub const MIGRATE: SlotState = SlotState(0x80);

	/// Bits that only describe in-memory state.
	pub const TRANSIENT: SlotState = SlotState(0x02 | 0x04 | 0x80);

	pub const EMPTY: SlotState = SlotState(0);

	pub const fn from_bits(bits: u8) -> Self {
		SlotState(bits)
	}

	pub const fn bits(self) -> u8 {
		self.0
	}

	#[inline]
	pub const fn contains(self, other: SlotState) -> bool {
		self.0 & other.0 == other.0
	}

	#[inline]
	pub fn insert(&mut self, other: SlotState) {
		self.0 |= other.0;
	}

	#[inline]
	pub fn remove(&mut self, other: SlotState) {
		self.0 &= !other.0;
	}

	#[inline]
	pub fn set(&mut self, other: SlotState, on: bool) {
		if on {
			self.insert(other);
		} else {
			self.remove(other);
		}
	}

	pub const fn union(self, other: SlotState) -> SlotState {
		SlotState(self.0 | other.0)
	}

	/// The state as written to the log.
	pub const fn persisted(self) -> u8 {
		self.0 & !Self::TRANSIENT.0
	}

	pub const fn is_deleted(self) -> bool {
		self.0 & (Self::KNOWN_DELETED.0 | Self::PENDING_DELETED.0) != 0
	}
}

impl fmt::Debug for SlotState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		const NAMES: [(SlotState, &str); 8] = [
			(SlotState::KNOWN_DELETED, "KNOWN_DELETED"),
			(SlotState::DIRTY, "DIRTY"),
			(SlotState::UPDATE_KEY_ON_LOG, "UPDATE_KEY_ON_LOG"),
			(SlotState::PENDING_DELETED, "PENDING_DELETED"),
			(SlotState::EMBEDDED, "EMBEDDED"),
			(SlotState::NO_DATA, "NO_DATA"),
			(SlotState::TOMBSTONE, "TOMBSTONE"),
			(SlotState::MIGRATE, "MIGRATE"),
		];
		let mut first = true;
		write!(f, "SlotState(")?;
		for (bit, name) in NAMES {
			if self.contains(bit) {
				if !first {
					write!(f, "|")?;
				}
				write!(f, "{name}")?;
				first = false;
			}
		}
		write!(f, ")")
	}
}

/// Tree level of a node.
///
/// The high bits tell which logical tree the node belongs to, the low 16 bits
/// its height above the records. BINs are at height 1.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Level(u32);

impl Level {
	pub const MAIN: u32 = 0x10000;
	pub const CATALOG: u32 = 0x20000;
	pub const HEIGHT_MASK: u32 = 0xffff;

	pub const fn from_raw(raw: u32) -> Self {
		Level(raw)
	}

	pub const fn raw(self) -> u32 {
		self.0
	}

	pub fn bin(catalog: bool) -> Self {
		Level(Self::tree_bits(catalog) | 1)
	}

	const fn tree_bits(catalog: bool) -> u32 {
		if catalog {
			Self::CATALOG
		} else {
			Self::MAIN
		}
	}

	pub const fn height(self) -> u32 {
		self.0 & Self::HEIGHT_MASK
	}

	pub const fn is_bin(self) -> bool {
		self.height() == 1
	}

	pub const fn is_catalog(self) -> bool {
		self.0 & Self::CATALOG != 0
	}

	/// The level of a new parent for a node at this level.
	pub const fn parent(self) -> Self {
		Level(self.0 + 1)
	}
}

#[cfg(test)]
mod tests {
	use test_log::test;

	use super::*;

	#[test]
	fn transient_bits_are_not_persisted() {
		let mut s = SlotState::EMPTY;
		s.insert(SlotState::DIRTY);
		s.insert(SlotState::KNOWN_DELETED);
		s.insert(SlotState::MIGRATE);
		s.insert(SlotState::UPDATE_KEY_ON_LOG);
		assert_eq!(s.persisted(), SlotState::KNOWN_DELETED.bits());
		assert!(s.is_deleted());

		s.remove(SlotState::KNOWN_DELETED);
		assert!(!s.is_deleted());
		s.set(SlotState::PENDING_DELETED, true);
		assert!(s.is_deleted());
		assert_eq!(format!("{s:?}"), "SlotState(DIRTY|UPDATE_KEY_ON_LOG|PENDING_DELETED|MIGRATE)");
	}

	#[test]
	fn levels() {
		let bin = Level::bin(false);
		assert!(bin.is_bin());
		assert!(!bin.is_catalog());
		assert_eq!(bin.parent().height(), 2);
		assert!(!bin.parent().is_bin());
		assert!(Level::bin(true).is_catalog());
	}
}
