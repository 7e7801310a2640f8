//! BIN-deltas.
//!
//! A BIN-delta holds only the slots of a BIN that changed since its last full
//! version was logged. Deltas are cumulative: every delta written for a full
//! version holds all slots dirtied since that full write, so rebuilding a BIN
//! never takes more than the last full entry plus the last delta entry.

use std::sync::Arc;

use log::{debug, trace};

use crate::bloom::{self, BloomBuilder};
use crate::error::{Error, Result};

use super::{CursorPosition, DeltaShape, Node, SlotEntry, SlotState, Target};

impl Node {
	pub fn n_dirty_slots(&self) -> usize {
		(0..self.n_entries).filter(|&i| self.is_dirty_slot(i)).count()
	}

	/// Whether the next write of this BIN should be a delta.
	///
	/// A delta is only written when a full version exists, nothing prohibits
	/// it, and few enough slots are dirty. A node that is already a delta can
	/// only be written as a delta.
	pub fn should_log_delta(&self) -> bool {
		let Some(bin) = self.bin_state() else {
			return false;
		};
		if bin.delta.is_some() {
			return true;
		}
		if self.last_full_lsn.is_null() || bin.prohibit_next_delta {
			return false;
		}
		if (0..self.n_entries).any(|i| self.states[i].contains(SlotState::MIGRATE)) {
			return false;
		}
		let dirty = self.n_dirty_slots();
		dirty > 0 && dirty * 100 <= self.n_entries * self.env.options.bin_delta_percent
	}

	/// Forbids the next delta of the current full version.
	pub fn prohibit_next_delta(&mut self) {
		if let Some(bin) = self.bin_state_mut() {
			bin.prohibit_next_delta = true;
		}
	}

	fn can_mutate_to_delta(&self) -> bool {
		if !self.is_bin() || self.is_delta() || self.cursor_count() > 0 {
			return false;
		}
		for (i, t) in self.targets.iter() {
			match t {
				Target::Record(ln) if !ln.is_evictable() => return false,
				Target::Record(ln) if ln.is_dirty() && !self.is_dirty_slot(i) => return false,
				Target::Node(_) => return false,
				_ => {}
			}
		}
		self.should_log_delta()
	}

	/// Drops the clean slots of a full BIN, keeping only what a delta needs.
	///
	/// Returns false and leaves the node alone when it cannot become a delta.
	/// With blind operations enabled the dropped keys are summarized in a
	/// bloom filter.
	pub fn mutate_to_delta(&mut self) -> Result<bool> {
		if !self.can_mutate_to_delta() {
			return Ok(false);
		}
		let before = self.memory_size();
		let shape = DeltaShape {
			full_n_entries: self.n_entries,
			full_max_entries: self.capacity(),
		};
		let bloom = self.env.options.bin_delta_blind_ops.then(|| {
			let mut builder = BloomBuilder::new(self.env.options.bloom_bits_per_key);
			for i in (0..self.n_entries).filter(|&i| !self.is_dirty_slot(i)) {
				builder.add(&self.key(i));
			}
			builder.finish()
		});

		let n = self.n_entries;
		let keep: Vec<usize> = (0..n).filter(|&i| self.is_dirty_slot(i)).collect();
		let dirty: Vec<SlotEntry> = keep.into_iter().map(|i| self.take_slot(i)).collect();
		for i in 0..n {
			self.clear_slot(i);
		}
		self.n_entries = 0;
		self.resize(dirty.len())?;
		for entry in dirty {
			self.append_entry(entry)?;
		}
		if let Some(bin) = self.bin_state_mut() {
			bin.delta = Some(shape);
			bin.bloom = bloom;
		}
		self.recompute_prefix();
		debug!(
			"node {} mutated to delta: {} of {} slots kept, {} bytes freed",
			self.id,
			self.n_entries,
			shape.full_n_entries,
			before.saturating_sub(self.memory_size())
		);
		Ok(true)
	}

	/// Rebuilds the full BIN from its last full version and this delta.
	///
	/// Every delta slot is applied on top of the full version and stays dirty.
	/// Cursors are moved to the slot of the key they were on.
	pub fn mutate_to_full(&mut self) -> Result<()> {
		let Some(shape) = self.delta_shape() else {
			return Ok(());
		};
		if self.last_full_lsn.is_null() {
			return Err(Error::Internal(format!("delta {} has no full version", self.id)));
		}
		let mut full = Node::fetch(&self.env, self.last_full_lsn)?;
		if full.is_delta() || !full.is_bin() {
			return Err(Error::UnexpectedEntry(self.last_full_lsn));
		}

		let registered = match self.bin_state_mut() {
			Some(bin) => std::mem::take(&mut bin.cursors),
			None => Vec::new(),
		};
		let cursors: Vec<(Arc<CursorPosition>, Vec<u8>)> = registered
			.into_iter()
			.map(|c| {
				let key = self.key(c.index());
				(c, key)
			})
			.collect();
		let was_dirty = self.dirty;
		let delta_slots: Vec<SlotEntry> = (0..self.n_entries).map(|i| self.take_slot(i)).collect();

		self.swap_slots(&mut full);
		let capacity = shape.full_max_entries.max(self.n_entries + delta_slots.len());
		self.resize(capacity)?;

		for mut entry in delta_slots {
			entry.state.insert(SlotState::DIRTY);
			match self.insertion_index(&entry.key) {
				Ok(idx) => self.update_record(idx, entry),
				Err(_) => {
					self.insert_entry(entry)?;
				}
			}
		}

		let mut relocated = Vec::with_capacity(cursors.len());
		for (c, key) in cursors {
			match self.find_entry(&key, true) {
				Some(found) => {
					c.set_index(found.index);
					relocated.push(c);
				}
				None => return Err(Error::CursorLost(key)),
			}
		}
		if let Some(bin) = self.bin_state_mut() {
			bin.delta = None;
			bin.bloom = None;
			bin.cursors = relocated;
		}
		// Applied slots are already durable in the logged delta.
		self.dirty = was_dirty;
		self.recompute_prefix();
		trace!("node {} merged into full BIN with {} slots", self.id, self.n_entries);
		Ok(())
	}

	/// Exchanges the slot stores of two nodes.
	fn swap_slots(&mut self, other: &mut Node) {
		std::mem::swap(&mut self.key_prefix, &mut other.key_prefix);
		std::mem::swap(&mut self.n_entries, &mut other.n_entries);
		std::mem::swap(&mut self.keys, &mut other.keys);
		std::mem::swap(&mut self.lsns, &mut other.lsns);
		std::mem::swap(&mut self.sizes, &mut other.sizes);
		std::mem::swap(&mut self.states, &mut other.states);
		std::mem::swap(&mut self.targets, &mut other.targets);
		std::mem::swap(&mut self.vlsns, &mut other.vlsns);
		std::mem::swap(&mut self.expirations, &mut other.expirations);
		std::mem::swap(&mut self.expiration_in_hours, &mut other.expiration_in_hours);
		std::mem::swap(&mut self.mod_times, &mut other.mod_times);
		std::mem::swap(&mut self.create_times, &mut other.create_times);
		self.update_memory_size();
		other.update_memory_size();
	}

	/// Whether `key` is known to be absent from the full version.
	pub fn definitely_absent_from_full(&self, key: &[u8]) -> bool {
		match self.bin_state() {
			Some(bin) if bin.delta.is_some() => {
				bin.bloom.as_deref().is_some_and(|filter| !bloom::may_contain(filter, key))
			}
			_ => false,
		}
	}

	/// Inserts `entry` into a delta without fetching the full version.
	///
	/// Returns false if the key may be in the full version or the delta would
	/// grow past the configured share of the full node. The caller then merges
	/// and inserts into the full node.
	pub fn blind_insert(&mut self, entry: SlotEntry) -> Result<bool> {
		let Some(shape) = self.delta_shape() else {
			return Err(Error::InvalidArgument("blind insert into a full BIN".into()));
		};
		if !self.env.options.bin_delta_blind_ops || !self.definitely_absent_from_full(&entry.key) {
			return Ok(false);
		}
		let pct = self.env.options.bin_delta_percent;
		if (self.n_entries + 1) * 100 > (shape.full_n_entries + 1) * pct {
			return Ok(false);
		}
		if self.is_full() {
			self.resize(self.capacity() + 1)?;
		}
		self.insert_entry(entry)?;
		if let Some(bin) = self.bin_state_mut() {
			if let Some(delta) = &mut bin.delta {
				delta.full_n_entries += 1;
				delta.full_max_entries = delta.full_max_entries.max(delta.full_n_entries);
			}
		}
		Ok(true)
	}
}

#[cfg(test)]
mod tests {
	use test_log::test;

	use super::*;
	use crate::lsn::Lsn;
	use crate::node::tests::test_env;
	use crate::options::Options;

	fn keyed(i: usize) -> Vec<u8> {
		format!("key{i:02}").into_bytes()
	}

	/// A clean, fully logged BIN with `n` slots.
	fn logged_bin(options: Options, n: usize) -> Node {
		let env = test_env(options);
		let mut bin = Node::new_bin(env, Vec::new());
		for i in 0..n {
			bin.insert_entry(SlotEntry::new(keyed(i), Lsn::new(1, i as u32))).unwrap();
		}
		bin.log(false, false).unwrap();
		assert_eq!(bin.n_dirty_slots(), 0);
		bin
	}

	#[test]
	fn delta_decision_follows_dirty_share() {
		let mut bin = logged_bin(Options::default().with_bin_delta_percent(25), 10);
		assert!(!bin.should_log_delta());
		bin.update_slot_lsn(1, Lsn::new(2, 0), 10);
		bin.update_slot_lsn(5, Lsn::new(2, 10), 10);
		assert!(bin.should_log_delta());
		bin.update_slot_lsn(6, Lsn::new(2, 20), 10);
		bin.update_slot_lsn(7, Lsn::new(2, 30), 10);
		assert!(!bin.should_log_delta());
	}

	#[test]
	fn no_delta_without_full_version_or_after_dirty_delete() {
		let env = test_env(Options::default());
		let mut fresh = Node::new_bin(env, Vec::new());
		fresh.insert_entry(SlotEntry::new(keyed(0), Lsn::new(1, 0))).unwrap();
		assert!(!fresh.should_log_delta());

		let mut bin = logged_bin(Options::default(), 10);
		bin.update_slot_lsn(1, Lsn::new(2, 0), 10);
		bin.update_slot_lsn(2, Lsn::new(2, 1), 10);
		assert!(bin.should_log_delta());
		bin.delete_entry(2, true).unwrap();
		assert!(!bin.should_log_delta());
	}

	#[test]
	fn migrate_bit_prohibits_delta() {
		let mut bin = logged_bin(Options::default(), 10);
		bin.update_slot_lsn(1, Lsn::new(2, 0), 10);
		assert!(bin.should_log_delta());
		bin.set_state_bit(3, SlotState::MIGRATE, true);
		assert!(!bin.should_log_delta());
	}

	#[test]
	fn mutate_to_delta_and_back() {
		let mut bin = logged_bin(Options::default(), 12);
		bin.update_slot_lsn(3, Lsn::new(2, 0), 10);
		bin.update_slot_lsn(8, Lsn::new(2, 10), 10);
		let full_size = bin.memory_size();

		assert!(bin.mutate_to_delta().unwrap());
		assert!(bin.is_delta());
		assert_eq!(bin.n_entries(), 2);
		assert_eq!(bin.key(0), keyed(3));
		assert!(bin.memory_size() < full_size);
		assert!(bin.definitely_absent_from_full(b"nothing"));
		assert!(!bin.definitely_absent_from_full(&keyed(5)));
		assert!(matches!(bin.delete_entry(0, true), Err(Error::NotFullNode)));

		bin.mutate_to_full().unwrap();
		assert!(!bin.is_delta());
		assert_eq!(bin.n_entries(), 12);
		assert_eq!(bin.lsn(3), Lsn::new(2, 0));
		assert_eq!(bin.lsn(8), Lsn::new(2, 10));
		assert_eq!(bin.n_dirty_slots(), 2);
		bin.check_order().unwrap();
		bin.verify_memory_size().unwrap();
	}

	#[test]
	fn blind_insert_skips_the_full_version() {
		let mut bin = logged_bin(Options::default().with_bin_delta_percent(50), 12);
		bin.update_slot_lsn(3, Lsn::new(2, 0), 10);
		assert!(bin.mutate_to_delta().unwrap());

		let inserted = bin.blind_insert(SlotEntry::new(&b"key05x"[..], Lsn::new(2, 5))).unwrap();
		assert!(inserted);
		assert_eq!(bin.n_entries(), 2);
		// a key of the full version may not be inserted blindly
		assert!(!bin.blind_insert(SlotEntry::new(keyed(7), Lsn::new(2, 6))).unwrap());

		bin.mutate_to_full().unwrap();
		assert_eq!(bin.n_entries(), 13);
		assert!(bin.find_entry(b"key05x", true).is_some());
		bin.check_order().unwrap();
	}

	#[test]
	fn cursor_survives_merge() {
		let mut bin = logged_bin(Options::default(), 12);
		bin.update_slot_lsn(9, Lsn::new(2, 0), 10);
		assert!(bin.mutate_to_delta().unwrap());
		let c = bin.register_cursor(0).unwrap();
		bin.mutate_to_full().unwrap();
		assert_eq!(c.index(), 9);
		assert_eq!(bin.key(c.index()), keyed(9));
	}

	#[test]
	fn nodes_with_cursors_stay_full() {
		let mut bin = logged_bin(Options::default(), 12);
		bin.update_slot_lsn(9, Lsn::new(2, 0), 10);
		let c = bin.register_cursor(4).unwrap();
		assert!(!bin.mutate_to_delta().unwrap());
		bin.unregister_cursor(&c);
		assert!(bin.mutate_to_delta().unwrap());
	}
}
