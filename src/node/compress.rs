//! Removal of deleted and expired slots from full BINs.

use log::debug;

use crate::error::Result;

use super::Node;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CompressOutcome {
	pub removed: usize,
	/// False if some removable slot had to be left behind. The caller retries
	/// on a later pass.
	pub complete: bool,
	/// The lowest key of the node changed.
	pub identifier_changed: bool,
	pub bytes_freed: usize,
}

impl Node {
	/// Removes slots whose records are deleted or expired.
	///
	/// A slot stays if a cursor is positioned on it, or if its record is
	/// locked and not extinct. Dirty slots are only considered when
	/// `compress_dirty_slots` is set. Removal does not dirty the node: the
	/// logged state already says the records are gone.
	pub fn compress(&mut self, compress_dirty_slots: bool) -> Result<CompressOutcome> {
		if !self.is_bin() {
			return Ok(CompressOutcome {
				complete: true,
				..Default::default()
			});
		}
		if self.is_delta() {
			return Ok(CompressOutcome::default());
		}
		let before = self.memory_size();
		let now = self.env.now_millis();
		let first_key = (self.n_entries > 0).then(|| self.key(0));
		let mut outcome = CompressOutcome {
			complete: true,
			..Default::default()
		};

		for i in (0..self.n_entries).rev() {
			if !compress_dirty_slots && self.is_dirty_slot(i) {
				continue;
			}
			if !self.is_defunct(i, now) {
				continue;
			}
			if self.has_cursor_at(i) {
				outcome.complete = false;
				continue;
			}
			let lsn = self.lsns[i];
			let locked = !lsn.is_null() && self.env.locks.is_contended(lsn);
			if locked && !self.env.is_extinct(&self.key(i)) {
				outcome.complete = false;
				continue;
			}
			self.delete_entry(i, false)?;
			outcome.removed += 1;
		}

		if outcome.removed > 0 {
			let new_first = (self.n_entries > 0).then(|| self.key(0));
			if new_first.is_some() && new_first != first_key {
				outcome.identifier_changed = true;
				if let Some(key) = new_first {
					if self.env.hooks.allow_identifier_key_update() {
						self.identifier_key = key;
					}
				}
			}
			self.recompute_prefix();
		}
		// A BIN grown by a delta merge goes back to the configured size.
		let max_entries = self.env.options.max_entries;
		if self.capacity() > max_entries && self.n_entries <= max_entries {
			self.resize(max_entries)?;
		}
		outcome.bytes_freed = before.saturating_sub(self.memory_size());
		if outcome.removed > 0 || !outcome.complete {
			debug!(
				"compressed node {}: removed {} slots, complete {}",
				self.id, outcome.removed, outcome.complete
			);
		}
		Ok(outcome)
	}
}
