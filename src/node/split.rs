//! Node splits.

use std::cmp::Ordering;

use log::debug;

use crate::error::{Error, Result};
use crate::lsn::Lsn;

use super::{Node, NodeRef, SlotEntry};

/// What a split produced.
#[derive(Debug)]
pub struct SplitOutcome {
	/// The new node, already referenced from the parent.
	pub sibling: NodeRef,
	/// True if the sibling took the lower half of the slots.
	pub sibling_is_left: bool,
	/// Where the parent was logged.
	pub parent_lsn: Lsn,
}

impl Node {
	/// Picks the slot to split at for an insert of `key`.
	///
	/// A key that extends the leftmost node below its lowest key, or the
	/// rightmost node past its highest key, splits off a single slot so that
	/// ascending and descending loads leave full nodes behind.
	pub fn split_index_for(&self, key: &[u8], leftmost: bool, rightmost: bool) -> usize {
		let n = self.n_entries;
		let cmp = self.env.comparator.as_ref();
		let first_real = if self.is_bin() {
			0
		} else {
			1
		};
		if leftmost && n > first_real && cmp.compare(key, &self.key(first_real)) == Ordering::Less {
			return 1;
		}
		if rightmost && n > 1 && cmp.compare(key, &self.key(n - 1)) == Ordering::Greater {
			return n - 1;
		}
		n / 2
	}

	/// Splits this node at `split_index`.
	///
	/// The half that does not hold the identifier key moves to a new sibling.
	/// Both halves are logged provisionally before the parent, and the parent
	/// is logged provisionally unless it is the root. If a grandparent is
	/// given, its slot for the parent is pointed at the new parent entry.
	pub fn split(
		&mut self,
		parent: &mut Node,
		child_index: usize,
		grandparent: Option<(&mut Node, usize)>,
		split_index: usize,
	) -> Result<SplitOutcome> {
		let n = self.n_entries;
		if n < 2 || split_index == 0 || split_index >= n {
			return Err(Error::InvalidArgument(format!(
				"cannot split node {} with {n} entries at {split_index}",
				self.id
			)));
		}
		if parent.is_full() {
			return Err(Error::NodeFull(parent.n_entries));
		}
		let this_ref = parent
			.child(child_index)
			.filter(|c| c.id() == self.id)
			.ok_or_else(|| {
				Error::Internal(format!(
					"slot {child_index} of node {} does not refer to node {}",
					parent.id, self.id
				))
			})?;

		let id_index = self.find_entry(&self.identifier_key, false).map_or(0, |f| f.index);
		let (low, high) = if id_index < split_index {
			(split_index, n)
		} else {
			(0, split_index)
		};

		let sibling_key = self.key(low);
		let mut sibling =
			Node::new(self.env.clone(), self.level, sibling_key.clone(), self.capacity());
		let sibling_id = sibling.id;

		for i in low..high {
			let entry = self.take_slot(i);
			sibling.append_entry(entry)?;
		}
		if low == 0 {
			self.copy_slots(high, 0, n - high);
		}
		for i in (n - (high - low))..n {
			self.clear_slot(i);
		}
		self.n_entries = n - (high - low);

		if let Some(bin) = self.bin_state_mut() {
			let (moved, kept): (Vec<_>, Vec<_>) =
				bin.cursors.drain(..).partition(|c| (low..high).contains(&c.index()));
			for c in &kept {
				if low == 0 {
					c.set_index(c.index() - high);
				}
			}
			bin.cursors = kept;
			bin.prohibit_next_delta = true;
			for c in &moved {
				c.set_node(sibling_id, c.index() - low);
			}
			if let Some(sib) = sibling.bin_state_mut() {
				sib.cursors = moved;
			}
		}

		self.dirty = true;
		sibling.dirty = true;
		self.recompute_prefix();
		sibling.recompute_prefix();

		let sibling_pos = sibling.log(true, false)?;
		let this_pos = self.log(true, false)?;
		let sibling_ref = NodeRef::new(sibling);

		if low == 0 {
			let this_key = self.key(0);
			parent.update_entry(child_index, sibling_ref.clone(), sibling_pos.lsn, sibling_pos.size);
			parent.insert_entry(SlotEntry::child(
				this_key,
				this_ref,
				this_pos.lsn,
				this_pos.size,
			))?;
		} else {
			parent.update_slot_lsn(child_index, this_pos.lsn, this_pos.size);
			parent.insert_entry(SlotEntry::child(
				sibling_key,
				sibling_ref.clone(),
				sibling_pos.lsn,
				sibling_pos.size,
			))?;
		}
		parent.set_provisional_children(true);

		let provisional = !parent.is_root;
		let parent_pos = parent.log(provisional, false)?;
		if let Some((gp, idx)) = grandparent {
			gp.update_slot_lsn(idx, parent_pos.lsn, parent_pos.size);
			if provisional {
				gp.set_provisional_children(true);
			}
		}

		debug!(
			"split node {} at {split_index}: moved slots {low}..{high} to node {sibling_id}, parent {} logged at {}",
			self.id, parent.id, parent_pos.lsn
		);
		Ok(SplitOutcome {
			sibling: sibling_ref,
			sibling_is_left: low == 0,
			parent_lsn: parent_pos.lsn,
		})
	}
}
