//! Resident children of a node.
//!
//! Most slots of a cached node have nothing resident, so targets start out
//! with no storage at all, move to a short list of `(slot, target)` pairs and
//! only become a full per-slot array once more than a few are resident.
//! Growing returns a new representation instead of resizing in place.

use crate::ln::Ln;
use crate::memory::{array_size, ARRAY_ITEM_OVERHEAD, OBJECT_OVERHEAD, WORD};

use super::latch::NodeRef;

const SPARSE_MAX: usize = 4;
const SPARSE_SIZE: usize = OBJECT_OVERHEAD + SPARSE_MAX * 2 * WORD;

/// What a slot refers to while it is resident.
#[derive(Clone)]
pub enum Target {
	/// A child IN or BIN.
	Node(NodeRef),
	/// A leaf record of a BIN.
	Record(Box<Ln>),
}

impl Target {
	pub fn as_node(&self) -> Option<&NodeRef> {
		match self {
			Target::Node(n) => Some(n),
			Target::Record(_) => None,
		}
	}

	pub fn as_record(&self) -> Option<&Ln> {
		match self {
			Target::Record(ln) => Some(ln),
			Target::Node(_) => None,
		}
	}

	/// Child nodes account for themselves.
	fn memory_size(&self) -> usize {
		match self {
			Target::Node(_) => 0,
			Target::Record(ln) => ln.memory_size(),
		}
	}
}

#[derive(Clone, Default)]
pub(crate) enum Targets {
	#[default]
	None,
	Sparse(Vec<(usize, Target)>),
	Dense(Vec<Option<Target>>),
}

impl Targets {
	fn get(&self, idx: usize) -> Option<&Target> {
		match self {
			Targets::None => None,
			Targets::Sparse(entries) => entries.iter().find(|(i, _)| *i == idx).map(|(_, t)| t),
			Targets::Dense(slots) => slots.get(idx).and_then(Option::as_ref),
		}
	}

	/// Returns the representation with `idx` set to `target`, plus the target
	/// that was replaced.
	fn with(self, idx: usize, target: Option<Target>, capacity: usize) -> (Targets, Option<Target>) {
		match (self, target) {
			(Targets::None, None) => (Targets::None, None),
			(Targets::None, Some(t)) => (Targets::Sparse(vec![(idx, t)]), None),
			(Targets::Sparse(mut entries), target) => {
				let pos = entries.iter().position(|(i, _)| *i == idx);
				match (pos, target) {
					(Some(p), Some(t)) => {
						let old = std::mem::replace(&mut entries[p].1, t);
						(Targets::Sparse(entries), Some(old))
					}
					(Some(p), None) => {
						let (_, old) = entries.swap_remove(p);
						if entries.is_empty() {
							(Targets::None, Some(old))
						} else {
							(Targets::Sparse(entries), Some(old))
						}
					}
					(None, None) => (Targets::Sparse(entries), None),
					(None, Some(t)) if entries.len() < SPARSE_MAX => {
						entries.push((idx, t));
						(Targets::Sparse(entries), None)
					}
					(None, Some(t)) => {
						let mut slots: Vec<Option<Target>> = vec![None; capacity];
						for (i, e) in entries {
							slots[i] = Some(e);
						}
						slots[idx] = Some(t);
						(Targets::Dense(slots), None)
					}
				}
			}
			(Targets::Dense(mut slots), target) => {
				let old = std::mem::replace(&mut slots[idx], target);
				(Targets::Dense(slots), old)
			}
		}
	}
}

/// Per-slot targets plus the memory held by resident records.
#[derive(Clone, Default)]
pub(crate) struct TargetStore {
	rep: Targets,
	ln_bytes: usize,
}

impl TargetStore {
	pub(crate) fn get(&self, idx: usize) -> Option<&Target> {
		self.rep.get(idx)
	}

	pub(crate) fn set(&mut self, idx: usize, target: Option<Target>, capacity: usize) -> Option<Target> {
		if let Some(t) = &target {
			self.ln_bytes += t.memory_size();
		}
		let (rep, old) = std::mem::take(&mut self.rep).with(idx, target, capacity);
		self.rep = rep;
		if let Some(t) = &old {
			self.ln_bytes -= t.memory_size();
		}
		old
	}

	pub(crate) fn take(&mut self, idx: usize, capacity: usize) -> Option<Target> {
		self.set(idx, None, capacity)
	}

	/// Moves `n` slots from `from` to `to`, clearing sources not overwritten.
	pub(crate) fn copy(&mut self, from: usize, to: usize, n: usize) {
		if from == to || n == 0 {
			return;
		}
		let src = from..from + n;
		let dst = to..to + n;
		match &mut self.rep {
			Targets::None => {}
			Targets::Sparse(entries) => {
				let mut dropped = 0;
				entries.retain(|(i, t)| {
					let keep = src.contains(i) || !dst.contains(i);
					if !keep {
						dropped += t.memory_size();
					}
					keep
				});
				for (i, _) in entries.iter_mut() {
					if src.contains(&*i) {
						*i = *i - from + to;
					}
				}
				self.ln_bytes -= dropped;
				if entries.is_empty() {
					self.rep = Targets::None;
				}
			}
			Targets::Dense(slots) => {
				let moved: Vec<Option<Target>> = src.map(|i| slots[i].take()).collect();
				for (i, t) in moved.into_iter().enumerate() {
					if let Some(old) = std::mem::replace(&mut slots[to + i], t) {
						self.ln_bytes -= old.memory_size();
					}
				}
			}
		}
	}

	/// Changes the slot count, dropping targets past the new capacity.
	pub(crate) fn resize(&mut self, capacity: usize) {
		match &mut self.rep {
			Targets::None => {}
			Targets::Sparse(entries) => {
				let mut dropped = 0;
				entries.retain(|(i, t)| {
					if *i >= capacity {
						dropped += t.memory_size();
					}
					*i < capacity
				});
				self.ln_bytes -= dropped;
				if entries.is_empty() {
					self.rep = Targets::None;
				}
			}
			Targets::Dense(slots) => {
				for old in slots.iter_mut().skip(capacity).filter_map(Option::take) {
					self.ln_bytes -= old.memory_size();
				}
				slots.resize(capacity, None);
				slots.shrink_to_fit();
			}
		}
	}

	/// Moves to the smallest representation that holds the resident targets.
	/// Returns true if the representation changed.
	pub(crate) fn compact(&mut self) -> bool {
		let resident = self.len();
		let rep = std::mem::take(&mut self.rep);
		let (rep, changed) = match rep {
			Targets::Dense(slots) if resident <= SPARSE_MAX => {
				let entries: Vec<(usize, Target)> = slots
					.into_iter()
					.enumerate()
					.filter_map(|(i, t)| t.map(|t| (i, t)))
					.collect();
				if entries.is_empty() {
					(Targets::None, true)
				} else {
					(Targets::Sparse(entries), true)
				}
			}
			Targets::Sparse(entries) if entries.is_empty() => (Targets::None, true),
			other => (other, false),
		};
		self.rep = rep;
		changed
	}

	/// Resident targets in slot order.
	pub(crate) fn iter(&self) -> Box<dyn Iterator<Item = (usize, &Target)> + '_> {
		match &self.rep {
			Targets::None => Box::new(std::iter::empty()),
			Targets::Sparse(entries) => {
				let mut sorted: Vec<(usize, &Target)> = entries.iter().map(|(i, t)| (*i, t)).collect();
				sorted.sort_by_key(|(i, _)| *i);
				Box::new(sorted.into_iter())
			}
			Targets::Dense(slots) => {
				Box::new(slots.iter().enumerate().filter_map(|(i, t)| t.as_ref().map(|t| (i, t))))
			}
		}
	}

	pub(crate) fn len(&self) -> usize {
		match &self.rep {
			Targets::None => 0,
			Targets::Sparse(entries) => entries.len(),
			Targets::Dense(slots) => slots.iter().filter(|t| t.is_some()).count(),
		}
	}

	pub(crate) fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub(crate) fn is_dense(&self) -> bool {
		matches!(self.rep, Targets::Dense(_))
	}

	pub(crate) fn memory_size(&self) -> usize {
		self.rep_size() + self.ln_bytes
	}

	fn rep_size(&self) -> usize {
		match &self.rep {
			Targets::None => 0,
			Targets::Sparse(_) => SPARSE_SIZE,
			Targets::Dense(slots) => array_size(slots.len(), ARRAY_ITEM_OVERHEAD),
		}
	}

	pub(crate) fn computed_memory_size(&self) -> usize {
		self.rep_size() + self.iter().map(|(_, t)| t.memory_size()).sum::<usize>()
	}
}

#[cfg(test)]
mod tests {
	use test_log::test;

	use super::*;

	fn record(data: &'static [u8]) -> Option<Target> {
		Some(Target::Record(Box::new(Ln::data(data))))
	}

	fn data_at(store: &TargetStore, idx: usize) -> Option<Vec<u8>> {
		store.get(idx).and_then(|t| t.as_record()).and_then(|ln| ln.bytes()).map(|b| b.to_vec())
	}

	#[test]
	fn grows_from_none_to_dense() {
		let mut store = TargetStore::default();
		assert_eq!(store.memory_size(), 0);
		for i in 0..SPARSE_MAX {
			store.set(i * 2, record(b"v"), 16);
		}
		assert!(!store.is_dense());
		assert_eq!(store.len(), SPARSE_MAX);

		store.set(15, record(b"w"), 16);
		assert!(store.is_dense());
		assert_eq!(data_at(&store, 2), Some(b"v".to_vec()));
		assert_eq!(data_at(&store, 15), Some(b"w".to_vec()));
		assert_eq!(store.memory_size(), store.computed_memory_size());

		for i in 0..SPARSE_MAX {
			store.take(i * 2, 16);
		}
		assert!(store.compact());
		assert!(!store.is_dense());
		assert_eq!(store.len(), 1);
		store.take(15, 16);
		assert!(store.is_empty());
		assert_eq!(store.memory_size(), 0);
	}

	#[test]
	fn replaced_target_is_returned() {
		let mut store = TargetStore::default();
		assert!(store.set(1, record(b"a"), 4).is_none());
		let old = store.set(1, record(b"bb"), 4);
		assert!(old.is_some());
		assert_eq!(data_at(&store, 1), Some(b"bb".to_vec()));
		assert_eq!(store.memory_size(), store.computed_memory_size());
	}

	#[test]
	fn copy_matches_between_representations() {
		let mut sparse = TargetStore::default();
		let mut dense = TargetStore::default();
		for i in [0, 2, 3] {
			sparse.set(i, record(b"x"), 8);
			dense.set(i, record(b"x"), 8);
		}
		for i in [5, 6] {
			dense.set(i, record(b"y"), 8);
		}
		dense.take(5, 8);
		dense.take(6, 8);
		assert!(dense.is_dense());

		for (from, to, n) in [(2, 3, 3), (3, 1, 4), (0, 4, 2)] {
			sparse.copy(from, to, n);
			dense.copy(from, to, n);
			for i in 0..8 {
				assert_eq!(data_at(&sparse, i), data_at(&dense, i), "slot {i} after copy({from},{to},{n})");
			}
			assert_eq!(sparse.memory_size(), sparse.computed_memory_size());
			assert_eq!(dense.memory_size(), dense.computed_memory_size());
		}
	}

	#[test]
	fn resize_drops_targets_past_capacity() {
		let mut store = TargetStore::default();
		store.set(1, record(b"a"), 8);
		store.set(6, record(b"b"), 8);
		store.resize(4);
		assert_eq!(store.len(), 1);
		assert_eq!(store.memory_size(), store.computed_memory_size());
	}
}
