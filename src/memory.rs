//! Memory accounting for cached nodes.
//!
//! Sizes are estimates of the heap footprint of a node and its slot stores.
//! They are byte-precise in the sense that the incrementally maintained size of
//! a node always equals the size recomputed from scratch, which is what the
//! cache budget relies on.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::env::MemoryBudget;

pub const WORD: usize = 8;
pub const OBJECT_OVERHEAD: usize = 16;
pub const ARRAY_OVERHEAD: usize = 24;
pub const ARRAY_ITEM_OVERHEAD: usize = WORD;

/// Fixed part of an internal node, excluding its slot stores.
pub const IN_FIXED_OVERHEAD: usize = 192;
/// Fixed part of a BIN, excluding its slot stores.
pub const BIN_FIXED_OVERHEAD: usize = 256;
/// Fixed part of a resident leaf record, excluding its payload.
pub const LN_OVERHEAD: usize = 64;
/// One registered cursor.
pub const CURSOR_OVERHEAD: usize = 32;

/// Heap size of a byte array of `len` bytes.
#[inline]
pub fn byte_array_size(len: usize) -> usize {
	ARRAY_OVERHEAD + len.div_ceil(WORD) * WORD
}

/// Heap size of an array of `capacity` elements of `item` bytes each.
#[inline]
pub fn array_size(capacity: usize, item: usize) -> usize {
	ARRAY_OVERHEAD + (capacity * item).div_ceil(WORD) * WORD
}

/// Batches node size deltas before reporting them to the global budget.
///
/// Nodes mutate their own size counter under their latch and push the change
/// here. The sink only sees an update once the accumulated delta crosses the
/// threshold, which keeps the shared counter off the hot path.
pub struct BudgetTracker {
	sink: Arc<dyn MemoryBudget>,
	pending: AtomicI64,
	total: AtomicI64,
	threshold: i64,
}

impl BudgetTracker {
	pub fn new(sink: Arc<dyn MemoryBudget>, threshold: i64) -> Self {
		Self {
			sink,
			pending: AtomicI64::new(0),
			total: AtomicI64::new(0),
			threshold,
		}
	}

	/// Records a change of `delta` bytes.
	pub fn update(&self, delta: i64) {
		if delta == 0 {
			return;
		}
		self.total.fetch_add(delta, Ordering::Relaxed);
		let pending = self.pending.fetch_add(delta, Ordering::AcqRel) + delta;
		if pending.abs() >= self.threshold {
			let batch = self.pending.swap(0, Ordering::AcqRel);
			if batch != 0 {
				self.sink.account_delta(batch);
			}
		}
	}

	/// Pushes any pending delta to the sink.
	pub fn flush(&self) {
		let batch = self.pending.swap(0, Ordering::AcqRel);
		if batch != 0 {
			self.sink.account_delta(batch);
		}
	}

	/// Bytes currently charged by live nodes, including unflushed deltas.
	pub fn total(&self) -> i64 {
		self.total.load(Ordering::Relaxed)
	}

	pub fn pending(&self) -> i64 {
		self.pending.load(Ordering::Relaxed)
	}
}
