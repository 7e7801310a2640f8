//! Tree nodes.
//!
//! A [`Node`] is either an internal node (IN) whose slots refer to other
//! nodes, or a bottom internal node (BIN) whose slots refer to leaf records.
//! Both share the same slot layout:
//!
//! - a key store holding each slot's key, minus a prefix shared by all keys,
//! - the log position, last logged size and state byte of each slot,
//! - packed optional numbers (version, expiration, modification and creation
//!   time),
//! - the resident targets.
//!
//! BIN specific state (delta shape, bloom filter, cursors) lives in
//! [`NodeKind::Bin`]. Slot keys are kept in strictly increasing order. In an
//! IN, slot 0 acts as a lower bound for every key during routing.

pub mod codec;
mod compress;
mod delta;
mod evict;
mod keys;
pub mod latch;
mod longs;
mod split;
pub mod state;
pub mod targets;

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::comparator::common_prefix_len;
use crate::env::NodeEnv;
use crate::error::{Error, Result};
use crate::ln::Ln;
use crate::lsn::{Lsn, NULL_LSN};
use crate::memory::{
	array_size, byte_array_size, BIN_FIXED_OVERHEAD, CURSOR_OVERHEAD, IN_FIXED_OVERHEAD,
};
use crate::ttl::Expiration;

pub use compress::CompressOutcome;
pub use latch::{ExclusiveGuard, NodeGuard, NodeRef, SharedGuard, NO_PARENT};
pub use split::SplitOutcome;
pub use state::{Level, SlotState};
pub use targets::Target;

use keys::KeyStore;
use longs::PackedLongs;
use targets::TargetStore;

/// Where a cursor is positioned. Updated by the BIN it is registered with,
/// under that BIN's latch.
#[derive(Debug)]
pub struct CursorPosition {
	node_id: AtomicU64,
	index: AtomicUsize,
}

impl CursorPosition {
	fn new(node_id: u64, index: usize) -> Self {
		Self {
			node_id: AtomicU64::new(node_id),
			index: AtomicUsize::new(index),
		}
	}

	pub fn node_id(&self) -> u64 {
		self.node_id.load(AtomicOrdering::Acquire)
	}

	pub fn index(&self) -> usize {
		self.index.load(AtomicOrdering::Acquire)
	}

	fn set_index(&self, index: usize) {
		self.index.store(index, AtomicOrdering::Release);
	}

	fn set_node(&self, node_id: u64, index: usize) {
		self.node_id.store(node_id, AtomicOrdering::Release);
		self.index.store(index, AtomicOrdering::Release);
	}
}

/// Shape of the full BIN a delta was derived from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeltaShape {
	pub full_n_entries: usize,
	pub full_max_entries: usize,
}

#[derive(Debug, Default)]
pub struct InternalState {
	/// A child was logged provisionally after this node was last logged.
	pub(crate) provisional_children: bool,
}

#[derive(Debug)]
pub struct BinState {
	pub(crate) last_delta_lsn: Lsn,
	pub(crate) delta: Option<DeltaShape>,
	pub(crate) bloom: Option<Vec<u8>>,
	pub(crate) prohibit_next_delta: bool,
	pub(crate) cursors: Vec<Arc<CursorPosition>>,
}

impl Default for BinState {
	fn default() -> Self {
		Self {
			last_delta_lsn: NULL_LSN,
			delta: None,
			bloom: None,
			prohibit_next_delta: false,
			cursors: Vec::new(),
		}
	}
}

#[derive(Debug)]
pub enum NodeKind {
	Internal(InternalState),
	Bin(BinState),
}

/// Result of a binary search over a node's slots.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Found {
	pub index: usize,
	pub exact: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
	Inserted(usize),
	/// The key is already present at this slot. Nothing was changed.
	Duplicate(usize),
}

/// Everything stored in one slot, detached from any node.
#[derive(Clone)]
pub struct SlotEntry {
	pub key: Vec<u8>,
	/// Record data stored with the key.
	pub data: Option<Vec<u8>>,
	pub target: Option<Target>,
	pub lsn: Lsn,
	pub size: u32,
	pub state: SlotState,
	pub vlsn: u64,
	pub expiration: Expiration,
	pub modification_time: u64,
	pub creation_time: u64,
}

impl SlotEntry {
	pub fn new(key: impl Into<Vec<u8>>, lsn: Lsn) -> Self {
		Self {
			key: key.into(),
			data: None,
			target: None,
			lsn,
			size: 0,
			state: SlotState::EMPTY,
			vlsn: 0,
			expiration: Expiration::NONE,
			modification_time: 0,
			creation_time: 0,
		}
	}

	/// A slot of an IN referring to `child`.
	pub fn child(key: impl Into<Vec<u8>>, child: NodeRef, lsn: Lsn, size: u32) -> Self {
		Self::new(key, lsn).with_target(Target::Node(child)).with_size(size)
	}

	pub fn with_target(mut self, target: Target) -> Self {
		self.target = Some(target);
		self
	}

	pub fn with_size(mut self, size: u32) -> Self {
		self.size = size;
		self
	}

	pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
		self.data = Some(data.into());
		self
	}

	pub fn with_state(mut self, state: SlotState) -> Self {
		self.state = state;
		self
	}

	pub fn with_vlsn(mut self, vlsn: u64) -> Self {
		self.vlsn = vlsn;
		self
	}

	pub fn with_expiration(mut self, expiration: Expiration) -> Self {
		self.expiration = expiration;
		self
	}

	pub fn with_times(mut self, modification_time: u64, creation_time: u64) -> Self {
		self.modification_time = modification_time;
		self.creation_time = creation_time;
		self
	}
}

pub struct Node {
	pub(crate) id: u64,
	pub(crate) level: Level,
	pub(crate) identifier_key: Vec<u8>,
	pub(crate) key_prefix: Vec<u8>,
	pub(crate) n_entries: usize,
	pub(crate) keys: KeyStore,
	pub(crate) lsns: Vec<Lsn>,
	pub(crate) sizes: Vec<u32>,
	pub(crate) states: Vec<SlotState>,
	pub(crate) targets: TargetStore,
	pub(crate) vlsns: PackedLongs,
	pub(crate) expirations: PackedLongs,
	pub(crate) expiration_in_hours: bool,
	pub(crate) mod_times: PackedLongs,
	pub(crate) create_times: PackedLongs,
	pub(crate) is_root: bool,
	pub(crate) dirty: bool,
	pub(crate) last_full_lsn: Lsn,
	pub(crate) detached: bool,
	pub(crate) in_memory_size: usize,
	pub(crate) env: Arc<NodeEnv>,
	pub(crate) kind: NodeKind,
}

impl Node {
	/// Creates an empty node with a fresh id.
	pub fn new(env: Arc<NodeEnv>, level: Level, identifier_key: Vec<u8>, capacity: usize) -> Self {
		let id = env.next_node_id();
		Self::with_id(env, id, level, identifier_key, capacity)
	}

	pub(crate) fn with_id(
		env: Arc<NodeEnv>,
		id: u64,
		level: Level,
		identifier_key: Vec<u8>,
		capacity: usize,
	) -> Self {
		let kind = if level.is_bin() {
			NodeKind::Bin(BinState::default())
		} else {
			NodeKind::Internal(InternalState::default())
		};
		let mut node = Self {
			id,
			level,
			identifier_key,
			key_prefix: Vec::new(),
			n_entries: 0,
			keys: KeyStore::new(capacity),
			lsns: vec![NULL_LSN; capacity],
			sizes: vec![0; capacity],
			states: vec![SlotState::EMPTY; capacity],
			targets: TargetStore::default(),
			vlsns: PackedLongs::Empty,
			expirations: PackedLongs::Empty,
			expiration_in_hours: false,
			mod_times: PackedLongs::Empty,
			create_times: PackedLongs::Empty,
			is_root: false,
			dirty: false,
			last_full_lsn: NULL_LSN,
			detached: false,
			in_memory_size: 0,
			env,
			kind,
		};
		node.update_memory_size();
		node
	}

	/// Creates an empty BIN with the configured capacity.
	pub fn new_bin(env: Arc<NodeEnv>, identifier_key: Vec<u8>) -> Self {
		let level = Level::bin(env.options.catalog);
		let capacity = env.options.max_entries;
		Self::new(env, level, identifier_key, capacity)
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn level(&self) -> Level {
		self.level
	}

	pub fn is_bin(&self) -> bool {
		matches!(self.kind, NodeKind::Bin(_))
	}

	pub fn is_delta(&self) -> bool {
		matches!(&self.kind, NodeKind::Bin(b) if b.delta.is_some())
	}

	pub fn is_root(&self) -> bool {
		self.is_root
	}

	pub fn set_root(&mut self, root: bool) {
		self.is_root = root;
	}

	pub fn is_dirty(&self) -> bool {
		self.dirty
	}

	pub fn set_dirty(&mut self, dirty: bool) {
		self.dirty = dirty;
	}

	pub fn is_detached(&self) -> bool {
		self.detached
	}

	pub fn n_entries(&self) -> usize {
		self.n_entries
	}

	pub fn capacity(&self) -> usize {
		self.lsns.len()
	}

	pub fn is_full(&self) -> bool {
		self.n_entries >= self.capacity()
	}

	pub fn identifier_key(&self) -> &[u8] {
		&self.identifier_key
	}

	pub fn set_identifier_key(&mut self, key: &[u8]) {
		if self.identifier_key != key {
			self.identifier_key = key.to_vec();
			self.dirty = true;
			self.update_memory_size();
		}
	}

	pub fn key_prefix(&self) -> &[u8] {
		&self.key_prefix
	}

	pub fn last_full_lsn(&self) -> Lsn {
		self.last_full_lsn
	}

	pub fn last_delta_lsn(&self) -> Lsn {
		match &self.kind {
			NodeKind::Bin(b) => b.last_delta_lsn,
			NodeKind::Internal(_) => NULL_LSN,
		}
	}

	pub fn env(&self) -> &Arc<NodeEnv> {
		&self.env
	}

	pub fn delta_shape(&self) -> Option<DeltaShape> {
		match &self.kind {
			NodeKind::Bin(b) => b.delta,
			NodeKind::Internal(_) => None,
		}
	}

	pub(crate) fn bin_state(&self) -> Option<&BinState> {
		match &self.kind {
			NodeKind::Bin(b) => Some(b),
			NodeKind::Internal(_) => None,
		}
	}

	pub(crate) fn bin_state_mut(&mut self) -> Option<&mut BinState> {
		match &mut self.kind {
			NodeKind::Bin(b) => Some(b),
			NodeKind::Internal(_) => None,
		}
	}

	pub fn has_provisional_children(&self) -> bool {
		matches!(&self.kind, NodeKind::Internal(s) if s.provisional_children)
	}

	pub(crate) fn set_provisional_children(&mut self, on: bool) {
		if let NodeKind::Internal(s) = &mut self.kind {
			s.provisional_children = on;
		}
	}

	// ---- slot access ----

	/// The full key of slot `idx`.
	pub fn key(&self, idx: usize) -> Vec<u8> {
		let suffix = self.key_suffix(idx);
		let mut key = Vec::with_capacity(self.key_prefix.len() + suffix.len());
		key.extend_from_slice(&self.key_prefix);
		key.extend_from_slice(suffix);
		key
	}

	pub fn key_suffix(&self, idx: usize) -> &[u8] {
		self.keys.key(idx, self.states[idx].contains(SlotState::EMBEDDED))
	}

	/// Record data stored with the key of slot `idx`.
	pub fn embedded_data(&self, idx: usize) -> Option<&[u8]> {
		self.keys.data(idx, self.states[idx].contains(SlotState::EMBEDDED))
	}

	pub fn lsn(&self, idx: usize) -> Lsn {
		self.lsns[idx]
	}

	pub fn last_logged_size(&self, idx: usize) -> u32 {
		self.sizes[idx]
	}

	pub fn state(&self, idx: usize) -> SlotState {
		self.states[idx]
	}

	pub fn is_dirty_slot(&self, idx: usize) -> bool {
		self.states[idx].contains(SlotState::DIRTY)
	}

	pub fn is_known_deleted(&self, idx: usize) -> bool {
		self.states[idx].contains(SlotState::KNOWN_DELETED)
	}

	pub fn is_pending_deleted(&self, idx: usize) -> bool {
		self.states[idx].contains(SlotState::PENDING_DELETED)
	}

	pub fn is_embedded(&self, idx: usize) -> bool {
		self.states[idx].contains(SlotState::EMBEDDED)
	}

	pub fn is_expired(&self, idx: usize, now: u64) -> bool {
		self.expiration(idx).is_expired(now)
	}

	/// Deleted or expired.
	pub fn is_defunct(&self, idx: usize, now: u64) -> bool {
		self.states[idx].is_deleted() || self.is_expired(idx, now)
	}

	pub(crate) fn mark_slot_dirty(&mut self, idx: usize) {
		self.states[idx].insert(SlotState::DIRTY);
		self.dirty = true;
	}

	pub(crate) fn set_state_bit(&mut self, idx: usize, bit: SlotState, on: bool) {
		self.states[idx].set(bit, on);
	}

	pub fn set_known_deleted(&mut self, idx: usize) {
		self.states[idx].insert(SlotState::KNOWN_DELETED);
		self.states[idx].remove(SlotState::PENDING_DELETED);
		self.mark_slot_dirty(idx);
	}

	pub fn clear_known_deleted(&mut self, idx: usize) {
		self.states[idx].remove(SlotState::KNOWN_DELETED);
		self.mark_slot_dirty(idx);
	}

	pub fn set_pending_deleted(&mut self, idx: usize) {
		self.states[idx].insert(SlotState::PENDING_DELETED);
		self.mark_slot_dirty(idx);
	}

	pub fn clear_pending_deleted(&mut self, idx: usize) {
		self.states[idx].remove(SlotState::PENDING_DELETED);
		self.mark_slot_dirty(idx);
	}

	/// Version of the record in slot `idx`, from the resident record if any.
	pub fn vlsn(&self, idx: usize) -> u64 {
		match self.record(idx) {
			Some(ln) if ln.vlsn != 0 => ln.vlsn,
			_ => self.vlsns.get(idx),
		}
	}

	pub fn set_vlsn(&mut self, idx: usize, vlsn: u64) {
		let capacity = self.capacity();
		self.vlsns.set(idx, vlsn, capacity);
		self.update_memory_size();
	}

	pub fn expiration(&self, idx: usize) -> Expiration {
		Expiration {
			value: self.expirations.get(idx),
			in_hours: self.expiration_in_hours,
		}
	}

	pub fn is_expiration_in_hours(&self) -> bool {
		self.expiration_in_hours
	}

	pub fn set_expiration(&mut self, idx: usize, expiration: Expiration) {
		self.store_expiration(idx, expiration);
		self.update_memory_size();
	}

	fn store_expiration(&mut self, idx: usize, expiration: Expiration) {
		let capacity = self.capacity();
		if expiration.is_none() {
			self.expirations.set(idx, 0, capacity);
			return;
		}
		if expiration.in_hours && !self.expiration_in_hours {
			// Switch the node to hours, converting the stored days.
			for i in 0..capacity {
				let days = self.expirations.get(i);
				if days != 0 {
					self.expirations.set(i, days * 24, capacity);
				}
			}
			self.expiration_in_hours = true;
		}
		let value = if self.expiration_in_hours {
			expiration.as_hours()
		} else {
			expiration.value
		};
		self.expirations.set(idx, value, capacity);
	}

	pub fn modification_time(&self, idx: usize) -> u64 {
		self.mod_times.get(idx)
	}

	pub fn creation_time(&self, idx: usize) -> u64 {
		self.create_times.get(idx)
	}

	pub fn set_times(&mut self, idx: usize, modification_time: u64, creation_time: u64) {
		let capacity = self.capacity();
		self.mod_times.set(idx, modification_time, capacity);
		self.create_times.set(idx, creation_time, capacity);
		self.update_memory_size();
	}

	pub fn target(&self, idx: usize) -> Option<&Target> {
		self.targets.get(idx)
	}

	/// The resident child node of slot `idx`.
	pub fn child(&self, idx: usize) -> Option<NodeRef> {
		self.targets.get(idx).and_then(Target::as_node).cloned()
	}

	/// The resident record of slot `idx`.
	pub fn record(&self, idx: usize) -> Option<&Ln> {
		self.targets.get(idx).and_then(Target::as_record)
	}

	/// Replaces the target of slot `idx` and returns the previous one.
	pub fn set_target(&mut self, idx: usize, target: Option<Target>) -> Option<Target> {
		if let Some(Target::Node(child)) = &target {
			child.set_parent_id(self.id);
		}
		let capacity = self.capacity();
		let old = self.targets.set(idx, target, capacity);
		self.update_memory_size();
		old
	}

	pub fn take_target(&mut self, idx: usize) -> Option<Target> {
		self.set_target(idx, None)
	}

	pub fn resident_children(&self) -> Vec<(usize, NodeRef)> {
		self.targets.iter().filter_map(|(i, t)| t.as_node().map(|n| (i, n.clone()))).collect()
	}

	pub fn has_resident_children(&self) -> bool {
		self.targets.iter().any(|(_, t)| matches!(t, Target::Node(_)))
	}

	pub fn resident_records(&self) -> usize {
		self.targets.iter().filter(|(_, t)| matches!(t, Target::Record(_))).count()
	}

	// ---- cursors ----

	pub fn cursor_count(&self) -> usize {
		self.bin_state().map_or(0, |b| b.cursors.len())
	}

	pub(crate) fn has_cursor_at(&self, idx: usize) -> bool {
		self.bin_state().is_some_and(|b| b.cursors.iter().any(|c| c.index() == idx))
	}

	/// Registers a cursor positioned on slot `idx` of this BIN.
	pub fn register_cursor(&mut self, idx: usize) -> Result<Arc<CursorPosition>> {
		let id = self.id;
		let bin = self
			.bin_state_mut()
			.ok_or_else(|| Error::InvalidArgument("cursors can only be registered on a BIN".into()))?;
		let cursor = Arc::new(CursorPosition::new(id, idx));
		bin.cursors.push(cursor.clone());
		self.update_memory_size();
		Ok(cursor)
	}

	pub fn unregister_cursor(&mut self, cursor: &Arc<CursorPosition>) -> bool {
		let Some(bin) = self.bin_state_mut() else {
			return false;
		};
		let before = bin.cursors.len();
		bin.cursors.retain(|c| !Arc::ptr_eq(c, cursor));
		let removed = bin.cursors.len() != before;
		if removed {
			self.update_memory_size();
		}
		removed
	}

	// ---- search ----

	fn compare_slot(&self, key: &[u8], idx: usize) -> Ordering {
		self.keys.compare_keys(
			key,
			&self.key_prefix,
			idx,
			self.states[idx].contains(SlotState::EMBEDDED),
			self.env.comparator.as_ref(),
		)
	}

	/// Finds the rightmost slot whose key is less than or equal to `key`.
	///
	/// With `exact` set only an exact match is returned. Otherwise an IN
	/// treats slot 0 as smaller than every key, so there is always a result,
	/// while a BIN returns `None` for a key below all of its slots.
	pub fn find_entry(&self, key: &[u8], exact: bool) -> Option<Found> {
		let n = self.n_entries;
		if n == 0 {
			return None;
		}
		let mut low = if !self.is_bin() && !exact {
			1
		} else {
			0
		};
		let mut high = n;
		while low < high {
			let mid = low + (high - low) / 2;
			match self.compare_slot(key, mid) {
				Ordering::Less => high = mid,
				Ordering::Equal => {
					return Some(Found {
						index: mid,
						exact: true,
					})
				}
				Ordering::Greater => low = mid + 1,
			}
		}
		if exact || low == 0 {
			return None;
		}
		Some(Found {
			index: low - 1,
			exact: false,
		})
	}

	/// `Ok(idx)` if `key` is present at `idx`, otherwise `Err(idx)` with the
	/// slot it would be inserted at.
	pub fn insertion_index(&self, key: &[u8]) -> std::result::Result<usize, usize> {
		let mut low = 0;
		let mut high = self.n_entries;
		while low < high {
			let mid = low + (high - low) / 2;
			match self.compare_slot(key, mid) {
				Ordering::Less => high = mid,
				Ordering::Equal => return Ok(mid),
				Ordering::Greater => low = mid + 1,
			}
		}
		Err(low)
	}

	// ---- mutation ----

	/// Moves `n` slots from `from` to `to` across every slot store.
	fn copy_slots(&mut self, from: usize, to: usize, n: usize) {
		if from == to || n == 0 {
			return;
		}
		self.keys.copy(from, to, n);
		self.lsns.copy_within(from..from + n, to);
		self.sizes.copy_within(from..from + n, to);
		self.states.copy_within(from..from + n, to);
		self.targets.copy(from, to, n);
		self.vlsns.copy(from, to, n);
		self.expirations.copy(from, to, n);
		self.mod_times.copy(from, to, n);
		self.create_times.copy(from, to, n);
		for i in from..from + n {
			if i < to || i >= to + n {
				self.lsns[i] = NULL_LSN;
				self.sizes[i] = 0;
				self.states[i] = SlotState::EMPTY;
			}
		}
	}

	fn clear_slot(&mut self, idx: usize) {
		let capacity = self.capacity();
		self.keys.set(idx, None);
		self.lsns[idx] = NULL_LSN;
		self.sizes[idx] = 0;
		self.states[idx] = SlotState::EMPTY;
		self.targets.take(idx, capacity);
		self.vlsns.set(idx, 0, capacity);
		self.expirations.set(idx, 0, capacity);
		self.mod_times.set(idx, 0, capacity);
		self.create_times.set(idx, 0, capacity);
	}

	/// Writes every field of `entry` into slot `idx`. The key must already
	/// start with the node's prefix.
	fn write_slot(&mut self, idx: usize, entry: SlotEntry) {
		let capacity = self.capacity();
		let SlotEntry {
			key,
			data,
			target,
			lsn,
			size,
			mut state,
			vlsn,
			expiration,
			modification_time,
			creation_time,
		} = entry;
		let suffix = &key[self.key_prefix.len()..];
		match &data {
			Some(data) => {
				state.insert(SlotState::EMBEDDED);
				self.keys.set(idx, Some(&keys::combine(suffix, data)));
			}
			None => {
				state.remove(SlotState::EMBEDDED);
				self.keys.set(idx, Some(suffix));
			}
		}
		self.lsns[idx] = lsn;
		self.sizes[idx] = size;
		self.states[idx] = state;
		if let Some(Target::Node(child)) = &target {
			child.set_parent_id(self.id);
		}
		self.targets.set(idx, target, capacity);
		self.vlsns.set(idx, vlsn, capacity);
		self.store_expiration(idx, expiration);
		self.mod_times.set(idx, modification_time, capacity);
		self.create_times.set(idx, creation_time, capacity);
	}

	/// Copies slot `idx` out of the node, taking its target.
	pub(crate) fn take_slot(&mut self, idx: usize) -> SlotEntry {
		let capacity = self.capacity();
		let target = self.targets.take(idx, capacity);
		let entry = self.slot_entry(idx);
		SlotEntry {
			target,
			..entry
		}
	}

	/// Copies slot `idx` without its target.
	pub fn slot_entry(&self, idx: usize) -> SlotEntry {
		let data = self.embedded_data(idx).map(<[u8]>::to_vec);
		SlotEntry {
			key: self.key(idx),
			data,
			target: None,
			lsn: self.lsns[idx],
			size: self.sizes[idx],
			state: self.states[idx],
			vlsn: self.vlsns.get(idx),
			expiration: self.expiration(idx),
			modification_time: self.mod_times.get(idx),
			creation_time: self.create_times.get(idx),
		}
	}

	/// Inserts a new slot, keeping slots ordered.
	///
	/// Fails with [`Error::NodeFull`] if there is no free slot; callers split
	/// first. An existing key is reported as a duplicate and left untouched.
	pub fn insert_entry(&mut self, entry: SlotEntry) -> Result<InsertOutcome> {
		if self.is_full() {
			return Err(Error::NodeFull(self.n_entries));
		}
		let idx = match self.insertion_index(&entry.key) {
			Ok(dup) => return Ok(InsertOutcome::Duplicate(dup)),
			Err(idx) => idx,
		};
		self.fit_prefix(&entry.key);
		let key_for_id = (idx == 0 && self.is_bin()).then(|| entry.key.clone());

		let n = self.n_entries;
		self.copy_slots(idx, idx + 1, n - idx);
		self.write_slot(idx, entry);
		self.n_entries += 1;
		self.mark_slot_dirty(idx);

		if let Some(bin) = self.bin_state_mut() {
			for c in &bin.cursors {
				if c.index() >= idx {
					c.set_index(c.index() + 1);
				}
			}
		}
		if let Some(key) = key_for_id {
			if self.env.hooks.allow_identifier_key_update() {
				self.identifier_key = key;
			}
		}
		self.update_memory_size();
		Ok(InsertOutcome::Inserted(idx))
	}

	/// Appends a slot known to sort after every existing slot.
	pub(crate) fn append_entry(&mut self, entry: SlotEntry) -> Result<()> {
		if self.is_full() {
			return Err(Error::NodeFull(self.n_entries));
		}
		self.fit_prefix(&entry.key);
		let idx = self.n_entries;
		self.write_slot(idx, entry);
		self.n_entries += 1;
		Ok(())
	}

	/// Removes slot `idx` from a full node and returns its target.
	pub fn delete_entry(&mut self, idx: usize, make_dirty: bool) -> Result<Option<Target>> {
		if self.is_delta() {
			return Err(Error::NotFullNode);
		}
		if idx >= self.n_entries {
			return Err(Error::InvalidArgument(format!(
				"slot {idx} out of range, node has {} entries",
				self.n_entries
			)));
		}
		let was_dirty = self.is_dirty_slot(idx);
		let capacity = self.capacity();
		let target = self.targets.take(idx, capacity);
		let n = self.n_entries;
		self.copy_slots(idx + 1, idx, n - idx - 1);
		self.clear_slot(n - 1);
		self.n_entries -= 1;

		if let Some(bin) = self.bin_state_mut() {
			// A delta would lose the deleted slot, so the next write is full.
			if was_dirty {
				bin.prohibit_next_delta = true;
			}
			for c in &bin.cursors {
				if c.index() > idx {
					c.set_index(c.index() - 1);
				}
			}
		}
		if make_dirty {
			self.dirty = true;
		}
		self.update_memory_size();
		Ok(target)
	}

	/// Points slot `idx` of an IN at a new child.
	pub fn update_entry(&mut self, idx: usize, child: NodeRef, lsn: Lsn, size: u32) {
		self.set_target(idx, Some(Target::Node(child)));
		self.lsns[idx] = lsn;
		self.sizes[idx] = size;
		self.mark_slot_dirty(idx);
	}

	/// Records a new log position for the target of slot `idx`.
	pub fn update_slot_lsn(&mut self, idx: usize, lsn: Lsn, size: u32) {
		self.lsns[idx] = lsn;
		self.sizes[idx] = size;
		self.mark_slot_dirty(idx);
	}

	/// Overwrites the record in slot `idx`. The key compares equal to the
	/// existing one but its bytes (or embedded data) may differ.
	pub fn update_record(&mut self, idx: usize, entry: SlotEntry) {
		self.fit_prefix(&entry.key);
		let capacity = self.capacity();
		self.targets.take(idx, capacity);
		self.write_slot(idx, entry);
		self.mark_slot_dirty(idx);
		self.update_memory_size();
	}

	/// Replaces the key of slot `idx`, keeping its data.
	pub fn set_key(&mut self, idx: usize, key: &[u8]) {
		self.fit_prefix(key);
		let embedded = self.is_embedded(idx);
		let suffix = &key[self.key_prefix.len()..];
		let stored = match self.embedded_data(idx) {
			Some(data) if embedded => keys::combine(suffix, data),
			_ => suffix.to_vec(),
		};
		self.keys.set(idx, Some(&stored));
		self.mark_slot_dirty(idx);
		self.update_memory_size();
	}

	// ---- key prefix ----

	/// Shortens the prefix so that `key` starts with it.
	fn fit_prefix(&mut self, key: &[u8]) {
		if !key.starts_with(&self.key_prefix) {
			let len = common_prefix_len(&self.key_prefix, key);
			self.change_prefix(self.key_prefix[..len].to_vec());
		}
	}

	/// Re-encodes every slot against `prefix`. Every key must start with it.
	fn change_prefix(&mut self, prefix: Vec<u8>) {
		if prefix == self.key_prefix {
			return;
		}
		for i in 0..self.n_entries {
			let full = self.key(i);
			let suffix = &full[prefix.len()..];
			let stored = match self.embedded_data(i) {
				Some(data) => keys::combine(suffix, data),
				None => suffix.to_vec(),
			};
			self.keys.set(i, Some(&stored));
		}
		self.key_prefix = prefix;
	}

	/// Strips the longest prefix shared by every key.
	pub fn recompute_prefix(&mut self) {
		let prefix = if self.env.options.key_prefixing && self.n_entries > 1 {
			let first = self.key(0);
			let mut len = first.len();
			for i in 1..self.n_entries {
				if len == 0 {
					break;
				}
				len = len.min(common_prefix_len(&first, &self.key(i)));
			}
			first[..len].to_vec()
		} else {
			Vec::new()
		};
		self.change_prefix(prefix);
		self.update_memory_size();
	}

	/// Changes the slot capacity. Fails if `capacity` cannot hold the slots.
	pub fn resize(&mut self, capacity: usize) -> Result<()> {
		if capacity < self.n_entries {
			return Err(Error::InvalidArgument(format!(
				"capacity {capacity} below {} entries",
				self.n_entries
			)));
		}
		self.keys.resize(capacity);
		self.lsns.resize(capacity, NULL_LSN);
		self.sizes.resize(capacity, 0);
		self.states.resize(capacity, SlotState::EMPTY);
		self.lsns.shrink_to_fit();
		self.sizes.shrink_to_fit();
		self.states.shrink_to_fit();
		self.targets.resize(capacity);
		self.vlsns.resize(capacity);
		self.expirations.resize(capacity);
		self.mod_times.resize(capacity);
		self.create_times.resize(capacity);
		self.update_memory_size();
		Ok(())
	}

	// ---- memory ----

	pub fn memory_size(&self) -> usize {
		self.in_memory_size
	}

	fn fixed_memory_size(&self) -> usize {
		let capacity = self.capacity();
		let mut size = byte_array_size(self.identifier_key.len())
			+ byte_array_size(self.key_prefix.len())
			+ array_size(capacity, 8)
			+ array_size(capacity, 4)
			+ array_size(capacity, 1)
			+ self.vlsns.memory_size()
			+ self.expirations.memory_size()
			+ self.mod_times.memory_size()
			+ self.create_times.memory_size();
		match &self.kind {
			NodeKind::Internal(_) => size += IN_FIXED_OVERHEAD,
			NodeKind::Bin(b) => {
				size += BIN_FIXED_OVERHEAD + b.cursors.len() * CURSOR_OVERHEAD;
				if let Some(bloom) = &b.bloom {
					size += crate::bloom::memory_size(bloom);
				}
			}
		}
		size
	}

	fn compute_memory_size(&self) -> usize {
		self.fixed_memory_size() + self.keys.memory_size() + self.targets.memory_size()
	}

	/// Refreshes the node's size and reports the change to the budget.
	pub(crate) fn update_memory_size(&mut self) {
		let new = self.compute_memory_size();
		let delta = new as i64 - self.in_memory_size as i64;
		self.in_memory_size = new;
		self.env.budget.update(delta);
	}

	/// Recomputes the size from every slot and compares it with the
	/// incrementally maintained one.
	pub fn verify_memory_size(&self) -> Result<()> {
		let computed = self.fixed_memory_size()
			+ self.keys.computed_memory_size()
			+ self.targets.computed_memory_size();
		if computed != self.in_memory_size {
			return Err(Error::Internal(format!(
				"node {} memory size {} does not match computed size {}",
				self.id, self.in_memory_size, computed
			)));
		}
		Ok(())
	}

	/// Checks that slot keys are strictly increasing. Slot 0 of an IN is
	/// skipped since it only acts as a lower bound.
	pub fn check_order(&self) -> Result<()> {
		let start = if self.is_bin() {
			0
		} else {
			1
		};
		let cmp = self.env.comparator.as_ref();
		for i in (start + 1)..self.n_entries {
			if cmp.compare(&self.key(i - 1), &self.key(i)) != Ordering::Less {
				return Err(Error::Corruption(format!(
					"node {} slots {} and {} are out of order",
					self.id,
					i - 1,
					i
				)));
			}
		}
		Ok(())
	}
}

impl Drop for Node {
	fn drop(&mut self) {
		self.env.budget.update(-(self.in_memory_size as i64));
	}
}

impl std::fmt::Debug for Node {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Node")
			.field("id", &self.id)
			.field("level", &self.level)
			.field("n_entries", &self.n_entries)
			.field("capacity", &self.capacity())
			.field("delta", &self.is_delta())
			.field("dirty", &self.dirty)
			.field("root", &self.is_root)
			.finish()
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use std::sync::Arc;

	use test_log::test;

	use super::*;
	use crate::env::{BudgetCounter, MemoryLog, NodeEnv};
	use crate::options::Options;

	pub(crate) fn test_env(options: Options) -> Arc<NodeEnv> {
		NodeEnv::builder(options, Arc::new(MemoryLog::new())).build().unwrap()
	}

	pub(crate) fn bin_with(env: &Arc<NodeEnv>, keys: &[&[u8]]) -> Node {
		let mut bin = Node::new_bin(env.clone(), keys.first().map(|k| k.to_vec()).unwrap_or_default());
		for (i, k) in keys.iter().enumerate() {
			bin.insert_entry(SlotEntry::new(*k, Lsn::new(1, i as u32 * 100))).unwrap();
		}
		bin
	}

	fn keys_of(node: &Node) -> Vec<Vec<u8>> {
		(0..node.n_entries()).map(|i| node.key(i)).collect()
	}

	#[test]
	fn insert_keeps_order_and_sets_identifier_key() {
		let env = test_env(Options::default().with_max_entries(4));
		let mut bin = Node::new_bin(env, Vec::new());
		for k in [b"d", b"b", b"f"] {
			assert!(matches!(
				bin.insert_entry(SlotEntry::new(&k[..], Lsn::new(1, 0))).unwrap(),
				InsertOutcome::Inserted(_)
			));
		}
		assert_eq!(keys_of(&bin), vec![b"b".to_vec(), b"d".to_vec(), b"f".to_vec()]);
		assert_eq!(bin.identifier_key(), b"b");

		assert_eq!(
			bin.insert_entry(SlotEntry::new(&b"d"[..], Lsn::new(1, 0))).unwrap(),
			InsertOutcome::Duplicate(1)
		);

		bin.insert_entry(SlotEntry::new(&b"a"[..], Lsn::new(1, 0))).unwrap();
		assert_eq!(bin.identifier_key(), b"a");
		assert!(matches!(
			bin.insert_entry(SlotEntry::new(&b"z"[..], Lsn::new(1, 0))),
			Err(Error::NodeFull(4))
		));
		bin.check_order().unwrap();
		bin.verify_memory_size().unwrap();
	}

	#[test]
	fn find_entry_bin_and_in() {
		let env = test_env(Options::default());
		let bin = bin_with(&env, &[b"b", b"d", b"f"]);
		assert_eq!(
			bin.find_entry(b"d", true),
			Some(Found {
				index: 1,
				exact: true
			})
		);
		assert_eq!(bin.find_entry(b"c", true), None);
		assert_eq!(
			bin.find_entry(b"e", false),
			Some(Found {
				index: 1,
				exact: false
			})
		);
		assert_eq!(bin.find_entry(b"a", false), None);

		let mut inode = Node::new(env.clone(), Level::bin(false).parent(), b"m".to_vec(), 8);
		for k in [b"m", b"p", b"t"] {
			inode.insert_entry(SlotEntry::new(&k[..], Lsn::new(2, 0))).unwrap();
		}
		// slot 0 routes everything below the first real separator
		assert_eq!(inode.find_entry(b"a", false).map(|f| f.index), Some(0));
		assert_eq!(inode.find_entry(b"q", false).map(|f| f.index), Some(1));
		assert_eq!(inode.find_entry(b"t", false).map(|f| f.index), Some(2));
		assert_eq!(inode.find_entry(b"m", true).map(|f| f.index), Some(0));
	}

	#[test]
	fn delete_shifts_and_prohibits_delta() {
		let env = test_env(Options::default());
		let mut bin = bin_with(&env, &[b"a", b"b", b"c"]);
		bin.bin_state_mut().unwrap().prohibit_next_delta = false;
		// freshly inserted slots are dirty
		bin.delete_entry(1, true).unwrap();
		assert_eq!(keys_of(&bin), vec![b"a".to_vec(), b"c".to_vec()]);
		assert!(bin.bin_state().unwrap().prohibit_next_delta);
		assert!(bin.delete_entry(5, true).is_err());
		bin.verify_memory_size().unwrap();
	}

	#[test]
	fn prefix_follows_keys() {
		let env = test_env(Options::default());
		let mut bin = bin_with(&env, &[b"user/001", b"user/002", b"user/003"]);
		bin.recompute_prefix();
		assert_eq!(bin.key_prefix(), b"user/00");
		assert_eq!(bin.key_suffix(1), b"2");

		bin.insert_entry(SlotEntry::new(&b"user/1"[..], Lsn::new(1, 0))).unwrap();
		assert_eq!(bin.key_prefix(), b"user/");
		assert_eq!(bin.key(0), b"user/001");
		assert_eq!(bin.key(3), b"user/1");

		bin.insert_entry(SlotEntry::new(&b"admin"[..], Lsn::new(1, 0))).unwrap();
		assert_eq!(bin.key_prefix(), b"");
		assert_eq!(bin.key(1), b"user/001");
		bin.check_order().unwrap();
		bin.verify_memory_size().unwrap();
	}

	#[test]
	fn embedded_data_survives_prefix_changes() {
		let env = test_env(Options::default());
		let mut bin = Node::new_bin(env, Vec::new());
		bin.insert_entry(SlotEntry::new(&b"key1"[..], Lsn::new(1, 0)).with_data(&b"one"[..])).unwrap();
		bin.insert_entry(SlotEntry::new(&b"key2"[..], Lsn::new(1, 0)).with_data(&b"two"[..])).unwrap();
		bin.recompute_prefix();
		assert_eq!(bin.key_prefix(), b"key");
		assert_eq!(bin.embedded_data(1), Some(&b"two"[..]));
		assert_eq!(bin.find_entry(b"key2", true).map(|f| f.index), Some(1));

		bin.insert_entry(SlotEntry::new(&b"a"[..], Lsn::new(1, 0))).unwrap();
		assert_eq!(bin.embedded_data(1), Some(&b"one"[..]));
		assert_eq!(bin.key(2), b"key2");
		assert!(bin.embedded_data(0).is_none());
	}

	#[test]
	fn expiration_switches_to_hours() {
		let env = test_env(Options::default());
		let mut bin = bin_with(&env, &[b"a", b"b"]);
		bin.set_expiration(0, Expiration::days(3));
		assert!(!bin.is_expiration_in_hours());
		bin.set_expiration(1, Expiration::hours(100));
		assert!(bin.is_expiration_in_hours());
		assert_eq!(bin.expiration(0), Expiration::hours(72));
		assert_eq!(bin.expiration(1), Expiration::hours(100));
		assert!(bin.is_expired(0, 72 * crate::ttl::MILLIS_PER_HOUR));
		assert!(bin.is_defunct(0, 72 * crate::ttl::MILLIS_PER_HOUR));
		assert!(!bin.is_defunct(1, 72 * crate::ttl::MILLIS_PER_HOUR));
	}

	#[test]
	fn memory_is_returned_on_drop() {
		let counter = Arc::new(BudgetCounter::default());
		let env = NodeEnv::builder(
			Options::default().with_budget_flush_threshold(1),
			Arc::new(MemoryLog::new()),
		)
		.with_budget(counter.clone())
		.build()
		.unwrap();
		{
			let mut bin = bin_with(&env, &[b"a", b"b"]);
			bin.set_target(0, Some(Target::Record(Box::new(Ln::data(&b"value"[..])))));
			assert_eq!(counter.used(), bin.memory_size() as i64);
			bin.verify_memory_size().unwrap();
		}
		assert_eq!(counter.used(), 0);
	}

	#[test]
	fn cursors_follow_inserts_and_deletes() {
		let env = test_env(Options::default());
		let mut bin = bin_with(&env, &[b"b", b"d"]);
		let c = bin.register_cursor(1).unwrap();
		bin.insert_entry(SlotEntry::new(&b"a"[..], Lsn::new(1, 0))).unwrap();
		assert_eq!(c.index(), 2);
		bin.delete_entry(0, true).unwrap();
		assert_eq!(c.index(), 1);
		assert_eq!(bin.key(c.index()), b"d");
		assert!(bin.unregister_cursor(&c));
		assert_eq!(bin.cursor_count(), 0);
		bin.verify_memory_size().unwrap();
	}
}
