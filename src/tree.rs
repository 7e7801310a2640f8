//! Record-level operations over a tree of nodes.
//!
//! The tree owns the root slot and the node cache and drives the node layer:
//! top-down descent with latch coupling, reading children from the log with
//! the parent latch released, checkpoints, compression and eviction. It is not
//! a transaction layer; pending deletes are the only multi-step state kept.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, error, warn};
use parking_lot::RwLock;

use crate::cache::NodeCache;
use crate::env::{LogPosition, NodeEnv};
use crate::error::{Error, Result};
use crate::ln::Ln;
use crate::lsn::{Lsn, NULL_LSN};
use crate::node::{
	CursorPosition, ExclusiveGuard, Node, NodeGuard, NodeRef, SlotEntry, SlotState, Target,
	NO_PARENT,
};
use crate::ttl::Expiration;

/// How a delete is applied.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeleteMode {
	/// The deleting transaction is still open. The record stays readable
	/// until [`Tree::commit_delete`] or [`Tree::abort_delete`].
	Pending,
	Committed,
}

/// Totals from one [`Tree::compress_all`] pass.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CompressStats {
	pub removed: usize,
	/// BINs that still hold removable slots.
	pub incomplete: usize,
}

pub(crate) struct RootSlot {
	pub(crate) lsn: Lsn,
	pub(crate) node: NodeRef,
}

/// Outcome of reading a child that was not resident.
enum Fetched {
	Child(ExclusiveGuard, NodeRef),
	/// The parent changed while its latch was released.
	Restart,
}

pub struct Tree {
	pub(crate) env: Arc<NodeEnv>,
	pub(crate) root: RwLock<RootSlot>,
	pub(crate) cache: NodeCache,
	restarts: AtomicU64,
}

impl Tree {
	/// Creates an empty tree whose root is a single BIN.
	pub fn new(env: Arc<NodeEnv>) -> Self {
		let mut root = Node::new_bin(env.clone(), Vec::new());
		root.set_root(true);
		root.set_dirty(true);
		Self::with_root(env, NULL_LSN, root)
	}

	/// Opens a tree whose root was logged at `root_lsn`. Everything below the
	/// root is read from the log on demand.
	pub fn open(env: Arc<NodeEnv>, root_lsn: Lsn) -> Result<Self> {
		let mut root = Node::fetch(&env, root_lsn)?;
		root.set_root(true);
		debug!("opened tree at {root_lsn}, root node {}", root.id());
		Ok(Self::with_root(env, root_lsn, root))
	}

	fn with_root(env: Arc<NodeEnv>, lsn: Lsn, root: Node) -> Self {
		let node = NodeRef::new(root);
		let cache = NodeCache::new();
		cache.insert(node.clone());
		Self {
			env,
			root: RwLock::new(RootSlot {
				lsn,
				node,
			}),
			cache,
			restarts: AtomicU64::new(0),
		}
	}

	pub fn env(&self) -> &Arc<NodeEnv> {
		&self.env
	}

	pub fn cache(&self) -> &NodeCache {
		&self.cache
	}

	pub fn root_lsn(&self) -> Lsn {
		self.root.read().lsn
	}

	pub fn root_node(&self) -> NodeRef {
		self.root.read().node.clone()
	}

	/// Number of descents restarted because a parent changed during a fetch.
	pub fn restarts(&self) -> u64 {
		self.restarts.load(Ordering::Relaxed)
	}

	// ---- records ----

	pub fn put(&self, key: &[u8], data: &[u8]) -> Result<()> {
		self.put_with_expiration(key, data, Expiration::NONE)
	}

	pub fn put_with_expiration(&self, key: &[u8], data: &[u8], expiration: Expiration) -> Result<()> {
		let entry = self.record_entry(key, data)?.with_expiration(expiration);
		let mut merge = false;
		loop {
			let mut bin = self.find_bin_for_insert(key, merge)?;
			if bin.is_delta() {
				if let Some(found) = bin.find_entry(key, true) {
					bin.update_record(found.index, entry);
					return Ok(());
				}
				if bin.blind_insert(entry.clone())? {
					return Ok(());
				}
				bin.mutate_to_full()?;
			}
			match bin.insertion_index(key) {
				Ok(idx) => {
					let created = bin.creation_time(idx);
					let mut entry = entry;
					if created != 0 {
						entry.creation_time = created;
					}
					bin.update_record(idx, entry);
					return Ok(());
				}
				Err(_) if bin.is_full() => {
					// The delta merged into a full BIN. Descend again so it splits.
					merge = true;
				}
				Err(_) => {
					bin.insert_entry(entry)?;
					return Ok(());
				}
			}
		}
	}

	/// Logs the record and builds its slot. Small data is embedded in the
	/// slot, larger data stays resident as the slot's target. An empty record
	/// keeps neither and is flagged NO_DATA.
	fn record_entry(&self, key: &[u8], data: &[u8]) -> Result<SlotEntry> {
		let now = self.env.now_millis();
		let mut ln = Ln::data(Bytes::copy_from_slice(data));
		ln.vlsn = self.env.next_vlsn();
		ln.modification_time = now;
		ln.creation_time = now;
		let pos = ln.log(&self.env)?;

		let options = self.env.options();
		let mut entry = SlotEntry::new(key, pos.lsn).with_size(pos.size).with_times(now, now);
		if options.cache_vlsn {
			entry = entry.with_vlsn(ln.vlsn);
		}
		if data.is_empty() {
			Ok(entry.with_state(SlotState::NO_DATA))
		} else if options.max_embedded_ln > 0 && data.len() <= options.max_embedded_ln {
			Ok(entry.with_data(data))
		} else {
			Ok(entry.with_target(Target::Record(Box::new(ln))))
		}
	}

	pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
		let (mut bin, idx) = self.locate(key)?;
		let Some(idx) = idx else {
			return Ok(None);
		};
		if bin.is_known_deleted(idx) || bin.is_expired(idx, self.env.now_millis()) {
			return Ok(None);
		}
		if bin.state(idx).contains(SlotState::NO_DATA) {
			return Ok(Some(Bytes::new()));
		}
		if let Some(data) = bin.embedded_data(idx) {
			return Ok(Some(Bytes::copy_from_slice(data)));
		}
		if let Some(ln) = bin.record(idx) {
			return Ok(ln.bytes().cloned());
		}
		match Ln::fetch(&self.env, bin.lsn(idx)) {
			Ok(ln) => {
				let data = ln.bytes().cloned();
				bin.set_target(idx, Some(Target::Record(Box::new(ln))));
				Ok(data)
			}
			Err(e) => {
				self.record_fetch_failed(&bin, idx, e)?;
				Ok(None)
			}
		}
	}

	/// Deletes `key`, returning false if there was no live record.
	pub fn delete(&self, key: &[u8], mode: DeleteMode) -> Result<bool> {
		let (mut bin, idx) = self.locate(key)?;
		let Some(idx) = idx else {
			return Ok(false);
		};
		if bin.is_defunct(idx, self.env.now_millis()) {
			return Ok(false);
		}
		match mode {
			DeleteMode::Pending => bin.set_pending_deleted(idx),
			DeleteMode::Committed => self.log_deletion(&mut bin, idx)?,
		}
		Ok(true)
	}

	pub fn commit_delete(&self, key: &[u8]) -> Result<bool> {
		let (mut bin, idx) = self.locate(key)?;
		match idx {
			Some(idx) if bin.is_pending_deleted(idx) => {
				self.log_deletion(&mut bin, idx)?;
				Ok(true)
			}
			_ => Ok(false),
		}
	}

	pub fn abort_delete(&self, key: &[u8]) -> Result<bool> {
		let (mut bin, idx) = self.locate(key)?;
		match idx {
			Some(idx) if bin.is_pending_deleted(idx) => {
				bin.clear_pending_deleted(idx);
				Ok(true)
			}
			_ => Ok(false),
		}
	}

	fn log_deletion(&self, bin: &mut Node, idx: usize) -> Result<()> {
		let mut ln = Ln::deleted();
		ln.vlsn = self.env.next_vlsn();
		ln.modification_time = self.env.now_millis();
		let pos = ln.log(&self.env)?;
		let mut entry = SlotEntry::new(bin.key(idx), pos.lsn)
			.with_size(pos.size)
			.with_state(SlotState::KNOWN_DELETED.union(SlotState::TOMBSTONE));
		if self.env.options().cache_vlsn {
			entry = entry.with_vlsn(ln.vlsn);
		}
		bin.update_record(idx, entry);
		Ok(())
	}

	/// Decides what an unreadable record means.
	///
	/// A record that is already deleted, expired or extinct is simply absent.
	/// Anything else points at a damaged log.
	fn record_fetch_failed(&self, bin: &Node, idx: usize, err: Error) -> Result<()> {
		if !err.is_log_integrity() {
			return Err(err);
		}
		let key = bin.key(idx);
		let lsn = bin.lsn(idx);
		if bin.is_defunct(idx, self.env.now_millis()) || self.env.is_extinct(&key) {
			warn!("ignoring unreadable record at {lsn} in node {}: {err}", bin.id());
			return Ok(());
		}
		error!("record at {lsn} in node {} is unreadable: {err}", bin.id());
		Err(Error::Corruption(format!("record at {lsn} in node {} is unreadable: {err}", bin.id())))
	}

	// ---- descent ----

	fn route(node: &Node, key: &[u8]) -> Result<usize> {
		node.find_entry(key, false)
			.map(|f| f.index)
			.ok_or_else(|| Error::Internal(format!("internal node {} has no entries", node.id())))
	}

	/// Latches the BIN covering `key` and finds its exact slot. A delta is
	/// merged unless it answers the lookup by itself.
	fn locate(&self, key: &[u8]) -> Result<(ExclusiveGuard, Option<usize>)> {
		let mut bin = self.find_bin(key)?;
		if bin.is_delta() {
			if let Some(found) = bin.find_entry(key, true) {
				return Ok((bin, Some(found.index)));
			}
			if bin.definitely_absent_from_full(key) {
				return Ok((bin, None));
			}
			bin.mutate_to_full()?;
		}
		let idx = bin.find_entry(key, true).map(|f| f.index);
		Ok((bin, idx))
	}

	/// Descends to the BIN covering `key` using shared latches on INs.
	pub(crate) fn find_bin(&self, key: &[u8]) -> Result<ExclusiveGuard> {
		'restart: loop {
			let slot = self.root.read();
			let mut guard = slot.node.latch_shared();
			drop(slot);
			if !guard.is_root() {
				self.note_restart();
				continue 'restart;
			}
			loop {
				if guard.is_bin() {
					return match guard {
						NodeGuard::Exclusive(g) => Ok(g),
						NodeGuard::Shared(g) => {
							Err(Error::Internal(format!("BIN {} latched shared", g.id())))
						}
					};
				}
				let idx = Self::route(&guard, key)?;
				let (parent, child) = match guard.child(idx) {
					Some(child) => (guard, child),
					None => {
						let node = guard.node_ref().clone();
						drop(guard);
						let parent = node.latch_exclusive();
						if parent.is_detached() {
							self.note_restart();
							continue 'restart;
						}
						let idx = Self::route(&parent, key)?;
						match self.fetch_child(parent, idx)? {
							Fetched::Child(parent, child) => (NodeGuard::Exclusive(parent), child),
							Fetched::Restart => continue 'restart,
						}
					}
				};
				let next = child.latch_shared();
				drop(parent);
				guard = next;
			}
		}
	}

	/// Descends exclusively to the BIN covering `key`, splitting every full
	/// node on the way so the BIN has room for one more slot.
	fn find_bin_for_insert(&self, key: &[u8], merge: bool) -> Result<ExclusiveGuard> {
		'restart: loop {
			let mut slot = self.root.write();
			let mut parent = slot.node.latch_exclusive();
			if parent.is_bin() {
				self.prepare_bin(&mut parent, key, merge)?;
			}
			if !parent.is_delta() && parent.is_full() {
				self.split_root(&mut slot, parent, key)?;
				continue 'restart;
			}
			drop(slot);
			if parent.is_bin() {
				return Ok(parent);
			}

			let mut grandparent: Option<(ExclusiveGuard, usize)> = None;
			let mut leftmost = true;
			let mut rightmost = true;
			loop {
				let idx = Self::route(&parent, key)?;
				let n = parent.n_entries();
				let (p, child) = match self.fetch_child(parent, idx)? {
					Fetched::Child(p, child) => (p, child),
					Fetched::Restart => continue 'restart,
				};
				parent = p;
				let mut child_guard = child.latch_exclusive();
				if child_guard.is_bin() {
					self.prepare_bin(&mut child_guard, key, merge)?;
				}
				if !child_guard.is_delta() && child_guard.is_full() {
					let split_index =
						child_guard.split_index_for(key, leftmost && idx == 0, rightmost && idx + 1 == n);
					let gp = grandparent.as_mut().map(|(g, i)| (&mut **g, *i));
					let outcome = child_guard.split(&mut parent, idx, gp, split_index)?;
					self.cache.insert(outcome.sibling);
					continue;
				}
				leftmost &= idx == 0;
				rightmost &= idx + 1 == n;
				if child_guard.is_bin() {
					return Ok(child_guard);
				}
				grandparent = Some((parent, idx));
				parent = child_guard;
			}
		}
	}

	/// Merges a delta unless the insert can be applied to it directly.
	fn prepare_bin(&self, bin: &mut Node, key: &[u8], merge: bool) -> Result<()> {
		if !bin.is_delta() {
			return Ok(());
		}
		let usable = !merge
			&& (bin.find_entry(key, true).is_some()
				|| (self.env.options().bin_delta_blind_ops && bin.definitely_absent_from_full(key)));
		if !usable {
			bin.mutate_to_full()?;
		}
		Ok(())
	}

	/// Grows the tree by one level. Called with the tree latch held.
	fn split_root(&self, slot: &mut RootSlot, mut old: ExclusiveGuard, key: &[u8]) -> Result<()> {
		let level = old.level().parent();
		let capacity = self.env.options().max_entries;
		let mut root = Node::new(self.env.clone(), level, Vec::new(), capacity);
		root.set_root(true);
		let old_ref = old.node_ref().clone();
		root.insert_entry(SlotEntry::child(Vec::new(), old_ref, old.last_full_lsn(), 0))?;
		old.set_root(false);

		let split_index = old.split_index_for(key, true, true);
		let outcome = old.split(&mut root, 0, None, split_index)?;
		drop(old);
		let root = NodeRef::new(root);
		self.cache.insert(outcome.sibling);
		self.cache.insert(root.clone());
		debug!("root split, new root {} logged at {}", root.id(), outcome.parent_lsn);
		slot.lsn = outcome.parent_lsn;
		slot.node = root;
		Ok(())
	}

	/// Returns child `idx` of `parent`, reading it from the log if needed.
	///
	/// The parent latch is released during the read. Afterwards the parent is
	/// latched again and the slot checked; if it moved or was re-pointed the
	/// caller restarts its descent.
	fn fetch_child(&self, parent: ExclusiveGuard, idx: usize) -> Result<Fetched> {
		if let Some(child) = parent.child(idx) {
			return Ok(Fetched::Child(parent, child));
		}
		let lsn = parent.lsn(idx);
		let parent_id = parent.id();
		let parent_ref = parent.node_ref().clone();
		drop(parent);

		self.env.hooks.fetch_window(parent_id, idx);
		let fetched = Node::fetch(&self.env, lsn);

		let mut parent = parent_ref.latch_exclusive();
		if parent.is_detached() || idx >= parent.n_entries() || parent.lsn(idx) != lsn {
			debug!("node {parent_id} changed while reading child {idx}, restarting");
			self.note_restart();
			return Ok(Fetched::Restart);
		}
		if let Some(child) = parent.child(idx) {
			return Ok(Fetched::Child(parent, child));
		}
		let mut node = match fetched {
			Ok(node) => node,
			Err(e) if e.is_log_integrity() => {
				error!("child {idx} of node {parent_id} at {lsn} is unreadable: {e}");
				return Err(Error::Corruption(format!(
					"child {idx} of node {parent_id} at {lsn} is unreadable: {e}"
				)));
			}
			Err(e) => return Err(e),
		};
		node.set_root(false);
		let child = NodeRef::new(node);
		parent.set_target(idx, Some(Target::Node(child.clone())));
		self.cache.insert(child.clone());
		Ok(Fetched::Child(parent, child))
	}

	fn note_restart(&self) {
		self.restarts.fetch_add(1, Ordering::Relaxed);
	}

	/// Latches the parent of `child` and finds the slot referring to it.
	///
	/// The caller must not hold the child's latch. Returns `None` for the root
	/// and for a node no longer referenced by any cached parent.
	pub fn latch_parent(&self, child: &NodeRef) -> Result<Option<(ExclusiveGuard, usize)>> {
		loop {
			let parent_id = child.parent_id();
			if parent_id == NO_PARENT {
				return Ok(None);
			}
			let Some(parent) = self.cache.get(parent_id) else {
				return Ok(None);
			};
			let guard = parent.latch_exclusive();
			let slot = guard.resident_children().into_iter().find(|(_, c)| c.ptr_eq(child));
			if let Some((idx, _)) = slot {
				return Ok(Some((guard, idx)));
			}
			if child.parent_id() != parent_id {
				// Moved by a split while we waited for the latch.
				continue;
			}
			if guard.is_detached() {
				return Ok(None);
			}
			return Err(Error::Internal(format!(
				"node {parent_id} does not refer to its child {}",
				child.id()
			)));
		}
	}

	// ---- maintenance ----

	/// Logs every dirty resident node, children before parents, and returns
	/// where the root was written.
	pub fn checkpoint(&self) -> Result<Lsn> {
		let mut slot = self.root.write();
		let root = slot.node.clone();
		if let Some(pos) = self.checkpoint_node(&root)? {
			slot.lsn = pos.lsn;
		}
		self.env.budget().flush();
		debug!("checkpoint complete, root at {}", slot.lsn);
		Ok(slot.lsn)
	}

	fn checkpoint_node(&self, node: &NodeRef) -> Result<Option<LogPosition>> {
		let mut guard = node.latch_exclusive();
		for (idx, child) in guard.resident_children() {
			if let Some(pos) = self.checkpoint_node(&child)? {
				guard.update_slot_lsn(idx, pos.lsn, pos.size);
			}
		}
		if !guard.is_dirty() && !guard.has_provisional_children() {
			return Ok(None);
		}
		let provisional = !guard.is_root();
		guard.log(provisional, true).map(Some)
	}

	/// Compresses every cached BIN, dirty slots included.
	pub fn compress_all(&self) -> Result<CompressStats> {
		let mut stats = CompressStats::default();
		for bin in self.cache.bins() {
			let outcome = {
				let mut guard = bin.latch_exclusive();
				if guard.is_detached() {
					continue;
				}
				guard.compress(true)?
			};
			stats.removed += outcome.removed;
			if !outcome.complete {
				stats.incomplete += 1;
			}
			if outcome.identifier_changed {
				if let Some((mut parent, idx)) = self.latch_parent(&bin)? {
					parent.set_state_bit(idx, SlotState::UPDATE_KEY_ON_LOG, true);
				}
			}
		}
		Ok(stats)
	}

	/// Runs the node-local eviction steps on one cached node.
	pub fn partial_evict(&self, node_id: u64) -> Result<usize> {
		let Some(node) = self.cache.get(node_id) else {
			return Ok(0);
		};
		let mut guard = node.latch_exclusive();
		if guard.is_detached() {
			return Ok(0);
		}
		guard.partial_evict()
	}

	/// Shrinks a cached BIN to a delta of its dirty slots.
	pub fn mutate_to_delta(&self, node_id: u64) -> Result<bool> {
		let Some(node) = self.cache.get(node_id) else {
			return Ok(false);
		};
		let mut guard = node.latch_exclusive();
		if guard.is_detached() || !guard.is_bin() {
			return Ok(false);
		}
		guard.mutate_to_delta()
	}

	/// Drops a node from the cache, logging it first if it is dirty.
	pub fn evict_node(&self, node_id: u64) -> Result<bool> {
		let Some(node) = self.cache.get(node_id) else {
			return Ok(false);
		};
		let Some((mut parent, idx)) = self.latch_parent(&node)? else {
			return Ok(false);
		};
		let mut guard = node.latch_exclusive();
		if !guard.is_evictable() {
			return Ok(false);
		}
		if guard.is_dirty() {
			let pos = guard.log(false, true)?;
			parent.update_slot_lsn(idx, pos.lsn, pos.size);
		}
		guard.detached = true;
		parent.take_target(idx);
		self.cache.remove(node_id);
		debug!("evicted node {node_id} from slot {idx} of node {}", parent.id());
		Ok(true)
	}

	// ---- cursors ----

	/// Positions a cursor on `key`. The BIN keeps the cursor's slot while it
	/// is open.
	pub fn open_cursor(&self, key: &[u8]) -> Result<Option<Cursor<'_>>> {
		let mut bin = self.find_bin(key)?;
		if bin.is_delta() {
			bin.mutate_to_full()?;
		}
		let Some(found) = bin.find_entry(key, true) else {
			return Ok(None);
		};
		let position = bin.register_cursor(found.index)?;
		Ok(Some(Cursor {
			tree: self,
			position,
		}))
	}
}

impl std::fmt::Debug for Tree {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Tree")
			.field("root_lsn", &self.root_lsn())
			.field("cache", &self.cache)
			.finish()
	}
}

/// A registered position on a BIN slot.
pub struct Cursor<'a> {
	tree: &'a Tree,
	position: Arc<CursorPosition>,
}

impl Cursor<'_> {
	pub fn node_id(&self) -> u64 {
		self.position.node_id()
	}

	pub fn index(&self) -> usize {
		self.position.index()
	}

	/// Key under the cursor.
	pub fn key(&self) -> Option<Vec<u8>> {
		let bin = self.latch_bin()?;
		let idx = self.position.index();
		(idx < bin.n_entries()).then(|| bin.key(idx))
	}

	// Splits move the position to another node, so re-check after latching.
	fn latch_bin(&self) -> Option<ExclusiveGuard> {
		loop {
			let id = self.position.node_id();
			let guard = self.tree.cache.get(id)?.latch_exclusive();
			if self.position.node_id() == id {
				return Some(guard);
			}
		}
	}
}

impl Drop for Cursor<'_> {
	fn drop(&mut self) {
		if let Some(mut bin) = self.latch_bin() {
			bin.unregister_cursor(&self.position);
		}
	}
}
