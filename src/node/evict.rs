//! Node-local eviction.
//!
//! The cache evictor asks a node to give memory back in steps of increasing
//! cost and stops at the first step that frees anything.

use log::debug;

use crate::error::Result;

use super::{Node, Target};

impl Node {
	/// Runs the eviction steps in order and returns the bytes freed by the
	/// first one that freed anything.
	pub fn partial_evict(&mut self) -> Result<usize> {
		let freed = self.compress(false)?.bytes_freed;
		if freed > 0 {
			return Ok(freed);
		}
		let freed = self.evict_lns()?;
		if freed > 0 {
			return Ok(freed);
		}
		let freed = self.compact_memory();
		if freed > 0 {
			return Ok(freed);
		}
		Ok(self.discard_vlsn_cache())
	}

	/// Detaches resident records, logging dirty ones first.
	///
	/// Nothing is evicted while a cursor is registered on the node.
	pub fn evict_lns(&mut self) -> Result<usize> {
		if !self.is_bin() || self.cursor_count() > 0 {
			return Ok(0);
		}
		let before = self.memory_size();
		let capacity = self.capacity();
		let evictable: Vec<usize> = self
			.targets
			.iter()
			.filter_map(|(i, t)| match t {
				Target::Record(ln) if ln.is_evictable() => Some(i),
				_ => None,
			})
			.collect();

		let mut evicted = 0;
		for i in evictable {
			let Some(Target::Record(mut ln)) = self.targets.take(i, capacity) else {
				continue;
			};
			if ln.is_dirty() {
				match ln.log(&self.env) {
					Ok(pos) => {
						self.lsns[i] = pos.lsn;
						self.sizes[i] = pos.size;
						self.mark_slot_dirty(i);
					}
					Err(e) => {
						self.targets.set(i, Some(Target::Record(ln)), capacity);
						self.update_memory_size();
						return Err(e);
					}
				}
			}
			if self.env.options.cache_vlsn && ln.vlsn != 0 {
				self.vlsns.set(i, ln.vlsn, capacity);
			}
			evicted += 1;
		}
		self.update_memory_size();
		let freed = before.saturating_sub(self.memory_size());
		if evicted > 0 {
			debug!("evicted {evicted} records from node {}, {freed} bytes freed", self.id);
		}
		Ok(freed)
	}

	/// Moves the slot stores to their smallest representations.
	pub fn compact_memory(&mut self) -> usize {
		let before = self.memory_size();
		let max_key_len = self.env.options.compact_max_key_length;
		if max_key_len > 0 {
			self.keys.compact(max_key_len);
		}
		self.targets.compact();
		self.vlsns.compact();
		self.expirations.compact();
		self.mod_times.compact();
		self.create_times.compact();
		self.update_memory_size();
		before.saturating_sub(self.memory_size())
	}

	/// Drops the cached record versions. They are kept while any record is
	/// embedded, since those records are never fetched from the log.
	pub fn discard_vlsn_cache(&mut self) -> usize {
		if !self.is_bin() || self.vlsns.is_empty() {
			return 0;
		}
		if (0..self.n_entries).any(|i| self.is_embedded(i)) {
			return 0;
		}
		let before = self.memory_size();
		self.vlsns = Default::default();
		self.update_memory_size();
		before.saturating_sub(self.memory_size())
	}

	/// Whether the whole node may be dropped from the cache.
	pub fn is_evictable(&self) -> bool {
		if self.cursor_count() > 0 {
			return false;
		}
		let resident_ok = self.targets.iter().all(|(_, t)| match t {
			Target::Node(_) => false,
			Target::Record(ln) => ln.is_evictable(),
		});
		if !resident_ok {
			return false;
		}
		// Under blind operations a lock on any slot pins the node, whether or
		// not its record is in memory.
		if self.is_bin() && self.env.options.bin_delta_blind_ops {
			return (0..self.n_entries).all(|i| {
				let lsn = self.lsns[i];
				lsn.is_null() || !self.env.locks.is_contended(lsn)
			});
		}
		true
	}
}
