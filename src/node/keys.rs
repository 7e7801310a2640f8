//! Slot key storage.
//!
//! Keys (or key suffixes, when the node strips a common prefix) are kept in one
//! of two layouts. The default layout allocates every key separately and
//! handles any size. The compact layout packs all slots into one buffer with a
//! fixed stride and is chosen by [`KeyStore::compact`] when every key fits.
//! Writing a key that does not fit into a compact store converts it back to the
//! default layout first.
//!
//! A slot whose record data is embedded stores `key ‖ data ‖ key_len` where
//! `key_len` is a big-endian u32. Callers pass the embedded flag on every
//! access that needs to separate the two.

use std::cmp::Ordering;

use crate::comparator::Comparator;
use crate::memory::{array_size, byte_array_size, ARRAY_ITEM_OVERHEAD};
use crate::options::{MAX_COMPACT_KEY_LENGTH, MAX_COMPACT_SLOTS};

const KEY_LEN_TRAILER: usize = 4;

/// Joins a key and embedded record data into one stored value.
pub(crate) fn combine(key: &[u8], data: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(key.len() + data.len() + KEY_LEN_TRAILER);
	out.extend_from_slice(key);
	out.extend_from_slice(data);
	out.extend_from_slice(&(key.len() as u32).to_be_bytes());
	out
}

/// Splits a stored value into key and embedded data.
pub(crate) fn split(stored: &[u8], embedded: bool) -> (&[u8], Option<&[u8]>) {
	if !embedded || stored.len() < KEY_LEN_TRAILER {
		return (stored, None);
	}
	let body = stored.len() - KEY_LEN_TRAILER;
	let mut len = [0u8; KEY_LEN_TRAILER];
	len.copy_from_slice(&stored[body..]);
	let key_len = (u32::from_be_bytes(len) as usize).min(body);
	(&stored[..key_len], Some(&stored[key_len..body]))
}

#[derive(Clone, Debug)]
pub(crate) enum KeyStore {
	Default {
		keys: Vec<Option<Box<[u8]>>>,
		// heap bytes of the separately allocated keys
		bytes: usize,
	},
	Compact {
		max_key_len: usize,
		data: Vec<u8>,
	},
}

impl KeyStore {
	pub(crate) fn new(capacity: usize) -> Self {
		KeyStore::Default {
			keys: vec![None; capacity],
			bytes: 0,
		}
	}

	pub(crate) fn capacity(&self) -> usize {
		match self {
			KeyStore::Default {
				keys,
				..
			} => keys.len(),
			KeyStore::Compact {
				max_key_len,
				data,
			} => data.len() / (max_key_len + 1),
		}
	}

	pub(crate) fn is_compact(&self) -> bool {
		matches!(self, KeyStore::Compact { .. })
	}

	/// The stored bytes of slot `idx`: the key, or key and data if embedded.
	pub(crate) fn get(&self, idx: usize) -> Option<&[u8]> {
		match self {
			KeyStore::Default {
				keys,
				..
			} => keys.get(idx).and_then(|k| k.as_deref()),
			KeyStore::Compact {
				max_key_len,
				data,
			} => {
				let stride = max_key_len + 1;
				let off = idx * stride;
				let len = *data.get(off)? as usize;
				if len == 0 {
					None
				} else {
					Some(&data[off + 1..off + len])
				}
			}
		}
	}

	/// The key part of slot `idx`.
	pub(crate) fn key(&self, idx: usize, embedded: bool) -> &[u8] {
		match self.get(idx) {
			Some(stored) => split(stored, embedded).0,
			None => &[],
		}
	}

	pub(crate) fn data(&self, idx: usize, embedded: bool) -> Option<&[u8]> {
		self.get(idx).and_then(|stored| split(stored, embedded).1)
	}

	pub(crate) fn set(&mut self, idx: usize, value: Option<&[u8]>) {
		let too_long = match (&*self, value) {
			(
				KeyStore::Compact {
					max_key_len,
					..
				},
				Some(v),
			) => v.len() > *max_key_len,
			_ => false,
		};
		if too_long {
			self.expand();
		}
		match self {
			KeyStore::Default {
				keys,
				bytes,
			} => {
				if let Some(old) = keys[idx].take() {
					*bytes -= byte_array_size(old.len());
				}
				if let Some(v) = value {
					*bytes += byte_array_size(v.len());
					keys[idx] = Some(v.into());
				}
			}
			KeyStore::Compact {
				max_key_len,
				data,
			} => {
				let off = idx * (*max_key_len + 1);
				match value {
					Some(v) => {
						data[off] = (v.len() + 1) as u8;
						data[off + 1..off + 1 + v.len()].copy_from_slice(v);
					}
					None => data[off] = 0,
				}
			}
		}
	}

	/// Moves `n` slots starting at `from` to start at `to`. Source slots that
	/// are not overwritten by the move are cleared.
	pub(crate) fn copy(&mut self, from: usize, to: usize, n: usize) {
		if from == to || n == 0 {
			return;
		}
		match self {
			KeyStore::Default {
				keys,
				bytes,
			} => {
				let moved: Vec<Option<Box<[u8]>>> =
					(from..from + n).map(|i| keys[i].take()).collect();
				for (i, k) in moved.into_iter().enumerate() {
					if let Some(old) = std::mem::replace(&mut keys[to + i], k) {
						*bytes -= byte_array_size(old.len());
					}
				}
			}
			KeyStore::Compact {
				max_key_len,
				data,
			} => {
				let stride = *max_key_len + 1;
				data.copy_within(from * stride..(from + n) * stride, to * stride);
				for i in from..from + n {
					if i < to || i >= to + n {
						data[i * stride] = 0;
					}
				}
			}
		}
	}

	/// Changes the number of slots. Slots past a smaller capacity are dropped.
	pub(crate) fn resize(&mut self, capacity: usize) {
		if capacity > MAX_COMPACT_SLOTS {
			self.expand();
		}
		match self {
			KeyStore::Default {
				keys,
				bytes,
			} => {
				for old in keys.iter_mut().skip(capacity).filter_map(|k| k.take()) {
					*bytes -= byte_array_size(old.len());
				}
				keys.resize(capacity, None);
				keys.shrink_to_fit();
			}
			KeyStore::Compact {
				max_key_len,
				data,
			} => {
				data.resize(capacity * (*max_key_len + 1), 0);
				data.shrink_to_fit();
			}
		}
	}

	/// Converts to the default layout, keeping every slot.
	fn expand(&mut self) {
		if let KeyStore::Compact {
			..
		} = self
		{
			let capacity = self.capacity();
			let mut keys = Vec::with_capacity(capacity);
			let mut bytes = 0;
			for i in 0..capacity {
				let k: Option<Box<[u8]>> = self.get(i).map(Into::into);
				if let Some(k) = &k {
					bytes += byte_array_size(k.len());
				}
				keys.push(k);
			}
			*self = KeyStore::Default {
				keys,
				bytes,
			};
		}
	}

	/// Switches to the compact layout when every stored value fits in
	/// `max_key_len` bytes and that layout is smaller. Returns true if the
	/// layout changed.
	pub(crate) fn compact(&mut self, max_key_len: usize) -> bool {
		let KeyStore::Default {
			keys,
			..
		} = &*self
		else {
			return false;
		};
		if max_key_len == 0 || max_key_len > MAX_COMPACT_KEY_LENGTH || keys.len() > MAX_COMPACT_SLOTS
		{
			return false;
		}
		if keys.iter().flatten().any(|k| k.len() > max_key_len) {
			return false;
		}
		let stride = max_key_len + 1;
		if byte_array_size(keys.len() * stride) >= self.memory_size() {
			return false;
		}
		let mut data = vec![0u8; keys.len() * stride];
		for (i, k) in keys.iter().enumerate() {
			if let Some(k) = k {
				let off = i * stride;
				data[off] = (k.len() + 1) as u8;
				data[off + 1..off + 1 + k.len()].copy_from_slice(k);
			}
		}
		*self = KeyStore::Compact {
			max_key_len,
			data,
		};
		true
	}

	/// Compares `search` against the full key of slot `idx`.
	pub(crate) fn compare_keys(
		&self,
		search: &[u8],
		prefix: &[u8],
		idx: usize,
		embedded: bool,
		cmp: &dyn Comparator,
	) -> Ordering {
		cmp.compare_prefixed(search, prefix, self.key(idx, embedded))
	}

	pub(crate) fn memory_size(&self) -> usize {
		match self {
			KeyStore::Default {
				keys,
				bytes,
			} => array_size(keys.len(), ARRAY_ITEM_OVERHEAD) + bytes,
			KeyStore::Compact {
				data,
				..
			} => byte_array_size(data.len()),
		}
	}

	/// Memory size recomputed from the slots.
	pub(crate) fn computed_memory_size(&self) -> usize {
		match self {
			KeyStore::Default {
				keys,
				..
			} => {
				array_size(keys.len(), ARRAY_ITEM_OVERHEAD)
					+ keys.iter().flatten().map(|k| byte_array_size(k.len())).sum::<usize>()
			}
			KeyStore::Compact {
				..
			} => self.memory_size(),
		}
	}
}

#[cfg(test)]
mod tests {
	use rand::rngs::StdRng;
	use rand::{Rng, SeedableRng};
	use test_log::test;

	use super::*;
	use crate::comparator::BytewiseComparator;

	#[test]
	fn embedded_round_trip() {
		let stored = combine(b"key", b"value");
		assert_eq!(split(&stored, true), (&b"key"[..], Some(&b"value"[..])));
		assert_eq!(split(&stored, false).0, &stored[..]);

		let stored = combine(b"", b"");
		assert_eq!(split(&stored, true), (&b""[..], Some(&b""[..])));
	}

	#[test]
	fn compact_switches_and_expands() {
		let mut store = KeyStore::new(8);
		for i in 0..4 {
			store.set(i, Some(format!("k{i}").as_bytes()));
		}
		assert!(store.compact(16));
		assert!(store.is_compact());
		// idempotent
		assert!(!store.compact(16));
		assert_eq!(store.get(2), Some(&b"k2"[..]));
		assert_eq!(store.get(5), None);

		store.set(5, Some(&[7u8; 40]));
		assert!(!store.is_compact());
		assert_eq!(store.get(2), Some(&b"k2"[..]));
		assert_eq!(store.get(5), Some(&[7u8; 40][..]));
		assert_eq!(store.memory_size(), store.computed_memory_size());
	}

	#[test]
	fn compact_refuses_oversized_keys() {
		let mut store = KeyStore::new(4);
		store.set(0, Some(&[1u8; 20]));
		assert!(!store.compact(16));
		assert!(!store.compact(0));
	}

	#[test]
	fn empty_key_is_not_none() {
		let mut store = KeyStore::new(2);
		store.set(0, Some(b""));
		assert!(store.compact(4));
		assert_eq!(store.get(0), Some(&b""[..]));
		assert_eq!(store.get(1), None);
	}

	#[test]
	fn compare_with_prefix() {
		let mut store = KeyStore::new(2);
		store.set(0, Some(b"le"));
		let cmp = BytewiseComparator::default();
		assert_eq!(store.compare_keys(b"apple", b"app", 0, false, &cmp), Ordering::Equal);
		assert_eq!(store.compare_keys(b"apply", b"app", 0, false, &cmp), Ordering::Greater);

		store.set(1, Some(&combine(b"le", b"data")));
		assert_eq!(store.compare_keys(b"apple", b"app", 1, true, &cmp), Ordering::Equal);
	}

	#[test]
	fn default_and_compact_behave_the_same() {
		let mut rng = StdRng::seed_from_u64(7);
		let capacity = 32;
		let mut default = KeyStore::new(capacity);
		let mut compact = KeyStore::new(capacity);
		for i in 0..capacity {
			let key = format!("key{i:02}").into_bytes();
			default.set(i, Some(&key));
			compact.set(i, Some(&key));
		}
		assert!(compact.compact(12));
		assert!(compact.is_compact());

		for _ in 0..2000 {
			match rng.random_range(0..3) {
				0 => {
					let idx = rng.random_range(0..capacity);
					let value: Option<Vec<u8>> = if rng.random_bool(0.2) {
						None
					} else {
						let len = rng.random_range(0..=12);
						Some((0..len).map(|_| rng.random()).collect())
					};
					default.set(idx, value.as_deref());
					compact.set(idx, value.as_deref());
				}
				1 => {
					let n = rng.random_range(0..capacity / 2);
					let from = rng.random_range(0..=capacity - n);
					let to = rng.random_range(0..=capacity - n);
					default.copy(from, to, n);
					compact.copy(from, to, n);
				}
				_ => {
					let idx = rng.random_range(0..capacity);
					assert_eq!(default.get(idx), compact.get(idx));
				}
			}
		}
		assert!(compact.is_compact());
		for i in 0..capacity {
			assert_eq!(default.get(i), compact.get(i), "slot {i}");
		}
		assert_eq!(default.memory_size(), default.computed_memory_size());
	}

	#[test]
	fn resize_drops_trailing_slots() {
		let mut store = KeyStore::new(4);
		store.set(3, Some(b"gone"));
		store.resize(2);
		assert_eq!(store.capacity(), 2);
		assert_eq!(store.memory_size(), store.computed_memory_size());
		store.resize(300);
		assert_eq!(store.capacity(), 300);
	}
}
