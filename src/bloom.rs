//! Bloom filter over the clean keys of a BIN-delta.
//!
//! A delta only holds the dirty slots of its BIN. The filter summarizes the
//! keys that were left behind in the full version so an insert of a key that
//! is definitely absent there can be applied to the delta directly.

use crate::memory::byte_array_size;

const SEED: u32 = 0xbc9f_1d34;

// Hash returns the hash of the given data.
pub(crate) fn hash(data: &[u8], seed: u32) -> u32 {
	const M: u32 = 0xc6a4_a793;
	const R: u32 = 24;

	let mut h = seed ^ ((data.len() as u64) * M as u64) as u32;

	let mut chunks = data.chunks_exact(4);
	for chunk in &mut chunks {
		let w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
		h = h.wrapping_add(w);
		h = h.wrapping_mul(M);
		h ^= h >> 16;
	}

	let rest = chunks.remainder();
	match rest.len() {
		3 => {
			h = h.wrapping_add((rest[2] as u32) << 16);
			h = h.wrapping_add((rest[1] as u32) << 8);
			h = h.wrapping_add(rest[0] as u32);
		}
		2 => {
			h = h.wrapping_add((rest[1] as u32) << 8);
			h = h.wrapping_add(rest[0] as u32);
		}
		1 => {
			h = h.wrapping_add(rest[0] as u32);
		}
		_ => {}
	}

	h = h.wrapping_mul(M);
	h ^= h >> R;

	h
}

/// Accumulates key hashes and produces the filter bytes.
pub(crate) struct BloomBuilder {
	bits_per_key: usize,
	hashes: Vec<u32>,
}

impl BloomBuilder {
	pub(crate) fn new(bits_per_key: usize) -> Self {
		Self {
			bits_per_key,
			hashes: Vec::new(),
		}
	}

	pub(crate) fn add(&mut self, key: &[u8]) {
		self.hashes.push(hash(key, SEED));
	}

	/// Builds the filter. The last byte holds the number of probes.
	pub(crate) fn finish(self) -> Vec<u8> {
		let n = self.hashes.len();
		if n == 0 {
			return vec![];
		}

		let bits = (n * self.bits_per_key).max(64);
		let bytes = bits.div_ceil(8);
		let bits = bytes * 8;

		let mut filter = vec![0u8; bytes + 1];
		let k = (((self.bits_per_key as f64) * 0.7) as u32).clamp(1, 30);

		for h in self.hashes {
			let delta = h.rotate_left(15);
			let mut hash = h;
			for _ in 0..k {
				let bit_pos = (hash % (bits as u32)) as usize;
				filter[bit_pos / 8] |= 1 << (bit_pos % 8);
				hash = hash.wrapping_add(delta);
			}
		}

		filter[bytes] = k as u8;
		filter
	}
}

/// Returns false only if `key` was definitely not added to `filter`.
///
/// An empty filter summarizes an empty key set.
pub(crate) fn may_contain(filter: &[u8], key: &[u8]) -> bool {
	let bytes = filter.len();
	if bytes < 2 {
		return false;
	}

	let k = filter[bytes - 1] as u32;
	if k > 30 {
		// Reserved for potentially new encodings
		return true;
	}

	let bits = (bytes - 1) * 8;
	let h = hash(key, SEED);
	let delta = h.rotate_left(15);
	let mut hash = h;

	for _ in 0..k {
		let bit_pos = (hash % (bits as u32)) as usize;
		if (filter[bit_pos / 8] & (1 << (bit_pos % 8))) == 0 {
			return false;
		}
		hash = hash.wrapping_add(delta);
	}

	true
}

pub(crate) fn memory_size(filter: &[u8]) -> usize {
	byte_array_size(filter.len())
}
