//! Packed per-slot numbers.
//!
//! Version sequence numbers, expiration times and modification/creation times
//! are optional per slot and usually close to each other within one node. They
//! are stored as offsets from a per-node base with the smallest byte width that
//! fits every offset. A stored 0 means "no value".

use crate::memory::byte_array_size;

#[derive(Clone, Debug, Default)]
pub(crate) enum PackedLongs {
	#[default]
	Empty,
	Packed {
		base: u64,
		width: usize,
		data: Vec<u8>,
	},
}

fn width_for(offset: u64) -> usize {
	let bits = 64 - offset.leading_zeros() as usize;
	bits.div_ceil(8).max(1)
}

fn read(data: &[u8], width: usize, idx: usize) -> u64 {
	data[idx * width..(idx + 1) * width].iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

fn write(data: &mut [u8], width: usize, idx: usize, value: u64) {
	let slot = &mut data[idx * width..(idx + 1) * width];
	for (i, b) in slot.iter_mut().enumerate() {
		*b = (value >> (8 * (width - 1 - i))) as u8;
	}
}

impl PackedLongs {
	pub(crate) fn is_empty(&self) -> bool {
		matches!(self, PackedLongs::Empty)
	}

	pub(crate) fn get(&self, idx: usize) -> u64 {
		match self {
			PackedLongs::Empty => 0,
			PackedLongs::Packed {
				base,
				width,
				data,
			} => {
				if (idx + 1) * width > data.len() {
					return 0;
				}
				match read(data, *width, idx) {
					0 => 0,
					stored => base + stored - 1,
				}
			}
		}
	}

	/// Stores `value` in slot `idx` of a node with `capacity` slots. Any other
	/// stored value keeps its absolute value when the base or width changes.
	pub(crate) fn set(&mut self, idx: usize, value: u64, capacity: usize) {
		if value == 0 {
			if let PackedLongs::Packed {
				width,
				data,
				..
			} = self
			{
				if (idx + 1) * *width <= data.len() {
					write(data, *width, idx, 0);
				}
			}
			return;
		}
		match self {
			PackedLongs::Empty => {
				let mut data = vec![0u8; capacity];
				write(&mut data, 1, idx, 1);
				*self = PackedLongs::Packed {
					base: value,
					width: 1,
					data,
				};
			}
			PackedLongs::Packed {
				base,
				width,
				data,
			} => {
				if value >= *base && width_for(value - *base + 1) <= *width {
					write(data, *width, idx, value - *base + 1);
					return;
				}
				let slots = data.len() / *width;
				let mut values: Vec<u64> = (0..slots).map(|i| self.get(i)).collect();
				values[idx] = value;
				self.rebuild(&values);
			}
		}
	}

	/// Re-encodes the given absolute values with the smallest base and width.
	fn rebuild(&mut self, values: &[u64]) {
		let present = values.iter().copied().filter(|v| *v != 0);
		let (min, max) = present.fold((u64::MAX, 0u64), |(lo, hi), v| (lo.min(v), hi.max(v)));
		if max == 0 {
			*self = PackedLongs::Empty;
			return;
		}
		let width = width_for(max - min + 1);
		let mut data = vec![0u8; values.len() * width];
		for (i, v) in values.iter().enumerate() {
			if *v != 0 {
				write(&mut data, width, i, v - min + 1);
			}
		}
		*self = PackedLongs::Packed {
			base: min,
			width,
			data,
		};
	}

	/// Moves `n` slots from `from` to `to`, clearing sources not overwritten.
	pub(crate) fn copy(&mut self, from: usize, to: usize, n: usize) {
		if from == to || n == 0 {
			return;
		}
		if let PackedLongs::Packed {
			width,
			data,
			..
		} = self
		{
			let w = *width;
			data.copy_within(from * w..(from + n) * w, to * w);
			for i in from..from + n {
				if i < to || i >= to + n {
					write(data, w, i, 0);
				}
			}
		}
	}

	pub(crate) fn resize(&mut self, capacity: usize) {
		if let PackedLongs::Packed {
			width,
			data,
			..
		} = self
		{
			data.resize(capacity * *width, 0);
			data.shrink_to_fit();
		}
	}

	/// Drops the array when no slot holds a value, and otherwise narrows it to
	/// the smallest encoding. Returns true if anything changed.
	pub(crate) fn compact(&mut self) -> bool {
		let PackedLongs::Packed {
			base,
			width,
			data,
		} = &*self
		else {
			return false;
		};
		let slots = data.len() / width;
		let values: Vec<u64> = (0..slots).map(|i| self.get(i)).collect();
		let (old_base, old_width) = (*base, *width);
		self.rebuild(&values);
		match self {
			PackedLongs::Empty => true,
			PackedLongs::Packed {
				base,
				width,
				..
			} => *base != old_base || *width != old_width,
		}
	}

	pub(crate) fn memory_size(&self) -> usize {
		match self {
			PackedLongs::Empty => 0,
			PackedLongs::Packed {
				data,
				..
			} => byte_array_size(data.len()),
		}
	}
}
