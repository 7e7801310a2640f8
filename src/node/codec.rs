//! Log format of nodes.
//!
//! ```text
//! version u8 | id | level | flags u8 | identifier key | [prefix]
//! | compact key length u8 | entry count | capacity
//! | BIN: last full lsn, last delta lsn
//! | [expiration base] | [time base]
//! | slots
//! | delta: full entry count, full capacity, [bloom]
//! ```
//!
//! Every slot is its stored key bytes, lsn, state byte and the optional
//! columns announced by the flags. Numbers are varints, byte strings are
//! length prefixed. Lsns are written shifted by one so that a null lsn is a
//! single zero byte. Bytes after the last field are ignored.

use std::sync::Arc;

use integer_encoding::VarIntWriter;
use log::debug;

use crate::env::{EntryKind, LogItem, LogPosition, NodeEnv};
use crate::error::{Error, Result};
use crate::ln::Reader;
use crate::lsn::{Lsn, NULL_LSN};
use crate::ttl::Expiration;

use super::{keys, DeltaShape, Level, Node, SlotEntry, SlotState};

pub const FORMAT_VERSION: u8 = 1;

const FLAG_ROOT: u8 = 0x01;
const FLAG_HAS_PREFIX: u8 = 0x02;
const FLAG_HAS_LAST_SIZE: u8 = 0x04;
const FLAG_HAS_BLOOM: u8 = 0x08;
const FLAG_HAS_VLSN: u8 = 0x10;
const FLAG_EXP_IN_HOURS: u8 = 0x20;
const FLAG_HAS_EXPIRATION: u8 = 0x40;
const FLAG_HAS_TIMES: u8 = 0x80;

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
	buf.write_varint(bytes.len() as u64)?;
	buf.extend_from_slice(bytes);
	Ok(())
}

fn read_bytes<'a>(reader: &mut Reader<'a>) -> Result<&'a [u8]> {
	let len = reader.varint::<u64>()? as usize;
	reader.bytes(len)
}

/// Smallest non-zero value, or 0 if there is none.
fn base_of(values: impl Iterator<Item = u64>) -> u64 {
	values.filter(|v| *v != 0).min().unwrap_or(0)
}

fn offset(value: u64, base: u64) -> u64 {
	if value == 0 {
		0
	} else {
		value - base + 1
	}
}

fn from_offset(offset: u64, base: u64) -> u64 {
	if offset == 0 {
		0
	} else {
		base + offset - 1
	}
}

impl Node {
	/// Slots written by the next entry: the dirty ones for a delta, all
	/// non-extinct ones otherwise.
	fn written_slots(&self, delta: bool) -> Vec<usize> {
		(0..self.n_entries)
			.filter(|&i| {
				if delta {
					self.is_dirty_slot(i)
				} else {
					!(self.is_bin() && self.env.is_extinct(&self.key(i)))
				}
			})
			.collect()
	}

	pub(crate) fn encode(&self, delta: bool) -> Result<Vec<u8>> {
		let slots = self.written_slots(delta);
		let expirations: Vec<u64> = slots.iter().map(|&i| self.expirations.get(i)).collect();
		let mod_times: Vec<u64> = slots.iter().map(|&i| self.mod_times.get(i)).collect();
		let create_times: Vec<u64> = slots.iter().map(|&i| self.create_times.get(i)).collect();
		let vlsns: Vec<u64> = if self.env.options.cache_vlsn {
			slots.iter().map(|&i| self.vlsn(i)).collect()
		} else {
			vec![0; slots.len()]
		};
		let exp_base = base_of(expirations.iter().copied());
		let time_base = base_of(mod_times.iter().chain(create_times.iter()).copied());
		let bloom = if delta {
			self.delta_bloom()
		} else {
			None
		};

		let mut flags = 0;
		if self.is_root {
			flags |= FLAG_ROOT;
		}
		if !self.key_prefix.is_empty() {
			flags |= FLAG_HAS_PREFIX;
		}
		if slots.iter().any(|&i| self.sizes[i] != 0) {
			flags |= FLAG_HAS_LAST_SIZE;
		}
		if bloom.is_some() {
			flags |= FLAG_HAS_BLOOM;
		}
		if vlsns.iter().any(|v| *v != 0) {
			flags |= FLAG_HAS_VLSN;
		}
		if self.expiration_in_hours {
			flags |= FLAG_EXP_IN_HOURS;
		}
		if exp_base != 0 {
			flags |= FLAG_HAS_EXPIRATION;
		}
		if time_base != 0 {
			flags |= FLAG_HAS_TIMES;
		}

		let mut buf = Vec::with_capacity(64 + slots.len() * 16);
		buf.push(FORMAT_VERSION);
		buf.write_varint(self.id)?;
		buf.write_varint(self.level.raw())?;
		buf.push(flags);
		write_bytes(&mut buf, &self.identifier_key)?;
		if flags & FLAG_HAS_PREFIX != 0 {
			write_bytes(&mut buf, &self.key_prefix)?;
		}
		let compact_len = match &self.keys {
			keys::KeyStore::Compact {
				max_key_len,
				..
			} => *max_key_len as u8,
			keys::KeyStore::Default {
				..
			} => 0,
		};
		buf.push(compact_len);
		buf.write_varint(slots.len() as u64)?;
		buf.write_varint(self.capacity() as u64)?;
		if self.is_bin() {
			buf.write_varint(self.last_full_lsn.to_persisted())?;
			buf.write_varint(self.last_delta_lsn().to_persisted())?;
		}
		if exp_base != 0 {
			buf.write_varint(exp_base)?;
		}
		if time_base != 0 {
			buf.write_varint(time_base)?;
		}

		for (n, &i) in slots.iter().enumerate() {
			write_bytes(&mut buf, self.keys.get(i).unwrap_or_default())?;
			buf.write_varint(self.lsns[i].to_persisted())?;
			buf.push(self.states[i].persisted());
			if flags & FLAG_HAS_LAST_SIZE != 0 {
				buf.write_varint(self.sizes[i])?;
			}
			if flags & FLAG_HAS_VLSN != 0 {
				buf.write_varint(vlsns[n])?;
			}
			if exp_base != 0 {
				buf.write_varint(offset(expirations[n], exp_base))?;
			}
			if time_base != 0 {
				buf.write_varint(offset(mod_times[n], time_base))?;
				buf.write_varint(offset(create_times[n], time_base))?;
			}
		}

		if delta {
			let shape = self.delta_shape().unwrap_or(DeltaShape {
				full_n_entries: self.n_entries,
				full_max_entries: self.capacity(),
			});
			buf.write_varint(shape.full_n_entries as u64)?;
			buf.write_varint(shape.full_max_entries as u64)?;
			if let Some(bloom) = &bloom {
				write_bytes(&mut buf, bloom)?;
			}
		}
		Ok(buf)
	}

	/// The bloom filter to write with a delta: the one a delta node carries,
	/// or one over the clean slots of a full node.
	fn delta_bloom(&self) -> Option<Vec<u8>> {
		if !self.env.options.bin_delta_blind_ops {
			return None;
		}
		if let Some(bin) = self.bin_state() {
			if bin.delta.is_some() {
				return bin.bloom.clone();
			}
		}
		let mut builder = crate::bloom::BloomBuilder::new(self.env.options.bloom_bits_per_key);
		for i in (0..self.n_entries).filter(|&i| !self.is_dirty_slot(i)) {
			builder.add(&self.key(i));
		}
		Some(builder.finish())
	}

	/// Rebuilds a node from a logged entry read at `lsn`.
	pub fn decode(env: &Arc<NodeEnv>, lsn: Lsn, kind: EntryKind, payload: &[u8]) -> Result<Node> {
		let mut reader = Reader::new(payload);
		let version = reader.byte()?;
		if version == 0 || version > FORMAT_VERSION {
			return Err(Error::Deserialization(format!("unsupported node format version {version}")));
		}
		let id = reader.varint::<u64>()?;
		let level = Level::from_raw(reader.varint::<u32>()?);
		if level.is_bin() != matches!(kind, EntryKind::Bin | EntryKind::BinDelta) {
			return Err(Error::UnexpectedEntry(lsn));
		}
		let flags = reader.byte()?;
		let identifier_key = read_bytes(&mut reader)?.to_vec();
		let prefix = if flags & FLAG_HAS_PREFIX != 0 {
			read_bytes(&mut reader)?.to_vec()
		} else {
			Vec::new()
		};
		let compact_len = reader.byte()? as usize;
		let n = reader.varint::<u64>()? as usize;
		let capacity = reader.varint::<u64>()? as usize;
		if n > capacity {
			return Err(Error::Deserialization(format!("{n} entries in a node of capacity {capacity}")));
		}
		let (last_full, last_delta) = if level.is_bin() {
			(
				Lsn::from_persisted(reader.varint::<u64>()?),
				Lsn::from_persisted(reader.varint::<u64>()?),
			)
		} else {
			(NULL_LSN, NULL_LSN)
		};
		let exp_base = if flags & FLAG_HAS_EXPIRATION != 0 {
			reader.varint::<u64>()?
		} else {
			0
		};
		let time_base = if flags & FLAG_HAS_TIMES != 0 {
			reader.varint::<u64>()?
		} else {
			0
		};

		env.note_node_id(id);
		let mut node = Node::with_id(env.clone(), id, level, identifier_key, capacity);
		node.key_prefix = prefix;
		node.is_root = flags & FLAG_ROOT != 0;
		let delta = kind == EntryKind::BinDelta;

		for _ in 0..n {
			let stored = read_bytes(&mut reader)?;
			let slot_lsn = Lsn::from_persisted(reader.varint::<u64>()?);
			let mut state = SlotState::from_bits(reader.byte()?);
			let (suffix, data) = keys::split(stored, state.contains(SlotState::EMBEDDED));
			let mut key = node.key_prefix.clone();
			key.extend_from_slice(suffix);

			let mut entry = SlotEntry::new(key, slot_lsn);
			if let Some(data) = data {
				entry.data = Some(data.to_vec());
			}
			if flags & FLAG_HAS_LAST_SIZE != 0 {
				entry.size = reader.varint::<u32>()?;
			}
			if flags & FLAG_HAS_VLSN != 0 {
				entry.vlsn = reader.varint::<u64>()?;
			}
			if exp_base != 0 {
				entry.expiration = Expiration {
					value: from_offset(reader.varint::<u64>()?, exp_base),
					in_hours: flags & FLAG_EXP_IN_HOURS != 0,
				};
			}
			if time_base != 0 {
				entry.modification_time = from_offset(reader.varint::<u64>()?, time_base);
				entry.creation_time = from_offset(reader.varint::<u64>()?, time_base);
			}
			if delta {
				state.insert(SlotState::DIRTY);
			}
			entry.state = state;
			node.append_entry(entry)?;
		}
		if flags & FLAG_EXP_IN_HOURS != 0 {
			node.expiration_in_hours = true;
		}

		if let Some(bin) = node.bin_state_mut() {
			if delta {
				let full_n_entries = reader.varint::<u64>()? as usize;
				let full_max_entries = reader.varint::<u64>()? as usize;
				bin.delta = Some(DeltaShape {
					full_n_entries,
					full_max_entries,
				});
				if flags & FLAG_HAS_BLOOM != 0 {
					bin.bloom = Some(read_bytes(&mut reader)?.to_vec());
				}
				bin.last_delta_lsn = lsn;
			} else {
				bin.last_delta_lsn = NULL_LSN;
			}
		}
		node.last_full_lsn = if delta {
			last_full
		} else {
			lsn
		};
		if compact_len > 0 {
			node.keys.compact(compact_len);
		}
		node.update_memory_size();
		debug!(
			"decoded node {id} from {lsn}: {n} slots, delta {delta}, last delta {last_delta}, {} trailing bytes",
			reader.buf.len()
		);
		Ok(node)
	}

	/// Reads a node from the log.
	pub fn fetch(env: &Arc<NodeEnv>, lsn: Lsn) -> Result<Node> {
		if lsn.is_null() {
			return Err(Error::LogEntryNotFound(lsn));
		}
		let entry = env.log.read(lsn)?;
		if !entry.kind.is_node() {
			return Err(Error::UnexpectedEntry(lsn));
		}
		Node::decode(env, lsn, entry.kind, &entry.payload)
	}

	/// Writes the node to the log.
	///
	/// A BIN is written as a delta when `allow_delta` is set and a delta is
	/// worthwhile, and always when it already is a delta. A delta keeps the
	/// dirty bits of its slots so that the next delta holds them again. A
	/// full write clears them.
	pub fn log(&mut self, provisional: bool, allow_delta: bool) -> Result<LogPosition> {
		let delta = self.is_delta() || (allow_delta && self.should_log_delta());
		if !delta {
			self.refresh_slot_keys();
		}
		let payload = self.encode(delta)?;
		let kind = if delta {
			EntryKind::BinDelta
		} else if self.is_bin() {
			EntryKind::Bin
		} else {
			EntryKind::In
		};
		let pos = self.env.log.append(&LogItem {
			kind,
			provisional,
			payload: &payload,
		})?;

		if delta {
			if let Some(bin) = self.bin_state_mut() {
				bin.last_delta_lsn = pos.lsn;
			}
		} else {
			for state in self.states.iter_mut().take(self.n_entries) {
				state.remove(SlotState::TRANSIENT);
			}
			if let Some(bin) = self.bin_state_mut() {
				bin.last_delta_lsn = NULL_LSN;
				bin.prohibit_next_delta = false;
			}
			self.last_full_lsn = pos.lsn;
		}
		self.dirty = false;
		if !provisional {
			self.set_provisional_children(false);
		}
		debug!(
			"logged node {} as {kind:?} at {} ({} bytes, provisional {provisional})",
			self.id, pos.lsn, pos.size
		);
		Ok(pos)
	}

	/// Raises the keys of IN slots flagged for refresh to the identifier key
	/// of their resident BIN child. A key is only raised while it stays below
	/// the next slot and at or below every key of the child.
	fn refresh_slot_keys(&mut self) {
		if self.is_bin() {
			return;
		}
		let cmp = self.env.comparator.clone();
		for i in 1..self.n_entries {
			if !self.states[i].contains(SlotState::UPDATE_KEY_ON_LOG) {
				continue;
			}
			self.states[i].remove(SlotState::UPDATE_KEY_ON_LOG);
			let Some(child) = self.child(i) else {
				continue;
			};
			if !child.is_bin() {
				continue;
			}
			let Some(guard) = child.try_latch_exclusive() else {
				continue;
			};
			if guard.n_entries() == 0 || guard.is_delta() {
				continue;
			}
			let candidate = guard.identifier_key().to_vec();
			let lowest = guard.key(0);
			drop(guard);
			let current = self.key(i);
			let raises = cmp.compare(&candidate, &current).is_gt()
				&& cmp.compare(&candidate, &lowest).is_le()
				&& (i + 1 == self.n_entries || cmp.compare(&candidate, &self.key(i + 1)).is_lt());
			if raises {
				self.set_key(i, &candidate);
			}
		}
	}
}
