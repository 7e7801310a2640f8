//! Leaf records.
//!
//! An [`Ln`] is the payload a BIN slot refers to. While it is resident the
//! record also caches its version sequence number and timestamps; the
//! authoritative copies live in its log entry.

use bytes::Bytes;
use integer_encoding::{VarInt, VarIntWriter};

use crate::env::{EntryKind, LogItem, LogPosition, NodeEnv};
use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::memory::{byte_array_size, LN_OVERHEAD, OBJECT_OVERHEAD};

const PAYLOAD_DATA: u8 = 0;
const PAYLOAD_DELETED: u8 = 1;
const PAYLOAD_DATABASE: u8 = 2;
const PAYLOAD_FILE_SUMMARY: u8 = 3;

/// A catalog record describing one database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseRecord {
	pub id: u64,
	pub name: String,
	/// An open database keeps its catalog record resident.
	pub open: bool,
}

/// Obsolete-space tracking for one log file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileSummary {
	pub file_number: u32,
	pub total_count: u64,
	pub total_size: u64,
	pub obsolete_count: u64,
	pub obsolete_size: u64,
}

impl FileSummary {
	pub fn new(file_number: u32) -> Self {
		Self {
			file_number,
			..Default::default()
		}
	}

	pub fn add_written(&mut self, size: u64) {
		self.total_count += 1;
		self.total_size += size;
	}

	pub fn add_obsolete(&mut self, size: u64) {
		self.obsolete_count += 1;
		self.obsolete_size += size;
	}

	/// Percentage of the file that is still live.
	pub fn utilization(&self) -> u64 {
		if self.total_size == 0 {
			return 100;
		}
		let live = self.total_size.saturating_sub(self.obsolete_size);
		live * 100 / self.total_size
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LnPayload {
	/// User data. `None` marks a deleted record.
	Data(Option<Bytes>),
	Database(DatabaseRecord),
	FileSummary(FileSummary),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ln {
	pub payload: LnPayload,
	pub vlsn: u64,
	pub modification_time: u64,
	pub creation_time: u64,
	pub(crate) dirty: bool,
}

impl Ln {
	pub fn new(payload: LnPayload) -> Self {
		Self {
			payload,
			vlsn: 0,
			modification_time: 0,
			creation_time: 0,
			dirty: true,
		}
	}

	pub fn data(data: impl Into<Bytes>) -> Self {
		Self::new(LnPayload::Data(Some(data.into())))
	}

	pub fn deleted() -> Self {
		Self::new(LnPayload::Data(None))
	}

	pub fn is_deleted(&self) -> bool {
		matches!(self.payload, LnPayload::Data(None))
	}

	pub fn is_dirty(&self) -> bool {
		self.dirty
	}

	/// The user data, if this is a live data record.
	pub fn bytes(&self) -> Option<&Bytes> {
		match &self.payload {
			LnPayload::Data(data) => data.as_ref(),
			_ => None,
		}
	}

	/// A catalog record of an open database must stay resident.
	pub fn is_evictable(&self) -> bool {
		!matches!(&self.payload, LnPayload::Database(db) if db.open)
	}

	pub fn memory_size(&self) -> usize {
		LN_OVERHEAD
			+ match &self.payload {
				LnPayload::Data(Some(data)) => byte_array_size(data.len()),
				LnPayload::Data(None) => 0,
				LnPayload::Database(db) => OBJECT_OVERHEAD + byte_array_size(db.name.len()),
				LnPayload::FileSummary(_) => OBJECT_OVERHEAD + 40,
			}
	}

	pub fn encode(&self) -> Result<Vec<u8>> {
		let mut buf = Vec::with_capacity(32);
		let kind = match &self.payload {
			LnPayload::Data(Some(_)) => PAYLOAD_DATA,
			LnPayload::Data(None) => PAYLOAD_DELETED,
			LnPayload::Database(_) => PAYLOAD_DATABASE,
			LnPayload::FileSummary(_) => PAYLOAD_FILE_SUMMARY,
		};
		buf.push(kind);
		buf.write_varint(self.vlsn)?;
		buf.write_varint(self.modification_time)?;
		buf.write_varint(self.creation_time)?;
		match &self.payload {
			LnPayload::Data(Some(data)) => {
				buf.write_varint(data.len() as u64)?;
				buf.extend_from_slice(data);
			}
			LnPayload::Data(None) => {}
			LnPayload::Database(db) => {
				buf.write_varint(db.id)?;
				buf.write_varint(db.name.len() as u64)?;
				buf.extend_from_slice(db.name.as_bytes());
			}
			LnPayload::FileSummary(fs) => {
				buf.write_varint(fs.file_number)?;
				buf.write_varint(fs.total_count)?;
				buf.write_varint(fs.total_size)?;
				buf.write_varint(fs.obsolete_count)?;
				buf.write_varint(fs.obsolete_size)?;
			}
		}
		Ok(buf)
	}

	pub fn decode(buf: &[u8]) -> Result<Self> {
		let mut reader = Reader::new(buf);
		let kind = reader.byte()?;
		let vlsn = reader.varint::<u64>()?;
		let modification_time = reader.varint::<u64>()?;
		let creation_time = reader.varint::<u64>()?;
		let payload = match kind {
			PAYLOAD_DATA => {
				let len = reader.varint::<u64>()? as usize;
				LnPayload::Data(Some(Bytes::copy_from_slice(reader.bytes(len)?)))
			}
			PAYLOAD_DELETED => LnPayload::Data(None),
			PAYLOAD_DATABASE => {
				let id = reader.varint::<u64>()?;
				let len = reader.varint::<u64>()? as usize;
				let name = String::from_utf8(reader.bytes(len)?.to_vec())
					.map_err(|e| Error::Deserialization(format!("database name: {e}")))?;
				LnPayload::Database(DatabaseRecord {
					id,
					name,
					open: false,
				})
			}
			PAYLOAD_FILE_SUMMARY => LnPayload::FileSummary(FileSummary {
				file_number: reader.varint::<u32>()?,
				total_count: reader.varint::<u64>()?,
				total_size: reader.varint::<u64>()?,
				obsolete_count: reader.varint::<u64>()?,
				obsolete_size: reader.varint::<u64>()?,
			}),
			other => {
				return Err(Error::Deserialization(format!("unknown record payload type {other}")))
			}
		};
		Ok(Self {
			payload,
			vlsn,
			modification_time,
			creation_time,
			dirty: false,
		})
	}

	/// Writes the record to the log and marks it clean.
	pub fn log(&mut self, env: &NodeEnv) -> Result<LogPosition> {
		let kind = if self.is_deleted() {
			EntryKind::DeletedLn
		} else {
			EntryKind::Ln
		};
		let payload = self.encode()?;
		let pos = env.log.append(&LogItem {
			kind,
			provisional: false,
			payload: &payload,
		})?;
		self.dirty = false;
		Ok(pos)
	}

	/// Reads a record back from the log.
	pub fn fetch(env: &NodeEnv, lsn: Lsn) -> Result<Self> {
		if lsn.is_null() {
			return Err(Error::LogEntryNotFound(lsn));
		}
		let entry = env.log.read(lsn)?;
		match entry.kind {
			EntryKind::Ln | EntryKind::DeletedLn => Self::decode(&entry.payload),
			_ => Err(Error::UnexpectedEntry(lsn)),
		}
	}
}

/// Cursor over a byte slice for the log formats.
pub(crate) struct Reader<'a> {
	pub(crate) buf: &'a [u8],
}

impl<'a> Reader<'a> {
	pub(crate) fn new(buf: &'a [u8]) -> Self {
		Self {
			buf,
		}
	}

	pub(crate) fn byte(&mut self) -> Result<u8> {
		let (&b, rest) =
			self.buf.split_first().ok_or_else(|| Error::Deserialization("unexpected end".into()))?;
		self.buf = rest;
		Ok(b)
	}

	pub(crate) fn varint<V: VarInt>(&mut self) -> Result<V> {
		let (v, n) = V::decode_var(self.buf)
			.ok_or_else(|| Error::Deserialization("invalid varint".into()))?;
		self.buf = &self.buf[n..];
		Ok(v)
	}

	pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
		if self.buf.len() < len {
			return Err(Error::Deserialization(format!(
				"need {len} bytes, {} left",
				self.buf.len()
			)));
		}
		let (head, rest) = self.buf.split_at(len);
		self.buf = rest;
		Ok(head)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use test_log::test;

	use super::*;
	use crate::env::MemoryLog;
	use crate::options::Options;

	#[test]
	fn encode_decode_payloads() {
		let mut data = Ln::data(&b"hello"[..]);
		data.vlsn = 17;
		data.modification_time = 1_700_000_000_000;
		data.creation_time = 1_600_000_000_000;

		let records = vec![
			data,
			Ln::deleted(),
			Ln::new(LnPayload::Database(DatabaseRecord {
				id: 4,
				name: "users".into(),
				open: false,
			})),
			Ln::new(LnPayload::FileSummary(FileSummary {
				file_number: 3,
				total_count: 10,
				total_size: 1000,
				obsolete_count: 2,
				obsolete_size: 300,
			})),
		];
		for ln in records {
			let mut decoded = Ln::decode(&ln.encode().unwrap()).unwrap();
			decoded.dirty = ln.dirty;
			assert_eq!(decoded, ln);
		}
	}

	#[test]
	fn decode_rejects_garbage() {
		assert!(Ln::decode(&[]).is_err());
		assert!(Ln::decode(&[9, 0, 0, 0]).is_err());
		assert!(Ln::decode(&[PAYLOAD_DATA, 0, 0, 0, 10, 1]).is_err());
	}

	#[test]
	fn open_database_is_pinned() {
		let mut ln = Ln::new(LnPayload::Database(DatabaseRecord {
			id: 1,
			name: "db".into(),
			open: true,
		}));
		assert!(!ln.is_evictable());
		if let LnPayload::Database(db) = &mut ln.payload {
			db.open = false;
		}
		assert!(ln.is_evictable());
		assert!(Ln::data(&b"x"[..]).is_evictable());
	}

	#[test]
	fn file_summary_utilization() {
		let mut fs = FileSummary::new(7);
		assert_eq!(fs.utilization(), 100);
		fs.add_written(600);
		fs.add_written(400);
		fs.add_obsolete(400);
		assert_eq!(fs.utilization(), 60);
		assert_eq!(fs.obsolete_count, 1);
	}

	#[test]
	fn log_and_fetch() {
		let log = Arc::new(MemoryLog::new());
		let env = NodeEnv::builder(Options::default(), log.clone()).build().unwrap();

		let mut ln = Ln::data(&b"value"[..]);
		assert!(ln.is_dirty());
		let pos = ln.log(&env).unwrap();
		assert!(!ln.is_dirty());
		assert_eq!(log.count(EntryKind::Ln), 1);

		let fetched = Ln::fetch(&env, pos.lsn).unwrap();
		assert_eq!(fetched.bytes().map(|b| &b[..]), Some(&b"value"[..]));

		let mut tomb = Ln::deleted();
		tomb.log(&env).unwrap();
		assert_eq!(log.count(EntryKind::DeletedLn), 1);
	}
}
