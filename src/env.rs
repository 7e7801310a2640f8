//! External collaborators of the node layer and the environment that bundles
//! them.
//!
//! The log manager, the lock manager, the extinction filter and the global
//! memory budget are owned by the surrounding engine. The node layer only talks
//! to them through the traits below. Simple in-memory implementations are
//! provided for embedding and for tests.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use bytes::Bytes;
use crc32fast::Hasher;
use parking_lot::RwLock;

use crate::comparator::{BytewiseComparator, Comparator};
use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::memory::BudgetTracker;
use crate::options::Options;
use crate::ttl;

/// Type of a logged entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EntryKind {
	In = 1,
	Bin = 2,
	BinDelta = 3,
	Ln = 4,
	DeletedLn = 5,
}

impl EntryKind {
	pub fn from_u8(value: u8) -> Option<Self> {
		match value {
			1 => Some(EntryKind::In),
			2 => Some(EntryKind::Bin),
			3 => Some(EntryKind::BinDelta),
			4 => Some(EntryKind::Ln),
			5 => Some(EntryKind::DeletedLn),
			_ => None,
		}
	}

	pub fn is_node(self) -> bool {
		matches!(self, EntryKind::In | EntryKind::Bin | EntryKind::BinDelta)
	}
}

/// An entry handed to the log manager.
pub struct LogItem<'a> {
	pub kind: EntryKind,
	/// Provisional entries only count once an ancestor is logged
	/// non-provisionally.
	pub provisional: bool,
	pub payload: &'a [u8],
}

/// Where an appended entry landed and how many bytes it took.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LogPosition {
	pub lsn: Lsn,
	pub size: u32,
}

/// An entry read back from the log.
#[derive(Clone, Debug)]
pub struct LoggedEntry {
	pub kind: EntryKind,
	pub provisional: bool,
	pub payload: Bytes,
}

/// Appends serialized entries and reads them back by position.
pub trait LogManager: Send + Sync {
	fn append(&self, item: &LogItem<'_>) -> Result<LogPosition>;
	fn read(&self, lsn: Lsn) -> Result<LoggedEntry>;
}

/// Non-blocking probe into the lock manager.
pub trait LockProbe: Send + Sync {
	/// Returns true if some locker holds or waits for a lock on `lsn`.
	fn is_contended(&self, lsn: Lsn) -> bool;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExtinctionStatus {
	Extinct,
	MaybeExtinct,
	NotExtinct,
}

/// Reports key ranges that were administratively marked as removable.
pub trait ExtinctionFilter: Send + Sync {
	fn status(&self, database_id: u64, key: &[u8]) -> ExtinctionStatus;
}

/// Sink for cache memory usage changes.
pub trait MemoryBudget: Send + Sync {
	fn account_delta(&self, bytes: i64);
}

/// Capability object for behaviour that tests need to influence.
pub trait NodeHooks: Send + Sync {
	/// Whether inserting a new lowest key may move the identifier key.
	fn allow_identifier_key_update(&self) -> bool {
		true
	}

	/// Called while a parent latch is released to read a child from the log.
	fn fetch_window(&self, _parent_id: u64, _child_index: usize) {}

	/// Wall clock used for expiration checks.
	fn now_millis(&self) -> u64 {
		ttl::now_millis()
	}
}

/// Hooks that change nothing.
#[derive(Default)]
pub struct NoHooks;

impl NodeHooks for NoHooks {}

/// A lock probe for environments without a lock manager.
#[derive(Default)]
pub struct NoLocks;

impl LockProbe for NoLocks {
	fn is_contended(&self, _lsn: Lsn) -> bool {
		false
	}
}

/// An extinction filter that never reports anything extinct.
#[derive(Default)]
pub struct NoExtinction;

impl ExtinctionFilter for NoExtinction {
	fn status(&self, _database_id: u64, _key: &[u8]) -> ExtinctionStatus {
		ExtinctionStatus::NotExtinct
	}
}

/// A set of record positions that are currently locked.
#[derive(Default)]
pub struct LockTable {
	locked: RwLock<HashSet<Lsn>>,
}

impl LockTable {
	pub fn new() -> Self {
		Self {
			locked: RwLock::new(HashSet::new()),
		}
	}

	pub fn lock(&self, lsn: Lsn) {
		self.locked.write().insert(lsn);
	}

	pub fn unlock(&self, lsn: Lsn) {
		self.locked.write().remove(&lsn);
	}
}

impl LockProbe for LockTable {
	fn is_contended(&self, lsn: Lsn) -> bool {
		self.locked.read().contains(&lsn)
	}
}

/// Extinction by key prefix, per database.
#[derive(Default)]
pub struct ExtinctPrefixes {
	prefixes: RwLock<Vec<(u64, Vec<u8>)>>,
}

impl ExtinctPrefixes {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&self, database_id: u64, prefix: &[u8]) {
		self.prefixes.write().push((database_id, prefix.to_vec()));
	}
}

impl ExtinctionFilter for ExtinctPrefixes {
	fn status(&self, database_id: u64, key: &[u8]) -> ExtinctionStatus {
		let extinct = self
			.prefixes
			.read()
			.iter()
			.any(|(db, prefix)| *db == database_id && key.starts_with(prefix));
		if extinct {
			ExtinctionStatus::Extinct
		} else {
			ExtinctionStatus::NotExtinct
		}
	}
}

/// Memory budget that simply sums what it is told.
#[derive(Default)]
pub struct BudgetCounter {
	used: AtomicI64,
}

impl BudgetCounter {
	pub fn used(&self) -> i64 {
		self.used.load(Ordering::Relaxed)
	}
}

impl MemoryBudget for BudgetCounter {
	fn account_delta(&self, bytes: i64) {
		self.used.fetch_add(bytes, Ordering::Relaxed);
	}
}

/// Bytes of framing the in-memory log charges per entry:
/// kind(1) + provisional(1) + length(4) + checksum(4).
const ENTRY_HEADER_SIZE: u32 = 10;

/// Default size of one in-memory log "file" before the file number rolls.
const DEFAULT_FILE_SIZE: u32 = 10 * 1024 * 1024;

struct StoredEntry {
	kind: EntryKind,
	provisional: bool,
	payload: Bytes,
	checksum: u32,
}

struct LogState {
	entries: HashMap<Lsn, StoredEntry>,
	file_number: u32,
	file_offset: u32,
}

/// A log manager that keeps every entry in memory.
///
/// Entries are checksummed on append and verified on read so tests can
/// simulate lost or damaged log entries with [`MemoryLog::corrupt`] and
/// [`MemoryLog::remove`].
pub struct MemoryLog {
	state: RwLock<LogState>,
	file_size: u32,
}

impl Default for MemoryLog {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryLog {
	pub fn new() -> Self {
		Self::with_file_size(DEFAULT_FILE_SIZE)
	}

	pub fn with_file_size(file_size: u32) -> Self {
		Self {
			state: RwLock::new(LogState {
				entries: HashMap::new(),
				file_number: 0,
				file_offset: 0,
			}),
			file_size,
		}
	}

	fn checksum(kind: EntryKind, provisional: bool, payload: &[u8]) -> u32 {
		let mut hasher = Hasher::new();
		hasher.update(&[kind as u8, provisional as u8]);
		hasher.update(payload);
		hasher.finalize()
	}

	/// Number of entries in the log.
	pub fn len(&self) -> usize {
		self.state.read().entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Number of entries of the given kind.
	pub fn count(&self, kind: EntryKind) -> usize {
		self.state.read().entries.values().filter(|e| e.kind == kind).count()
	}

	/// Damages the payload of an entry while leaving its checksum intact.
	pub fn corrupt(&self, lsn: Lsn) -> bool {
		let mut state = self.state.write();
		match state.entries.get_mut(&lsn) {
			Some(entry) => {
				let mut damaged = entry.payload.to_vec();
				if damaged.is_empty() {
					damaged.push(0xff);
				} else {
					for b in damaged.iter_mut() {
						*b = !*b;
					}
				}
				entry.payload = Bytes::from(damaged);
				true
			}
			None => false,
		}
	}

	/// Drops an entry as if its log file had been deleted.
	pub fn remove(&self, lsn: Lsn) -> bool {
		self.state.write().entries.remove(&lsn).is_some()
	}
}

impl LogManager for MemoryLog {
	fn append(&self, item: &LogItem<'_>) -> Result<LogPosition> {
		let size = ENTRY_HEADER_SIZE
			+ u32::try_from(item.payload.len())
				.map_err(|_| Error::Serialization("log entry too large".into()))?;
		let mut state = self.state.write();
		if state.file_offset > 0 && state.file_offset.saturating_add(size) > self.file_size {
			state.file_number += 1;
			state.file_offset = 0;
		}
		let lsn = Lsn::new(state.file_number, state.file_offset);
		state.file_offset += size;
		state.entries.insert(
			lsn,
			StoredEntry {
				kind: item.kind,
				provisional: item.provisional,
				payload: Bytes::copy_from_slice(item.payload),
				checksum: Self::checksum(item.kind, item.provisional, item.payload),
			},
		);
		Ok(LogPosition {
			lsn,
			size,
		})
	}

	fn read(&self, lsn: Lsn) -> Result<LoggedEntry> {
		let state = self.state.read();
		let entry = state.entries.get(&lsn).ok_or(Error::LogEntryNotFound(lsn))?;
		if Self::checksum(entry.kind, entry.provisional, &entry.payload) != entry.checksum {
			return Err(Error::ChecksumMismatch(lsn));
		}
		Ok(LoggedEntry {
			kind: entry.kind,
			provisional: entry.provisional,
			payload: entry.payload.clone(),
		})
	}
}

/// Everything a node needs from the engine around it.
pub struct NodeEnv {
	pub(crate) options: Options,
	pub(crate) comparator: Arc<dyn Comparator>,
	pub(crate) log: Arc<dyn LogManager>,
	pub(crate) locks: Arc<dyn LockProbe>,
	pub(crate) extinction: Arc<dyn ExtinctionFilter>,
	pub(crate) budget: BudgetTracker,
	pub(crate) hooks: Arc<dyn NodeHooks>,
	next_node_id: AtomicU64,
	next_vlsn: AtomicU64,
}

impl NodeEnv {
	pub fn builder(options: Options, log: Arc<dyn LogManager>) -> NodeEnvBuilder {
		NodeEnvBuilder {
			options,
			log,
			comparator: Arc::new(BytewiseComparator::default()),
			locks: Arc::new(NoLocks),
			extinction: Arc::new(NoExtinction),
			budget: Arc::new(BudgetCounter::default()),
			hooks: Arc::new(NoHooks),
		}
	}

	pub fn options(&self) -> &Options {
		&self.options
	}

	pub fn comparator(&self) -> &dyn Comparator {
		self.comparator.as_ref()
	}

	pub fn log(&self) -> &dyn LogManager {
		self.log.as_ref()
	}

	pub fn budget(&self) -> &BudgetTracker {
		&self.budget
	}

	pub fn now_millis(&self) -> u64 {
		self.hooks.now_millis()
	}

	/// Allocates a node id. Ids are never reused within the process.
	pub fn next_node_id(&self) -> u64 {
		self.next_node_id.fetch_add(1, Ordering::Relaxed)
	}

	/// Makes sure ids handed out later are above an id read from the log.
	pub(crate) fn note_node_id(&self, id: u64) {
		self.next_node_id.fetch_max(id.saturating_add(1), Ordering::Relaxed);
	}

	pub fn next_vlsn(&self) -> u64 {
		self.next_vlsn.fetch_add(1, Ordering::Relaxed)
	}

	pub(crate) fn is_extinct(&self, key: &[u8]) -> bool {
		self.extinction.status(self.options.database_id, key) == ExtinctionStatus::Extinct
	}
}

pub struct NodeEnvBuilder {
	options: Options,
	log: Arc<dyn LogManager>,
	comparator: Arc<dyn Comparator>,
	locks: Arc<dyn LockProbe>,
	extinction: Arc<dyn ExtinctionFilter>,
	budget: Arc<dyn MemoryBudget>,
	hooks: Arc<dyn NodeHooks>,
}

impl NodeEnvBuilder {
	pub fn with_comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
		self.comparator = comparator;
		self
	}

	pub fn with_locks(mut self, locks: Arc<dyn LockProbe>) -> Self {
		self.locks = locks;
		self
	}

	pub fn with_extinction(mut self, extinction: Arc<dyn ExtinctionFilter>) -> Self {
		self.extinction = extinction;
		self
	}

	pub fn with_budget(mut self, budget: Arc<dyn MemoryBudget>) -> Self {
		self.budget = budget;
		self
	}

	pub fn with_hooks(mut self, hooks: Arc<dyn NodeHooks>) -> Self {
		self.hooks = hooks;
		self
	}

	pub fn build(self) -> Result<Arc<NodeEnv>> {
		self.options.validate()?;
		let threshold = self.options.budget_flush_threshold;
		Ok(Arc::new(NodeEnv {
			options: self.options,
			comparator: self.comparator,
			log: self.log,
			locks: self.locks,
			extinction: self.extinction,
			budget: BudgetTracker::new(self.budget, threshold),
			hooks: self.hooks,
			next_node_id: AtomicU64::new(1),
			next_vlsn: AtomicU64::new(1),
		}))
	}
}
