use crate::error::{Error, Result};

/// Largest key suffix the compact key store can hold in one slot. One byte
/// per slot records the length and the value 0 is reserved for "no key".
pub const MAX_COMPACT_KEY_LENGTH: usize = 254;

/// Largest node capacity for which the compact key store may be chosen.
pub const MAX_COMPACT_SLOTS: usize = 256;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Options {
	// Required options.
	pub database_id: u64, // Identifies the database whose tree the nodes belong to.
	pub catalog: bool,    // True for the catalog (database-of-databases) tree.

	// Usually modified options.
	pub max_entries: usize,       // Configured node capacity (slots per IN/BIN).
	pub bin_delta_percent: usize, // Max dirty-slot percentage for logging a BIN-delta.
	pub key_prefixing: bool,      // Strip the longest common prefix from stored keys.

	// Fine tuning options.
	pub compact_max_key_length: usize, // Stride of the compact key store, 0 disables it.
	pub max_embedded_ln: usize,        // Data up to this size is stored with the key, 0 disables.
	pub bin_delta_blind_ops: bool,     // Allow inserts into a BIN-delta guarded by a bloom filter.
	pub bloom_bits_per_key: usize,     // Bloom filter density for BIN-delta blind operations.
	pub cache_vlsn: bool,              // Keep record version numbers after their LN is evicted.
	pub budget_flush_threshold: i64,   // Batched memory deltas flushed past this many bytes.
}

impl Default for Options {
	/// Creates a new set of options with default values.
	fn default() -> Self {
		Self {
			database_id: 1,
			catalog: false,
			max_entries: 128,
			bin_delta_percent: 25,
			key_prefixing: true,
			compact_max_key_length: 16,
			max_embedded_ln: 16,
			bin_delta_blind_ops: true,
			bloom_bits_per_key: 10,
			cache_vlsn: true,
			budget_flush_threshold: 64 * 1024,
		}
	}
}

impl Options {
	/// Creates a new set of options with default values.
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_database_id(mut self, database_id: u64) -> Self {
		self.database_id = database_id;
		self
	}

	pub fn with_catalog(mut self, catalog: bool) -> Self {
		self.catalog = catalog;
		self
	}

	pub fn with_max_entries(mut self, max_entries: usize) -> Self {
		self.max_entries = max_entries;
		self
	}

	pub fn with_bin_delta_percent(mut self, percent: usize) -> Self {
		self.bin_delta_percent = percent;
		self
	}

	pub fn with_key_prefixing(mut self, key_prefixing: bool) -> Self {
		self.key_prefixing = key_prefixing;
		self
	}

	pub fn with_compact_max_key_length(mut self, len: usize) -> Self {
		self.compact_max_key_length = len;
		self
	}

	pub fn with_max_embedded_ln(mut self, len: usize) -> Self {
		self.max_embedded_ln = len;
		self
	}

	pub fn with_bin_delta_blind_ops(mut self, enabled: bool) -> Self {
		self.bin_delta_blind_ops = enabled;
		self
	}

	pub fn with_bloom_bits_per_key(mut self, bits: usize) -> Self {
		self.bloom_bits_per_key = bits;
		self
	}

	pub fn with_cache_vlsn(mut self, enabled: bool) -> Self {
		self.cache_vlsn = enabled;
		self
	}

	pub fn with_budget_flush_threshold(mut self, bytes: i64) -> Self {
		self.budget_flush_threshold = bytes;
		self
	}

	/// Checks that the options describe a usable node layout.
	pub fn validate(&self) -> Result<()> {
		if self.max_entries < 4 {
			return Err(Error::InvalidArgument(format!(
				"max_entries must be at least 4, got {}",
				self.max_entries
			)));
		}
		if self.max_entries > u16::MAX as usize {
			return Err(Error::InvalidArgument(format!(
				"max_entries must be at most {}, got {}",
				u16::MAX,
				self.max_entries
			)));
		}
		if self.bin_delta_percent > 100 {
			return Err(Error::InvalidArgument(format!(
				"bin_delta_percent must be within 0..=100, got {}",
				self.bin_delta_percent
			)));
		}
		if self.compact_max_key_length > MAX_COMPACT_KEY_LENGTH {
			return Err(Error::InvalidArgument(format!(
				"compact_max_key_length must be at most {}, got {}",
				MAX_COMPACT_KEY_LENGTH, self.compact_max_key_length
			)));
		}
		if self.bin_delta_blind_ops && self.bloom_bits_per_key == 0 {
			return Err(Error::InvalidArgument(
				"bloom_bits_per_key must be positive when blind operations are enabled".into(),
			));
		}
		if self.budget_flush_threshold <= 0 {
			return Err(Error::InvalidArgument("budget_flush_threshold must be positive".into()));
		}
		Ok(())
	}
}
