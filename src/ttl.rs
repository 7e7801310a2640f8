//! Record expiration times.
//!
//! An expiration is a count of hours or days since the Unix epoch, 0 meaning
//! "never". A node stores all of its expirations in one unit and switches to
//! hours the first time an hour-granular value arrives.

use std::time::{SystemTime, UNIX_EPOCH};

pub const MILLIS_PER_HOUR: u64 = 60 * 60 * 1000;
pub const MILLIS_PER_DAY: u64 = 24 * MILLIS_PER_HOUR;

/// Current wall clock time in milliseconds.
pub fn now_millis() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// An expiration time together with its unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct Expiration {
	pub value: u64,
	pub in_hours: bool,
}

impl Expiration {
	pub const NONE: Expiration = Expiration {
		value: 0,
		in_hours: false,
	};

	pub fn hours(value: u64) -> Self {
		Self {
			value,
			in_hours: true,
		}
	}

	pub fn days(value: u64) -> Self {
		Self {
			value,
			in_hours: false,
		}
	}

	/// Expiration `ttl_millis` from `now`, rounded up to whole hours.
	pub fn after(now: u64, ttl_millis: u64) -> Self {
		Self::hours((now + ttl_millis).div_ceil(MILLIS_PER_HOUR))
	}

	pub fn is_none(&self) -> bool {
		self.value == 0
	}

	/// Value expressed in hours.
	pub fn as_hours(&self) -> u64 {
		if self.in_hours {
			self.value
		} else {
			self.value * 24
		}
	}

	pub fn as_millis(&self) -> u64 {
		if self.in_hours {
			self.value * MILLIS_PER_HOUR
		} else {
			self.value * MILLIS_PER_DAY
		}
	}

	pub fn is_expired(&self, now: u64) -> bool {
		!self.is_none() && now >= self.as_millis()
	}
}
