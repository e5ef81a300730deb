#![forbid(unsafe_code)]

//! Per-user, per-board token bucket.
//!
//! Levels are kept in quarter-credits. Replenishment is derived lazily from
//! elapsed time each time the bucket is touched; nothing ticks in the
//! background.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Quarter-credits per whole credit.
pub const QUARTERS: u32 = 4;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("insufficient credits: need {need} quarter-credits, have {have}")]
pub struct InsufficientCredits {
	pub need: u32,
	pub have: u32,
}

/// Size and refill rate handed to newly created buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketPolicy {
	pub size: u32,
	pub rate_secs: u32,
}

impl Default for BucketPolicy {
	fn default() -> Self {
		Self { size: 8, rate_secs: 15 }
	}
}

/// Serialized as `[size, rate, level, timestamp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u32, u32, u32, u64)", into = "(u32, u32, u32, u64)")]
pub struct UserBucket {
	/// Capacity in whole credits.
	pub size: u32,
	/// Seconds per quarter-credit.
	pub rate: u32,
	/// Current quarter-credits, `0..=size*4`.
	pub level: u32,
	/// Unix seconds of the last accounted tick.
	pub timestamp: u64,
}

impl From<(u32, u32, u32, u64)> for UserBucket {
	fn from((size, rate, level, timestamp): (u32, u32, u32, u64)) -> Self {
		let mut b = Self {
			size,
			rate,
			level,
			timestamp,
		};
		b.level = b.level.min(b.capacity());
		b
	}
}

impl From<UserBucket> for (u32, u32, u32, u64) {
	fn from(b: UserBucket) -> Self {
		(b.size, b.rate, b.level, b.timestamp)
	}
}

impl UserBucket {
	/// A full bucket.
	pub fn new(policy: BucketPolicy, now: u64) -> Self {
		Self {
			size: policy.size,
			rate: policy.rate_secs,
			level: policy.size.saturating_mul(QUARTERS),
			timestamp: now,
		}
	}

	pub fn capacity(&self) -> u32 {
		self.size.saturating_mul(QUARTERS)
	}

	/// Apply elapsed whole ticks. The timestamp moves by exactly the ticks
	/// applied so fractional progress carries into the next call.
	pub fn adjust_level(&mut self, now: u64) {
		if self.rate == 0 {
			self.level = self.capacity();
			self.timestamp = now;
			return;
		}
		if now <= self.timestamp {
			return;
		}
		let rate = u64::from(self.rate);
		let ticks = (now - self.timestamp) / rate;
		if ticks == 0 {
			return;
		}
		let refill = u32::try_from(ticks).unwrap_or(u32::MAX);
		self.level = self.level.saturating_add(refill).min(self.capacity());
		self.timestamp += ticks * rate;
	}

	/// Take `n` whole credits, or fail leaving the level untouched.
	pub fn consume(&mut self, n: u32, now: u64) -> Result<(), InsufficientCredits> {
		self.adjust_level(now);
		let need = n.saturating_mul(QUARTERS);
		if self.level < need {
			return Err(InsufficientCredits {
				need,
				have: self.level,
			});
		}
		self.level -= need;
		Ok(())
	}

	/// Return `n` whole credits, capped at capacity.
	pub fn credit(&mut self, n: u32, now: u64) {
		self.adjust_level(now);
		self.level = self.level.saturating_add(n.saturating_mul(QUARTERS)).min(self.capacity());
	}
}
