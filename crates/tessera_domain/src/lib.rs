#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod bucket;
pub mod game;
pub mod moderation;
pub mod user;

pub use bucket::{BucketPolicy, InsufficientCredits, UserBucket};
pub use game::{Board, Series};
pub use moderation::{Fault, Love, Report, UserBan};
pub use user::{Profile, User};

/// Errors for parsing identifiers and topics from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid number: {0}")]
	InvalidNumber(String),
	#[error("out of range: {0}")]
	OutOfRange(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

macro_rules! numeric_id {
	($(#[$meta:meta])* $name:ident, $repr:ty) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub $repr);

		impl $name {
			pub const fn get(self) -> $repr {
				self.0
			}

			/// Parse a lowercase or uppercase hex string (cursor form used in query strings).
			pub fn parse_hex(s: &str) -> Result<Self, ParseIdError> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				<$repr>::from_str_radix(s, 16)
					.map(Self)
					.map_err(|e| ParseIdError::InvalidNumber(format!("{s}: {e}")))
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				s.parse::<$repr>()
					.map(Self)
					.map_err(|e| ParseIdError::InvalidNumber(format!("{s}: {e}")))
			}
		}

		impl From<$repr> for $name {
			fn from(v: $repr) -> Self {
				Self(v)
			}
		}
	};
}

numeric_id!(
	/// Board identifier, unique across all series.
	BoardId,
	u16
);
numeric_id!(
	/// Board-local tile index (at most 256 tiles per board).
	TileId,
	u8
);
numeric_id!(
	/// Dense user id assigned on first sight. Frames carry 24 bits of it.
	UserId,
	u32
);
numeric_id!(SeriesId, u16);

impl UserId {
	/// Largest id a frame header can carry.
	pub const MAX_FRAME: u32 = (1 << 24) - 1;
}

/// Broadcast scope a connection subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
	Global,
	Board(BoardId),
	User(UserId),
	Moderation,
}

impl Topic {
	pub const GLOBAL: &'static str = "global";
	pub const MODERATION: &'static str = "mod";
	pub const BOARD_PREFIX: &'static str = "board-";
	pub const USER_PREFIX: &'static str = "user-";
}

impl fmt::Display for Topic {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Topic::Global => f.write_str(Self::GLOBAL),
			Topic::Moderation => f.write_str(Self::MODERATION),
			Topic::Board(id) => write!(f, "{}{id}", Self::BOARD_PREFIX),
			Topic::User(id) => write!(f, "{}{id}", Self::USER_PREFIX),
		}
	}
}

impl FromStr for Topic {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if s == Self::GLOBAL {
			return Ok(Topic::Global);
		}
		if s == Self::MODERATION {
			return Ok(Topic::Moderation);
		}
		if let Some(rest) = s.strip_prefix(Self::BOARD_PREFIX) {
			return rest.parse().map(Topic::Board);
		}
		if let Some(rest) = s.strip_prefix(Self::USER_PREFIX) {
			return rest.parse().map(Topic::User);
		}
		Err(ParseIdError::InvalidFormat(format!("unknown topic: {s}")))
	}
}
