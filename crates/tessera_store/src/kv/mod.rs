#![forbid(unsafe_code)]

//! Single-key optimistic concurrency over an ordered byte-keyed store.
//!
//! Every value carries a version: the first 16 hex digits of its SHA-256.
//! Writers pass the version they read; `None` writes unconditionally.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::error::StoreError;

mod factory;
mod memory;
mod sqlite;

pub use factory::{StoreBackend, StoreFactory};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub const VERSION_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version(String);

impl Version {
	pub fn of(value: &[u8]) -> Self {
		let mut hex = format!("{:x}", Sha256::digest(value));
		hex.truncate(VERSION_LEN);
		Self(hex)
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub(crate) fn from_stored(s: String) -> Self {
		Self(s)
	}
}

impl fmt::Display for Version {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
	pub key: Vec<u8>,
	pub version: Version,
	pub value: Vec<u8>,
}

#[async_trait::async_trait]
pub trait VersionedStore: Send + Sync {
	async fn get(&self, key: &[u8]) -> Result<(Version, Vec<u8>), StoreError>;

	/// Fails with `VersionConflict` if `expected` is set and differs from the
	/// stored version (or the key is absent).
	async fn put(&self, key: &[u8], expected: Option<&Version>, value: &[u8]) -> Result<Version, StoreError>;

	/// Deleting an absent key succeeds.
	async fn delete(&self, key: &[u8], expected: Option<&Version>) -> Result<(), StoreError>;

	async fn has(&self, key: &[u8]) -> Result<bool, StoreError>;

	/// Keys `>= start`, ascending, or descending from the largest when
	/// `reverse`. `limit == 0` is unbounded.
	async fn range_scan(&self, start: &[u8], limit: usize, reverse: bool) -> Result<Vec<Entry>, StoreError>;

	/// Keys beginning with `prefix`, ascending.
	async fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<Entry>, StoreError>;
}

/// Smallest key greater than every key starting with `prefix`.
pub(crate) fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
	let mut end = prefix.to_vec();
	while let Some(last) = end.pop() {
		if last < u8::MAX {
			end.push(last + 1);
			return Some(end);
		}
	}
	None
}
