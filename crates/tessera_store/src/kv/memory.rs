#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::ops::Bound;

use tokio::sync::Mutex;

use super::{Entry, Version, VersionedStore, prefix_end};
use crate::error::StoreError;

/// Ordered map behind a mutex. Used by tests and small deployments.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<BTreeMap<Vec<u8>, (Version, Vec<u8>)>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

fn entry((key, (version, value)): (&Vec<u8>, &(Version, Vec<u8>))) -> Entry {
	Entry {
		key: key.clone(),
		version: version.clone(),
		value: value.clone(),
	}
}

#[async_trait::async_trait]
impl VersionedStore for MemoryStore {
	async fn get(&self, key: &[u8]) -> Result<(Version, Vec<u8>), StoreError> {
		let guard = self.inner.lock().await;
		guard.get(key).cloned().ok_or(StoreError::NotFound)
	}

	async fn put(&self, key: &[u8], expected: Option<&Version>, value: &[u8]) -> Result<Version, StoreError> {
		let mut guard = self.inner.lock().await;
		if let Some(expected) = expected {
			match guard.get(key) {
				Some((current, _)) if current == expected => {}
				_ => return Err(StoreError::VersionConflict),
			}
		}
		let version = Version::of(value);
		guard.insert(key.to_vec(), (version.clone(), value.to_vec()));
		Ok(version)
	}

	async fn delete(&self, key: &[u8], expected: Option<&Version>) -> Result<(), StoreError> {
		let mut guard = self.inner.lock().await;
		match (guard.get(key), expected) {
			(None, _) => return Ok(()),
			(Some((current, _)), Some(expected)) if current != expected => {
				return Err(StoreError::VersionConflict);
			}
			_ => {}
		}
		guard.remove(key);
		Ok(())
	}

	async fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
		Ok(self.inner.lock().await.contains_key(key))
	}

	async fn range_scan(&self, start: &[u8], limit: usize, reverse: bool) -> Result<Vec<Entry>, StoreError> {
		let guard = self.inner.lock().await;
		let range = guard.range::<[u8], _>((Bound::Included(start), Bound::Unbounded));
		let limit = if limit == 0 { usize::MAX } else { limit };
		let out = if reverse {
			range.rev().take(limit).map(entry).collect()
		} else {
			range.take(limit).map(entry).collect()
		};
		Ok(out)
	}

	async fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<Entry>, StoreError> {
		let guard = self.inner.lock().await;
		let upper = prefix_end(prefix);
		let upper = match &upper {
			Some(end) => Bound::Excluded(end.as_slice()),
			None => Bound::Unbounded,
		};
		Ok(guard
			.range::<[u8], _>((Bound::Included(prefix), upper))
			.map(entry)
			.collect())
	}
}
