#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::{MemoryStore, SqliteStore, VersionedStore};
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
	Memory,
	/// One database file per namespace under `dir`.
	Sqlite { dir: PathBuf },
}

/// Hands out one store per namespace and keeps it open for the process lifetime.
pub struct StoreFactory {
	backend: StoreBackend,
	open: Mutex<HashMap<String, Arc<dyn VersionedStore>>>,
}

impl StoreFactory {
	pub fn new(backend: StoreBackend) -> Self {
		Self {
			backend,
			open: Mutex::new(HashMap::new()),
		}
	}

	pub fn memory() -> Self {
		Self::new(StoreBackend::Memory)
	}

	pub async fn open(&self, namespace: &str) -> Result<Arc<dyn VersionedStore>, StoreError> {
		let mut guard = self.open.lock().await;
		if let Some(db) = guard.get(namespace) {
			return Ok(db.clone());
		}

		let db: Arc<dyn VersionedStore> = match &self.backend {
			StoreBackend::Memory => Arc::new(MemoryStore::new()),
			StoreBackend::Sqlite { dir } => {
				tokio::fs::create_dir_all(dir)
					.await
					.map_err(|e| StoreError::TemporaryUnavailable(format!("create {}: {e}", dir.display())))?;
				Arc::new(SqliteStore::open(&dir.join(format!("{namespace}.db"))).await?)
			}
		};
		tracing::info!(namespace, "store opened");
		guard.insert(namespace.to_string(), db.clone());
		Ok(db)
	}
}
