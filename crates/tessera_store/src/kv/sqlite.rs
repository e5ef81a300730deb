#![forbid(unsafe_code)]

use std::path::Path;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};

use super::{Entry, Version, VersionedStore, prefix_end};
use crate::error::StoreError;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (\
	key BLOB PRIMARY KEY NOT NULL, \
	version TEXT NOT NULL, \
	value BLOB NOT NULL\
) WITHOUT ROWID";

/// One SQLite file in WAL mode holding a single `kv` table.
#[derive(Clone)]
pub struct SqliteStore {
	pool: SqlitePool,
}

type Row = (Vec<u8>, String, Vec<u8>);

fn row_entry((key, version, value): Row) -> Entry {
	Entry {
		key,
		version: Version::from_stored(version),
		value,
	}
}

impl SqliteStore {
	pub async fn open(path: &Path) -> Result<Self, StoreError> {
		let unavailable = |e: sqlx::Error| StoreError::TemporaryUnavailable(format!("open {}: {e}", path.display()));

		let opts = SqliteConnectOptions::new()
			.filename(path)
			.create_if_missing(true)
			.journal_mode(SqliteJournalMode::Wal)
			.synchronous(SqliteSynchronous::Normal)
			.busy_timeout(Duration::from_secs(5));

		let pool = SqlitePoolOptions::new()
			.max_connections(4)
			.connect_with(opts)
			.await
			.map_err(unavailable)?;

		sqlx::query(SCHEMA).execute(&pool).await.map_err(unavailable)?;

		tracing::debug!(path = %path.display(), "opened sqlite store");
		Ok(Self { pool })
	}
}

#[async_trait::async_trait]
impl VersionedStore for SqliteStore {
	async fn get(&self, key: &[u8]) -> Result<(Version, Vec<u8>), StoreError> {
		let row: Option<(String, Vec<u8>)> = sqlx::query_as("SELECT version, value FROM kv WHERE key = ?")
			.bind(key)
			.fetch_optional(&self.pool)
			.await?;
		row.map(|(v, value)| (Version::from_stored(v), value))
			.ok_or(StoreError::NotFound)
	}

	async fn put(&self, key: &[u8], expected: Option<&Version>, value: &[u8]) -> Result<Version, StoreError> {
		let version = Version::of(value);
		match expected {
			None => {
				sqlx::query(
					"INSERT INTO kv (key, version, value) VALUES (?, ?, ?) \
					ON CONFLICT(key) DO UPDATE SET version = excluded.version, value = excluded.value",
				)
				.bind(key)
				.bind(version.as_str())
				.bind(value)
				.execute(&self.pool)
				.await?;
			}
			Some(expected) => {
				let res = sqlx::query("UPDATE kv SET version = ?, value = ? WHERE key = ? AND version = ?")
					.bind(version.as_str())
					.bind(value)
					.bind(key)
					.bind(expected.as_str())
					.execute(&self.pool)
					.await?;
				if res.rows_affected() == 0 {
					return Err(StoreError::VersionConflict);
				}
			}
		}
		Ok(version)
	}

	async fn delete(&self, key: &[u8], expected: Option<&Version>) -> Result<(), StoreError> {
		let Some(expected) = expected else {
			sqlx::query("DELETE FROM kv WHERE key = ?")
				.bind(key)
				.execute(&self.pool)
				.await?;
			return Ok(());
		};

		let res = sqlx::query("DELETE FROM kv WHERE key = ? AND version = ?")
			.bind(key)
			.bind(expected.as_str())
			.execute(&self.pool)
			.await?;
		if res.rows_affected() == 0 && self.has(key).await? {
			return Err(StoreError::VersionConflict);
		}
		Ok(())
	}

	async fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
		let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM kv WHERE key = ?")
			.bind(key)
			.fetch_optional(&self.pool)
			.await?;
		Ok(row.is_some())
	}

	async fn range_scan(&self, start: &[u8], limit: usize, reverse: bool) -> Result<Vec<Entry>, StoreError> {
		let sql = if reverse {
			"SELECT key, version, value FROM kv WHERE key >= ? ORDER BY key DESC LIMIT ?"
		} else {
			"SELECT key, version, value FROM kv WHERE key >= ? ORDER BY key ASC LIMIT ?"
		};
		// SQLite treats a negative LIMIT as unbounded.
		let limit = if limit == 0 { -1 } else { i64::try_from(limit).unwrap_or(i64::MAX) };
		let rows: Vec<Row> = sqlx::query_as(sql)
			.bind(start)
			.bind(limit)
			.fetch_all(&self.pool)
			.await?;
		Ok(rows.into_iter().map(row_entry).collect())
	}

	async fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<Entry>, StoreError> {
		let rows: Vec<Row> = match prefix_end(prefix) {
			Some(end) => {
				sqlx::query_as("SELECT key, version, value FROM kv WHERE key >= ? AND key < ? ORDER BY key ASC")
					.bind(prefix)
					.bind(end)
					.fetch_all(&self.pool)
					.await?
			}
			None => {
				sqlx::query_as("SELECT key, version, value FROM kv WHERE key >= ? ORDER BY key ASC")
					.bind(prefix)
					.fetch_all(&self.pool)
					.await?
			}
		};
		Ok(rows.into_iter().map(row_entry).collect())
	}
}
