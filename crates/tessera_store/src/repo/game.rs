#![forbid(unsafe_code)]

use std::sync::Arc;

use tessera_domain::{Board, BoardId, Series, SeriesId};

use super::{next_id, seed_counter};
use crate::error::{RepoError, StoreError};
use crate::kv::VersionedStore;

const VERSION_KEY: &[u8] = b"_v";
const SERIES_PREFIX: &str = "series-";

fn series_key(id: SeriesId) -> Vec<u8> {
	format!("{SERIES_PREFIX}{:04x}", id.get()).into_bytes()
}

/// Series and their boards.
pub struct GameRepo {
	db: Arc<dyn VersionedStore>,
}

impl GameRepo {
	pub async fn open(db: Arc<dyn VersionedStore>) -> Result<Self, RepoError> {
		seed_counter(db.as_ref()).await?;
		let repo = Self { db };
		repo.version().await?;
		Ok(repo)
	}

	/// Random content version, created on first use and rotated on every
	/// series write so clients can drop cached series data.
	pub async fn version(&self) -> Result<u64, RepoError> {
		match self.db.get(VERSION_KEY).await {
			Ok((_, raw)) if raw.len() == 8 => {
				let mut b = [0u8; 8];
				b.copy_from_slice(&raw);
				Ok(u64::from_be_bytes(b))
			}
			Ok(_) | Err(StoreError::NotFound) => self.rotate_version().await,
			Err(e) => Err(e.into()),
		}
	}

	async fn rotate_version(&self) -> Result<u64, RepoError> {
		let (v, _) = uuid::Uuid::new_v4().as_u64_pair();
		self.db.put(VERSION_KEY, None, &v.to_be_bytes()).await?;
		Ok(v)
	}

	pub async fn insert_series(&self, mut series: Series) -> Result<Series, RepoError> {
		let id = next_id(self.db.as_ref()).await?;
		series.id = SeriesId(u16::try_from(id).map_err(|_| RepoError::Corrupt("series id space exhausted".into()))?);
		self.db.put(&series_key(series.id), None, &serde_json::to_vec(&series)?).await?;
		self.rotate_version().await?;
		tracing::info!(series_id = series.id.get(), name = %series.name, "series created");
		Ok(series)
	}

	pub async fn update_series(&self, series: &Series) -> Result<(), RepoError> {
		self.db.put(&series_key(series.id), None, &serde_json::to_vec(series)?).await?;
		self.rotate_version().await?;
		Ok(())
	}

	pub async fn find_series(&self, id: SeriesId) -> Result<Series, RepoError> {
		let (_, raw) = self.db.get(&series_key(id)).await?;
		Ok(serde_json::from_slice(&raw)?)
	}

	pub async fn all_series(&self) -> Result<Vec<Series>, RepoError> {
		self.db
			.prefix_scan(SERIES_PREFIX.as_bytes())
			.await?
			.iter()
			.map(|e| serde_json::from_slice(&e.value).map_err(RepoError::from))
			.collect()
	}

	pub async fn active_series(&self, now: u64) -> Result<Vec<Series>, RepoError> {
		Ok(self.all_series().await?.into_iter().filter(|s| s.is_active(now)).collect())
	}

	/// A board is live only while its series is active.
	pub async fn find_active_board(&self, board: BoardId, now: u64) -> Result<(Series, Board), RepoError> {
		for series in self.active_series(now).await? {
			if let Some(b) = series.board(board).cloned() {
				return Ok((series, b));
			}
		}
		Err(RepoError::NotFound)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kv::MemoryStore;

	fn series(boards: &[u16], active: u64) -> Series {
		Series {
			id: SeriesId(0),
			name: "s".into(),
			author: "a".into(),
			palette: vec![],
			boards: boards
				.iter()
				.map(|id| Board {
					id: BoardId(*id),
					bg: 0,
					w: 16,
					h: 16,
					ts: 16,
					created: 0,
				})
				.collect(),
			created: 0,
			active,
			finished: 0,
		}
	}

	#[tokio::test]
	async fn version_is_stable_until_series_change() {
		let r = GameRepo::open(Arc::new(MemoryStore::new())).await.expect("open");
		let v1 = r.version().await.expect("v");
		assert_eq!(v1, r.version().await.expect("v"));
		r.insert_series(series(&[1], 10)).await.expect("insert");
		assert_ne!(v1, r.version().await.expect("v"));
	}

	#[tokio::test]
	async fn finds_boards_only_in_active_series() {
		let r = GameRepo::open(Arc::new(MemoryStore::new())).await.expect("open");
		let live = r.insert_series(series(&[1, 2], 10)).await.expect("insert");
		r.insert_series(series(&[3], 0)).await.expect("insert");
		assert_eq!(live.id, SeriesId(1));

		let (s, b) = r.find_active_board(BoardId(2), 100).await.expect("find");
		assert_eq!(s.id, SeriesId(1));
		assert_eq!(b.id, BoardId(2));
		assert_eq!(r.find_active_board(BoardId(3), 100).await, Err(RepoError::NotFound));
		assert_eq!(r.active_series(100).await.expect("active").len(), 1);
		assert_eq!(r.all_series().await.expect("all").len(), 2);

		let mut finished = r.find_series(SeriesId(1)).await.expect("find");
		finished.finished = 50;
		r.update_series(&finished).await.expect("update");
		assert!(r.find_active_board(BoardId(1), 100).await.is_err());
	}
}
