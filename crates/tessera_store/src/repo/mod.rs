#![forbid(unsafe_code)]

use std::sync::Arc;

use tessera_domain::BucketPolicy;

use crate::error::{RepoError, StoreError};
use crate::kv::{StoreFactory, VersionedStore};

pub mod board;
pub mod game;
pub mod history;
pub mod moderation;
pub mod tile_lock;
pub mod user;

pub use board::{BoardStore, StoredFrame};
pub use game::GameRepo;
pub use history::{FrameRef, TileHistoryRepo, UserFrameHistoryRepo};
pub use moderation::{FaultRepo, LoveRepo, ReportRepo, UserBanRepo};
pub use tile_lock::{TileLease, TileLockManager};
pub use user::UserRepo;

/// Attempts for a read-modify-CAS loop before `VersionConflict` surfaces.
pub const CAS_ATTEMPTS: usize = 8;

/// Key of the monotonic id counter in counted namespaces.
pub(crate) const COUNTER_KEY: &[u8] = b"_id";

#[derive(Debug, Clone, Copy)]
pub struct RepoSettings {
	pub lock_ttl_secs: u32,
	pub bucket: BucketPolicy,
	/// 60 stores minutes since the checkpoint, 1 stores seconds.
	pub timestamp_unit_secs: u32,
}

impl Default for RepoSettings {
	fn default() -> Self {
		Self {
			lock_ttl_secs: 600,
			bucket: BucketPolicy::default(),
			timestamp_unit_secs: 60,
		}
	}
}

pub struct Repos {
	pub boards: BoardStore,
	pub locks: TileLockManager,
	pub users: UserRepo,
	pub bans: UserBanRepo,
	pub reports: ReportRepo,
	pub loves: LoveRepo,
	pub faults: FaultRepo,
	pub tile_history: TileHistoryRepo,
	pub user_frames: UserFrameHistoryRepo,
	pub game: GameRepo,
}

impl Repos {
	pub async fn open(factory: Arc<StoreFactory>, settings: RepoSettings) -> Result<Self, RepoError> {
		Ok(Self {
			locks: TileLockManager::new(
				factory.open("tile_lock").await?,
				factory.open("tile_lock_user").await?,
				settings.lock_ttl_secs,
			),
			users: UserRepo::open(factory.open("user").await?, settings.bucket).await?,
			bans: UserBanRepo::open(factory.open("user_ban").await?).await?,
			reports: ReportRepo::new(factory.open("report").await?),
			loves: LoveRepo::new(factory.open("love").await?),
			faults: FaultRepo::new(factory.open("fault").await?),
			tile_history: TileHistoryRepo::new(factory.open("tile_history").await?),
			user_frames: UserFrameHistoryRepo::new(factory.open("user_frame_history").await?),
			game: GameRepo::open(factory.open("game").await?).await?,
			boards: BoardStore::new(factory, settings.timestamp_unit_secs),
		})
	}
}

/// Clamp unix seconds into the 32-bit fields used in keys and values.
pub(crate) fn secs32(secs: u64) -> u32 {
	u32::try_from(secs).unwrap_or(u32::MAX)
}

pub(crate) fn read_u16(b: &[u8]) -> u16 {
	u16::from_be_bytes([b[0], b[1]])
}

pub(crate) fn read_u32(b: &[u8]) -> u32 {
	u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// Create the counter at zero if this namespace has never been written.
pub(crate) async fn seed_counter(db: &dyn VersionedStore) -> Result<(), RepoError> {
	if !db.has(COUNTER_KEY).await? {
		db.put(COUNTER_KEY, None, &0u32.to_be_bytes()).await?;
	}
	Ok(())
}

/// Increment the counter under CAS, rereading on conflict.
pub(crate) async fn next_id(db: &dyn VersionedStore) -> Result<u32, RepoError> {
	for _ in 0..CAS_ATTEMPTS {
		let (version, raw) = db.get(COUNTER_KEY).await?;
		if raw.len() != 4 {
			return Err(RepoError::Corrupt(format!("counter has {} bytes", raw.len())));
		}
		let next = read_u32(&raw)
			.checked_add(1)
			.ok_or_else(|| RepoError::Corrupt("counter overflow".into()))?;
		match db.put(COUNTER_KEY, Some(&version), &next.to_be_bytes()).await {
			Ok(_) => return Ok(next),
			Err(StoreError::VersionConflict) => {
				tracing::debug!(next, "counter increment lost a race; rereading");
			}
			Err(e) => return Err(e.into()),
		}
	}
	Err(RepoError::VersionConflict)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kv::MemoryStore;

	#[tokio::test]
	async fn concurrent_increments_never_share_an_id() {
		let db: Arc<dyn VersionedStore> = Arc::new(MemoryStore::new());
		seed_counter(db.as_ref()).await.expect("seed");

		let mut tasks = Vec::new();
		for _ in 0..4 {
			let db = db.clone();
			tasks.push(tokio::spawn(async move { next_id(db.as_ref()).await }));
		}
		let mut ids = Vec::new();
		for t in tasks {
			ids.push(t.await.expect("join").expect("next_id"));
		}
		ids.sort_unstable();
		assert_eq!(ids, vec![1, 2, 3, 4]);
	}

	#[tokio::test]
	async fn seeding_is_idempotent() {
		let db = MemoryStore::new();
		seed_counter(&db).await.expect("seed");
		assert_eq!(next_id(&db).await.expect("next"), 1);
		seed_counter(&db).await.expect("reseed");
		assert_eq!(next_id(&db).await.expect("next"), 2);
	}
}
