#![forbid(unsafe_code)]

//! TTL leases on tiles.
//!
//! Forward index (`tile_lock`): `board u16 ‖ tile u16` -> `user u32 ‖ expires u32`.
//! Reverse index (`tile_lock_user`): `user u32` -> forward key.
//!
//! Expiry is checked lazily. The two indexes are written one after the other;
//! a reverse entry may outlive its lease, so ownership is always confirmed on
//! the forward entry before anything is deleted through it.

use std::sync::Arc;

use tessera_domain::{BoardId, TileId, UserId};
use tokio::sync::Mutex;

use super::{read_u16, read_u32, secs32};
use crate::error::{RepoError, StoreError};
use crate::kv::{Version, VersionedStore};

const TILE_KEY_LEN: usize = 4;

fn tile_key(board: BoardId, tile: TileId) -> [u8; TILE_KEY_LEN] {
	let mut k = [0u8; TILE_KEY_LEN];
	k[..2].copy_from_slice(&board.get().to_be_bytes());
	k[2..].copy_from_slice(&u16::from(tile.get()).to_be_bytes());
	k
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileLease {
	pub board: BoardId,
	pub tile: TileId,
	pub user: UserId,
	pub expires_at: u32,
}

impl TileLease {
	pub fn expired(&self, now: u64) -> bool {
		u64::from(self.expires_at) < now
	}

	fn encode(&self) -> [u8; 8] {
		let mut v = [0u8; 8];
		v[..4].copy_from_slice(&self.user.get().to_be_bytes());
		v[4..].copy_from_slice(&self.expires_at.to_be_bytes());
		v
	}

	fn decode(key: &[u8], raw: &[u8]) -> Result<Self, RepoError> {
		if key.len() != TILE_KEY_LEN || raw.len() != 8 {
			return Err(RepoError::Corrupt(format!(
				"tile lease key={} value={} bytes",
				key.len(),
				raw.len()
			)));
		}
		let tile = u8::try_from(read_u16(&key[2..])).map_err(|_| RepoError::Corrupt("tile id above 255".into()))?;
		Ok(Self {
			board: BoardId(read_u16(key)),
			tile: TileId(tile),
			user: UserId(read_u32(raw)),
			expires_at: read_u32(&raw[4..]),
		})
	}
}

pub struct TileLockManager {
	tiles: Arc<dyn VersionedStore>,
	users: Arc<dyn VersionedStore>,
	ttl_secs: u32,
	/// Lease decisions are made one at a time so two first-time acquirers
	/// cannot both observe an empty tile.
	gate: Mutex<()>,
}

impl TileLockManager {
	pub fn new(tiles: Arc<dyn VersionedStore>, users: Arc<dyn VersionedStore>, ttl_secs: u32) -> Self {
		Self {
			tiles,
			users,
			ttl_secs,
			gate: Mutex::new(()),
		}
	}

	async fn lease(&self, key: &[u8]) -> Result<Option<(Version, TileLease)>, RepoError> {
		match self.tiles.get(key).await {
			Ok((version, raw)) => Ok(Some((version, TileLease::decode(key, &raw)?))),
			Err(StoreError::NotFound) => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	/// The live lease on a tile, if any.
	pub async fn holder(&self, board: BoardId, tile: TileId, now: u64) -> Result<Option<TileLease>, RepoError> {
		Ok(self
			.lease(&tile_key(board, tile))
			.await?
			.map(|(_, lease)| lease)
			.filter(|lease| !lease.expired(now)))
	}

	pub async fn holds(&self, user: UserId, board: BoardId, tile: TileId, now: u64) -> Result<bool, RepoError> {
		Ok(self.holder(board, tile, now).await?.is_some_and(|l| l.user == user))
	}

	/// Drop whatever `user` holds elsewhere, unless it is `keep`.
	async fn release_previous(&self, user: UserId, keep: &[u8]) -> Result<(), RepoError> {
		let user_key = user.get().to_be_bytes();
		let (reverse_version, previous) = match self.users.get(&user_key).await {
			Ok(found) => found,
			Err(StoreError::NotFound) => return Ok(()),
			Err(e) => return Err(e.into()),
		};
		if previous == keep {
			return Ok(());
		}
		if let Some((version, lease)) = self.lease(&previous).await?
			&& lease.user == user
		{
			self.tiles.delete(&previous, Some(&version)).await?;
			tracing::debug!(user_id = user.get(), board_id = lease.board.get(), tile_id = lease.tile.get(), "released previous lease");
		}
		self.users.delete(&user_key, Some(&reverse_version)).await?;
		Ok(())
	}

	pub async fn acquire(&self, user: UserId, board: BoardId, tile: TileId, now: u64) -> Result<TileLease, RepoError> {
		let _gate = self.gate.lock().await;
		let key = tile_key(board, tile);
		self.release_previous(user, &key).await?;

		let current = self.lease(&key).await?;
		if let Some((_, lease)) = &current
			&& lease.user != user
			&& !lease.expired(now)
		{
			return Err(RepoError::LockHeld);
		}

		let lease = TileLease {
			board,
			tile,
			user,
			expires_at: secs32(now.saturating_add(u64::from(self.ttl_secs))),
		};
		let expected = current.as_ref().map(|(v, _)| v);
		match self.tiles.put(&key, expected, &lease.encode()).await {
			Ok(_) => {}
			Err(StoreError::VersionConflict) => return Err(RepoError::LockHeld),
			Err(e) => return Err(e.into()),
		}
		self.users.put(&user.get().to_be_bytes(), None, &key).await?;
		Ok(lease)
	}

	pub async fn release(&self, user: UserId, board: BoardId, tile: TileId, now: u64) -> Result<(), RepoError> {
		let _gate = self.gate.lock().await;
		let key = tile_key(board, tile);
		let Some((version, lease)) = self.lease(&key).await? else {
			return Err(RepoError::NotLocked);
		};
		if lease.expired(now) {
			return Err(RepoError::LockExpired);
		}
		if lease.user != user {
			return Err(RepoError::LockForeign);
		}

		let user_key = user.get().to_be_bytes();
		match self.users.get(&user_key).await {
			Ok((reverse_version, target)) if target == key => {
				self.users.delete(&user_key, Some(&reverse_version)).await?;
			}
			Ok(_) | Err(StoreError::NotFound) => {}
			Err(e) => return Err(e.into()),
		}
		self.tiles.delete(&key, Some(&version)).await?;
		Ok(())
	}
}
