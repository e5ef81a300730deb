#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use tessera_domain::{BoardId, TileId, UserId};

use super::{read_u16, read_u32};
use crate::error::RepoError;
use crate::kv::VersionedStore;

/// Where a frame lives and when it was painted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef {
	pub board: BoardId,
	pub generation: u16,
	pub frame_id: u32,
	pub date: u32,
}

fn date_of(raw: &[u8]) -> Result<u32, RepoError> {
	if raw.len() != 4 {
		return Err(RepoError::Corrupt(format!("history date has {} bytes", raw.len())));
	}
	Ok(read_u32(raw))
}

/// `board u16 ‖ tile u8 ‖ generation u16 ‖ frame id u32` -> date.
pub struct TileHistoryRepo {
	db: Arc<dyn VersionedStore>,
}

impl TileHistoryRepo {
	pub fn new(db: Arc<dyn VersionedStore>) -> Self {
		Self { db }
	}

	fn prefix(board: BoardId, tile: TileId) -> Vec<u8> {
		let mut k = board.get().to_be_bytes().to_vec();
		k.push(tile.get());
		k
	}

	pub async fn insert(&self, board: BoardId, tile: TileId, generation: u16, frame_id: u32, date: u32) -> Result<(), RepoError> {
		let mut key = Self::prefix(board, tile);
		key.extend_from_slice(&generation.to_be_bytes());
		key.extend_from_slice(&frame_id.to_be_bytes());
		self.db.put(&key, None, &date.to_be_bytes()).await?;
		Ok(())
	}
}

/// `user u32 ‖ board u16 ‖ generation u16 ‖ frame id u32` -> date.
pub struct UserFrameHistoryRepo {
	db: Arc<dyn VersionedStore>,
}

impl UserFrameHistoryRepo {
	pub fn new(db: Arc<dyn VersionedStore>) -> Self {
		Self { db }
	}

	pub async fn insert(&self, user: UserId, board: BoardId, generation: u16, frame_id: u32, date: u32) -> Result<(), RepoError> {
		let mut key = user.get().to_be_bytes().to_vec();
		key.extend_from_slice(&board.get().to_be_bytes());
		key.extend_from_slice(&generation.to_be_bytes());
		key.extend_from_slice(&frame_id.to_be_bytes());
		self.db.put(&key, None, &date.to_be_bytes()).await?;
		Ok(())
	}

	pub async fn for_user(&self, user: UserId) -> Result<Vec<FrameRef>, RepoError> {
		let mut out = Vec::new();
		for entry in self.db.prefix_scan(&user.get().to_be_bytes()).await? {
			if entry.key.len() != 12 {
				continue;
			}
			out.push(FrameRef {
				board: BoardId(read_u16(&entry.key[4..])),
				generation: read_u16(&entry.key[6..]),
				frame_id: read_u32(&entry.key[8..]),
				date: date_of(&entry.value)?,
			});
		}
		Ok(out)
	}

	/// Boards `user` painted on at or after `since`.
	pub async fn boards_since(&self, user: UserId, since: u32) -> Result<BTreeSet<BoardId>, RepoError> {
		Ok(self
			.for_user(user)
			.await?
			.into_iter()
			.filter(|r| r.date >= since)
			.map(|r| r.board)
			.collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kv::MemoryStore;

	#[tokio::test]
	async fn tile_history_is_scoped_to_one_tile() {
		let r = TileHistoryRepo::new(Arc::new(MemoryStore::new()));
		r.insert(BoardId(1), TileId(5), 0, 0x0105, 100).await.expect("insert");
		r.insert(BoardId(1), TileId(5), 0, 0x0205, 160).await.expect("insert");
		r.insert(BoardId(1), TileId(6), 0, 0x0206, 170).await.expect("insert");
		let tile5 = r.db.prefix_scan(&TileHistoryRepo::prefix(BoardId(1), TileId(5))).await.expect("scan");
		let dates: Vec<u32> = tile5.iter().map(|e| read_u32(&e.value)).collect();
		assert_eq!(dates, vec![100, 160]);
		assert_eq!(read_u32(&tile5[1].key[5..]), 0x0205);
	}

	#[tokio::test]
	async fn boards_since_filters_by_date() {
		let r = UserFrameHistoryRepo::new(Arc::new(MemoryStore::new()));
		r.insert(UserId(3), BoardId(1), 0, 1, 100).await.expect("insert");
		r.insert(UserId(3), BoardId(2), 0, 1, 200).await.expect("insert");
		r.insert(UserId(3), BoardId(4), 1, 9, 300).await.expect("insert");
		r.insert(UserId(4), BoardId(9), 0, 1, 300).await.expect("insert");
		let boards = r.boards_since(UserId(3), 150).await.expect("boards");
		assert_eq!(boards.into_iter().collect::<Vec<_>>(), vec![BoardId(2), BoardId(4)]);
	}
}
