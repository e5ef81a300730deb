#![forbid(unsafe_code)]

//! Per-board append log of frames.
//!
//! Frame keys are `generation (u16 BE) ‖ frame id (u32 BE)`. The
//! administrative key `_checkpoint` holds one epoch (u32 BE unix seconds) per
//! generation; a frame's absolute time is `epochs[generation] + ts * unit`.
//! When the relative timestamp would no longer fit the header, a new
//! generation starts and that frame becomes the checkpoint frame.

use std::collections::HashMap;
use std::sync::Arc;

use tessera_domain::{BoardId, UserId};
use tessera_protocol::{Frame, TIMESTAMP_MAX};
use tokio::sync::Mutex;

use super::{read_u16, read_u32, secs32};
use crate::error::{RepoError, StoreError};
use crate::kv::{StoreFactory, Version, VersionedStore};

const CHECKPOINT_KEY: &[u8] = b"_checkpoint";
const FRAME_KEY_LEN: usize = 6;

fn frame_key(generation: u16, frame_id: u32) -> [u8; FRAME_KEY_LEN] {
	let mut k = [0u8; FRAME_KEY_LEN];
	k[..2].copy_from_slice(&generation.to_be_bytes());
	k[2..].copy_from_slice(&frame_id.to_be_bytes());
	k
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFrame {
	pub generation: u16,
	pub frame: Frame,
}

struct BoardLog {
	db: Arc<dyn VersionedStore>,
	/// Serializes writers so two frames never race on the checkpoint.
	writer: Mutex<()>,
}

pub struct BoardStore {
	factory: Arc<StoreFactory>,
	unit: u32,
	logs: Mutex<HashMap<BoardId, Arc<BoardLog>>>,
}

async fn read_checkpoints(db: &dyn VersionedStore) -> Result<(Option<Version>, Vec<u32>), RepoError> {
	match db.get(CHECKPOINT_KEY).await {
		Ok((version, raw)) => {
			if raw.len() % 4 != 0 {
				return Err(RepoError::Corrupt(format!("checkpoint list has {} bytes", raw.len())));
			}
			Ok((Some(version), raw.chunks_exact(4).map(read_u32).collect()))
		}
		Err(StoreError::NotFound) => Ok((None, Vec::new())),
		Err(e) => Err(e.into()),
	}
}

impl BoardStore {
	pub fn new(factory: Arc<StoreFactory>, unit_secs: u32) -> Self {
		Self {
			factory,
			unit: unit_secs.max(1),
			logs: Mutex::new(HashMap::new()),
		}
	}

	async fn log(&self, board: BoardId) -> Result<Arc<BoardLog>, RepoError> {
		let mut guard = self.logs.lock().await;
		if let Some(log) = guard.get(&board) {
			return Ok(log.clone());
		}
		let db = self.factory.open(&format!("board-{:04x}", board.get())).await?;
		let log = Arc::new(BoardLog {
			db,
			writer: Mutex::new(()),
		});
		guard.insert(board, log.clone());
		Ok(log)
	}

	/// Epoch per generation.
	pub async fn checkpoints(&self, board: BoardId) -> Result<Vec<u32>, RepoError> {
		let log = self.log(board).await?;
		Ok(read_checkpoints(log.db.as_ref()).await?.1)
	}

	/// Stamp `frame` against the board's checkpoint and persist it.
	/// Returns the generation the frame was stored under.
	pub async fn insert(&self, board: BoardId, frame: &mut Frame, now: u64) -> Result<u16, RepoError> {
		let log = self.log(board).await?;
		let _writer = log.writer.lock().await;

		let (version, mut epochs) = read_checkpoints(log.db.as_ref()).await?;
		let now = secs32(now);
		let truncated = now - now % self.unit;

		let relative = epochs.last().map(|epoch| truncated.saturating_sub(*epoch) / self.unit);
		let generation = match relative {
			Some(rel) if rel <= TIMESTAMP_MAX => {
				frame.stamp(rel.max(1))?;
				epochs.len() - 1
			}
			_ => {
				let epoch = truncated.saturating_sub(self.unit);
				epochs.push(epoch);
				let raw: Vec<u8> = epochs.iter().flat_map(|e| e.to_be_bytes()).collect();
				log.db.put(CHECKPOINT_KEY, version.as_ref(), &raw).await?;
				frame.stamp_checkpoint(epoch);
				tracing::info!(board_id = board.get(), generation = epochs.len() - 1, epoch, "board checkpoint advanced");
				epochs.len() - 1
			}
		};
		let generation =
			u16::try_from(generation).map_err(|_| RepoError::Corrupt("generation space exhausted".into()))?;

		log.db.put(&frame_key(generation, frame.id()), None, frame.as_bytes()).await?;
		Ok(generation)
	}

	pub async fn find(&self, board: BoardId, generation: u16, frame_id: u32) -> Result<Frame, RepoError> {
		let log = self.log(board).await?;
		let (_, raw) = log.db.get(&frame_key(generation, frame_id)).await?;
		Ok(Frame::decode_stored(raw)?)
	}

	/// Every frame from the start of `timecode`'s time bucket in `generation`
	/// onward, in key order.
	pub async fn since(&self, board: BoardId, generation: u16, timecode: u32) -> Result<Vec<StoredFrame>, RepoError> {
		let log = self.log(board).await?;
		let start = frame_key(generation, timecode - timecode % 256);
		let mut out = Vec::new();
		for entry in log.db.range_scan(&start, 0, false).await? {
			if entry.key.len() != FRAME_KEY_LEN {
				continue;
			}
			out.push(StoredFrame {
				generation: read_u16(&entry.key),
				frame: Frame::decode_stored(entry.value)?,
			});
		}
		Ok(out)
	}

	/// Absolute unix seconds of a stored frame.
	pub fn frame_time(&self, epochs: &[u32], generation: u16, frame: &Frame) -> Option<u64> {
		let epoch = *epochs.get(usize::from(generation))?;
		Some(u64::from(epoch) + u64::from(frame.timestamp()) * u64::from(self.unit))
	}

	/// Soft-delete every frame by `user` painted at or after `since` (unix
	/// seconds). Frames are compared in stored units, so anything painted in
	/// the same unit as `since` counts as after it. Returns how many frames
	/// were flagged.
	pub async fn delete_user_frames_after(&self, board: BoardId, user: UserId, since: u64) -> Result<usize, RepoError> {
		let log = self.log(board).await?;
		let _writer = log.writer.lock().await;
		let (_, epochs) = read_checkpoints(log.db.as_ref()).await?;
		if epochs.is_empty() {
			return Ok(0);
		}

		let (since_generation, threshold) = self.stored_position(&epochs, since);
		// A checkpoint frame sits at ts 0 but was painted one unit later.
		let start = frame_key(since_generation, threshold.saturating_sub(1) << 8);

		let mut flagged = 0;
		for entry in log.db.range_scan(&start, 0, true).await? {
			if entry.key.len() != FRAME_KEY_LEN {
				continue;
			}
			let generation = read_u16(&entry.key);
			let mut frame = Frame::decode_stored(entry.value)?;
			let painted = if frame.is_checkpoint() { 1 } else { frame.timestamp() };
			let before = generation < since_generation || (generation == since_generation && painted < threshold);
			if before || frame.user_id() != user || frame.deleted() {
				continue;
			}
			frame.set_deleted(true);
			log.db.put(&entry.key, Some(&entry.version), frame.as_bytes()).await?;
			flagged += 1;
		}
		tracing::info!(board_id = board.get(), user_id = user.get(), since, flagged, "rolled back user frames");
		Ok(flagged)
	}

	/// `(generation, relative timestamp)` of the unit holding `since`.
	fn stored_position(&self, epochs: &[u32], since: u64) -> (u16, u32) {
		let Some(generation) = epochs.iter().rposition(|e| u64::from(*e) <= since) else {
			return (0, 0);
		};
		let relative = (since - u64::from(epochs[generation])) / u64::from(self.unit);
		(
			u16::try_from(generation).unwrap_or(u16::MAX),
			u32::try_from(relative).unwrap_or(TIMESTAMP_MAX).min(TIMESTAMP_MAX),
		)
	}
}
