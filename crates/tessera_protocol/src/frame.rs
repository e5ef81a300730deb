#![forbid(unsafe_code)]

//! Binary paint frame.
//!
//! ```text
//! 0       3      4       7      8            12
//! | ts:24 | tile | user:24 | flags | [epoch:32] | payload...
//! ```
//!
//! All fields are big-endian. Bytes `0..4` form the frame id
//! (`ts * 256 + tile`), so ids sort by time bucket then tile. A stored frame
//! with `ts == 0` is a checkpoint and carries the absolute epoch right after
//! the header. The payload is opaque to the server.

use bytes::Bytes;
use thiserror::Error;
use tessera_domain::{TileId, UserId};

pub const HEADER_LEN: usize = 8;
pub const EPOCH_LEN: usize = 4;
/// Largest relative timestamp the header can carry.
pub const TIMESTAMP_MAX: u32 = (1 << 24) - 1;
/// Soft-delete bit in the flags byte.
pub const FLAG_DELETED: u8 = 0x04;

const FLAGS_AT: usize = 7;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
	#[error("frame shorter than header: need={need} have={have}")]
	TooShort {
		need: usize,
		have: usize,
	},

	#[error("relative timestamp out of range: {0}")]
	TimestampOutOfRange(u32),

	#[error("user id does not fit in 24 bits: {0}")]
	UserIdOutOfRange(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
	data: Vec<u8>,
}

fn read_u24(b: &[u8]) -> u32 {
	u32::from_be_bytes([0, b[0], b[1], b[2]])
}

fn write_u24(b: &mut [u8], v: u32) {
	b.copy_from_slice(&v.to_be_bytes()[1..]);
}

impl Frame {
	/// Accept client-submitted bytes. Only the header length is checked.
	pub fn decode(data: impl Into<Vec<u8>>) -> Result<Self, FrameError> {
		let data = data.into();
		if data.len() < HEADER_LEN {
			return Err(FrameError::TooShort {
				need: HEADER_LEN,
				have: data.len(),
			});
		}
		Ok(Self { data })
	}

	/// Decode a frame read back from storage, where `ts == 0` implies an epoch.
	pub fn decode_stored(data: impl Into<Vec<u8>>) -> Result<Self, FrameError> {
		let frame = Self::decode(data)?;
		if frame.timestamp() == 0 && frame.data.len() < HEADER_LEN + EPOCH_LEN {
			return Err(FrameError::TooShort {
				need: HEADER_LEN + EPOCH_LEN,
				have: frame.data.len(),
			});
		}
		Ok(frame)
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.data
	}

	pub fn into_bytes(self) -> Bytes {
		Bytes::from(self.data)
	}

	pub fn len(&self) -> usize {
		self.data.len()
	}

	pub fn is_empty(&self) -> bool {
		self.data.is_empty()
	}

	pub fn timestamp(&self) -> u32 {
		read_u24(&self.data[0..3])
	}

	pub fn tile_id(&self) -> TileId {
		TileId(self.data[3])
	}

	pub fn set_tile_id(&mut self, tile: TileId) {
		self.data[3] = tile.get();
	}

	/// `timestamp * 256 + tile`.
	pub fn id(&self) -> u32 {
		u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
	}

	pub fn user_id(&self) -> UserId {
		UserId(read_u24(&self.data[4..7]))
	}

	pub fn set_user_id(&mut self, user: UserId) -> Result<(), FrameError> {
		if user.get() > UserId::MAX_FRAME {
			return Err(FrameError::UserIdOutOfRange(user.get()));
		}
		write_u24(&mut self.data[4..7], user.get());
		Ok(())
	}

	pub fn flags(&self) -> u8 {
		self.data[FLAGS_AT]
	}

	pub fn deleted(&self) -> bool {
		self.data[FLAGS_AT] & FLAG_DELETED != 0
	}

	pub fn set_deleted(&mut self, deleted: bool) {
		if deleted {
			self.data[FLAGS_AT] |= FLAG_DELETED;
		} else {
			self.data[FLAGS_AT] &= !FLAG_DELETED;
		}
	}

	pub fn is_checkpoint(&self) -> bool {
		self.timestamp() == 0
	}

	/// Absolute epoch carried by a stored checkpoint frame.
	pub fn checkpoint_epoch(&self) -> Option<u32> {
		if !self.is_checkpoint() {
			return None;
		}
		let b = self.data.get(HEADER_LEN..HEADER_LEN + EPOCH_LEN)?;
		Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
	}

	/// Tile payload after the header (and epoch, for checkpoints).
	pub fn payload(&self) -> &[u8] {
		let start = if self.checkpoint_epoch().is_some() {
			HEADER_LEN + EPOCH_LEN
		} else {
			HEADER_LEN
		};
		&self.data[start..]
	}

	/// Stamp an unstamped submission with a relative timestamp in `1..=TIMESTAMP_MAX`.
	pub fn stamp(&mut self, ts: u32) -> Result<(), FrameError> {
		if ts == 0 || ts > TIMESTAMP_MAX {
			return Err(FrameError::TimestampOutOfRange(ts));
		}
		write_u24(&mut self.data[0..3], ts);
		Ok(())
	}

	/// Turn an unstamped submission into a checkpoint frame carrying `epoch`.
	pub fn stamp_checkpoint(&mut self, epoch: u32) {
		write_u24(&mut self.data[0..3], 0);
		let payload = self.data.split_off(HEADER_LEN);
		self.data.extend_from_slice(&epoch.to_be_bytes());
		self.data.extend_from_slice(&payload);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn blank() -> Frame {
		Frame::decode(vec![0u8; 11]).unwrap()
	}

	#[test]
	fn header_fields_do_not_overlap() {
		let mut f = blank();
		f.stamp(TIMESTAMP_MAX).unwrap();
		assert_eq!(&f.as_bytes()[..3], &[255, 255, 255]);
		assert_eq!(f.id(), 0xFFFF_FF00);

		f.set_tile_id(TileId(255));
		assert_eq!(f.id(), 0xFFFF_FFFF);

		f.set_user_id(UserId(UserId::MAX_FRAME)).unwrap();
		assert_eq!(&f.as_bytes()[4..7], &[255, 255, 255]);

		f.stamp(420).unwrap();
		f.set_user_id(UserId(4201)).unwrap();
		f.set_tile_id(TileId(54));
		assert_eq!(f.timestamp(), 420);
		assert_eq!(f.user_id(), UserId(4201));
		assert_eq!(f.tile_id(), TileId(54));
		assert_eq!(f.id(), 420 * 256 + 54);
	}

	#[test]
	fn deleted_flag_preserves_other_bits() {
		let mut f = Frame::decode(vec![0, 0, 1, 5, 0, 0, 9, 0b1011_0011]).unwrap();
		f.set_deleted(true);
		assert!(f.deleted());
		assert_eq!(f.flags(), 0b1011_0111);
		f.set_deleted(false);
		assert_eq!(f.flags(), 0b1011_0011);
	}

	#[test]
	fn rejects_short_frames_and_wide_user_ids() {
		assert_eq!(
			Frame::decode(vec![0u8; 7]),
			Err(FrameError::TooShort { need: 8, have: 7 })
		);
		assert_eq!(
			blank().set_user_id(UserId(1 << 24)),
			Err(FrameError::UserIdOutOfRange(1 << 24))
		);
		assert!(blank().stamp(0).is_err());
		assert!(blank().stamp(TIMESTAMP_MAX + 1).is_err());
	}

	#[test]
	fn checkpoint_epoch_sits_between_header_and_payload() {
		let mut f = Frame::decode(vec![0, 0, 0, 7, 0, 0, 3, 0, 0xAA, 0xBB]).unwrap();
		f.stamp_checkpoint(1_700_000_000);
		assert!(f.is_checkpoint());
		assert_eq!(f.checkpoint_epoch(), Some(1_700_000_000));
		assert_eq!(f.payload(), &[0xAA, 0xBB]);
		assert_eq!(f.tile_id(), TileId(7));

		let back = Frame::decode_stored(f.as_bytes().to_vec()).unwrap();
		assert_eq!(back, f);
	}

	#[test]
	fn stored_checkpoint_without_epoch_is_rejected() {
		assert!(Frame::decode_stored(vec![0u8; 8]).is_err());
		assert!(Frame::decode_stored(vec![0, 0, 1, 0, 0, 0, 0, 0]).is_ok());
	}
}
