#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{BoardId, SeriesId, TileId};

/// A canvas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
	pub id: BoardId,
	/// Background palette index.
	#[serde(default)]
	pub bg: u8,
	/// Width in tiles.
	pub w: u16,
	/// Height in tiles.
	pub h: u16,
	/// Tile edge length in pixels.
	pub ts: u16,
	#[serde(default)]
	pub created: u64,
}

impl Board {
	/// Tiles addressable by a one-byte tile id.
	pub fn tile_count(&self) -> u32 {
		(u32::from(self.w) * u32::from(self.h)).min(256)
	}

	pub fn has_tile(&self, tile: TileId) -> bool {
		u32::from(tile.get()) < self.tile_count()
	}
}

/// A themed campaign that owns boards and an activation window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
	pub id: SeriesId,
	pub name: String,
	#[serde(default)]
	pub author: String,
	/// Hex colors.
	#[serde(default)]
	pub palette: Vec<String>,
	#[serde(default)]
	pub boards: Vec<Board>,
	#[serde(default)]
	pub created: u64,
	/// Zero means never activated.
	#[serde(default)]
	pub active: u64,
	/// Zero means open-ended.
	#[serde(default)]
	pub finished: u64,
}

impl Series {
	pub fn is_active(&self, now: u64) -> bool {
		self.active != 0 && self.active <= now && (self.finished == 0 || now < self.finished)
	}

	pub fn board(&self, id: BoardId) -> Option<&Board> {
		self.boards.iter().find(|b| b.id == id)
	}
}
