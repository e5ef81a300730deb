#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{BoardId, UserId};

/// A player's complaint about a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
	#[serde(rename = "targetID")]
	pub target_id: UserId,
	pub board_id: BoardId,
	pub generation: u16,
	pub timecode: u32,
	#[serde(rename = "userID")]
	pub user_id: UserId,
	pub date: u32,
	pub frame_date: u32,
	pub reason: String,
}

/// A player liked a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Love {
	pub board_id: BoardId,
	#[serde(rename = "userID")]
	pub user_id: UserId,
	pub generation: u16,
	pub timecode: u32,
	pub date: u32,
}

/// Moderator action against a user. `ban == false` is a timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBan {
	pub id: u32,
	#[serde(rename = "modID")]
	pub mod_id: UserId,
	#[serde(rename = "targetID")]
	pub target_id: UserId,
	/// Frames at or after this unix second are rolled back.
	pub since: u32,
	pub until: u32,
	#[serde(default)]
	pub reason: String,
	#[serde(default)]
	pub ban: bool,
}

/// Client-side storage fault telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
	/// Unix minute.
	pub minute: u32,
	#[serde(rename = "userID")]
	pub user_id: UserId,
	pub err_type: String,
	pub user_agent: String,
}
