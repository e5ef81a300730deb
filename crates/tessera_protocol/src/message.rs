#![forbid(unsafe_code)]

//! JSON text messages exchanged over the socket, discriminated by `type`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tessera_domain::{BoardId, Love, Report, Series, TileId, User, UserBan, UserBucket, UserId};

#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("malformed message: {0}")]
	Malformed(String),

	#[error("encode error: {0}")]
	Encode(#[from] serde_json::Error),
}

/// Client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Inbound {
	/// Switch to a board and replay what the client missed.
	BoardInit {
		#[serde(rename = "boardID", alias = "boardId")]
		board_id: BoardId,
		#[serde(default)]
		generation: u16,
		#[serde(default)]
		timecode: u32,
		#[serde(default, rename = "userIdx")]
		user_idx: Option<UserId>,
	},
	TileLock {
		#[serde(rename = "tileID")]
		tile_id: TileId,
	},
	TileLockRelease {
		#[serde(rename = "tileID")]
		tile_id: TileId,
	},
	Report {
		#[serde(default, rename = "boardID", alias = "boardId")]
		board_id: Option<BoardId>,
		#[serde(default)]
		generation: Option<u16>,
		timecode: u32,
		#[serde(default)]
		reason: String,
	},
	ReportClear {
		#[serde(rename = "targetID")]
		target_id: UserId,
	},
	Love {
		#[serde(default, rename = "boardID", alias = "boardId")]
		board_id: Option<BoardId>,
		#[serde(default)]
		generation: Option<u16>,
		timecode: u32,
	},
	UserBan {
		#[serde(rename = "targetID")]
		target_id: UserId,
		since: u32,
		/// Seconds.
		#[serde(default)]
		duration: u32,
		#[serde(default)]
		reason: String,
		#[serde(default)]
		ban: bool,
	},
	ErrStorage {
		#[serde(default, rename = "userID")]
		user_id: Option<UserId>,
		#[serde(default, rename = "userAgent")]
		user_agent: String,
		#[serde(default, rename = "errType")]
		err_type: String,
	},
}

/// Fails closed on unknown or missing `type`.
pub fn decode_inbound(text: &str) -> Result<Inbound, ProtocolError> {
	serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Outbound {
	Init {
		/// Game content version, hex.
		v: String,
		user: Option<User>,
		series: Vec<Series>,
		#[serde(rename = "userIdx")]
		user_idx: UserId,
		#[serde(rename = "banIdx")]
		ban_idx: u32,
	},
	SyncComplete {
		#[serde(rename = "boardID")]
		board_id: Option<BoardId>,
		generation: u16,
		timecode: u32,
		#[serde(rename = "userIdx")]
		user_idx: UserId,
		#[serde(rename = "banIdx")]
		ban_idx: u32,
		bucket: Option<UserBucket>,
	},
	TileLocked {
		#[serde(rename = "tileID")]
		tile_id: TileId,
		#[serde(rename = "userID")]
		user_id: UserId,
		bucket: Option<UserBucket>,
	},
	TileLockReleased {
		#[serde(rename = "tileID")]
		tile_id: TileId,
		#[serde(rename = "userID")]
		user_id: UserId,
		bucket: Option<UserBucket>,
	},
	NewUser {
		#[serde(rename = "userID")]
		user_id: UserId,
		login: String,
		display_name: String,
	},
	Love(Love),
	Report(Report),
	ReportSuccess {},
	ReportClear {
		#[serde(rename = "targetID")]
		target_id: UserId,
	},
	UserBan(UserBan),
	Err {
		msg: String,
	},
}

impl Outbound {
	pub fn to_json(&self) -> Result<String, ProtocolError> {
		Ok(serde_json::to_string(self)?)
	}

	pub fn err(msg: impl Into<String>) -> Self {
		Outbound::Err { msg: msg.into() }
	}

	pub fn new_user(user: &User) -> Self {
		Outbound::NewUser {
			user_id: user.user_id,
			login: user.profile.login.clone(),
			display_name: user.profile.display_name.clone(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decodes_kebab_case_tags() {
		let m = decode_inbound(r#"{"type":"tile-lock","tileID":5}"#).unwrap();
		assert_eq!(m, Inbound::TileLock { tile_id: TileId(5) });

		let m = decode_inbound(r#"{"type":"board-init","boardId":1}"#).unwrap();
		assert_eq!(
			m,
			Inbound::BoardInit {
				board_id: BoardId(1),
				generation: 0,
				timecode: 0,
				user_idx: None,
			}
		);
	}

	#[test]
	fn unknown_or_missing_tag_is_malformed() {
		for text in [
			r#"{"type":"paint-everything"}"#,
			r#"{"tileID":5}"#,
			r#"{"type":"tile-lock"}"#,
			"not json",
		] {
			match decode_inbound(text) {
				Err(ProtocolError::Malformed(_)) => {}
				other => panic!("expected malformed for {text}, got: {other:?}"),
			}
		}
	}

	#[test]
	fn tile_ids_above_a_byte_are_rejected() {
		assert!(decode_inbound(r#"{"type":"tile-lock","tileID":256}"#).is_err());
	}

	#[test]
	fn outbound_uses_type_tag() {
		let json = Outbound::err("tile locked").to_json().unwrap();
		assert_eq!(json, r#"{"type":"err","msg":"tile locked"}"#);

		let json = Outbound::TileLocked {
			tile_id: TileId(5),
			user_id: UserId(9),
			bucket: None,
		}
		.to_json()
		.unwrap();
		assert_eq!(json, r#"{"type":"tile-locked","tileID":5,"userID":9,"bucket":null}"#);
	}
}
