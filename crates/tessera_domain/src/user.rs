#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{BoardId, BucketPolicy, UserBucket, UserId};

/// Identity as reported by the external identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Profile {
	/// Stable provider-side id.
	pub id: String,
	pub login: String,
	pub display_name: String,
	#[serde(default)]
	pub profile_image_url: String,
}

/// A player: provider profile plus game state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
	pub profile: Profile,
	#[serde(rename = "userID")]
	pub user_id: UserId,
	#[serde(default)]
	pub policy: bool,
	/// Unix seconds until which the user may not act.
	#[serde(default)]
	pub timeout: u64,
	#[serde(default)]
	pub banned: bool,
	#[serde(default, rename = "mod")]
	pub moderator: bool,
	#[serde(default)]
	pub buckets: BTreeMap<u16, UserBucket>,
}

impl User {
	pub fn new(user_id: UserId, profile: Profile) -> Self {
		Self {
			profile,
			user_id,
			policy: false,
			timeout: 0,
			banned: false,
			moderator: false,
			buckets: BTreeMap::new(),
		}
	}

	pub fn is_timed_out(&self, now: u64) -> bool {
		self.timeout > now
	}

	pub fn bucket(&self, board: BoardId) -> Option<&UserBucket> {
		self.buckets.get(&board.get())
	}

	/// The board's bucket, created full under `policy` on first use.
	pub fn bucket_mut(&mut self, board: BoardId, policy: BucketPolicy, now: u64) -> &mut UserBucket {
		self.buckets
			.entry(board.get())
			.or_insert_with(|| UserBucket::new(policy, now))
	}

	/// Copy provider fields over. Returns whether anything changed.
	pub fn merge_profile(&mut self, profile: &Profile) -> bool {
		if self.profile == *profile {
			return false;
		}
		self.profile = profile.clone();
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn profile() -> Profile {
		Profile {
			id: "1234".into(),
			login: "painter".into(),
			display_name: "Painter".into(),
			profile_image_url: String::new(),
		}
	}

	#[test]
	fn json_uses_wire_field_names() {
		let user = User::new(UserId(3), profile());
		let v = serde_json::to_value(&user).unwrap();
		assert_eq!(v["userID"], 3);
		assert_eq!(v["mod"], false);
		assert_eq!(v["profile"]["login"], "painter");
	}

	#[test]
	fn bucket_is_created_once() {
		let mut user = User::new(UserId(3), profile());
		user.bucket_mut(BoardId(1), BucketPolicy::default(), 10).level = 5;
		assert_eq!(user.bucket_mut(BoardId(1), BucketPolicy::default(), 99).level, 5);
		assert!(user.bucket(BoardId(2)).is_none());
	}

	#[test]
	fn merge_profile_reports_changes() {
		let mut user = User::new(UserId(3), profile());
		assert!(!user.merge_profile(&profile()));
		let mut renamed = profile();
		renamed.display_name = "Renamed".into();
		assert!(user.merge_profile(&renamed));
		assert_eq!(user.profile.display_name, "Renamed");
	}
}
