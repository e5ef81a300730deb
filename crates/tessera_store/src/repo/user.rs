#![forbid(unsafe_code)]

//! Player directory.
//!
//! Layout of the `user` namespace:
//! - `_id`: last assigned user id (u32 BE)
//! - `twitch-<external id>`: user id (u32 BE)
//! - `<user id u32 BE>`: user JSON

use std::sync::Arc;

use tessera_domain::{BoardId, BucketPolicy, Profile, User, UserBucket, UserId};
use tokio::sync::Mutex;

use super::{CAS_ATTEMPTS, next_id, read_u32, seed_counter};
use crate::error::{RepoError, StoreError};
use crate::kv::{Version, VersionedStore};

const EXTERNAL_PREFIX: &str = "twitch-";
const USER_KEY_LEN: usize = 4;

fn user_key(id: UserId) -> [u8; USER_KEY_LEN] {
	id.get().to_be_bytes()
}

fn external_key(external_id: &str) -> Vec<u8> {
	format!("{EXTERNAL_PREFIX}{external_id}").into_bytes()
}

pub struct UserRepo {
	db: Arc<dyn VersionedStore>,
	bucket: BucketPolicy,
	/// Held while creating a user so one external id never gets two ids.
	create: Mutex<()>,
}

impl UserRepo {
	pub async fn open(db: Arc<dyn VersionedStore>, bucket: BucketPolicy) -> Result<Self, RepoError> {
		seed_counter(db.as_ref()).await?;
		Ok(Self {
			db,
			bucket,
			create: Mutex::new(()),
		})
	}

	async fn find_versioned(&self, id: UserId) -> Result<(Version, User), RepoError> {
		let (version, raw) = self.db.get(&user_key(id)).await?;
		Ok((version, serde_json::from_slice(&raw)?))
	}

	pub async fn find(&self, id: UserId) -> Result<User, RepoError> {
		Ok(self.find_versioned(id).await?.1)
	}

	pub async fn find_by_external(&self, external_id: &str) -> Result<User, RepoError> {
		let (_, raw) = self.db.get(&external_key(external_id)).await?;
		if raw.len() != USER_KEY_LEN {
			return Err(RepoError::Corrupt(format!("external index for {external_id} has {} bytes", raw.len())));
		}
		self.find(UserId(read_u32(&raw))).await
	}

	async fn find_external(&self, external_id: &str) -> Result<Option<User>, RepoError> {
		match self.find_by_external(external_id).await {
			Ok(user) => Ok(Some(user)),
			Err(RepoError::NotFound) => Ok(None),
			Err(e) => Err(e),
		}
	}

	/// Returns the user and whether it was created by this call.
	pub async fn find_or_insert(&self, profile: &Profile) -> Result<(User, bool), RepoError> {
		if let Some(user) = self.find_external(&profile.id).await? {
			return Ok((user, false));
		}

		let _create = self.create.lock().await;
		// Another connection for the same account may have won the gate.
		if let Some(user) = self.find_external(&profile.id).await? {
			return Ok((user, false));
		}

		let id = next_id(self.db.as_ref()).await?;
		if id > UserId::MAX_FRAME {
			return Err(RepoError::Corrupt("user id space exhausted".into()));
		}
		let user = User::new(UserId(id), profile.clone());
		self.db.put(&user_key(user.user_id), None, &serde_json::to_vec(&user)?).await?;
		self.db.put(&external_key(&profile.id), None, &user_key(user.user_id)).await?;
		tracing::info!(user_id = id, login = %profile.login, "user created");
		Ok((user, true))
	}

	/// Read-modify-write under CAS. `f` may run more than once.
	pub async fn modify<T, F>(&self, id: UserId, mut f: F) -> Result<(User, T), RepoError>
	where
		F: FnMut(&mut User) -> Result<T, RepoError> + Send,
		T: Send,
	{
		for _ in 0..CAS_ATTEMPTS {
			let (version, mut user) = self.find_versioned(id).await?;
			let out = f(&mut user)?;
			match self
				.db
				.put(&user_key(id), Some(&version), &serde_json::to_vec(&user)?)
				.await
			{
				Ok(_) => return Ok((user, out)),
				Err(StoreError::VersionConflict) => continue,
				Err(e) => return Err(e.into()),
			}
		}
		Err(RepoError::VersionConflict)
	}

	/// Sync provider fields and flags handed over by the identity layer.
	/// Returns the stored user and whether it was newly created.
	pub async fn update_profile(&self, profile: &Profile, policy: bool, moderator: bool) -> Result<(User, bool), RepoError> {
		let (user, inserted) = self.find_or_insert(profile).await?;
		if !inserted && user.profile == *profile && user.policy == policy && user.moderator == moderator {
			return Ok((user, false));
		}
		let (user, _) = self
			.modify(user.user_id, |u| {
				u.merge_profile(profile);
				u.policy = policy;
				u.moderator = moderator;
				Ok(())
			})
			.await?;
		Ok((user, inserted))
	}

	/// Users with id strictly greater than `cursor`, ascending.
	pub async fn since(&self, cursor: UserId) -> Result<Vec<User>, RepoError> {
		let start = user_key(cursor);
		let mut out = Vec::new();
		for entry in self.db.range_scan(&start, 0, false).await? {
			if entry.key.len() != USER_KEY_LEN || entry.key == start {
				continue;
			}
			out.push(serde_json::from_slice(&entry.value)?);
		}
		Ok(out)
	}

	/// The user's bucket for `board` as of `now`, without persisting.
	pub fn bucket_view(&self, user: &User, board: BoardId, now: u64) -> UserBucket {
		match user.bucket(board) {
			Some(b) => {
				let mut b = *b;
				b.adjust_level(now);
				b
			}
			None => UserBucket::new(self.bucket, now),
		}
	}

	pub async fn consume(&self, id: UserId, board: BoardId, now: u64) -> Result<UserBucket, RepoError> {
		let policy = self.bucket;
		let (_, bucket) = self
			.modify(id, |u| {
				let b = u.bucket_mut(board, policy, now);
				b.consume(1, now)?;
				Ok(*b)
			})
			.await?;
		Ok(bucket)
	}

	pub async fn credit(&self, id: UserId, board: BoardId, now: u64) -> Result<UserBucket, RepoError> {
		let policy = self.bucket;
		let (_, bucket) = self
			.modify(id, |u| {
				let b = u.bucket_mut(board, policy, now);
				b.credit(1, now);
				Ok(*b)
			})
			.await?;
		Ok(bucket)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kv::MemoryStore;

	fn profile(id: &str) -> Profile {
		Profile {
			id: id.into(),
			login: format!("login{id}"),
			display_name: format!("Name {id}"),
			profile_image_url: String::new(),
		}
	}

	async fn repo() -> UserRepo {
		UserRepo::open(Arc::new(MemoryStore::new()), BucketPolicy::default())
			.await
			.expect("open")
	}

	#[tokio::test]
	async fn find_or_insert_assigns_dense_ids_once() {
		let r = repo().await;
		let (a, inserted) = r.find_or_insert(&profile("100")).await.expect("insert a");
		assert!(inserted);
		assert_eq!(a.user_id, UserId(1));
		let (b, _) = r.find_or_insert(&profile("200")).await.expect("insert b");
		assert_eq!(b.user_id, UserId(2));
		let (again, inserted) = r.find_or_insert(&profile("100")).await.expect("find a");
		assert!(!inserted);
		assert_eq!(again.user_id, UserId(1));
	}

	#[tokio::test]
	async fn concurrent_first_logins_share_one_user() {
		let r = Arc::new(repo().await);
		let mut tasks = Vec::new();
		for _ in 0..8 {
			let r = r.clone();
			tasks.push(tokio::spawn(async move { r.find_or_insert(&profile("555")).await }));
		}
		let mut inserted = 0;
		let mut ids = Vec::new();
		for t in tasks {
			let (user, created) = t.await.expect("join").expect("find_or_insert");
			inserted += usize::from(created);
			ids.push(user.user_id);
		}
		assert_eq!(inserted, 1);
		assert!(ids.iter().all(|id| *id == UserId(1)));
		assert_eq!(r.since(UserId(0)).await.expect("since").len(), 1);
		assert_eq!(r.find_by_external("555").await.expect("external").user_id, UserId(1));
	}

	#[tokio::test]
	async fn since_skips_admin_and_index_keys() {
		let r = repo().await;
		for id in ["1", "2", "3"] {
			r.find_or_insert(&profile(id)).await.expect("insert");
		}
		let ids: Vec<_> = r.since(UserId(1)).await.expect("since").iter().map(|u| u.user_id).collect();
		assert_eq!(ids, vec![UserId(2), UserId(3)]);
		assert_eq!(r.since(UserId(0)).await.expect("since").len(), 3);
	}

	#[tokio::test]
	async fn consume_and_credit_persist() {
		let r = repo().await;
		let (u, _) = r.find_or_insert(&profile("7")).await.expect("insert");
		let b = r.consume(u.user_id, BoardId(1), 1_000).await.expect("consume");
		assert_eq!(b.level, 28);
		let stored = r.find(u.user_id).await.expect("find");
		assert_eq!(stored.bucket(BoardId(1)).map(|b| b.level), Some(28));
		let b = r.credit(u.user_id, BoardId(1), 1_000).await.expect("credit");
		assert_eq!(b.level, 32);
	}

	#[tokio::test]
	async fn consume_fails_when_empty() {
		let r = repo().await;
		let (u, _) = r.find_or_insert(&profile("7")).await.expect("insert");
		for _ in 0..8 {
			r.consume(u.user_id, BoardId(1), 1_000).await.expect("consume");
		}
		match r.consume(u.user_id, BoardId(1), 1_000).await {
			Err(RepoError::InsufficientCredits(_)) => {}
			other => panic!("expected InsufficientCredits, got: {other:?}"),
		}
	}

	#[tokio::test]
	async fn update_profile_sets_flags() {
		let r = repo().await;
		let (u, inserted) = r.update_profile(&profile("9"), true, true).await.expect("update");
		assert!(inserted);
		assert!(u.policy && u.moderator);
		let mut renamed = profile("9");
		renamed.login = "renamed".into();
		let (u, inserted) = r.update_profile(&renamed, true, false).await.expect("update");
		assert!(!inserted);
		assert!(!u.moderator);
		assert_eq!(r.find(u.user_id).await.expect("find").profile.login, "renamed");
	}
}
