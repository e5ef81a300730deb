#![forbid(unsafe_code)]

//! Append-only moderation and engagement records.

use std::sync::Arc;

use tessera_domain::{BoardId, Fault, Love, Report, UserBan, UserId};

use super::{next_id, read_u16, read_u32, seed_counter};
use crate::error::RepoError;
use crate::kv::VersionedStore;

fn corrupt(what: &str, key: &[u8], value: &[u8]) -> RepoError {
	RepoError::Corrupt(format!("{what} key={} value={} bytes", key.len(), value.len()))
}

/// Bans and timeouts under a 4-byte counter id.
pub struct UserBanRepo {
	db: Arc<dyn VersionedStore>,
}

impl UserBanRepo {
	pub async fn open(db: Arc<dyn VersionedStore>) -> Result<Self, RepoError> {
		seed_counter(db.as_ref()).await?;
		Ok(Self { db })
	}

	/// Assigns the next id and stores the record.
	pub async fn insert(&self, mut ban: UserBan) -> Result<UserBan, RepoError> {
		ban.id = next_id(self.db.as_ref()).await?;
		self.db.put(&ban.id.to_be_bytes(), None, &serde_json::to_vec(&ban)?).await?;
		Ok(ban)
	}

	/// Records with id strictly greater than `cursor`.
	pub async fn since(&self, cursor: u32) -> Result<Vec<UserBan>, RepoError> {
		let start = cursor.to_be_bytes();
		let mut out = Vec::new();
		for entry in self.db.range_scan(&start, 0, false).await? {
			if entry.key.len() != 4 || entry.key == start {
				continue;
			}
			out.push(serde_json::from_slice(&entry.value)?);
		}
		Ok(out)
	}
}

/// `target u32 ‖ board u16 ‖ generation u16 ‖ timecode u32 ‖ reporter u32`
/// -> `date u32 ‖ frame date u32 ‖ reason`.
pub struct ReportRepo {
	db: Arc<dyn VersionedStore>,
}

impl ReportRepo {
	const KEY_LEN: usize = 16;

	pub fn new(db: Arc<dyn VersionedStore>) -> Self {
		Self { db }
	}

	fn decode(key: &[u8], value: &[u8]) -> Result<Report, RepoError> {
		if key.len() != Self::KEY_LEN || value.len() < 8 {
			return Err(corrupt("report", key, value));
		}
		Ok(Report {
			target_id: UserId(read_u32(key)),
			board_id: BoardId(read_u16(&key[4..])),
			generation: read_u16(&key[6..]),
			timecode: read_u32(&key[8..]),
			user_id: UserId(read_u32(&key[12..])),
			date: read_u32(value),
			frame_date: read_u32(&value[4..]),
			reason: String::from_utf8_lossy(&value[8..]).into_owned(),
		})
	}

	pub async fn insert(&self, r: &Report) -> Result<(), RepoError> {
		let mut key = Vec::with_capacity(Self::KEY_LEN);
		key.extend_from_slice(&r.target_id.get().to_be_bytes());
		key.extend_from_slice(&r.board_id.get().to_be_bytes());
		key.extend_from_slice(&r.generation.to_be_bytes());
		key.extend_from_slice(&r.timecode.to_be_bytes());
		key.extend_from_slice(&r.user_id.get().to_be_bytes());
		let mut value = Vec::with_capacity(8 + r.reason.len());
		value.extend_from_slice(&r.date.to_be_bytes());
		value.extend_from_slice(&r.frame_date.to_be_bytes());
		value.extend_from_slice(r.reason.as_bytes());
		self.db.put(&key, None, &value).await?;
		Ok(())
	}

	pub async fn all(&self) -> Result<Vec<Report>, RepoError> {
		self.db
			.range_scan(&[], 0, false)
			.await?
			.iter()
			.map(|e| Self::decode(&e.key, &e.value))
			.collect()
	}

	/// Delete every report against `target`. Returns how many were removed.
	pub async fn clear(&self, target: UserId) -> Result<usize, RepoError> {
		let entries = self.db.prefix_scan(&target.get().to_be_bytes()).await?;
		for e in &entries {
			self.db.delete(&e.key, Some(&e.version)).await?;
		}
		Ok(entries.len())
	}

	/// Delete reports filed before `before` and return them.
	pub async fn sweep(&self, before: u32) -> Result<Vec<Report>, RepoError> {
		let mut removed = Vec::new();
		for e in self.db.range_scan(&[], 0, false).await? {
			let report = Self::decode(&e.key, &e.value)?;
			if report.date < before {
				self.db.delete(&e.key, Some(&e.version)).await?;
				removed.push(report);
			}
		}
		Ok(removed)
	}
}

/// `board u16 ‖ user u32 ‖ generation u16 ‖ timecode u32` -> date.
pub struct LoveRepo {
	db: Arc<dyn VersionedStore>,
}

impl LoveRepo {
	pub fn new(db: Arc<dyn VersionedStore>) -> Self {
		Self { db }
	}

	fn decode(key: &[u8], value: &[u8]) -> Result<Love, RepoError> {
		if key.len() != 12 || value.len() != 4 {
			return Err(corrupt("love", key, value));
		}
		Ok(Love {
			board_id: BoardId(read_u16(key)),
			user_id: UserId(read_u32(&key[2..])),
			generation: read_u16(&key[6..]),
			timecode: read_u32(&key[8..]),
			date: read_u32(value),
		})
	}

	pub async fn insert(&self, l: &Love) -> Result<(), RepoError> {
		let mut key = Vec::with_capacity(12);
		key.extend_from_slice(&l.board_id.get().to_be_bytes());
		key.extend_from_slice(&l.user_id.get().to_be_bytes());
		key.extend_from_slice(&l.generation.to_be_bytes());
		key.extend_from_slice(&l.timecode.to_be_bytes());
		self.db.put(&key, None, &l.date.to_be_bytes()).await?;
		Ok(())
	}

	pub async fn sweep(&self, before: u32) -> Result<Vec<Love>, RepoError> {
		let mut removed = Vec::new();
		for e in self.db.range_scan(&[], 0, false).await? {
			let love = Self::decode(&e.key, &e.value)?;
			if love.date < before {
				self.db.delete(&e.key, Some(&e.version)).await?;
				removed.push(love);
			}
		}
		Ok(removed)
	}
}

/// `minute u32 ‖ user u32 ‖ err type` -> user agent.
pub struct FaultRepo {
	db: Arc<dyn VersionedStore>,
}

impl FaultRepo {
	pub fn new(db: Arc<dyn VersionedStore>) -> Self {
		Self { db }
	}

	fn decode(key: &[u8], value: &[u8]) -> Result<Fault, RepoError> {
		if key.len() < 8 {
			return Err(corrupt("fault", key, value));
		}
		Ok(Fault {
			minute: read_u32(key),
			user_id: UserId(read_u32(&key[4..])),
			err_type: String::from_utf8_lossy(&key[8..]).into_owned(),
			user_agent: String::from_utf8_lossy(value).into_owned(),
		})
	}

	pub async fn insert(&self, f: &Fault) -> Result<(), RepoError> {
		let mut key = Vec::with_capacity(8 + f.err_type.len());
		key.extend_from_slice(&f.minute.to_be_bytes());
		key.extend_from_slice(&f.user_id.get().to_be_bytes());
		key.extend_from_slice(f.err_type.as_bytes());
		self.db.put(&key, None, f.user_agent.as_bytes()).await?;
		Ok(())
	}

	/// Keys lead with the minute, so this stops at the first newer record.
	pub async fn sweep(&self, before_minute: u32) -> Result<Vec<Fault>, RepoError> {
		let mut removed = Vec::new();
		for e in self.db.range_scan(&[], 0, false).await? {
			let fault = Self::decode(&e.key, &e.value)?;
			if fault.minute >= before_minute {
				break;
			}
			self.db.delete(&e.key, Some(&e.version)).await?;
			removed.push(fault);
		}
		Ok(removed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kv::MemoryStore;

	fn report(target: u32, reporter: u32, date: u32) -> Report {
		Report {
			target_id: UserId(target),
			board_id: BoardId(1),
			generation: 0,
			timecode: 0x0305,
			user_id: UserId(reporter),
			date,
			frame_date: 90,
			reason: "spam".into(),
		}
	}

	#[tokio::test]
	async fn ban_ids_are_sequential_and_since_is_exclusive() {
		let r = UserBanRepo::open(Arc::new(MemoryStore::new())).await.expect("open");
		for target in [5, 6, 7] {
			r.insert(UserBan {
				id: 0,
				mod_id: UserId(1),
				target_id: UserId(target),
				since: 100,
				until: 200,
				reason: String::new(),
				ban: false,
			})
			.await
			.expect("insert");
		}
		let bans = r.since(1).await.expect("since");
		assert_eq!(bans.iter().map(|b| b.id).collect::<Vec<_>>(), vec![2, 3]);
		assert_eq!(bans[0].target_id, UserId(6));
	}

	#[tokio::test]
	async fn reports_roundtrip_clear_and_sweep() {
		let r = ReportRepo::new(Arc::new(MemoryStore::new()));
		r.insert(&report(5, 1, 100)).await.expect("insert");
		r.insert(&report(5, 2, 300)).await.expect("insert");
		r.insert(&report(6, 1, 100)).await.expect("insert");
		assert_eq!(r.all().await.expect("all")[0], report(5, 1, 100));

		assert_eq!(r.clear(UserId(5)).await.expect("clear"), 2);
		assert_eq!(r.all().await.expect("all"), vec![report(6, 1, 100)]);
		assert_eq!(r.sweep(200).await.expect("sweep"), vec![report(6, 1, 100)]);
		assert!(r.all().await.expect("all").is_empty());
	}

	#[tokio::test]
	async fn loves_and_faults_sweep_by_date() {
		let loves = LoveRepo::new(Arc::new(MemoryStore::new()));
		for (user, date) in [(1, 10), (2, 20)] {
			loves
				.insert(&Love {
					board_id: BoardId(1),
					user_id: UserId(user),
					generation: 0,
					timecode: 7,
					date,
				})
				.await
				.expect("insert");
		}
		let swept = loves.sweep(15).await.expect("sweep");
		assert_eq!(swept.iter().map(|l| l.user_id).collect::<Vec<_>>(), vec![UserId(1)]);
		assert_eq!(loves.sweep(u32::MAX).await.expect("sweep")[0].user_id, UserId(2));

		let faults = FaultRepo::new(Arc::new(MemoryStore::new()));
		for minute in [1, 2, 3] {
			faults
				.insert(&Fault {
					minute,
					user_id: UserId(9),
					err_type: "quota".into(),
					user_agent: "test".into(),
				})
				.await
				.expect("insert");
		}
		assert_eq!(faults.sweep(3).await.expect("sweep").len(), 2);
		let left = faults.sweep(u32::MAX).await.expect("sweep");
		assert_eq!(left.len(), 1);
		assert_eq!((left[0].minute, left[0].err_type.as_str()), (3, "quota"));
	}
}
