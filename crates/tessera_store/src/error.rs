#![forbid(unsafe_code)]

use tessera_domain::InsufficientCredits;
use tessera_protocol::FrameError;
use thiserror::Error;

/// Versioned key-value store failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
	#[error("item not found")]
	NotFound,

	#[error("item version does not match")]
	VersionConflict,

	/// The engine could not be opened or reached. Retryable at a higher level.
	#[error("storage temporarily unavailable: {0}")]
	TemporaryUnavailable(String),

	#[error("storage error: {0}")]
	Backend(String),
}

impl From<sqlx::Error> for StoreError {
	fn from(e: sqlx::Error) -> Self {
		match &e {
			sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
				StoreError::TemporaryUnavailable(e.to_string())
			}
			sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("5") | Some("6")) => {
				// SQLITE_BUSY / SQLITE_LOCKED
				StoreError::TemporaryUnavailable(e.to_string())
			}
			_ => StoreError::Backend(e.to_string()),
		}
	}
}

/// Repository-level failures, including lock and bucket outcomes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepoError {
	#[error("item not found")]
	NotFound,

	#[error("item version does not match")]
	VersionConflict,

	#[error("storage temporarily unavailable: {0}")]
	TemporaryUnavailable(String),

	#[error("storage error: {0}")]
	Backend(String),

	#[error("tile locked")]
	LockHeld,

	#[error("tile lock expired")]
	LockExpired,

	#[error("tile locked by another user")]
	LockForeign,

	#[error("tile not locked")]
	NotLocked,

	#[error(transparent)]
	InsufficientCredits(#[from] InsufficientCredits),

	#[error("invalid frame: {0}")]
	Frame(#[from] FrameError),

	#[error("corrupt record: {0}")]
	Corrupt(String),
}

impl From<StoreError> for RepoError {
	fn from(e: StoreError) -> Self {
		match e {
			StoreError::NotFound => RepoError::NotFound,
			StoreError::VersionConflict => RepoError::VersionConflict,
			StoreError::TemporaryUnavailable(m) => RepoError::TemporaryUnavailable(m),
			StoreError::Backend(m) => RepoError::Backend(m),
		}
	}
}

impl From<serde_json::Error> for RepoError {
	fn from(e: serde_json::Error) -> Self {
		RepoError::Corrupt(e.to_string())
	}
}

impl RepoError {
	/// Short stable label for metrics.
	pub fn kind(&self) -> &'static str {
		match self {
			RepoError::NotFound => "not_found",
			RepoError::VersionConflict => "version_conflict",
			RepoError::TemporaryUnavailable(_) => "unavailable",
			RepoError::Backend(_) => "backend",
			RepoError::LockHeld => "lock_held",
			RepoError::LockExpired => "lock_expired",
			RepoError::LockForeign => "lock_foreign",
			RepoError::NotLocked => "not_locked",
			RepoError::InsufficientCredits(_) => "insufficient_credits",
			RepoError::Frame(_) => "frame",
			RepoError::Corrupt(_) => "corrupt",
		}
	}
}
