#![forbid(unsafe_code)]

pub mod error;
pub mod kv;
pub mod repo;

pub use error::{RepoError, StoreError};
pub use kv::{Entry, StoreBackend, StoreFactory, Version, VersionedStore};
pub use repo::{RepoSettings, Repos};
