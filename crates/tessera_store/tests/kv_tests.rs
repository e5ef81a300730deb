use std::sync::Arc;

use tessera_store::kv::{MemoryStore, SqliteStore};
use tessera_store::{StoreBackend, StoreError, StoreFactory, Version, VersionedStore};

async fn sqlite() -> (tempfile::TempDir, Arc<dyn VersionedStore>) {
	let dir = tempfile::tempdir().expect("tempdir");
	let db = SqliteStore::open(&dir.path().join("kv.db")).await.expect("open sqlite");
	(dir, Arc::new(db))
}

async fn check_cas_contract(db: &dyn VersionedStore) {
	assert_eq!(db.get(b"k").await, Err(StoreError::NotFound));
	assert!(!db.has(b"k").await.expect("has"));

	let stale = Version::of(b"nothing");
	assert_eq!(db.put(b"k", Some(&stale), b"v0").await, Err(StoreError::VersionConflict));

	let v1 = db.put(b"k", None, b"v1").await.expect("put v1");
	assert_eq!(v1, Version::of(b"v1"));
	assert_eq!(db.get(b"k").await.expect("get"), (v1.clone(), b"v1".to_vec()));

	let v2 = db.put(b"k", Some(&v1), b"v2").await.expect("cas v2");
	assert_eq!(db.put(b"k", Some(&v1), b"v3").await, Err(StoreError::VersionConflict));
	assert_eq!(db.delete(b"k", Some(&v1)).await, Err(StoreError::VersionConflict));

	db.delete(b"k", Some(&v2)).await.expect("delete");
	assert!(!db.has(b"k").await.expect("has"));
	db.delete(b"k", Some(&v2)).await.expect("delete missing");
	db.delete(b"k", None).await.expect("delete missing unconditionally");
}

async fn check_scans(db: &dyn VersionedStore) {
	for key in [&[1u8, 0][..], &[1, 1], &[1, 2], &[2, 0], &[1, 0xFF]] {
		db.put(key, None, key).await.expect("put");
	}

	let keys = |entries: Vec<tessera_store::Entry>| entries.into_iter().map(|e| e.key).collect::<Vec<_>>();

	assert_eq!(
		keys(db.range_scan(&[1, 1], 0, false).await.expect("scan")),
		vec![vec![1, 1], vec![1, 2], vec![1, 0xFF], vec![2, 0]]
	);
	assert_eq!(
		keys(db.range_scan(&[1, 1], 2, false).await.expect("scan")),
		vec![vec![1, 1], vec![1, 2]]
	);
	assert_eq!(
		keys(db.range_scan(&[1, 2], 0, true).await.expect("scan")),
		vec![vec![2, 0], vec![1, 0xFF], vec![1, 2]]
	);
	assert_eq!(keys(db.range_scan(&[], 1, true).await.expect("scan")), vec![vec![2, 0]]);
	assert_eq!(
		keys(db.prefix_scan(&[1]).await.expect("prefix")),
		vec![vec![1, 0], vec![1, 1], vec![1, 2], vec![1, 0xFF]]
	);
	assert!(db.prefix_scan(&[3]).await.expect("prefix").is_empty());
}

async fn check_concurrent_cas(db: Arc<dyn VersionedStore>) {
	let base = db.put(b"race", None, b"base").await.expect("put");
	let a = {
		let db = db.clone();
		let base = base.clone();
		tokio::spawn(async move { db.put(b"race", Some(&base), b"a").await })
	};
	let b = {
		let db = db.clone();
		tokio::spawn(async move { db.put(b"race", Some(&base), b"b").await })
	};
	let results = [a.await.expect("join a"), b.await.expect("join b")];
	let wins = results.iter().filter(|r| r.is_ok()).count();
	let conflicts = results
		.iter()
		.filter(|r| matches!(r, Err(StoreError::VersionConflict)))
		.count();
	assert_eq!((wins, conflicts), (1, 1), "got: {results:?}");
}

#[tokio::test]
async fn memory_store_honours_cas_contract() {
	let db = MemoryStore::new();
	check_cas_contract(&db).await;
	check_scans(&db).await;
	check_concurrent_cas(Arc::new(MemoryStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sqlite_store_honours_cas_contract() {
	let (_dir, db) = sqlite().await;
	check_cas_contract(db.as_ref()).await;
	check_scans(db.as_ref()).await;
	check_concurrent_cas(db).await;
}

#[tokio::test]
async fn sqlite_store_survives_reopen() {
	let dir = tempfile::tempdir().expect("tempdir");
	let path = dir.path().join("kv.db");
	let v = {
		let db = SqliteStore::open(&path).await.expect("open");
		db.put(b"k", None, b"persisted").await.expect("put")
	};
	let db = SqliteStore::open(&path).await.expect("reopen");
	assert_eq!(db.get(b"k").await.expect("get"), (v, b"persisted".to_vec()));
}

#[tokio::test]
async fn factory_reuses_namespaces() {
	let dir = tempfile::tempdir().expect("tempdir");
	let factory = StoreFactory::new(StoreBackend::Sqlite {
		dir: dir.path().join("data"),
	});
	let a = factory.open("user").await.expect("open");
	a.put(b"x", None, b"1").await.expect("put");
	let again = factory.open("user").await.expect("open again");
	assert!(again.has(b"x").await.expect("has"));
	let other = factory.open("report").await.expect("open other");
	assert!(!other.has(b"x").await.expect("has"));
	assert!(dir.path().join("data").join("user.db").exists());
}
