//! Multi-connection allocation tests.
//!
//! Every thread opens its own connection to the same file-backed DB, so the
//! guarantees come from SQLite write locking, not from an in-process mutex.

use chrono::{Duration, Utc};
use folio_core::{
    AuthorizationRegistry, Clock, Database, FolioAllocator, FolioError, FolioStatus, FolioStore,
    NewRange, SystemClock,
};
use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::NamedTempFile;

const ISSUER: &str = "76543210-K";
const DOC: &str = "33";

fn clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

fn register(db: &Database, start: u64, end: u64) {
    let now = Utc::now();
    AuthorizationRegistry::new(db.clone(), clock(), 10_000)
        .register_range(NewRange::new(
            ISSUER,
            DOC,
            start,
            end,
            now,
            now + Duration::days(180),
        ))
        .unwrap();
}

/// Race `callers` threads, each on its own connection, for one folio each.
fn race(path: &std::path::Path, callers: usize) -> Vec<Result<u64, FolioError>> {
    let barrier = Arc::new(Barrier::new(callers));
    let allocators: Vec<FolioAllocator> = (0..callers)
        .map(|_| FolioAllocator::new(Database::open(path).unwrap(), clock()))
        .collect();

    let handles: Vec<_> = allocators
        .into_iter()
        .map(|allocator| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                allocator
                    .assign_next(ISSUER, DOC)
                    .map(|assignment| assignment.folio.number)
            })
        })
        .collect();

    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn test_sequential_assignment_then_exhaustion() {
    let db = Database::memory().unwrap();
    register(&db, 1, 5);
    let allocator = FolioAllocator::new(db, clock());

    let numbers: Vec<u64> = (0..5)
        .map(|_| allocator.assign_next(ISSUER, DOC).unwrap().folio.number)
        .collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);

    assert!(matches!(
        allocator.assign_next(ISSUER, DOC),
        Err(FolioError::NoFolioAvailable { .. })
    ));
}

#[test]
fn test_five_connections_get_exactly_one_through_five() {
    let tmp = NamedTempFile::new().unwrap();
    register(&Database::open(tmp.path()).unwrap(), 1, 5);

    let results = race(tmp.path(), 5);
    let numbers: BTreeSet<u64> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(numbers, (1..=5).collect());

    let allocator = FolioAllocator::new(Database::open(tmp.path()).unwrap(), clock());
    assert!(matches!(
        allocator.assign_next(ISSUER, DOC),
        Err(FolioError::NoFolioAvailable { .. })
    ));
}

#[test]
fn test_more_callers_than_folios_no_duplicates() {
    let tmp = NamedTempFile::new().unwrap();
    register(&Database::open(tmp.path()).unwrap(), 100, 119);

    let results = race(tmp.path(), 32);
    let granted: Vec<u64> = results.iter().filter_map(|r| r.clone().ok()).collect();
    let unique: BTreeSet<u64> = granted.iter().copied().collect();

    assert_eq!(granted.len(), 20, "every folio handed out exactly once");
    assert_eq!(unique, (100..=119).collect());
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(FolioError::NoFolioAvailable { .. })))
            .count(),
        12
    );
}

#[test]
fn test_numbers_strictly_increase_per_connection() {
    let tmp = NamedTempFile::new().unwrap();
    register(&Database::open(tmp.path()).unwrap(), 1, 200);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let allocator = FolioAllocator::new(Database::open(tmp.path()).unwrap(), clock());
            thread::spawn(move || {
                (0..50)
                    .map(|_| allocator.assign_next(ISSUER, DOC).unwrap().folio.number)
                    .collect::<Vec<u64>>()
            })
        })
        .collect();

    let mut all = BTreeSet::new();
    for handle in handles {
        let seen = handle.join().unwrap();
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
        all.extend(seen);
    }
    assert_eq!(all, (1..=200).collect());
}

#[test]
fn test_used_and_void_folios_survive_reopen() {
    let tmp = NamedTempFile::new().unwrap();
    {
        let db = Database::open(tmp.path()).unwrap();
        register(&db, 1, 5);
        let allocator = FolioAllocator::new(db.clone(), clock());
        allocator.assign_next(ISSUER, DOC).unwrap();
        allocator.assign_next(ISSUER, DOC).unwrap();
        FolioStore::new(db, clock())
            .void_folio(ISSUER, DOC, 3, "printer jam")
            .unwrap();
    }

    let db = Database::open(tmp.path()).unwrap();
    let store = FolioStore::new(db.clone(), clock());
    assert_eq!(store.get_folio(ISSUER, DOC, 1).unwrap().status, FolioStatus::Used);
    assert_eq!(store.get_folio(ISSUER, DOC, 3).unwrap().status, FolioStatus::Void);

    let allocator = FolioAllocator::new(db, clock());
    assert_eq!(allocator.assign_next(ISSUER, DOC).unwrap().folio.number, 4);
    assert_eq!(allocator.assign_next(ISSUER, DOC).unwrap().folio.number, 5);
    assert!(allocator.assign_next(ISSUER, DOC).is_err());
}
