//! Integration tests for the full store lifecycle.
//!
//! These tests exercise the controller end to end against both the in-memory
//! backend and the durable directory backend, including reopening a store
//! from disk.

use std::sync::Arc;
use std::time::Duration;

use rfbmc::backend::cas::CasBackend;
use rfbmc::backend::dir::DirStore;
use rfbmc::backend::memory::MemoryBackend;
use rfbmc::backend::Backend;
use rfbmc::data::Params;
use rfbmc::error::{RfBmcError, StoreError};
use rfbmc::rfm::{HashFamilyRfm, RfmRegistry, XorRfm};
use rfbmc::store::RfBmcStore;
use rfbmc::task::{RfBmcResult, RfBmcTask};
use tempfile::tempdir;

fn registry() -> Arc<RfmRegistry> {
    Arc::new(RfmRegistry::with_builtin())
}

fn params() -> Params {
    Params::new([(8, 3), (16, 1)])
}

fn t1() -> RfBmcTask {
    RfBmcTask::new(XorRfm::GUID, XorRfm::params(500), 4, 16)
}

fn t2() -> RfBmcTask {
    RfBmcTask::new(HashFamilyRfm::GUID, HashFamilyRfm::params("tabulation", 64), 2, 8)
}

fn r1() -> RfBmcResult {
    RfBmcResult::new(Some(16))
}

fn r2() -> RfBmcResult {
    RfBmcResult::new(None)
}

/// Runs the two-worker scenario against any backend handle.
fn two_worker_scenario<B: Backend + Clone>(backend: B) {
    let reg = registry();
    let ident = RfBmcStore::create(&backend, &reg, &params(), None, false).unwrap();

    let mut first = RfBmcStore::open(backend.clone(), reg.clone(), ident.clone()).unwrap();
    assert_eq!(first.params(), &params());

    first.add_results([(t1(), r1()), (t1(), r1()), (t1(), r2())]).unwrap();
    let histogram = first.get_results(&t1());
    assert_eq!(histogram.len(), 2);
    assert_eq!(histogram[&r1()], 2);
    assert_eq!(histogram[&r2()], 1);

    let mut second = RfBmcStore::open(backend.clone(), reg, ident).unwrap();
    second.add_results([(t1(), r1())]).unwrap();
    assert_eq!(second.get_results(&t1())[&r1()], 3);

    // The first controller is stale until it syncs.
    assert_eq!(first.get_results(&t1())[&r1()], 2);
    first.sync().unwrap();
    let histogram = first.get_results(&t1());
    assert_eq!(histogram[&r1()], 3);
    assert_eq!(histogram[&r2()], 1);
    assert!(first.get_results(&t2()).is_empty());
}

#[test]
fn test_two_workers_memory_backend() {
    two_worker_scenario(MemoryBackend::new());
}

#[test]
fn test_two_workers_dir_backend() {
    let temp_dir = tempdir().unwrap();
    let store = DirStore::open(temp_dir.path().join("results"), Duration::from_secs(5)).unwrap();
    two_worker_scenario(Arc::new(CasBackend::new(store)));
}

#[test]
fn test_reopen_from_disk() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("results");
    let reg = registry();

    // Phase 1: create and record
    let ident = {
        let backend = CasBackend::new(DirStore::open(&path, Duration::from_secs(5)).unwrap());
        let ident = RfBmcStore::create(&backend, &reg, &params(), Some("run-7"), false).unwrap();
        let mut store = RfBmcStore::open(backend, reg.clone(), ident.clone()).unwrap();
        store.add_results([(t1(), r1()), (t2(), r2()), (t2(), r2())]).unwrap();
        ident
    };

    // Phase 2: a fresh process sees the same data
    let backend = CasBackend::new(DirStore::open(&path, Duration::from_secs(5)).unwrap());
    let store = RfBmcStore::open(backend, reg, ident).unwrap();
    assert_eq!(store.ident(), "run-7");
    assert_eq!(store.params(), &params());
    assert_eq!(store.get_results(&t1())[&r1()], 1);
    assert_eq!(store.get_results(&t2())[&r2()], 2);
    assert_eq!(store.data().total_occurrences(), 3);
}

#[test]
fn test_explicit_identifier_reuse() {
    let backend = MemoryBackend::new();
    let reg = registry();

    let first = RfBmcStore::create(&backend, &reg, &params(), Some("shared"), true).unwrap();
    let mut store = RfBmcStore::open(backend.clone(), reg.clone(), first.clone()).unwrap();
    store.add_results([(t1(), r1())]).unwrap();

    let second =
        RfBmcStore::create(&backend, &reg, &Params::new([(4, 1)]), Some("shared"), true).unwrap();
    assert_eq!(first, second);

    store.sync().unwrap();
    assert_eq!(store.params(), &params());
    assert_eq!(store.get_results(&t1())[&r1()], 1);

    match RfBmcStore::create(&backend, &reg, &params(), Some("shared"), false) {
        Err(RfBmcError::Store(StoreError::IdentifierAlreadyExists { .. })) => {}
        other => panic!("Expected IdentifierAlreadyExists, got: {:?}", other),
    }
}

#[test]
fn test_generated_identifiers_are_unique() {
    let backend = MemoryBackend::new();
    let reg = registry();
    let mut seen = std::collections::HashSet::new();
    for _ in 0..200 {
        let ident = RfBmcStore::create(&backend, &reg, &params(), None, false).unwrap();
        assert!(seen.insert(ident));
    }
    assert_eq!(backend.len(), 200);
}

#[test]
fn test_empty_batch_leaves_document_untouched() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("results");
    let reg = registry();
    let backend = CasBackend::new(DirStore::open(&path, Duration::from_secs(5)).unwrap());

    let ident = RfBmcStore::create(&backend, &reg, &params(), Some("quiet"), false).unwrap();
    let mut store = RfBmcStore::open(&backend, reg, ident).unwrap();
    store.add_results([(t1(), r1())]).unwrap();

    let document = path.join("quiet.json");
    let before = std::fs::read(&document).unwrap();
    store.add_results(Vec::new()).unwrap();
    assert_eq!(std::fs::read(&document).unwrap(), before);
    assert_eq!(store.get_results(&t1())[&r1()], 1);
}

#[test]
fn test_leftover_lock_file_after_crash() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("results");
    let reg = registry();
    let backend = CasBackend::new(DirStore::open(&path, Duration::from_millis(200)).unwrap());

    let ident = RfBmcStore::create(&backend, &reg, &params(), Some("run"), false).unwrap();
    let mut store = RfBmcStore::open(&backend, reg, ident).unwrap();

    // A writer died here; its lock file stays but the OS released its lock.
    std::fs::write(path.join("run.lock"), b"").unwrap();

    for _ in 0..3 {
        store.add_results([(t1(), r1())]).unwrap();
    }
    assert_eq!(store.get_results(&t1())[&r1()], 3);
}
