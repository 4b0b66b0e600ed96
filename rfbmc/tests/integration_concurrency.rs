//! Integration tests for concurrent result ingestion.
//!
//! Many controllers share one store and submit overlapping batches from
//! separate threads. Whatever the interleaving, every submitted occurrence
//! must be counted exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rfbmc::backend::Backend;
use rfbmc::backend::cas::CasBackend;
use rfbmc::backend::dir::DirStore;
use rfbmc::backend::memory::MemoryBackend;
use rfbmc::codec::v0;
use rfbmc::config::{RetryConfig, StoreConfig};
use rfbmc::data::{Params, StoreData};
use rfbmc::rfm::{RfmRegistry, XorRfm};
use rfbmc::store::RfBmcStore;
use rfbmc::task::{RfBmcResult, RfBmcTask};
use rfbmc::{Condition, Result};
use tempfile::tempdir;

fn registry() -> Arc<RfmRegistry> {
    Arc::new(RfmRegistry::with_builtin())
}

fn task(a: u32) -> RfBmcTask {
    RfBmcTask::new(XorRfm::GUID, XorRfm::params(250), a, 8)
}

/// Deterministic batch for a worker: overlapping tasks and results.
fn batch(worker: u32, round: u32) -> Vec<(RfBmcTask, RfBmcResult)> {
    (0..6)
        .map(|i| {
            let a = (worker + round + i) % 3;
            let bmc = if i % 4 == 0 { None } else { Some(u64::from((worker * i) % 5)) };
            (task(a), RfBmcResult::new(bmc))
        })
        .collect()
}

fn expected_counts(workers: u32, rounds: u32) -> HashMap<(RfBmcTask, RfBmcResult), u64> {
    let mut expected = HashMap::new();
    for worker in 0..workers {
        for round in 0..rounds {
            for pair in batch(worker, round) {
                *expected.entry(pair).or_insert(0) += 1;
            }
        }
    }
    expected
}

/// Submits a batch, resyncing and resubmitting after a version-guard failure.
fn submit_with_retry<B: Backend>(
    store: &mut RfBmcStore<B>,
    pairs: Vec<(RfBmcTask, RfBmcResult)>,
) -> Result<()> {
    loop {
        match store.add_results(pairs.clone()) {
            Err(e) if e.is_concurrent_migration() => store.sync()?,
            other => return other,
        }
    }
}

fn assert_counts(data: &StoreData, expected: &HashMap<(RfBmcTask, RfBmcResult), u64>) {
    let total: u64 = expected.values().sum();
    assert_eq!(data.total_occurrences(), total);
    for ((task, result), count) in expected {
        assert_eq!(data.count(task, result), *count, "count for {task} / {result}");
    }
}

fn hammer<B: Backend + Clone>(backend: B, ident: &str, workers: u32, rounds: u32) {
    let reg = registry();
    std::thread::scope(|s| {
        for worker in 0..workers {
            let backend = backend.clone();
            let reg = reg.clone();
            s.spawn(move || {
                let mut store = RfBmcStore::open(backend, reg, ident).unwrap();
                for round in 0..rounds {
                    submit_with_retry(&mut store, batch(worker, round)).unwrap();
                }
            });
        }
    });
}

#[test]
fn test_concurrent_workers_memory_backend() {
    let backend = MemoryBackend::new();
    let reg = registry();
    let ident = RfBmcStore::create(&backend, &reg, &Params::new([(8, 1)]), None, false).unwrap();

    hammer(backend.clone(), &ident, 8, 50);

    let data = RfBmcStore::load_and_normalize(&backend, &reg, &ident).unwrap();
    assert_counts(&data, &expected_counts(8, 50));
}

#[test]
fn test_concurrent_workers_dir_backend() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("results");
    let reg = registry();
    let retry = RetryConfig {
        max_retries: 10_000,
        initial_backoff_ms: 1,
        max_backoff_ms: 8,
    };
    let backend = Arc::new(CasBackend::with_retry(
        DirStore::open(&path, Duration::from_secs(10)).unwrap(),
        retry,
    ));
    let ident = RfBmcStore::create(&backend, &reg, &Params::new([(8, 1)]), None, false).unwrap();

    hammer(backend.clone(), &ident, 4, 10);

    let data = RfBmcStore::load_and_normalize(&backend, &reg, &ident).unwrap();
    assert_counts(&data, &expected_counts(4, 10));
}

#[test]
fn test_workers_race_with_migration() {
    let backend = MemoryBackend::new();
    let reg = registry();

    let mut legacy = StoreData::new(Params::new([(8, 2)]));
    legacy.add_result(&task(0), &RfBmcResult::new(Some(1)));
    backend
        .put_item(v0::encode_item(&reg, "legacy", &legacy).unwrap(), Condition::NotExists)
        .unwrap();

    // Every worker opens (and so may migrate) the legacy entry concurrently.
    hammer(backend.clone(), "legacy", 6, 20);

    let mut expected = expected_counts(6, 20);
    *expected.entry((task(0), RfBmcResult::new(Some(1)))).or_insert(0) += 1;

    let data = RfBmcStore::load_and_normalize(&backend, &reg, "legacy").unwrap();
    assert_eq!(data.params, Params::new([(8, 2)]));
    assert_counts(&data, &expected);
}

#[test]
fn test_controller_cache_matches_backend_after_write() {
    let backend = MemoryBackend::new();
    let reg = registry();
    let ident = RfBmcStore::create(&backend, &reg, &Params::default(), None, false).unwrap();
    let config = StoreConfig::default();

    let mut a = RfBmcStore::open_with_config(backend.clone(), reg.clone(), ident.clone(), config.clone())
        .unwrap();
    let mut b = RfBmcStore::open_with_config(backend.clone(), reg.clone(), ident.clone(), config)
        .unwrap();

    a.add_results(batch(1, 0)).unwrap();
    b.add_results(batch(2, 0)).unwrap();
    a.add_results(batch(3, 0)).unwrap();

    // `a` wrote last, so its cache is the backend state.
    let fresh = RfBmcStore::load_and_normalize(&backend, &reg, &ident).unwrap();
    assert_eq!(a.data(), &fresh);
    assert_ne!(b.data(), &fresh);
}
