//! Compare-and-swap emulation of the guarded atomic update.
//!
//! Many key-value services offer only "write if revision unchanged". A
//! [`CasBackend`] builds the full [`Backend`] contract on top of such a
//! [`RevisionedStore`]: it reads the item with its revision, evaluates the
//! condition and computes the new item locally, then commits with a
//! compare-and-swap on the revision. A lost race re-reads and tries again
//! after an exponential, jittered backoff.
//!
//! # Retry Flow
//!
//! ```text
//! read(id) ──► condition? ──no──► ConditionFailed
//!                  │yes
//!                  ▼
//!          compute next item
//!                  │
//!     compare_and_swap(id, rev) ──conflict──► sleep(backoff) ──► read(id)
//!                  │ok
//!                  ▼
//!            return pre-image
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use super::{Backend, Condition, Item, UpdateItem, apply_increments};
use crate::config::RetryConfig;
use crate::error::BackendError;

/// An item together with the store revision it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revisioned {
    /// Per-item revision, increasing with every write.
    pub revision: u64,
    /// The stored item.
    pub item: Item,
}

/// A store whose only conditional write is compare-and-swap on a revision.
pub trait RevisionedStore: Send + Sync {
    /// Reads an item with its revision.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Unavailable`] or [`BackendError::Corrupted`] on failure.
    fn read(&self, id: &str) -> Result<Option<Revisioned>, BackendError>;

    /// Replaces (`Some`) or removes (`None`) the item if its current revision
    /// equals `expected` (`None` meaning "absent").
    ///
    /// Returns `false` if the revision did not match; nothing is written then.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Unavailable`] on storage failure.
    fn compare_and_swap(
        &self,
        id: &str,
        expected: Option<u64>,
        item: Option<&Item>,
    ) -> Result<bool, BackendError>;
}

/// What one attempt of the retry loop decided to do.
enum Plan<T> {
    /// Finish without writing.
    Done(T),
    /// Commit `item` (or delete when `None`) and return `output` on success.
    Write { item: Option<Item>, output: T },
}

/// [`Backend`] over a [`RevisionedStore`] using optimistic retries.
#[derive(Debug, Clone)]
pub struct CasBackend<S> {
    store: S,
    retry: RetryConfig,
}

impl<S: RevisionedStore> CasBackend<S> {
    /// Wraps a revisioned store with the default retry policy.
    pub fn new(store: S) -> Self {
        Self::with_retry(store, RetryConfig::default())
    }

    /// Wraps a revisioned store with an explicit retry policy.
    pub fn with_retry(store: S, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Returns the wrapped store.
    pub fn inner(&self) -> &S {
        &self.store
    }

    /// Runs `attempt` until its write commits or it finishes without writing.
    fn run<T>(
        &self,
        id: &str,
        operation: &'static str,
        mut attempt: impl FnMut(Option<&Item>) -> Result<Plan<T>, BackendError>,
    ) -> Result<T, BackendError> {
        let mut attempts = 0u32;
        let mut backoff_ms = self.retry.initial_backoff_ms;

        loop {
            let current = self.store.read(id)?;
            let expected = current.as_ref().map(|r| r.revision);

            let (item, output) = match attempt(current.as_ref().map(|r| &r.item))? {
                Plan::Done(output) => return Ok(output),
                Plan::Write { item, output } => (item, output),
            };

            if self.store.compare_and_swap(id, expected, item.as_ref())? {
                return Ok(output);
            }

            attempts += 1;
            if attempts >= self.retry.max_retries {
                return Err(BackendError::Contention {
                    id: id.to_string(),
                    attempts,
                });
            }

            debug!(id, operation, attempts, backoff_ms, "revision conflict, retrying");
            let jitter = rand::rng().random_range(0..=backoff_ms);
            std::thread::sleep(Duration::from_millis(jitter));
            backoff_ms = self.retry.next_backoff_ms(backoff_ms);
        }
    }
}

impl<S: RevisionedStore> Backend for CasBackend<S> {
    fn get_item(&self, id: &str) -> Result<Option<Item>, BackendError> {
        Ok(self.store.read(id)?.map(|r| r.item))
    }

    fn put_item(&self, item: Item, condition: Condition) -> Result<(), BackendError> {
        let id = item.id.clone();
        self.run(&id, "put_item", |current| {
            if !condition.holds(current) {
                return Err(BackendError::ConditionFailed { id: id.clone() });
            }
            Ok(Plan::Write {
                item: Some(item.clone()),
                output: (),
            })
        })
    }

    fn delete_item(&self, id: &str, condition: Condition) -> Result<(), BackendError> {
        self.run(id, "delete_item", |current| {
            if !condition.holds(current) {
                return Err(BackendError::ConditionFailed { id: id.to_string() });
            }
            match current {
                None => Ok(Plan::Done(())),
                Some(_) => Ok(Plan::Write {
                    item: None,
                    output: (),
                }),
            }
        })
    }

    fn update_item(&self, id: &str, update: &UpdateItem) -> Result<Item, BackendError> {
        self.run(id, "update_item", |current| {
            if !update.condition.holds(current) {
                return Err(BackendError::ConditionFailed { id: id.to_string() });
            }
            let previous = current.cloned().unwrap_or_else(|| Item::new(id));
            let mut next = previous.clone();
            apply_increments(&mut next, update)?;
            Ok(Plan::Write {
                item: Some(next),
                output: previous,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AttributeValue, VERSION_ATTRIBUTE};
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Revisioned map that can be told to lose the next few races.
    #[derive(Default)]
    struct FlakyStore {
        items: Mutex<HashMap<String, Revisioned>>,
        conflicts_left: AtomicU32,
    }

    impl RevisionedStore for FlakyStore {
        fn read(&self, id: &str) -> Result<Option<Revisioned>, BackendError> {
            Ok(self.items.lock().get(id).cloned())
        }

        fn compare_and_swap(
            &self,
            id: &str,
            expected: Option<u64>,
            item: Option<&Item>,
        ) -> Result<bool, BackendError> {
            if self
                .conflicts_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Ok(false);
            }
            let mut items = self.items.lock();
            let current = items.get(id).map(|r| r.revision);
            if current != expected {
                return Ok(false);
            }
            match item {
                Some(item) => {
                    let revision = current.unwrap_or(0) + 1;
                    items.insert(
                        id.to_string(),
                        Revisioned {
                            revision,
                            item: item.clone(),
                        },
                    );
                }
                None => {
                    items.remove(id);
                }
            }
            Ok(true)
        }
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 0,
            max_backoff_ms: 1,
        }
    }

    fn bump(amount: u64) -> UpdateItem {
        UpdateItem {
            map_attribute: "counts".to_string(),
            increments: BTreeMap::from([("x".to_string(), amount)]),
            condition: Condition::VersionEquals(1),
        }
    }

    fn v1_item(id: &str) -> Item {
        Item::new(id).with(VERSION_ATTRIBUTE, AttributeValue::Number(1))
    }

    #[test]
    fn test_update_retries_through_conflicts() {
        let backend = CasBackend::with_retry(FlakyStore::default(), fast_retry(10));
        backend.put_item(v1_item("a"), Condition::NotExists).unwrap();

        backend.inner().conflicts_left.store(3, Ordering::SeqCst);
        let before = backend.update_item("a", &bump(4)).unwrap();
        assert_eq!(before, v1_item("a"));

        let stored = backend.inner().read("a").unwrap().unwrap();
        assert_eq!(stored.revision, 2);
        let counts = stored.item.get("counts").and_then(AttributeValue::as_map).unwrap();
        assert_eq!(counts["x"], AttributeValue::Number(4));
    }

    #[test]
    fn test_update_gives_up_after_max_retries() {
        let backend = CasBackend::with_retry(FlakyStore::default(), fast_retry(3));
        backend.put_item(v1_item("a"), Condition::NotExists).unwrap();

        backend.inner().conflicts_left.store(100, Ordering::SeqCst);
        match backend.update_item("a", &bump(1)).unwrap_err() {
            BackendError::Contention { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("Expected Contention, got: {:?}", other),
        }
    }

    #[test]
    fn test_condition_failure_is_not_retried() {
        let backend = CasBackend::with_retry(FlakyStore::default(), fast_retry(3));
        let err = backend.update_item("missing", &bump(1)).unwrap_err();
        assert!(matches!(err, BackendError::ConditionFailed { .. }));
        assert!(backend.get_item("missing").unwrap().is_none());
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let backend = CasBackend::new(FlakyStore::default());
        backend.delete_item("missing", Condition::Always).unwrap();
        assert!(backend.delete_item("missing", Condition::Exists).is_err());
    }

    #[test]
    fn test_concurrent_updates_over_cas() {
        let backend = CasBackend::with_retry(FlakyStore::default(), fast_retry(10_000));
        backend.put_item(v1_item("a"), Condition::NotExists).unwrap();

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..100 {
                        backend.update_item("a", &bump(1)).unwrap();
                    }
                });
            }
        });

        let item = backend.get_item("a").unwrap().unwrap();
        let counts = item.get("counts").and_then(AttributeValue::as_map).unwrap();
        assert_eq!(counts["x"], AttributeValue::Number(400));
    }
}
