//! Store controller: the interface sampling workers use.
//!
//! An [`RfBmcStore`] binds one store identifier in a [`Backend`] and keeps a
//! local, possibly stale, [`StoreData`] snapshot of it.
//!
//! # Design
//!
//! - Creation writes an empty entry guarded by "must not exist"; generated
//!   identifiers are random UUIDs, regenerated on collision.
//! - Loading decodes whichever format version is stored and, when it is not
//!   [`CURRENT_VERSION`], atomically replaces the entry with its current-format
//!   encoding, guarded on the old version.
//! - Ingestion never reads-modifies-writes the entry. It sends one guarded
//!   batch of counter increments and rebuilds the local snapshot from the
//!   pre-image the backend returns, plus the same increments.
//!
//! No locks are held across calls. A worker whose increments hit a store that
//! another worker has just migrated (or that was deleted) gets
//! [`StoreError::ConcurrentMigration`]; nothing was applied, so it can
//! [`RfBmcStore::sync`] and resubmit the same batch.
//!
//! # Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use rfbmc::backend::memory::MemoryBackend;
//! use rfbmc::data::Params;
//! use rfbmc::rfm::{RfmRegistry, XorRfm};
//! use rfbmc::store::RfBmcStore;
//! use rfbmc::task::{RfBmcResult, RfBmcTask};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = MemoryBackend::new();
//! let registry = Arc::new(RfmRegistry::with_builtin());
//!
//! let ident = RfBmcStore::create(&backend, &registry, &Params::new([(8, 3)]), None, false)?;
//! let mut store = RfBmcStore::open(backend, registry, ident)?;
//!
//! let task = RfBmcTask::new(XorRfm::GUID, XorRfm::params(500), 4, 16);
//! store.add_results([(task.clone(), RfBmcResult::new(Some(16)))])?;
//! assert_eq!(store.get_results(&task)[&RfBmcResult::new(Some(16))], 1);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, Condition, UpdateItem};
use crate::codec::{self, CURRENT_VERSION, RESULTS_ATTRIBUTE, v1};
use crate::config::StoreConfig;
use crate::data::{Histogram, Params, StoreData};
use crate::error::{BackendError, Result, StoreError};
use crate::rfm::RfmRegistry;
use crate::task::{RfBmcResult, RfBmcTask};

/// Controller for one store entry.
///
/// # Thread Safety
///
/// A controller is a single-owner handle (`&mut self` for writes). Run one
/// controller per worker; they coordinate only through the backend.
#[derive(Debug)]
pub struct RfBmcStore<B> {
    backend: B,
    registry: Arc<RfmRegistry>,
    config: StoreConfig,
    ident: String,
    data: StoreData,
}

impl<B: Backend> RfBmcStore<B> {
    /// Allocates a new, empty store entry and returns its identifier.
    ///
    /// With `ident = None` a random identifier is generated; on the
    /// (practically impossible) event that it is taken, another is generated.
    /// With an explicit `ident` that already exists, the call fails unless
    /// `accept_existing` is set, in which case the identifier is returned and
    /// the existing entry is left untouched.
    ///
    /// # Errors
    ///
    /// - [`StoreError::IdentifierAlreadyExists`] for a taken explicit identifier
    /// - [`BackendError`] from the backend, unchanged
    pub fn create(
        backend: &B,
        registry: &RfmRegistry,
        params: &Params,
        ident: Option<&str>,
        accept_existing: bool,
    ) -> Result<String> {
        Self::create_with_config(
            backend,
            registry,
            params,
            ident,
            accept_existing,
            &StoreConfig::default(),
        )
    }

    /// [`RfBmcStore::create`] with an explicit configuration.
    ///
    /// # Errors
    ///
    /// As [`RfBmcStore::create`], plus [`StoreError::IdentifierAllocationExhausted`]
    /// when `config.max_create_attempts` is set and every attempt collided, and
    /// [`crate::error::ConfigError::Invalid`] for an invalid configuration.
    pub fn create_with_config(
        backend: &B,
        registry: &RfmRegistry,
        params: &Params,
        ident: Option<&str>,
        accept_existing: bool,
        config: &StoreConfig,
    ) -> Result<String> {
        config.validate()?;
        let data = StoreData::new(params.clone());

        if let Some(ident) = ident {
            let item = codec::encode_item(registry, ident, &data)?;
            return match backend.put_item(item, Condition::NotExists) {
                Ok(()) => {
                    info!(ident, "created store");
                    Ok(ident.to_string())
                }
                Err(BackendError::ConditionFailed { .. }) if accept_existing => {
                    debug!(ident, "store already exists, reusing");
                    Ok(ident.to_string())
                }
                Err(BackendError::ConditionFailed { .. }) => {
                    Err(StoreError::IdentifierAlreadyExists {
                        ident: ident.to_string(),
                    }
                    .into())
                }
                Err(e) => Err(e.into()),
            };
        }

        let mut attempts = 0u32;
        loop {
            if config.max_create_attempts.is_some_and(|max| attempts >= max) {
                return Err(StoreError::IdentifierAllocationExhausted { attempts }.into());
            }
            attempts = attempts.saturating_add(1);

            let ident = Uuid::new_v4().simple().to_string();
            let item = codec::encode_item(registry, &ident, &data)?;
            match backend.put_item(item, Condition::NotExists) {
                Ok(()) => {
                    info!(ident = %ident, attempts, "created store");
                    return Ok(ident);
                }
                Err(BackendError::ConditionFailed { .. }) => {
                    warn!(ident = %ident, "generated store identifier collided, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reads a store entry, migrating it to the current format if needed.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if no entry exists
    /// - [`crate::error::CodecError`] if the entry cannot be decoded
    /// - [`StoreError::MigrationContention`] if migration keeps losing races
    /// - [`BackendError`] from the backend, unchanged
    pub fn load_and_normalize(backend: &B, registry: &RfmRegistry, ident: &str) -> Result<StoreData> {
        Self::load_and_normalize_with_config(backend, registry, ident, &StoreConfig::default())
    }

    /// [`RfBmcStore::load_and_normalize`] with an explicit configuration.
    ///
    /// # Errors
    ///
    /// As [`RfBmcStore::load_and_normalize`].
    pub fn load_and_normalize_with_config(
        backend: &B,
        registry: &RfmRegistry,
        ident: &str,
        config: &StoreConfig,
    ) -> Result<StoreData> {
        for attempt in 1..=config.max_migration_attempts {
            let item = backend
                .get_item(ident)?
                .ok_or_else(|| StoreError::NotFound {
                    ident: ident.to_string(),
                })?;

            let (version, data) = codec::decode_item(registry, &item)?;
            if version == CURRENT_VERSION {
                return Ok(data);
            }

            info!(ident, from = version, to = CURRENT_VERSION, attempt, "migrating store format");
            let migrated = codec::encode_item(registry, ident, &data)?;
            match backend.put_item(migrated, Condition::VersionEquals(version)) {
                Ok(()) => return Ok(data),
                Err(BackendError::ConditionFailed { .. }) => {
                    debug!(ident, attempt, "store changed during migration, reloading");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::MigrationContention {
            ident: ident.to_string(),
            attempts: config.max_migration_attempts,
        }
        .into())
    }

    /// Opens a controller for an existing store, loading and normalizing it.
    ///
    /// # Errors
    ///
    /// As [`RfBmcStore::load_and_normalize`].
    pub fn open(backend: B, registry: Arc<RfmRegistry>, ident: impl Into<String>) -> Result<Self> {
        Self::open_with_config(backend, registry, ident, StoreConfig::default())
    }

    /// [`RfBmcStore::open`] with an explicit configuration.
    ///
    /// # Errors
    ///
    /// As [`RfBmcStore::load_and_normalize`], plus
    /// [`crate::error::ConfigError::Invalid`] for an invalid configuration.
    pub fn open_with_config(
        backend: B,
        registry: Arc<RfmRegistry>,
        ident: impl Into<String>,
        config: StoreConfig,
    ) -> Result<Self> {
        config.validate()?;
        let ident = ident.into();
        let data = Self::load_and_normalize_with_config(&backend, &registry, &ident, &config)?;
        Ok(Self {
            backend,
            registry,
            config,
            ident,
            data,
        })
    }

    /// Reloads the entry and replaces the cached snapshot wholesale.
    ///
    /// # Errors
    ///
    /// As [`RfBmcStore::load_and_normalize`]. The cache is unchanged on error.
    pub fn sync(&mut self) -> Result<()> {
        self.data = Self::load_and_normalize_with_config(
            &self.backend,
            &self.registry,
            &self.ident,
            &self.config,
        )?;
        Ok(())
    }

    /// Records `(task, result)` occurrences in one atomic backend update.
    ///
    /// Occurrences are tallied per distinct pair and sent as counter
    /// increments guarded on the entry existing at [`CURRENT_VERSION`]. The
    /// cached snapshot becomes the pre-update entry plus these increments. An
    /// empty input issues no write and only refreshes the cache.
    ///
    /// Once the update is committed the call succeeds. If the returned
    /// pre-image cannot be decoded (for example it holds keys of a formula
    /// module missing from this controller's registry), the cache keeps its
    /// previous contents and a warning is logged.
    ///
    /// # Errors
    ///
    /// - [`StoreError::ConcurrentMigration`] if the guard failed; no increment
    ///   was applied, so `sync` and resubmit
    /// - [`crate::error::CodecError`] if a task cannot be encoded (nothing written)
    /// - [`BackendError`] from the backend, unchanged
    pub fn add_results<I>(&mut self, task_results: I) -> Result<()>
    where
        I: IntoIterator<Item = (RfBmcTask, RfBmcResult)>,
    {
        let mut tallies: HashMap<(RfBmcTask, RfBmcResult), u64> = HashMap::new();
        for pair in task_results {
            *tallies.entry(pair).or_insert(0) += 1;
        }

        if tallies.is_empty() {
            return self.sync();
        }

        let mut increments = BTreeMap::new();
        for ((task, result), count) in &tallies {
            increments.insert(v1::encode_task_result(&self.registry, task, result)?, *count);
        }

        let update = UpdateItem {
            map_attribute: RESULTS_ATTRIBUTE.to_string(),
            increments,
            condition: Condition::VersionEquals(CURRENT_VERSION),
        };

        let previous = match self.backend.update_item(&self.ident, &update) {
            Ok(previous) => previous,
            Err(BackendError::ConditionFailed { .. }) => {
                warn!(ident = %self.ident, "version guard failed, store was migrated or removed");
                return Err(StoreError::ConcurrentMigration {
                    ident: self.ident.clone(),
                    expected_version: CURRENT_VERSION,
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        };

        // The increments are committed; from here on the call must succeed.
        match v1::decode_item(&self.registry, &previous) {
            Ok(mut data) => {
                for ((task, result), count) in &tallies {
                    data.add_result_n(task, result, *count);
                }
                self.data = data;
            }
            Err(e) => {
                warn!(
                    ident = %self.ident,
                    "results recorded but stored entry could not be decoded, cache left stale: {e}"
                );
            }
        }
        debug!(ident = %self.ident, pairs = tallies.len(), "recorded results");

        Ok(())
    }

    /// Returns the cached histogram for a task (empty if unseen).
    pub fn get_results(&self, task: &RfBmcTask) -> Histogram {
        self.data.get_results(task)
    }

    /// Iterates over the tasks in the cached snapshot.
    pub fn tasks(&self) -> impl Iterator<Item = &RfBmcTask> {
        self.data.tasks()
    }

    /// Returns the cached snapshot.
    pub fn data(&self) -> &StoreData {
        &self.data
    }

    /// Returns the store's creation-time params.
    pub fn params(&self) -> &Params {
        &self.data.params
    }

    /// Returns the store identifier.
    pub fn ident(&self) -> &str {
        &self.ident
    }

    /// Returns the backend handle.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}
