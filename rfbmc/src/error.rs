//! Error types for the rfbmc result store.

use thiserror::Error;

/// The main error type for all rfbmc operations.
///
/// This enum covers every failure a caller can observe, from decoding a
/// persisted entry to losing an optimistic-concurrency race against another
/// worker.
#[derive(Error, Debug)]
pub enum RfBmcError {
    /// Error while encoding or decoding a task, result, or store entry.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Error raised by the store controller (lifecycle, migration, ingestion).
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Error surfaced unchanged from the backing key-value store.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Error loading or validating configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl RfBmcError {
    /// Returns true if the failed operation can be retried after a reload.
    ///
    /// Only version-guard failures qualify; the caller should run
    /// [`crate::store::RfBmcStore::sync`] and then resubmit the batch.
    pub fn is_concurrent_migration(&self) -> bool {
        matches!(self, Self::Store(StoreError::ConcurrentMigration { .. }))
    }
}

/// Errors produced by the versioned codec.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The encoded value does not follow the codec grammar.
    #[error("malformed {kind} encoding '{encoded}': {reason}")]
    Malformed {
        /// What was being decoded (e.g. "task", "result").
        kind: &'static str,
        /// The offending encoded text.
        encoded: String,
        /// Why it was rejected.
        reason: String,
    },

    /// No formula module is registered under the given identifier.
    #[error("unknown restrictive formula module '{guid}'")]
    UnknownRfm {
        /// The module identifier found in the task.
        guid: String,
    },

    /// The stored entry uses a format version this build cannot read.
    #[error("unsupported store format version {version}")]
    UnsupportedVersion {
        /// The version recorded in the entry.
        version: u64,
    },
}

/// Errors raised by the store controller.
#[derive(Error, Debug)]
pub enum StoreError {
    /// An explicit identifier was requested but an entry already exists.
    #[error("store identifier '{ident}' already exists")]
    IdentifierAlreadyExists {
        /// The conflicting identifier.
        ident: String,
    },

    /// The version-guarded update found the entry missing or re-formatted.
    #[error("store '{ident}' is missing or no longer at format version {expected_version}")]
    ConcurrentMigration {
        /// The store identifier.
        ident: String,
        /// The format version the update was guarded on.
        expected_version: u64,
    },

    /// No entry exists for the identifier.
    #[error("store '{ident}' not found")]
    NotFound {
        /// The missing identifier.
        ident: String,
    },

    /// Every generated identifier collided with an existing entry.
    #[error("could not allocate a fresh store identifier after {attempts} attempts")]
    IdentifierAllocationExhausted {
        /// Number of identifiers tried.
        attempts: u32,
    },

    /// Format migration kept racing with other writers.
    #[error("migration of store '{ident}' did not settle after {attempts} attempts")]
    MigrationContention {
        /// The store identifier.
        ident: String,
        /// Number of load/migrate rounds attempted.
        attempts: u32,
    },
}

/// Errors reported by a backing key-value store.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Transport or storage failure; recovery policy belongs to the caller.
    #[error("backend unavailable during {operation}: {reason}")]
    Unavailable {
        /// The backend operation that failed.
        operation: &'static str,
        /// Description of the failure.
        reason: String,
        /// The underlying I/O error, when there is one.
        #[source]
        source: Option<std::io::Error>,
    },

    /// The write condition did not hold; nothing was modified.
    #[error("condition check failed for item '{id}'")]
    ConditionFailed {
        /// The item identifier.
        id: String,
    },

    /// The compare-and-swap emulation lost every race it entered.
    #[error("compare-and-swap on item '{id}' failed after {attempts} attempts")]
    Contention {
        /// The item identifier.
        id: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// A stored item could not be parsed.
    #[error("item '{id}' is corrupted: {reason}")]
    Corrupted {
        /// The item identifier.
        id: String,
        /// Description of the corruption.
        reason: String,
    },

    /// An increment would overflow a counter field.
    #[error("counter '{field}' of item '{id}' would overflow")]
    CounterOverflow {
        /// The item identifier.
        id: String,
        /// The map field being incremented.
        field: String,
    },

    /// The update targets an attribute that is not a map.
    #[error("attribute '{attribute}' of item '{id}' is not a map")]
    NotAMap {
        /// The item identifier.
        id: String,
        /// The attribute name.
        attribute: String,
    },
}

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        /// The config file path.
        path: std::path::PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`crate::config::StoreConfig`].
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The config file path.
        path: std::path::PathBuf,
        /// The underlying JSON parsing error.
        #[source]
        source: serde_json::Error,
    },

    /// A configuration value is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Type alias for `Result<T, RfBmcError>`.
pub type Result<T> = std::result::Result<T, RfBmcError>;
