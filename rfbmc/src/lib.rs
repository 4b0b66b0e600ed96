//! # rfbmc
//!
//! Versioned, concurrency-safe counting store for RF-BMC sampling results.
//!
//! Workers running randomized bounded model counting (RF-BMC) repeatedly
//! execute sampling tasks and report each outcome. rfbmc accumulates those
//! outcomes as per-task histograms inside a plain key-value store, so that
//! any number of workers can report concurrently without losing counts.
//!
//! ## Key Properties
//!
//! - Counts are atomic, commutative increments; workers never read-modify-write
//!   a whole entry
//! - Optimistic concurrency: a version guard detects format changes, no locks
//! - Canonical, reversible string encoding of tasks and results as map keys
//! - Online format migration of legacy entries on load
//! - Pluggable restrictive-formula modules via an [`RfmRegistry`]
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use rfbmc::{MemoryBackend, Params, RfBmcResult, RfBmcStore, RfBmcTask, RfmRegistry, XorRfm};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = MemoryBackend::new();
//! let registry = Arc::new(RfmRegistry::with_builtin());
//!
//! // Allocate a store
//! let ident = RfBmcStore::create(&backend, &registry, &Params::new([(8, 3), (16, 1)]), None, false)?;
//!
//! // Two workers on the same store
//! let mut w1 = RfBmcStore::open(backend.clone(), registry.clone(), ident.clone())?;
//! let mut w2 = RfBmcStore::open(backend.clone(), registry.clone(), ident)?;
//!
//! let task = RfBmcTask::new(XorRfm::GUID, XorRfm::params(500), 4, 16);
//! let hit = RfBmcResult::new(Some(16));
//! w1.add_results([(task.clone(), hit), (task.clone(), hit)])?;
//! w2.add_results([(task.clone(), hit)])?;
//!
//! w1.sync()?;
//! assert_eq!(w1.get_results(&task)[&hit], 3);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`RfBmcStore`] — Controller: create, load/migrate, sync, add results
//! - [`StoreData`] — Decoded params and histograms
//! - [`Backend`] — Key-value contract with a guarded atomic increment
//! - [`codec`] — Versioned encoding of store data into backend items
//!
//! ## Modules
//!
//! - [`store`] — Store controller
//! - [`data`] — In-memory data model
//! - [`task`] — Task and result value types
//! - [`rfm`] — Formula module codecs and registry
//! - [`codec`] — Format versions and canonical strings
//! - [`backend`] — Backing access layer and implementations
//! - [`config`] — Configuration
//! - [`error`] — Error types

pub mod backend;
pub mod codec;
pub mod config;
pub mod data;
pub mod error;
pub mod rfm;
pub mod store;
pub mod task;

// Re-export primary API types at crate root for convenience.
pub use backend::memory::MemoryBackend;
pub use backend::{Backend, Condition, Item};
pub use config::{RetryConfig, StoreConfig};
pub use data::{Histogram, Params, StoreData};
pub use error::{Result, RfBmcError};
pub use rfm::{HashFamilyRfm, RfmCodec, RfmRegistry, XorRfm};
pub use store::RfBmcStore;
pub use task::{FormulaParams, ParamValue, RfBmcResult, RfBmcTask};
