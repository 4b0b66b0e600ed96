//! In-memory store data model.
//!
//! [`StoreData`] is the decoded form of one persisted store entry: the
//! immutable [`Params`] chosen at creation and the per-task result histograms.
//! It has no knowledge of persistence; durability is the controller's job.

use std::collections::{BTreeMap, HashMap};

use crate::task::{RfBmcResult, RfBmcTask};

/// Multiset of results: result value to occurrence count.
pub type Histogram = HashMap<RfBmcResult, u64>;

/// Per-task histograms.
pub type ResultsMap = HashMap<RfBmcTask, Histogram>;

/// Store configuration fixed at creation time.
///
/// `bit_width_counter` records how many times each bit-width category was
/// selected by the sampler's configuration logic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    /// Bit width to number of times it was selected.
    pub bit_width_counter: BTreeMap<u32, u64>,
}

impl Params {
    /// Creates params from `(bit_width, count)` pairs.
    pub fn new(bit_width_counter: impl IntoIterator<Item = (u32, u64)>) -> Self {
        Self {
            bit_width_counter: bit_width_counter.into_iter().collect(),
        }
    }
}

/// Decoded contents of one store entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreData {
    /// Configuration set once at creation.
    pub params: Params,
    /// Accumulated results per task.
    pub rf_bmc_results_map: ResultsMap,
}

impl StoreData {
    /// Creates empty store data with the given params.
    pub fn new(params: Params) -> Self {
        Self {
            params,
            rf_bmc_results_map: ResultsMap::new(),
        }
    }

    /// Returns the histogram for a task, empty if the task was never seen.
    pub fn get_results(&self, task: &RfBmcTask) -> Histogram {
        self.rf_bmc_results_map.get(task).cloned().unwrap_or_default()
    }

    /// Returns the count for one `(task, result)` pair.
    pub fn count(&self, task: &RfBmcTask, result: &RfBmcResult) -> u64 {
        self.rf_bmc_results_map
            .get(task)
            .and_then(|histogram| histogram.get(result))
            .copied()
            .unwrap_or(0)
    }

    /// Increments the in-memory count of `(task, result)` by one.
    ///
    /// This mirrors an increment the backing store has already applied; it
    /// does not persist anything.
    pub fn add_result(&mut self, task: &RfBmcTask, result: &RfBmcResult) {
        self.add_result_n(task, result, 1);
    }

    /// Increments the in-memory count of `(task, result)` by `n`.
    pub(crate) fn add_result_n(&mut self, task: &RfBmcTask, result: &RfBmcResult, n: u64) {
        if n == 0 {
            return;
        }
        let count = self
            .rf_bmc_results_map
            .entry(task.clone())
            .or_default()
            .entry(*result)
            .or_insert(0);
        *count = count.saturating_add(n);
    }

    /// Returns the tasks that have at least one recorded result.
    pub fn tasks(&self) -> impl Iterator<Item = &RfBmcTask> {
        self.rf_bmc_results_map.keys()
    }

    /// Returns the number of result occurrences recorded across all tasks.
    pub fn total_occurrences(&self) -> u64 {
        self.rf_bmc_results_map
            .values()
            .flat_map(|histogram| histogram.values())
            .fold(0u64, |acc, count| acc.saturating_add(*count))
    }
}
