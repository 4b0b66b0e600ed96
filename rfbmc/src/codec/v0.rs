//! Format version 0: whole-store JSON snapshot (legacy, read for migration).
//!
//! Version 0 entries carry no `version` attribute. The entire store lives in a
//! single `snapshot` string attribute:
//!
//! ```text
//! {
//!   "bit_width_counter": { "8": 3 },
//!   "tasks": [
//!     { "rfm_guid": "xor", "rfm_formula_params": "500", "a": 4, "q": 16,
//!       "histogram": [ [16, 2], [null, 1] ] }
//!   ]
//! }
//! ```
//!
//! Because updating it means rewriting the whole snapshot, concurrent writers
//! could lose increments. Entries in this format are migrated to
//! [`super::v1`] on load.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::backend::{AttributeValue, Item};
use crate::data::{Params, StoreData};
use crate::error::CodecError;
use crate::rfm::RfmRegistry;
use crate::task::{RfBmcResult, RfBmcTask};

/// This format's version number.
pub const VERSION: u64 = 0;

/// Attribute holding the JSON snapshot.
pub const SNAPSHOT_ATTRIBUTE: &str = "snapshot";

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    bit_width_counter: BTreeMap<u32, u64>,
    tasks: Vec<TaskRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskRecord {
    rfm_guid: String,
    rfm_formula_params: String,
    a: u32,
    q: u32,
    histogram: Vec<(Option<u64>, u64)>,
}

/// Decodes a version-0 entry.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the snapshot is missing or invalid,
/// or [`CodecError::UnknownRfm`] for an unregistered module.
pub fn decode_item(registry: &RfmRegistry, item: &Item) -> Result<StoreData, CodecError> {
    let json = item
        .get(SNAPSHOT_ATTRIBUTE)
        .and_then(AttributeValue::as_str)
        .ok_or_else(|| CodecError::Malformed {
            kind: "snapshot",
            encoded: item.id.clone(),
            reason: "missing snapshot string".to_string(),
        })?;

    let snapshot: Snapshot = serde_json::from_str(json).map_err(|e| CodecError::Malformed {
        kind: "snapshot",
        encoded: json.to_string(),
        reason: e.to_string(),
    })?;

    let mut data = StoreData::new(Params {
        bit_width_counter: snapshot.bit_width_counter,
    });

    for record in snapshot.tasks {
        let rfm_formula_params = registry
            .get(&record.rfm_guid)?
            .decode_formula_params(&record.rfm_formula_params)?;
        let task = RfBmcTask {
            rfm_guid: record.rfm_guid,
            rfm_formula_params,
            a: record.a,
            q: record.q,
        };
        // Duplicate records for the same task are summed.
        for (bmc, count) in record.histogram {
            data.add_result_n(&task, &RfBmcResult { bmc }, count);
        }
    }

    Ok(data)
}

/// Encodes store data as a version-0 entry.
///
/// Only used to seed legacy entries (imports, migration tests); the store
/// controller never writes this format.
///
/// # Errors
///
/// Returns [`CodecError`] if a task's module is unknown or rejects its parameters.
pub fn encode_item(registry: &RfmRegistry, ident: &str, data: &StoreData) -> Result<Item, CodecError> {
    let mut tasks: Vec<TaskRecord> = Vec::with_capacity(data.rf_bmc_results_map.len());
    for (task, histogram) in &data.rf_bmc_results_map {
        let mut histogram: Vec<(Option<u64>, u64)> =
            histogram.iter().map(|(result, count)| (result.bmc, *count)).collect();
        histogram.sort_unstable();
        tasks.push(TaskRecord {
            rfm_guid: task.rfm_guid.clone(),
            rfm_formula_params: registry
                .get(&task.rfm_guid)?
                .encode_formula_params(&task.rfm_formula_params)?,
            a: task.a,
            q: task.q,
            histogram,
        });
    }
    tasks.sort_unstable_by(|x, y| {
        (&x.rfm_guid, &x.rfm_formula_params, x.a, x.q).cmp(&(&y.rfm_guid, &y.rfm_formula_params, y.a, y.q))
    });

    let snapshot = Snapshot {
        bit_width_counter: data.params.bit_width_counter.clone(),
        tasks,
    };
    let json = serde_json::to_string(&snapshot).map_err(|e| CodecError::Malformed {
        kind: "snapshot",
        encoded: ident.to_string(),
        reason: e.to_string(),
    })?;

    Ok(Item::new(ident).with(SNAPSHOT_ATTRIBUTE, AttributeValue::String(json)))
}
