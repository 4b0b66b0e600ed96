//! Format version 1: flat, atomically incrementable counters.
//!
//! # Canonical Strings
//!
//! All strings are compact JSON arrays, which gives escaping and
//! unambiguous nesting for free:
//!
//! ```text
//! task         ["xor","500",4,16]          [rfm_guid, module blob, a, q]
//! result       [16]  or  [null]            [bmc]
//! task-result  ["[\"xor\",\"500\",4,16]","[16]"]
//! ```
//!
//! Decoders accept only the exact spelling the encoders produce, so every
//! stored key has a single decoded value and vice versa.
//!
//! # Entry Layout
//!
//! ```text
//! {
//!   id: <ident>,
//!   version: N(1),
//!   params: M{ bit_width_counter: M{ "8": N(3), "16": N(1) } },
//!   rf_bmc_results_map: M{ <task-result>: N(count), ... }
//! }
//! ```

use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{PARAMS_ATTRIBUTE, RESULTS_ATTRIBUTE};
use crate::backend::{AttributeValue, Item, VERSION_ATTRIBUTE};
use crate::data::{Params, ResultsMap, StoreData};
use crate::error::CodecError;
use crate::rfm::RfmRegistry;
use crate::task::{RfBmcResult, RfBmcTask};

/// This format's version number.
pub const VERSION: u64 = 1;

/// Key of the bit-width table inside the params map.
const BIT_WIDTH_COUNTER: &str = "bit_width_counter";

fn malformed(kind: &'static str, encoded: &str, reason: impl Into<String>) -> CodecError {
    CodecError::Malformed {
        kind,
        encoded: encoded.to_string(),
        reason: reason.into(),
    }
}

fn to_json<T: Serialize + ?Sized>(kind: &'static str, value: &T) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(|e| malformed(kind, "<unencodable>", e.to_string()))
}

fn from_json<T: DeserializeOwned>(kind: &'static str, encoded: &str) -> Result<T, CodecError> {
    serde_json::from_str(encoded).map_err(|e| malformed(kind, encoded, e.to_string()))
}

fn require_canonical(kind: &'static str, encoded: &str, canonical: &str) -> Result<(), CodecError> {
    if encoded == canonical {
        Ok(())
    } else {
        Err(malformed(kind, encoded, format!("non-canonical spelling of {canonical}")))
    }
}

/// Encodes a task as `[rfm_guid, module_blob, a, q]`.
///
/// # Errors
///
/// Returns [`CodecError::UnknownRfm`] if the task's module is not registered,
/// or the module's error if it rejects the parameters.
pub fn encode_task(registry: &RfmRegistry, task: &RfBmcTask) -> Result<String, CodecError> {
    let blob = registry
        .get(&task.rfm_guid)?
        .encode_formula_params(&task.rfm_formula_params)?;
    to_json("task", &(&task.rfm_guid, blob, task.a, task.q))
}

/// Decodes a task encoded by [`encode_task`].
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] for text outside the grammar and
/// [`CodecError::UnknownRfm`] for an unregistered module.
pub fn decode_task(registry: &RfmRegistry, encoded: &str) -> Result<RfBmcTask, CodecError> {
    let (rfm_guid, blob, a, q): (String, String, u32, u32) = from_json("task", encoded)?;
    let rfm_formula_params = registry.get(&rfm_guid)?.decode_formula_params(&blob)?;
    let task = RfBmcTask {
        rfm_guid,
        rfm_formula_params,
        a,
        q,
    };
    require_canonical("task", encoded, &encode_task(registry, &task)?)?;
    Ok(task)
}

/// Encodes a result as `[bmc]`.
pub fn encode_result(result: &RfBmcResult) -> String {
    match result.bmc {
        Some(count) => format!("[{count}]"),
        None => "[null]".to_string(),
    }
}

/// Decodes a result encoded by [`encode_result`].
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] for text outside the grammar.
pub fn decode_result(encoded: &str) -> Result<RfBmcResult, CodecError> {
    let (bmc,): (Option<u64>,) = from_json("result", encoded)?;
    let result = RfBmcResult { bmc };
    require_canonical("result", encoded, &encode_result(&result))?;
    Ok(result)
}

/// Encodes a `(task, result)` pair as one map-field key.
///
/// # Errors
///
/// Propagates [`encode_task`] errors.
pub fn encode_task_result(
    registry: &RfmRegistry,
    task: &RfBmcTask,
    result: &RfBmcResult,
) -> Result<String, CodecError> {
    let task = encode_task(registry, task)?;
    to_json("task-result", &(task, encode_result(result)))
}

/// Decodes a key produced by [`encode_task_result`].
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the key or either half is malformed.
pub fn decode_task_result(
    registry: &RfmRegistry,
    encoded: &str,
) -> Result<(RfBmcTask, RfBmcResult), CodecError> {
    let (task, result): (String, String) = from_json("task-result", encoded)?;
    let pair = (decode_task(registry, &task)?, decode_result(&result)?);
    require_canonical(
        "task-result",
        encoded,
        &encode_task_result(registry, &pair.0, &pair.1)?,
    )?;
    Ok(pair)
}

/// Flattens per-task histograms into `task-result key -> count`.
///
/// Zero counts are omitted.
///
/// # Errors
///
/// Propagates [`encode_task`] errors.
pub fn encode_results_map(
    registry: &RfmRegistry,
    results: &ResultsMap,
) -> Result<BTreeMap<String, u64>, CodecError> {
    let mut flat = BTreeMap::new();
    for (task, histogram) in results {
        for (result, count) in histogram {
            if *count > 0 {
                flat.insert(encode_task_result(registry, task, result)?, *count);
            }
        }
    }
    Ok(flat)
}

/// Rebuilds per-task histograms from the flat map.
///
/// Zero counts are dropped, keeping "absent" and "zero" equivalent.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if any key is malformed.
pub fn decode_results_map(
    registry: &RfmRegistry,
    flat: &BTreeMap<String, u64>,
) -> Result<ResultsMap, CodecError> {
    let mut results = ResultsMap::new();
    for (key, count) in flat {
        if *count == 0 {
            continue;
        }
        let (task, result) = decode_task_result(registry, key)?;
        results.entry(task).or_default().insert(result, *count);
    }
    Ok(results)
}

/// Encodes params as `M{ bit_width_counter: M{ "<width>": N(count) } }`.
pub fn encode_params(params: &Params) -> AttributeValue {
    let counter = params
        .bit_width_counter
        .iter()
        .map(|(width, count)| (width.to_string(), AttributeValue::Number(*count)))
        .collect();
    AttributeValue::Map(BTreeMap::from([(
        BIT_WIDTH_COUNTER.to_string(),
        AttributeValue::Map(counter),
    )]))
}

/// Decodes params encoded by [`encode_params`].
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the layout or a width key is invalid.
pub fn decode_params(encoded: &AttributeValue) -> Result<Params, CodecError> {
    let counter = encoded
        .as_map()
        .and_then(|m| m.get(BIT_WIDTH_COUNTER))
        .and_then(AttributeValue::as_map)
        .ok_or_else(|| malformed("params", &format!("{encoded:?}"), "missing bit_width_counter map"))?;

    let mut bit_width_counter = BTreeMap::new();
    for (key, value) in counter {
        let width: u32 = key
            .parse()
            .map_err(|e| malformed("params", key, format!("bit width: {e}")))?;
        require_canonical("params", key, &width.to_string())?;
        let count = value
            .as_number()
            .ok_or_else(|| malformed("params", key, "count is not a number"))?;
        bit_width_counter.insert(width, count);
    }

    Ok(Params { bit_width_counter })
}

/// Encodes a whole store entry.
///
/// # Errors
///
/// Propagates [`encode_results_map`] errors.
pub fn encode_item(registry: &RfmRegistry, ident: &str, data: &StoreData) -> Result<Item, CodecError> {
    let results = encode_results_map(registry, &data.rf_bmc_results_map)?
        .into_iter()
        .map(|(key, count)| (key, AttributeValue::Number(count)))
        .collect();

    Ok(Item::new(ident)
        .with(VERSION_ATTRIBUTE, AttributeValue::Number(VERSION))
        .with(PARAMS_ATTRIBUTE, encode_params(&data.params))
        .with(RESULTS_ATTRIBUTE, AttributeValue::Map(results)))
}

/// Decodes a version-1 entry.
///
/// A missing results map decodes as empty.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the entry is not a version-1 layout.
pub fn decode_item(registry: &RfmRegistry, item: &Item) -> Result<StoreData, CodecError> {
    if item.version() != Some(VERSION) {
        return Err(malformed("entry", &item.id, "not a version 1 entry"));
    }

    let params = item
        .get(PARAMS_ATTRIBUTE)
        .ok_or_else(|| malformed("entry", &item.id, "missing params"))?;
    let params = decode_params(params)?;

    let mut flat = BTreeMap::new();
    if let Some(results) = item.get(RESULTS_ATTRIBUTE) {
        let fields = results
            .as_map()
            .ok_or_else(|| malformed("entry", &item.id, "results attribute is not a map"))?;
        for (key, value) in fields {
            let count = value
                .as_number()
                .ok_or_else(|| malformed("entry", key, "count is not a number"))?;
            flat.insert(key.clone(), count);
        }
    }

    Ok(StoreData {
        params,
        rf_bmc_results_map: decode_results_map(registry, &flat)?,
    })
}
