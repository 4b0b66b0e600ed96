//! Versioned codec between [`StoreData`] and backing-store [`Item`]s.
//!
//! Each format version lives in its own submodule:
//!
//! - [`v1`] — current format. Every `(task, result)` pair is one counter field
//!   in a flat map attribute, so the backing store can increment it atomically.
//! - [`v0`] — legacy format. The whole store is one JSON snapshot string.
//!   Readable so old entries can be migrated; new entries are never written in it.
//!
//! [`decode_item`] dispatches on the entry's `version` attribute;
//! [`encode_item`] always writes [`CURRENT_VERSION`].

pub mod v0;
pub mod v1;

use crate::backend::Item;
use crate::data::StoreData;
use crate::error::CodecError;
use crate::rfm::RfmRegistry;

/// Format version written by this build.
pub const CURRENT_VERSION: u64 = v1::VERSION;

/// Attribute holding the encoded [`crate::data::Params`].
pub const PARAMS_ATTRIBUTE: &str = "params";

/// Attribute holding the flat `(task, result) -> count` map.
pub const RESULTS_ATTRIBUTE: &str = "rf_bmc_results_map";

/// Decodes an entry of any supported version.
///
/// Returns the entry's version alongside the data so callers can tell
/// whether a migration is due.
///
/// # Errors
///
/// - [`CodecError::UnsupportedVersion`] for versions this build cannot read
/// - [`CodecError::Malformed`] if the entry does not match its version's layout
pub fn decode_item(registry: &RfmRegistry, item: &Item) -> Result<(u64, StoreData), CodecError> {
    let version = item.version().ok_or_else(|| CodecError::Malformed {
        kind: "entry",
        encoded: item.id.clone(),
        reason: "version attribute is not a number".to_string(),
    })?;

    let data = match version {
        v0::VERSION => v0::decode_item(registry, item)?,
        v1::VERSION => v1::decode_item(registry, item)?,
        other => return Err(CodecError::UnsupportedVersion { version: other }),
    };

    Ok((version, data))
}

/// Encodes store data as an entry in the current format.
///
/// # Errors
///
/// Returns [`CodecError`] if a task names an unregistered formula module or
/// its parameters do not fit the module.
pub fn encode_item(registry: &RfmRegistry, ident: &str, data: &StoreData) -> Result<Item, CodecError> {
    v1::encode_item(registry, ident, data)
}
