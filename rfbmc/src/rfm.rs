//! Restrictive formula module (RFM) codecs and their registry.
//!
//! A task embeds its formula parameters as an opaque blob produced by the
//! module named in `rfm_guid`. Decoding a task looks the module up in an
//! [`RfmRegistry`] and hands it the blob; the store itself never needs to know
//! a module's parameter schema.
//!
//! # Built-in Modules
//!
//! - [`XorRfm`] (`"xor"`): random XOR constraints, one parameter, the
//!   per-variable inclusion density in permille.
//! - [`HashFamilyRfm`] (`"hash-family"`): constraints drawn from a named hash
//!   family, parameters `(family, seed_bits)`.
//!
//! # Example
//!
//! ```rust
//! use rfbmc::rfm::{RfmRegistry, XorRfm};
//! use rfbmc::task::{FormulaParams, ParamValue};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = RfmRegistry::with_builtin();
//! let codec = registry.get(XorRfm::GUID)?;
//! let blob = codec.encode_formula_params(&FormulaParams::new([ParamValue::Int(500)]))?;
//! assert_eq!(blob, "500");
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::CodecError;
use crate::task::{FormulaParams, ParamValue};

/// Encodes and decodes one formula module's parameters.
pub trait RfmCodec: Send + Sync + fmt::Debug {
    /// The module identifier stored in tasks (`rfm_guid`).
    fn guid(&self) -> &str;

    /// Encodes parameters into the module's canonical blob.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] if the parameters do not fit the
    /// module's schema.
    fn encode_formula_params(&self, params: &FormulaParams) -> Result<String, CodecError>;

    /// Decodes a blob produced by [`RfmCodec::encode_formula_params`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] if the blob is not in the module's grammar.
    fn decode_formula_params(&self, encoded: &str) -> Result<FormulaParams, CodecError>;
}

/// Registry mapping `rfm_guid` to the module codec that understands it.
#[derive(Debug, Clone, Default)]
pub struct RfmRegistry {
    codecs: HashMap<String, Arc<dyn RfmCodec>>,
}

impl RfmRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with every built-in module registered.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(XorRfm);
        registry.register(HashFamilyRfm);
        registry
    }

    /// Registers a module codec, replacing any codec with the same identifier.
    ///
    /// Returns the replaced codec, if any.
    pub fn register<C: RfmCodec + 'static>(&mut self, codec: C) -> Option<Arc<dyn RfmCodec>> {
        self.codecs.insert(codec.guid().to_string(), Arc::new(codec))
    }

    /// Looks up the codec for a module identifier.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownRfm`] if no codec is registered for `guid`.
    pub fn get(&self, guid: &str) -> Result<&dyn RfmCodec, CodecError> {
        self.codecs
            .get(guid)
            .map(|codec| codec.as_ref())
            .ok_or_else(|| CodecError::UnknownRfm {
                guid: guid.to_string(),
            })
    }

    /// Returns the registered module identifiers, sorted.
    pub fn guids(&self) -> Vec<&str> {
        let mut guids: Vec<&str> = self.codecs.keys().map(String::as_str).collect();
        guids.sort_unstable();
        guids
    }
}

fn malformed(encoded: &str, reason: impl Into<String>) -> CodecError {
    CodecError::Malformed {
        kind: "formula params",
        encoded: encoded.to_string(),
        reason: reason.into(),
    }
}

/// Random XOR constraint module.
///
/// Parameters: `[Int(density_permille)]`, with density in `1..=1000`.
/// Blob: the density as a plain decimal, e.g. `"500"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct XorRfm;

impl XorRfm {
    /// Module identifier.
    pub const GUID: &'static str = "xor";

    /// Builds the parameter tuple for a density in permille.
    pub fn params(density_permille: i64) -> FormulaParams {
        FormulaParams::new([ParamValue::Int(density_permille)])
    }

    fn check_density(density: i64, encoded: &str) -> Result<i64, CodecError> {
        if (1..=1000).contains(&density) {
            Ok(density)
        } else {
            Err(malformed(encoded, format!("density {density} outside 1..=1000")))
        }
    }
}

impl RfmCodec for XorRfm {
    fn guid(&self) -> &str {
        Self::GUID
    }

    fn encode_formula_params(&self, params: &FormulaParams) -> Result<String, CodecError> {
        match params.values() {
            [ParamValue::Int(density)] => {
                let density = Self::check_density(*density, &format!("{params:?}"))?;
                Ok(density.to_string())
            }
            _ => Err(malformed(
                &format!("{params:?}"),
                "xor expects exactly one integer parameter",
            )),
        }
    }

    fn decode_formula_params(&self, encoded: &str) -> Result<FormulaParams, CodecError> {
        // Reject signs and leading zeros so each density has one spelling.
        let canonical = !encoded.is_empty()
            && encoded.bytes().all(|b| b.is_ascii_digit())
            && !(encoded.len() > 1 && encoded.starts_with('0'));
        if !canonical {
            return Err(malformed(encoded, "expected a canonical decimal density"));
        }
        let density: i64 = encoded
            .parse()
            .map_err(|e| malformed(encoded, format!("{e}")))?;
        Ok(Self::params(Self::check_density(density, encoded)?))
    }
}

/// Hash-family constraint module.
///
/// Parameters: `[Text(family), Int(seed_bits)]`, with `seed_bits` in `1..=256`.
/// Blob: a compact JSON pair, e.g. `["tabulation",64]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashFamilyRfm;

impl HashFamilyRfm {
    /// Module identifier.
    pub const GUID: &'static str = "hash-family";

    /// Builds the parameter tuple for a family name and seed width.
    pub fn params(family: impl Into<String>, seed_bits: i64) -> FormulaParams {
        FormulaParams::new([ParamValue::Text(family.into()), ParamValue::Int(seed_bits)])
    }
}

impl RfmCodec for HashFamilyRfm {
    fn guid(&self) -> &str {
        Self::GUID
    }

    fn encode_formula_params(&self, params: &FormulaParams) -> Result<String, CodecError> {
        match params.values() {
            [ParamValue::Text(family), ParamValue::Int(bits)] if (1..=256).contains(bits) => {
                serde_json::to_string(&(family, bits))
                    .map_err(|e| malformed(&format!("{params:?}"), e.to_string()))
            }
            _ => Err(malformed(
                &format!("{params:?}"),
                "hash-family expects (text family, integer seed_bits in 1..=256)",
            )),
        }
    }

    fn decode_formula_params(&self, encoded: &str) -> Result<FormulaParams, CodecError> {
        let (family, bits): (String, i64) =
            serde_json::from_str(encoded).map_err(|e| malformed(encoded, e.to_string()))?;
        let params = Self::params(family, bits);
        // Round-trip through the encoder to reject non-canonical spellings.
        if self.encode_formula_params(&params)? != encoded {
            return Err(malformed(encoded, "non-canonical hash-family encoding"));
        }
        Ok(params)
    }
}
