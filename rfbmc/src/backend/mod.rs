//! Backing access layer over a generic key-value store.
//!
//! Entries are [`Item`]s: an identifier plus named, typed attributes. The
//! store controller uses three of the four primitives:
//!
//! | Primitive | Used by |
//! |-----------|---------|
//! | [`Backend::get_item`] | load, sync |
//! | [`Backend::put_item`] with [`Condition::NotExists`] | create |
//! | [`Backend::put_item`] with [`Condition::VersionEquals`] | migration (atomic replace) |
//! | [`Backend::update_item`] | result ingestion |
//!
//! [`Backend::delete_item`] completes the key-value contract for operators and
//! tests; the controller never deletes entries.
//!
//! `update_item` is the atomic one: under a condition, it increments fields of
//! a map attribute (creating absent fields at zero) and returns the item as it
//! was immediately before the update, all in one indivisible step.
//!
//! # Implementations
//!
//! - [`memory::MemoryBackend`] — in-process map with a native atomic update
//! - [`cas::CasBackend`] — emulates the atomic update over any
//!   [`cas::RevisionedStore`] with an optimistic compare-and-swap loop
//! - [`dir::DirStore`] — durable [`cas::RevisionedStore`] on a directory of JSON files

pub mod cas;
pub mod dir;
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Name of the attribute holding an item's format version.
pub const VERSION_ATTRIBUTE: &str = "version";

/// A typed attribute value.
///
/// Numbers are exact unsigned integers; floating point is never used for
/// counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// Exact unsigned integer.
    #[serde(rename = "N")]
    Number(u64),
    /// UTF-8 string.
    #[serde(rename = "S")]
    String(String),
    /// Nested map of attributes.
    #[serde(rename = "M")]
    Map(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    /// Returns the number, if this is a number.
    pub fn as_number(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the string, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the map, if this is a map.
    pub fn as_map(&self) -> Option<&BTreeMap<String, AttributeValue>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }
}

/// One entry in the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Primary key.
    pub id: String,
    /// Named attributes.
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl Item {
    /// Creates an item with no attributes.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Adds an attribute, builder style.
    pub fn with(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Returns an attribute by name.
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Returns the item's format version.
    ///
    /// A missing version attribute means version 0. Returns `None` if the
    /// attribute exists but is not a number.
    pub fn version(&self) -> Option<u64> {
        match self.attributes.get(VERSION_ATTRIBUTE) {
            None => Some(0),
            Some(value) => value.as_number(),
        }
    }
}

/// Precondition evaluated atomically with a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// Always holds.
    Always,
    /// Holds if no item with the id exists.
    NotExists,
    /// Holds if an item with the id exists.
    Exists,
    /// Holds if the item exists and its format version equals the value.
    VersionEquals(u64),
}

impl Condition {
    /// Evaluates the condition against the current item, if any.
    pub fn holds(&self, current: Option<&Item>) -> bool {
        match self {
            Self::Always => true,
            Self::NotExists => current.is_none(),
            Self::Exists => current.is_some(),
            Self::VersionEquals(expected) => {
                current.is_some_and(|item| item.version() == Some(*expected))
            }
        }
    }
}

/// A guarded batch of counter increments on one map attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateItem {
    /// The map attribute holding the counters.
    pub map_attribute: String,
    /// Field name to amount added.
    pub increments: BTreeMap<String, u64>,
    /// Precondition checked atomically with the increments.
    pub condition: Condition,
}

/// A generic key-value store with struct-valued entries.
///
/// Every method is all-or-nothing: when it returns an error, the store is
/// unchanged by that call.
pub trait Backend: Send + Sync {
    /// Reads an item.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Unavailable`] on transport or storage failure.
    fn get_item(&self, id: &str) -> Result<Option<Item>, BackendError>;

    /// Writes an item, replacing any existing one, if `condition` holds.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::ConditionFailed`] if the condition does not hold.
    fn put_item(&self, item: Item, condition: Condition) -> Result<(), BackendError>;

    /// Deletes an item if `condition` holds. Deleting a missing item is a no-op
    /// when the condition allows it.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::ConditionFailed`] if the condition does not hold.
    fn delete_item(&self, id: &str, condition: Condition) -> Result<(), BackendError>;

    /// Atomically applies `update` and returns the item as it was before.
    ///
    /// # Errors
    ///
    /// - [`BackendError::ConditionFailed`] if the condition does not hold
    /// - [`BackendError::CounterOverflow`] if a counter would overflow
    /// - [`BackendError::NotAMap`] if the target attribute is not a map
    fn update_item(&self, id: &str, update: &UpdateItem) -> Result<Item, BackendError>;
}

impl<B: Backend + ?Sized> Backend for &B {
    fn get_item(&self, id: &str) -> Result<Option<Item>, BackendError> {
        (**self).get_item(id)
    }

    fn put_item(&self, item: Item, condition: Condition) -> Result<(), BackendError> {
        (**self).put_item(item, condition)
    }

    fn delete_item(&self, id: &str, condition: Condition) -> Result<(), BackendError> {
        (**self).delete_item(id, condition)
    }

    fn update_item(&self, id: &str, update: &UpdateItem) -> Result<Item, BackendError> {
        (**self).update_item(id, update)
    }
}

impl<B: Backend + ?Sized> Backend for Arc<B> {
    fn get_item(&self, id: &str) -> Result<Option<Item>, BackendError> {
        (**self).get_item(id)
    }

    fn put_item(&self, item: Item, condition: Condition) -> Result<(), BackendError> {
        (**self).put_item(item, condition)
    }

    fn delete_item(&self, id: &str, condition: Condition) -> Result<(), BackendError> {
        (**self).delete_item(id, condition)
    }

    fn update_item(&self, id: &str, update: &UpdateItem) -> Result<Item, BackendError> {
        (**self).update_item(id, update)
    }
}

/// Applies the increments of `update` to `item` in place.
///
/// Shared by backends so they agree on field creation and overflow rules.
/// Callers must apply it to a scratch copy and commit only on success.
pub(crate) fn apply_increments(item: &mut Item, update: &UpdateItem) -> Result<(), BackendError> {
    let map = item
        .attributes
        .entry(update.map_attribute.clone())
        .or_insert_with(|| AttributeValue::Map(BTreeMap::new()));

    let AttributeValue::Map(fields) = map else {
        return Err(BackendError::NotAMap {
            id: item.id.clone(),
            attribute: update.map_attribute.clone(),
        });
    };

    for (field, amount) in &update.increments {
        let slot = fields
            .entry(field.clone())
            .or_insert(AttributeValue::Number(0));
        let current = slot.as_number().ok_or_else(|| BackendError::Corrupted {
            id: item.id.clone(),
            reason: format!("counter '{field}' is not a number"),
        })?;
        let next = current
            .checked_add(*amount)
            .ok_or_else(|| BackendError::CounterOverflow {
                id: item.id.clone(),
                field: field.clone(),
            })?;
        *slot = AttributeValue::Number(next);
    }

    Ok(())
}
