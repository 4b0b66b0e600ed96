//! In-memory backend with a native atomic update primitive.
//!
//! Holds every item in a single map behind a mutex, so each call is trivially
//! linearizable. Cloning a [`MemoryBackend`] yields another handle to the same
//! items, which lets tests point several controllers at one store.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Backend, Condition, Item, UpdateItem, apply_increments};
use crate::error::BackendError;

/// Non-persistent [`Backend`] for tests and single-process use.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    items: Arc<Mutex<HashMap<String, Item>>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns true if no items are stored.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl Backend for MemoryBackend {
    fn get_item(&self, id: &str) -> Result<Option<Item>, BackendError> {
        Ok(self.items.lock().get(id).cloned())
    }

    fn put_item(&self, item: Item, condition: Condition) -> Result<(), BackendError> {
        let mut items = self.items.lock();
        if !condition.holds(items.get(&item.id)) {
            return Err(BackendError::ConditionFailed { id: item.id });
        }
        items.insert(item.id.clone(), item);
        Ok(())
    }

    fn delete_item(&self, id: &str, condition: Condition) -> Result<(), BackendError> {
        let mut items = self.items.lock();
        if !condition.holds(items.get(id)) {
            return Err(BackendError::ConditionFailed { id: id.to_string() });
        }
        items.remove(id);
        Ok(())
    }

    fn update_item(&self, id: &str, update: &UpdateItem) -> Result<Item, BackendError> {
        let mut items = self.items.lock();
        let current = items.get(id);
        if !update.condition.holds(current) {
            return Err(BackendError::ConditionFailed { id: id.to_string() });
        }

        let previous = current.cloned().unwrap_or_else(|| Item::new(id));
        let mut next = previous.clone();
        apply_increments(&mut next, update)?;
        items.insert(id.to_string(), next);

        Ok(previous)
    }
}
