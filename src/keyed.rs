//! Per-key locked state.
//!
//! The outer map is only write-locked when a new key appears; all further
//! access for a device goes through that device's own mutex, so a slow
//! device never serializes the others.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

// ---

#[derive(Debug)]
pub struct Keyed<T> {
    // ---
    slots: RwLock<HashMap<String, Arc<Mutex<T>>>>,
}

impl<T> Default for Keyed<T> {
    fn default() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Default> Keyed<T> {
    /// Slot for `key`, created with `T::default()` on first use.
    pub fn slot(&self, key: &str) -> Arc<Mutex<T>> {
        // ---
        if let Some(slot) = self.get(key) {
            return slot;
        }
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key.to_string()).or_default().clone()
    }
}

impl<T> Keyed<T> {
    pub fn get(&self, key: &str) -> Option<Arc<Mutex<T>>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Run `f` with the slot for `key` locked, if the key exists.
    pub fn with<R>(&self, key: &str, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let slot = self.get(key)?;
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        Some(f(&mut guard))
    }

    pub fn keys(&self) -> Vec<String> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

/// Lock a slot, recovering the data if a previous holder panicked.
pub fn lock<T>(slot: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
