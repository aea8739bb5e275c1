//! Resident models, keyed by name.
//!
//! The map is behind one reader/writer lock that is only held long enough to
//! find, create or drop a slot. Each slot has its own mutex guarding the
//! loaded model; loading, unloading and generation all hold it, so work on
//! one model never blocks another, and requests against the same model run
//! one at a time.
//!
//! A slot also carries a `resident` flag that is flipped while the slot
//! mutex is held. Membership queries read only the flag and never wait on a
//! slot, so a load in progress is observed as absent until it completes.
//!
//! An empty slot is removed from the map as soon as it is emptied (unload or
//! failed load) and marked retired. A loader that picked up the slot before
//! it was removed sees the mark once it gets the lock and starts over with a
//! fresh slot.
//!
//! Lock order is slot mutex, then map lock. Nothing waits on a slot mutex
//! while holding the map lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::SystemTime;

use crate::inference::backend::Session;
use crate::inference::engine::EngineError;
use crate::inference::types::ModelInfo;

/// A model with live backend resources. Dropping it releases them.
pub struct LoadedModel {
    name: String,
    loaded_at: SystemTime,
    info: ModelInfo,
    session: Box<dyn Session>,
}

impl LoadedModel {
    pub fn new(name: &str, info: ModelInfo, session: Box<dyn Session>) -> Self {
        Self {
            name: name.to_string(),
            loaded_at: SystemTime::now(),
            info,
            session,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loaded_at(&self) -> SystemTime {
        self.loaded_at
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn session_mut(&mut self) -> &mut dyn Session {
        self.session.as_mut()
    }
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("name", &self.name)
            .field("loaded_at", &self.loaded_at)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Slot {
    model: Mutex<Option<LoadedModel>>,
    resident: AtomicBool,
    /// Set once the slot has left the map. Only written with `model` locked.
    retired: AtomicBool,
}

#[derive(Default)]
pub struct ModelRegistry {
    slots: RwLock<HashMap<String, Arc<Slot>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, name: &str) -> Option<Arc<Slot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn slot_or_insert(&self, name: &str) -> Arc<Slot> {
        if let Some(slot) = self.slot(name) {
            return slot;
        }
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Drop an empty slot from the map. The caller holds the slot's mutex.
    fn retire(&self, name: &str, slot: &Arc<Slot>) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if slots.get(name).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(name);
        }
        slot.retired.store(true, Ordering::Release);
    }

    /// Load `name` with `open` unless it is already resident.
    ///
    /// Returns `true` when `open` ran and succeeded. `open` runs with the
    /// slot locked, so concurrent loads of one name call it at most once
    /// between them.
    pub fn load_with<F>(&self, name: &str, open: F) -> Result<bool, EngineError>
    where
        F: FnOnce() -> Result<LoadedModel, EngineError>,
    {
        loop {
            let slot = self.slot_or_insert(name);
            let mut guard = lock(&slot.model);
            if slot.retired.load(Ordering::Acquire) {
                continue;
            }
            if guard.is_some() {
                return Ok(false);
            }

            return match open() {
                Ok(model) => {
                    *guard = Some(model);
                    slot.resident.store(true, Ordering::Release);
                    Ok(true)
                }
                Err(e) => {
                    self.retire(name, &slot);
                    Err(e)
                }
            };
        }
    }

    /// Take `name` out of the registry. Waits for any generation on it.
    pub fn unload(&self, name: &str) -> Result<LoadedModel, EngineError> {
        let slot = self
            .slot(name)
            .ok_or_else(|| EngineError::NotLoaded(name.to_string()))?;
        let mut guard = lock(&slot.model);
        let model = guard
            .take()
            .ok_or_else(|| EngineError::NotLoaded(name.to_string()))?;
        slot.resident.store(false, Ordering::Release);
        self.retire(name, &slot);
        Ok(model)
    }

    /// Run `f` with exclusive access to a resident model.
    pub fn with_model<R, F>(&self, name: &str, f: F) -> Result<R, EngineError>
    where
        F: FnOnce(&mut LoadedModel) -> Result<R, EngineError>,
    {
        let slot = self
            .slot(name)
            .ok_or_else(|| EngineError::NotLoaded(name.to_string()))?;
        let mut guard = lock(&slot.model);
        let model = guard
            .as_mut()
            .ok_or_else(|| EngineError::NotLoaded(name.to_string()))?;
        f(model)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.slot(name)
            .map(|slot| slot.resident.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Resident model names, sorted.
    pub fn names(&self) -> Vec<String> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| slot.resident.load(Ordering::Acquire))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
