//! In-memory [`RedirectStore`] implementation for tests and in-process use.
//!
//! Definitions live in a `HashMap` keyed by id behind `std::sync::RwLock`.
//! The store can be switched into a failing mode to exercise
//! `StoreUnavailable` handling in callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::{RedirectError, Result};
use crate::models::{Dimension, EntityId, RedirectDefinition};

use super::{DimensionSnapshot, RedirectStore, SearchFilter};

/// In-memory store; writes keep the `(dimension, source)` uniqueness of
/// the SQLite table by replacing any other definition with the same key.
pub struct InMemoryStore {
    definitions: RwLock<HashMap<EntityId, RedirectDefinition>>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Seeds a store with definitions, bypassing the failure switch.
    pub fn with_definitions(definitions: impl IntoIterator<Item = RedirectDefinition>) -> Self {
        let store = Self::new();
        if let Ok(mut map) = store.definitions.write() {
            for def in definitions {
                map.insert(def.id.clone(), def);
            }
        }
        store
    }

    /// Makes every subsequent call fail with `StoreUnavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RedirectError::unavailable("in-memory store is switched off"));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<EntityId, RedirectDefinition>>> {
        self.check()?;
        self.definitions
            .read()
            .map_err(|_| RedirectError::unavailable("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<EntityId, RedirectDefinition>>> {
        self.check()?;
        self.definitions
            .write()
            .map_err(|_| RedirectError::unavailable("in-memory store lock poisoned"))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted_by_source(mut defs: Vec<RedirectDefinition>) -> Vec<RedirectDefinition> {
    defs.sort_by(|a, b| a.source.cmp(&b.source));
    defs
}

fn upsert_into(map: &mut HashMap<EntityId, RedirectDefinition>, definitions: &[RedirectDefinition]) {
    for def in definitions {
        map.retain(|id, existing| {
            id == &def.id || existing.dimension != def.dimension || existing.source != def.source
        });
        map.insert(def.id.clone(), def.clone());
    }
}

fn delete_from(map: &mut HashMap<EntityId, RedirectDefinition>, ids: &[EntityId]) {
    for id in ids {
        map.remove(id);
    }
}

#[async_trait]
impl RedirectStore for InMemoryStore {
    async fn find_all_by_dimension(
        &self,
        dimension: &Dimension,
        only_active: bool,
    ) -> Result<Vec<RedirectDefinition>> {
        let map = self.read()?;
        let defs = map
            .values()
            .filter(|d| &d.dimension == dimension && (!only_active || d.is_active()))
            .cloned()
            .collect();
        Ok(sorted_by_source(defs))
    }

    async fn find_all(&self, only_active: bool) -> Result<DimensionSnapshot> {
        let map = self.read()?;
        let mut snapshot = DimensionSnapshot::new();
        for def in map.values().filter(|d| !only_active || d.is_active()) {
            snapshot
                .entry(def.dimension.clone())
                .or_default()
                .insert(def.source.clone(), def.clone());
        }
        Ok(snapshot)
    }

    async fn find(&self, id: &EntityId) -> Result<Option<RedirectDefinition>> {
        Ok(self.read()?.get(id).cloned())
    }

    async fn upsert_many(&self, definitions: &[RedirectDefinition]) -> Result<()> {
        upsert_into(&mut *self.write()?, definitions);
        Ok(())
    }

    async fn delete_many(&self, ids: &[EntityId]) -> Result<()> {
        delete_from(&mut *self.write()?, ids);
        Ok(())
    }

    async fn apply(&self, upserts: &[RedirectDefinition], deletes: &[EntityId]) -> Result<()> {
        let mut map = self.write()?;
        upsert_into(&mut map, upserts);
        delete_from(&mut map, deletes);
        Ok(())
    }

    async fn search(&self, filter: &SearchFilter) -> Result<Vec<RedirectDefinition>> {
        let map = self.read()?;
        let defs = map.values().filter(|d| filter.matches(d)).cloned().collect();
        Ok(sorted_by_source(defs))
    }
}
