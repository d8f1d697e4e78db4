//! Local entity store interface.
//!
//! Local CRUD is owned elsewhere. Sync only needs to load an entity, save
//! resolved fields back, and enumerate entities of one kind.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::error::Result;
use crate::model::{EntityKind, LocalEntity};

/// Access to local work items.
pub trait LocalStore: Send + Sync {
    fn load(&self, id: &str) -> Result<Option<LocalEntity>>;

    /// Insert or replace an entity.
    fn save(&self, entity: &LocalEntity) -> Result<()>;

    fn list(&self, kind: EntityKind) -> Result<Vec<LocalEntity>>;

    /// Delete an entity. Returns whether it existed.
    ///
    /// Only used to undo an entity created by an import that failed to commit.
    fn remove(&self, id: &str) -> Result<bool>;
}

/// In-memory local store.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    entities: RwLock<BTreeMap<String, LocalEntity>>,
}

impl MemoryLocalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with entities.
    #[must_use]
    pub fn with_entities(entities: impl IntoIterator<Item = LocalEntity>) -> Self {
        let store = Self::new();
        {
            let mut map = store.entities.write();
            for entity in entities {
                map.insert(entity.id.clone(), entity);
            }
        }
        store
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }
}

impl LocalStore for MemoryLocalStore {
    fn load(&self, id: &str) -> Result<Option<LocalEntity>> {
        Ok(self.entities.read().get(id).cloned())
    }

    fn save(&self, entity: &LocalEntity) -> Result<()> {
        self.entities
            .write()
            .insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    fn list(&self, kind: EntityKind) -> Result<Vec<LocalEntity>> {
        Ok(self
            .entities
            .read()
            .values()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect())
    }

    fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.entities.write().remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_local_store_roundtrip() {
        let mut entity = LocalEntity::new(EntityKind::Issue, "Write docs");
        let store = MemoryLocalStore::with_entities([entity.clone()]);

        entity.status = "done".into();
        store.save(&entity).unwrap();

        let loaded = store.load(&entity.id).unwrap().unwrap();
        assert_eq!(loaded.status, "done");
        assert_eq!(store.list(EntityKind::Issue).unwrap().len(), 1);
        assert!(store.list(EntityKind::Milestone).unwrap().is_empty());

        assert!(store.remove(&entity.id).unwrap());
        assert!(store.is_empty());
    }
}
