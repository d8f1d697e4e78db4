//! Persisted per-entity sync state: base snapshots and open conflicts.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::NormalizedSnapshot;
use crate::storage::{ns, KeyValueStore, KvWrite};
use crate::sync::conflict::ConflictRecord;
use crate::sync::hash::fingerprint;

/// Last successfully synced snapshot of a linked pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBase {
    pub snapshot: NormalizedSnapshot,
    pub fingerprint: String,
}

impl StoredBase {
    #[must_use]
    pub fn new(snapshot: NormalizedSnapshot) -> Self {
        let fingerprint = fingerprint(&snapshot);
        Self {
            snapshot,
            fingerprint,
        }
    }
}

/// Outstanding conflicts for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSet {
    pub local_id: String,
    pub remote_id: String,
    /// Unix milliseconds
    pub detected_at: i64,
    pub conflicts: Vec<ConflictRecord>,
}

/// # Errors
///
/// Returns an error if the store read fails or the entry is corrupt.
pub fn load_base(store: &dyn KeyValueStore, remote_id: &str) -> Result<Option<StoredBase>> {
    store
        .get(ns::BASE, remote_id)?
        .map(|raw| serde_json::from_str(&raw).map_err(Error::from))
        .transpose()
}

/// # Errors
///
/// Returns an error if the snapshot cannot be serialized.
pub fn base_op(remote_id: &str, base: &StoredBase) -> Result<KvWrite> {
    Ok(KvWrite::put(ns::BASE, remote_id, serde_json::to_string(base)?))
}

/// Write (or clear, when `set.conflicts` is empty) the conflict set.
///
/// # Errors
///
/// Returns an error if the set cannot be serialized.
pub fn conflicts_op(set: &ConflictSet) -> Result<KvWrite> {
    if set.conflicts.is_empty() {
        return Ok(KvWrite::delete(ns::CONFLICTS, set.remote_id.clone()));
    }
    Ok(KvWrite::put(
        ns::CONFLICTS,
        set.remote_id.clone(),
        serde_json::to_string(set)?,
    ))
}

/// # Errors
///
/// Returns an error if the store read fails or the entry is corrupt.
pub fn load_conflicts(store: &dyn KeyValueStore, remote_id: &str) -> Result<Option<ConflictSet>> {
    store
        .get(ns::CONFLICTS, remote_id)?
        .map(|raw| serde_json::from_str(&raw).map_err(Error::from))
        .transpose()
}

/// All outstanding conflict sets, sorted by remote id.
///
/// # Errors
///
/// Returns an error if the store read fails or an entry is corrupt.
pub fn list_conflicts(store: &dyn KeyValueStore) -> Result<Vec<ConflictSet>> {
    let mut sets = Vec::new();
    for key in store.keys(ns::CONFLICTS)? {
        if let Some(raw) = store.get(ns::CONFLICTS, &key)? {
            sets.push(serde_json::from_str(&raw)?);
        }
    }
    Ok(sets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Field, FieldValue};
    use crate::storage::MemoryStore;

    #[test]
    fn test_empty_conflict_set_clears_entry() {
        let store = MemoryStore::new();
        let mut set = ConflictSet {
            local_id: "issue_1".into(),
            remote_id: "42".into(),
            detected_at: 0,
            conflicts: vec![ConflictRecord {
                field: Field::Status,
                local_value: FieldValue::Text(Some("review".into())),
                remote_value: FieldValue::Text(Some("done".into())),
                base_value: FieldValue::Text(Some("todo".into())),
            }],
        };

        store.write_batch(&[conflicts_op(&set).unwrap()]).unwrap();
        assert_eq!(list_conflicts(&store).unwrap(), vec![set.clone()]);

        set.conflicts.clear();
        store.write_batch(&[conflicts_op(&set).unwrap()]).unwrap();
        assert!(list_conflicts(&store).unwrap().is_empty());
    }

    #[test]
    fn test_base_round_trip_keeps_fingerprint() {
        let store = MemoryStore::new();
        let base = StoredBase::new(NormalizedSnapshot {
            id: "42".into(),
            title: Some("t".into()),
            ..Default::default()
        });
        store.write_batch(&[base_op("42", &base).unwrap()]).unwrap();

        let loaded = load_base(&store, "42").unwrap().unwrap();
        assert_eq!(loaded.fingerprint, base.fingerprint);
        assert!(load_base(&store, "43").unwrap().is_none());
    }
}
