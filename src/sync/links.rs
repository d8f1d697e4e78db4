//! Local to remote identity mapping.
//!
//! The table is a bijection: each local id maps to at most one remote id
//! and vice versa. Both directions are written in one atomic batch that
//! also carries the values it was validated against, so a writer that lost
//! a race is rejected by the store instead of breaking the mapping.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Error;
use crate::storage::{ns, KeyValueStore, KvWrite};

/// Errors from link table operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("local entity {local_id} is already linked to remote {remote_id}")]
    LocalAlreadyLinked { local_id: String, remote_id: String },

    #[error("remote entity {remote_id} is already linked to local {local_id}")]
    RemoteAlreadyLinked { remote_id: String, local_id: String },

    #[error("{id} is not linked")]
    NotLinked { id: String },

    #[error("link storage failed: {0}")]
    Store(String),
}

type LinkResult<T> = std::result::Result<T, LinkError>;

/// One identity mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub local_id: String,
    pub remote_id: String,
    /// Unix milliseconds
    pub linked_at: i64,
}

/// Bidirectional link table over a [`KeyValueStore`].
///
/// Any number of tables may share one store.
pub struct LinkTable {
    store: Arc<dyn KeyValueStore>,
}

impl LinkTable {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Link a local id to a remote id.
    ///
    /// Re-linking the identical pair is a no-op.
    ///
    /// # Errors
    ///
    /// Fails if either id already belongs to a different mapping.
    pub fn link(&self, local_id: &str, remote_id: &str) -> LinkResult<()> {
        self.commit_with(local_id, remote_id, Vec::new())
    }

    /// Link (or confirm a link) and apply `extra` writes in the same batch.
    ///
    /// # Errors
    ///
    /// Fails on a bijection violation or a store error; nothing is written.
    pub fn commit_with(&self, local_id: &str, remote_id: &str, extra: Vec<KvWrite>) -> LinkResult<()> {
        let mut writes = self.link_ops(local_id, remote_id)?;
        writes.extend(extra);
        if writes.iter().all(|w| matches!(w, KvWrite::Require { .. })) {
            return Ok(());
        }
        match self.store.write_batch(&writes) {
            Ok(()) => Ok(()),
            // Another writer got in first; report what it did.
            Err(e @ Error::WriteConflict { .. }) => match self.link_ops(local_id, remote_id) {
                Err(link_error) => Err(link_error),
                Ok(_) => Err(store_error(e)),
            },
            Err(e) => Err(store_error(e)),
        }
    }

    /// Remove the link for a local id. Returns the removed record.
    ///
    /// The pair's base snapshot, pending conflicts and cache entry go with
    /// it, so a later link of the same remote id starts from a first sync.
    ///
    /// # Errors
    ///
    /// Fails with [`LinkError::NotLinked`] if there is no link.
    pub fn unlink(&self, local_id: &str) -> LinkResult<LinkRecord> {
        let (record, writes) = self.unlink_plan(local_id)?;
        match self.store.write_batch(&writes) {
            Ok(()) => Ok(record),
            Err(e @ Error::WriteConflict { .. }) => match self.local_record(local_id)? {
                None => Err(LinkError::NotLinked {
                    id: local_id.to_string(),
                }),
                Some(_) => Err(store_error(e)),
            },
            Err(e) => Err(store_error(e)),
        }
    }

    /// Writes that would create the link, after validating the bijection.
    ///
    /// Only preconditions when the identical pair already exists. A new
    /// link also drops sync state left under the remote id by an earlier
    /// pair.
    ///
    /// # Errors
    ///
    /// Fails if either id is linked elsewhere.
    pub fn link_ops(&self, local_id: &str, remote_id: &str) -> LinkResult<Vec<KvWrite>> {
        let existing_remote = self.read(ns::LINK_LOCAL, local_id)?;
        let existing_local = self.read(ns::LINK_REMOTE, remote_id)?;
        let raw = |entry: &Option<(LinkRecord, String)>| entry.as_ref().map(|(_, raw)| raw.clone());
        let mut writes = vec![
            KvWrite::require(ns::LINK_LOCAL, local_id, raw(&existing_remote)),
            KvWrite::require(ns::LINK_REMOTE, remote_id, raw(&existing_local)),
        ];

        match (&existing_remote, &existing_local) {
            (Some((a, _)), Some((b, _))) if a.remote_id == remote_id && b.local_id == local_id => {
                return Ok(writes);
            }
            (Some((record, _)), _) if record.remote_id != remote_id => {
                return Err(LinkError::LocalAlreadyLinked {
                    local_id: local_id.to_string(),
                    remote_id: record.remote_id.clone(),
                });
            }
            (_, Some((record, _))) if record.local_id != local_id => {
                return Err(LinkError::RemoteAlreadyLinked {
                    remote_id: remote_id.to_string(),
                    local_id: record.local_id.clone(),
                });
            }
            _ => {}
        }

        let record = LinkRecord {
            local_id: local_id.to_string(),
            remote_id: remote_id.to_string(),
            linked_at: chrono::Utc::now().timestamp_millis(),
        };
        let value = serde_json::to_string(&record).map_err(|e| LinkError::Store(e.to_string()))?;
        writes.extend(pair_state_cleanup(remote_id));
        writes.push(KvWrite::put(ns::LINK_LOCAL, local_id, value.clone()));
        writes.push(KvWrite::put(ns::LINK_REMOTE, remote_id, value));
        Ok(writes)
    }

    /// Writes that would remove the link for a local id.
    ///
    /// # Errors
    ///
    /// Fails with [`LinkError::NotLinked`] if there is no link.
    pub fn unlink_ops(&self, local_id: &str) -> LinkResult<Vec<KvWrite>> {
        self.unlink_plan(local_id).map(|(_, writes)| writes)
    }

    fn unlink_plan(&self, local_id: &str) -> LinkResult<(LinkRecord, Vec<KvWrite>)> {
        let (record, raw) = self.read(ns::LINK_LOCAL, local_id)?.ok_or_else(|| LinkError::NotLinked {
            id: local_id.to_string(),
        })?;
        let mut writes = vec![
            KvWrite::require(ns::LINK_LOCAL, local_id, Some(raw)),
            KvWrite::delete(ns::LINK_LOCAL, local_id),
            KvWrite::delete(ns::LINK_REMOTE, record.remote_id.clone()),
        ];
        writes.extend(pair_state_cleanup(&record.remote_id));
        Ok((record, writes))
    }

    /// # Errors
    ///
    /// Returns a store error if the table cannot be read.
    pub fn remote_for(&self, local_id: &str) -> LinkResult<Option<String>> {
        Ok(self.local_record(local_id)?.map(|r| r.remote_id))
    }

    /// # Errors
    ///
    /// Returns a store error if the table cannot be read.
    pub fn local_for(&self, remote_id: &str) -> LinkResult<Option<String>> {
        Ok(self.remote_record(remote_id)?.map(|r| r.local_id))
    }

    /// All links, sorted by local id.
    ///
    /// # Errors
    ///
    /// Returns a store error if the table cannot be read.
    pub fn list(&self) -> LinkResult<Vec<LinkRecord>> {
        let keys = self.store.keys(ns::LINK_LOCAL).map_err(store_error)?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.local_record(&key)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn local_record(&self, local_id: &str) -> LinkResult<Option<LinkRecord>> {
        Ok(self.read(ns::LINK_LOCAL, local_id)?.map(|(record, _)| record))
    }

    fn remote_record(&self, remote_id: &str) -> LinkResult<Option<LinkRecord>> {
        Ok(self.read(ns::LINK_REMOTE, remote_id)?.map(|(record, _)| record))
    }

    /// The parsed record together with its stored text.
    fn read(&self, namespace: &str, key: &str) -> LinkResult<Option<(LinkRecord, String)>> {
        let Some(raw) = self.store.get(namespace, key).map_err(store_error)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(|record| Some((record, raw)))
            .map_err(|e| LinkError::Store(format!("corrupt link {namespace}/{key}: {e}")))
    }
}

/// Per-pair sync state stored under a remote id.
fn pair_state_cleanup(remote_id: &str) -> [KvWrite; 3] {
    [
        KvWrite::delete(ns::BASE, remote_id),
        KvWrite::delete(ns::CONFLICTS, remote_id),
        KvWrite::delete(ns::CACHE, remote_id),
    ]
}

fn store_error(e: Error) -> LinkError {
    LinkError::Store(e.to_string())
}
