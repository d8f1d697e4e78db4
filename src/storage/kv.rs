//! Key-value persistence for sync state.
//!
//! The link table, remote cache, base snapshots and outstanding conflicts
//! are stored as JSON strings under `(namespace, key)`. The format is
//! opaque to callers; any durable store that can apply a batch atomically
//! is sufficient.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Namespaces used by the sync core.
pub mod ns {
    pub const LINK_LOCAL: &str = "link.local";
    pub const LINK_REMOTE: &str = "link.remote";
    pub const CACHE: &str = "cache";
    pub const BASE: &str = "base";
    pub const CONFLICTS: &str = "conflicts";
}

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvWrite {
    Put {
        namespace: &'static str,
        key: String,
        value: String,
    },
    Delete {
        namespace: &'static str,
        key: String,
    },
    /// Precondition: the batch is rejected unless the key currently holds
    /// `value` (`None` meaning absent). Writes nothing itself.
    Require {
        namespace: &'static str,
        key: String,
        value: Option<String>,
    },
}

impl KvWrite {
    pub fn put(namespace: &'static str, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Put {
            namespace,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(namespace: &'static str, key: impl Into<String>) -> Self {
        Self::Delete {
            namespace,
            key: key.into(),
        }
    }

    pub fn require(namespace: &'static str, key: impl Into<String>, value: Option<String>) -> Self {
        Self::Require {
            namespace,
            key: key.into(),
            value,
        }
    }

    /// Error reported when this precondition does not hold.
    #[must_use]
    pub fn conflict(&self) -> Error {
        let (Self::Put { namespace, key, .. }
        | Self::Delete { namespace, key }
        | Self::Require { namespace, key, .. }) = self;
        Error::WriteConflict {
            namespace: (*namespace).to_string(),
            key: key.clone(),
        }
    }
}

/// Durable key-value store.
///
/// Implementations allow concurrent readers; writes are serialized.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>>;

    fn put(&self, namespace: &str, key: &str, value: &str) -> Result<()>;

    /// Remove a key. Returns whether it existed.
    fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

    /// All keys in a namespace, sorted.
    fn keys(&self, namespace: &str) -> Result<Vec<String>>;

    /// Remove every key in a namespace. Returns how many were removed.
    fn clear(&self, namespace: &str) -> Result<usize>;

    /// Apply all writes or none.
    ///
    /// Every [`KvWrite::Require`] is checked under the same exclusive write
    /// as the rest of the batch; a failed one yields
    /// [`Error::WriteConflict`] and nothing is written.
    fn write_batch(&self, writes: &[KvWrite]) -> Result<()>;
}

/// Non-durable store backed by a map (tests and `--dry-run`).
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<(String, String), String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .read()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn put(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .insert((namespace.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        Ok(self
            .entries
            .write()
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some())
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, key)| key.clone())
            .collect())
    }

    fn clear(&self, namespace: &str) -> Result<usize> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(ns, _), _| ns != namespace);
        Ok(before - entries.len())
    }

    fn write_batch(&self, writes: &[KvWrite]) -> Result<()> {
        // Single write guard: readers see either none or all of the batch.
        let mut entries = self.entries.write();
        for write in writes {
            if let KvWrite::Require {
                namespace,
                key,
                value,
            } = write
            {
                let current = entries.get(&((*namespace).to_string(), key.clone()));
                if current != value.as_ref() {
                    return Err(write.conflict());
                }
            }
        }
        for write in writes {
            match write {
                KvWrite::Put {
                    namespace,
                    key,
                    value,
                } => {
                    entries.insert(((*namespace).to_string(), key.clone()), value.clone());
                }
                KvWrite::Delete { namespace, key } => {
                    entries.remove(&((*namespace).to_string(), key.clone()));
                }
                KvWrite::Require { .. } => {}
            }
        }
        Ok(())
    }
}
