//! Remote state cache.
//!
//! Holds the last fetched normalized snapshot per remote id. An entry is
//! authoritative only while fresh: `now - fetched_at < ttl` and not
//! invalidated. Reading a stale entry evicts it.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::NormalizedSnapshot;
use crate::storage::{ns, KeyValueStore, KvWrite};
use crate::sync::events::{SharedSink, SyncEvent};

/// Default cache TTL: 5 minutes
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Source of the current time in Unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    #[must_use]
    pub fn at(millis: i64) -> Self {
        Self {
            now: AtomicI64::new(millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        let millis = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Which entries to invalidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheScope {
    One(String),
    All,
}

/// A cached remote snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(skip)]
    pub remote_id: String,
    pub snapshot: NormalizedSnapshot,
    /// Unix milliseconds
    pub fetched_at: i64,
}

/// Counts for `tl cache status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheSummary {
    pub total: usize,
    pub fresh: usize,
    pub stale: usize,
}

/// TTL cache of remote snapshots over a [`KeyValueStore`].
pub struct SyncCache {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    sink: SharedSink,
}

impl SyncCache {
    pub fn new(store: Arc<dyn KeyValueStore>, sink: SharedSink) -> Self {
        Self {
            store,
            ttl: DEFAULT_CACHE_TTL,
            clock: Arc::new(SystemClock),
            sink,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record a freshly fetched snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub fn put(&self, remote_id: &str, snapshot: &NormalizedSnapshot) -> Result<()> {
        self.store.write_batch(&[self.put_op(remote_id, snapshot)?])
    }

    /// The write [`Self::put`] would perform, for folding into a batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be serialized.
    pub fn put_op(&self, remote_id: &str, snapshot: &NormalizedSnapshot) -> Result<KvWrite> {
        let entry = CacheEntry {
            remote_id: remote_id.to_string(),
            snapshot: snapshot.clone(),
            fetched_at: self.clock.now_millis(),
        };
        Ok(KvWrite::put(ns::CACHE, remote_id, serde_json::to_string(&entry)?))
    }

    /// Fresh snapshot for a remote id.
    ///
    /// A stale or unreadable entry is evicted and `None` returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn get(&self, remote_id: &str) -> Result<Option<NormalizedSnapshot>> {
        let Some(entry) = self.load(remote_id)? else {
            return Ok(None);
        };
        if self.entry_is_fresh(&entry) {
            return Ok(Some(entry.snapshot));
        }
        self.evict(remote_id)?;
        Ok(None)
    }

    /// Whether a fresh entry exists. Does not evict.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn is_fresh(&self, remote_id: &str) -> Result<bool> {
        Ok(self
            .load(remote_id)?
            .is_some_and(|entry| self.entry_is_fresh(&entry)))
    }

    /// Drop one entry or all of them. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub fn invalidate(&self, scope: &CacheScope) -> Result<usize> {
        match scope {
            CacheScope::One(remote_id) => Ok(usize::from(self.store.delete(ns::CACHE, remote_id)?)),
            CacheScope::All => self.store.clear(ns::CACHE),
        }
    }

    /// All entries currently stored, fresh or not, sorted by remote id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        for key in self.store.keys(ns::CACHE)? {
            if let Some(entry) = self.load(&key)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Number of stored entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn len(&self) -> Result<usize> {
        Ok(self.store.keys(ns::CACHE)?.len())
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn summary(&self) -> Result<CacheSummary> {
        let entries = self.entries()?;
        let fresh = entries.iter().filter(|e| self.entry_is_fresh(e)).count();
        Ok(CacheSummary {
            total: entries.len(),
            fresh,
            stale: entries.len() - fresh,
        })
    }

    fn load(&self, remote_id: &str) -> Result<Option<CacheEntry>> {
        let Some(raw) = self.store.get(ns::CACHE, remote_id)? else {
            return Ok(None);
        };
        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(mut entry) => {
                entry.remote_id = remote_id.to_string();
                Ok(Some(entry))
            }
            Err(e) => {
                tracing::warn!(%remote_id, error = %e, "unreadable cache entry");
                self.evict(remote_id)?;
                Ok(None)
            }
        }
    }

    fn evict(&self, remote_id: &str) -> Result<()> {
        if self.store.delete(ns::CACHE, remote_id)? {
            self.sink.emit(SyncEvent::CacheEvicted {
                remote_id: remote_id.to_string(),
            });
        }
        Ok(())
    }

    fn entry_is_fresh(&self, entry: &CacheEntry) -> bool {
        let ttl = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        self.clock.now_millis().saturating_sub(entry.fetched_at) < ttl
    }
}
