//! Sync orchestration.
//!
//! A run walks `Init → FetchRemote → Normalize → Compare → Apply → Report →
//! Done`. Each entity is committed on its own: remote push, local save, then
//! one atomic batch carrying the link, cache entry, base snapshot and
//! conflict set. A failure after the first write compensates the earlier
//! writes and never advances the base. One entity failing does not stop the
//! run; an authentication failure does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;

use crate::error::{Error, Result};
use crate::model::{EntityKind, Field, FieldValue, LocalEntity, NormalizedSnapshot};
use crate::remote::{Method, Params, RawRemoteRecord, RemoteClient, RemoteError, RemoteFetcher};
use crate::storage::{KeyValueStore, LocalStore};
use crate::sync::cache::{CacheScope, Clock, SyncCache};
use crate::sync::conflict::{ConflictDetector, Detection, Direction, FieldChange, SeedPolicy};
use crate::sync::events::{SharedSink, SyncEvent};
use crate::sync::hash::fingerprint;
use crate::sync::links::{LinkError, LinkTable};
use crate::sync::normalize::{Normalized, StateNormalizer};
use crate::sync::report::{EntityReport, Outcome, SyncReport};
use crate::sync::state::{base_op, conflicts_op, load_base, load_conflicts, ConflictSet, StoredBase};

/// Default number of entities processed in parallel.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Phase of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    FetchRemote,
    Normalize,
    Compare,
    Apply,
    Report,
    Done,
    Failed,
}

impl RunPhase {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::FetchRemote => "fetch_remote",
            Self::Normalize => "normalize",
            Self::Compare => "compare",
            Self::Apply => "apply",
            Self::Report => "report",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Errors raised by the sync core.
///
/// `Authentication` and `Listing` abort a whole run; the rest fail one
/// entity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("remote {remote_id} did not keep pushed field(s): {fields}")]
    PushIgnored { remote_id: String, fields: String },

    #[error("listing {endpoint} failed: {source}")]
    Listing {
        endpoint: String,
        source: RemoteError,
    },
}

/// A remote collection to mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub kind: EntityKind,
    pub endpoint: String,
    #[serde(default)]
    pub params: Params,
}

impl Collection {
    /// The collection at the kind's default endpoint.
    #[must_use]
    pub fn for_kind(kind: EntityKind) -> Self {
        Self {
            kind,
            endpoint: kind.default_endpoint().to_string(),
            params: Params::new(),
        }
    }
}

/// Per-run behavior switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Compute the report without writing anything.
    pub dry_run: bool,
    pub concurrency: usize,
    pub seed_policy: SeedPolicy,
    /// Create local entities for remote items that have no link.
    pub import_unlinked: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            concurrency: DEFAULT_CONCURRENCY,
            seed_policy: SeedPolicy::default(),
            import_unlinked: false,
        }
    }
}

/// Cooperative cancellation, checked between entities.
///
/// Stays set until [`CancelFlag::reset`].
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous cancellation so the orchestrator can run again.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One async mutex per key, dropped once nobody holds or awaits it.
#[derive(Default)]
struct KeyedLocks {
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let lock = self
            .locks
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone();
        KeyGuard {
            locks: self,
            key: key.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.locks.lock();
        if locks.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.key);
        }
    }
}

/// Builder for [`SyncOrchestrator`].
pub struct OrchestratorBuilder<C> {
    client: Arc<C>,
    local: Arc<dyn LocalStore>,
    store: Arc<dyn KeyValueStore>,
    sink: SharedSink,
    options: SyncOptions,
    per_page: Option<u32>,
    max_pages: Option<u32>,
    cache_ttl: Option<Duration>,
    clock: Option<Arc<dyn Clock>>,
}

impl<C: RemoteClient + 'static> OrchestratorBuilder<C> {
    #[must_use]
    pub fn options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn page_limits(mut self, per_page: u32, max_pages: u32) -> Self {
        self.per_page = Some(per_page);
        self.max_pages = Some(max_pages);
        self
    }

    #[must_use]
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> SyncOrchestrator<C> {
        let mut fetcher = RemoteFetcher::new(self.client, self.sink.clone());
        if let Some(per_page) = self.per_page {
            fetcher = fetcher.with_per_page(per_page);
        }
        if let Some(max_pages) = self.max_pages {
            fetcher = fetcher.with_max_pages(max_pages);
        }

        let mut cache = SyncCache::new(self.store.clone(), self.sink.clone());
        if let Some(ttl) = self.cache_ttl {
            cache = cache.with_ttl(ttl);
        }
        if let Some(clock) = self.clock {
            cache = cache.with_clock(clock);
        }

        SyncOrchestrator {
            inner: Arc::new(Inner {
                fetcher,
                normalizer: StateNormalizer::new(self.sink.clone()),
                cache,
                links: LinkTable::new(self.store.clone()),
                detector: ConflictDetector::new(self.options.seed_policy),
                local: self.local,
                store: self.store,
                sink: self.sink,
                options: self.options,
                locks: KeyedLocks::default(),
                cancel: CancelFlag::default(),
                phase: RwLock::new(RunPhase::Init),
            }),
        }
    }
}

/// Sequences fetch, normalization, comparison and apply for a collection.
pub struct SyncOrchestrator<C> {
    inner: Arc<Inner<C>>,
}

struct Inner<C> {
    fetcher: RemoteFetcher<C>,
    normalizer: StateNormalizer,
    cache: SyncCache,
    links: LinkTable,
    detector: ConflictDetector,
    local: Arc<dyn LocalStore>,
    store: Arc<dyn KeyValueStore>,
    sink: SharedSink,
    options: SyncOptions,
    locks: KeyedLocks,
    cancel: CancelFlag,
    phase: RwLock<RunPhase>,
}

/// How the local side of a pair was resolved.
#[derive(Debug, Clone)]
enum Pairing {
    Linked(LocalEntity),
    /// A local entity to be created from the remote item.
    Import(LocalEntity),
}

#[derive(Debug, Clone)]
struct EntityPlan {
    remote_id: String,
    local_id: String,
    pairing: Pairing,
    remote: NormalizedSnapshot,
    base: Option<StoredBase>,
    /// `None` when fingerprints show nothing changed.
    detection: Option<Detection>,
}

impl EntityPlan {
    fn local_before(&self) -> &LocalEntity {
        match &self.pairing {
            Pairing::Linked(entity) | Pairing::Import(entity) => entity,
        }
    }

    fn changes(&self) -> Vec<FieldChange> {
        self.detection.as_ref().map(Detection::changes).unwrap_or_default()
    }

    fn outcome(&self) -> Outcome {
        let Some(detection) = &self.detection else {
            return Outcome::Unchanged;
        };
        if matches!(self.pairing, Pairing::Import(_)) {
            return Outcome::Created;
        }
        if !detection.conflicts().is_empty() {
            return Outcome::Conflicted;
        }
        if detection.is_seed() {
            return Outcome::Seeded;
        }
        if detection.changes().is_empty() {
            Outcome::Unchanged
        } else {
            Outcome::Applied
        }
    }

    fn report(&self) -> EntityReport {
        let outcome = self.outcome();
        EntityReport {
            local_id: Some(self.local_id.clone()),
            remote_id: self.remote_id.clone(),
            status: Some(
                self.detection
                    .as_ref()
                    .map_or(crate::sync::conflict::EntityStatus::Clean, Detection::status),
            ),
            outcome,
            changes: self.changes(),
            conflicts: self
                .detection
                .as_ref()
                .map(Detection::conflicts)
                .unwrap_or_default(),
            error: None,
        }
    }
}

/// What one entity task produced.
struct TaskResult {
    report: EntityReport,
    fatal: Option<SyncError>,
}

impl<C: RemoteClient + 'static> SyncOrchestrator<C> {
    pub fn builder(
        client: Arc<C>,
        local: Arc<dyn LocalStore>,
        store: Arc<dyn KeyValueStore>,
    ) -> OrchestratorBuilder<C> {
        OrchestratorBuilder {
            client,
            local,
            store,
            sink: crate::sync::events::default_sink(),
            options: SyncOptions::default(),
            per_page: None,
            max_pages: None,
            cache_ttl: None,
            clock: None,
        }
    }

    /// Current (or final) phase of the most recent run.
    #[must_use]
    pub fn phase(&self) -> RunPhase {
        *self.inner.phase.read()
    }

    /// Handle that stops the run between entities.
    #[must_use]
    pub fn cancel_flag(&self) -> CancelFlag {
        self.inner.cancel.clone()
    }

    #[must_use]
    pub fn options(&self) -> SyncOptions {
        self.inner.options
    }

    #[must_use]
    pub fn cache(&self) -> &SyncCache {
        &self.inner.cache
    }

    #[must_use]
    pub fn links(&self) -> &LinkTable {
        &self.inner.links
    }

    /// Sync every item of a remote collection.
    ///
    /// # Errors
    ///
    /// Fails (phase `Failed`) when the listing itself fails or the remote
    /// rejects the credentials. Per-entity failures are reported instead.
    pub async fn run(&self, collection: &Collection) -> Result<SyncReport> {
        let inner = &self.inner;
        let started = Instant::now();
        inner.set_phase(RunPhase::Init);
        tracing::debug!(endpoint = %collection.endpoint, kind = %collection.kind, "sync run starting");

        inner.set_phase(RunPhase::FetchRemote);
        let raw = match inner.fetcher.fetch_all(&collection.endpoint, &collection.params).await {
            Ok(raw) => raw,
            Err(e) => return Err(inner.fail_listing(&collection.endpoint, e)),
        };

        inner.set_phase(RunPhase::Normalize);
        let (remotes, mut reports) = inner.normalize_all(&raw);

        let mut report = self.execute(collection, remotes, &mut reports, false).await?;
        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            endpoint = %collection.endpoint,
            entities = report.entities.len(),
            applied = report.total_applied(),
            conflicted = report.count(Outcome::Conflicted),
            failed = report.count(Outcome::Failed),
            dry_run = report.dry_run,
            "sync run finished"
        );
        Ok(report)
    }

    /// Sync specific linked local entities.
    ///
    /// A fresh cache entry stands in for the remote state; otherwise the
    /// single item is fetched.
    ///
    /// # Errors
    ///
    /// Fails before doing anything if an id is not linked, and aborts on
    /// authentication failure.
    pub async fn sync_entities(&self, collection: &Collection, local_ids: &[String]) -> Result<SyncReport> {
        let inner = &self.inner;
        let started = Instant::now();
        inner.set_phase(RunPhase::Init);

        let mut targets = Vec::with_capacity(local_ids.len());
        for local_id in local_ids {
            let remote_id = inner
                .links
                .remote_for(local_id)?
                .ok_or_else(|| LinkError::NotLinked { id: local_id.clone() })?;
            targets.push(remote_id);
        }

        inner.set_phase(RunPhase::FetchRemote);
        let mut remotes = Vec::new();
        let mut reports = Vec::new();
        for remote_id in targets {
            if let Some(snapshot) = inner.cache.get(&remote_id)? {
                tracing::debug!(%remote_id, "cache hit");
                remotes.push(snapshot);
                continue;
            }
            match inner.fetcher.fetch_one(&collection.endpoint, &remote_id).await {
                Ok(Some(raw)) => match inner.normalize_one(&raw) {
                    Ok(snapshot) => remotes.push(snapshot),
                    Err(report) => reports.push(*report),
                },
                Ok(None) => {
                    let local_id = local_for_lossy(&inner.links, &remote_id);
                    reports.push(EntityReport::failed(
                        remote_id,
                        local_id,
                        "remote entity no longer exists".to_string(),
                    ));
                }
                Err(e) if e.is_fatal() => {
                    inner.set_phase(RunPhase::Failed);
                    return Err(SyncError::Authentication(e.to_string()).into());
                }
                Err(e) => {
                    let local_id = local_for_lossy(&inner.links, &remote_id);
                    reports.push(EntityReport::failed(remote_id, local_id, e.to_string()));
                }
            }
        }
        inner.set_phase(RunPhase::Normalize);

        let mut report = self.execute(collection, remotes, &mut reports, true).await?;
        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(report)
    }

    async fn execute(
        &self,
        collection: &Collection,
        remotes: Vec<NormalizedSnapshot>,
        reports: &mut Vec<EntityReport>,
        targeted: bool,
    ) -> Result<SyncReport> {
        let inner = &self.inner;
        let mut skipped_unlinked = 0usize;

        inner.set_phase(RunPhase::Compare);
        let mut plans = Vec::with_capacity(remotes.len());
        for remote in remotes {
            match inner.plan(collection.kind, remote, targeted) {
                Ok(Some(plan)) => plans.push(plan),
                Ok(None) => skipped_unlinked += 1,
                Err(report) => reports.push(*report),
            }
        }

        inner.set_phase(RunPhase::Apply);
        let mut fatal = None;
        if inner.options.dry_run {
            reports.extend(plans.iter().map(EntityPlan::report));
        } else {
            let semaphore = Arc::new(Semaphore::new(inner.options.concurrency.max(1)));
            let abort = Arc::new(AtomicBool::new(false));
            let mut tasks = JoinSet::new();
            for plan in plans {
                let inner = Arc::clone(&self.inner);
                let semaphore = Arc::clone(&semaphore);
                let abort = Arc::clone(&abort);
                let collection = collection.clone();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    inner.process(&collection, plan, &abort).await
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(result) => {
                        if let Some(err) = result.fatal {
                            abort.store(true, Ordering::SeqCst);
                            fatal.get_or_insert(err);
                        }
                        reports.push(result.report);
                    }
                    Err(e) => tracing::error!(error = %e, "entity task aborted"),
                }
            }
        }

        if let Some(err) = fatal {
            inner.set_phase(RunPhase::Failed);
            return Err(err.into());
        }

        inner.set_phase(RunPhase::Report);
        reports.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
        let report = SyncReport {
            kind: collection.kind,
            endpoint: collection.endpoint.clone(),
            dry_run: inner.options.dry_run,
            entities: std::mem::take(reports),
            skipped_unlinked,
            duration_ms: 0,
        };
        inner.set_phase(RunPhase::Done);
        Ok(report)
    }
}

fn local_for_lossy(links: &LinkTable, remote_id: &str) -> Option<String> {
    links.local_for(remote_id).ok().flatten()
}

impl<C: RemoteClient + 'static> Inner<C> {
    fn set_phase(&self, phase: RunPhase) {
        *self.phase.write() = phase;
        self.sink.emit(SyncEvent::PhaseChanged { phase });
    }

    fn fail_listing(&self, endpoint: &str, e: RemoteError) -> Error {
        self.set_phase(RunPhase::Failed);
        if e.is_fatal() {
            SyncError::Authentication(e.to_string()).into()
        } else {
            SyncError::Listing {
                endpoint: endpoint.to_string(),
                source: e,
            }
            .into()
        }
    }

    fn normalize_all(&self, raw: &[RawRemoteRecord]) -> (Vec<NormalizedSnapshot>, Vec<EntityReport>) {
        let mut remotes = Vec::with_capacity(raw.len());
        let mut reports = Vec::new();
        for record in raw {
            match self.normalize_one(record) {
                Ok(snapshot) => remotes.push(snapshot),
                Err(report) => reports.push(*report),
            }
        }
        (remotes, reports)
    }

    fn normalize_one(&self, raw: &RawRemoteRecord) -> std::result::Result<NormalizedSnapshot, Box<EntityReport>> {
        match self.normalizer.normalize(raw) {
            Normalized::Present(snapshot) => Ok(snapshot),
            Normalized::Absent(degraded) => {
                let remote_id = raw.remote_id().unwrap_or_else(|| "(unknown)".to_string());
                Err(Box::new(EntityReport::failed(
                    remote_id.clone(),
                    local_for_lossy(&self.links, &remote_id),
                    format!("normalization failed: {degraded}"),
                )))
            }
        }
    }

    /// Resolve the pair and run detection. `Ok(None)` skips an unlinked item.
    fn plan(
        &self,
        kind: EntityKind,
        remote: NormalizedSnapshot,
        targeted: bool,
    ) -> std::result::Result<Option<EntityPlan>, Box<EntityReport>> {
        let remote_id = remote.id.clone();
        let fail = |local_id: Option<String>, e: &dyn std::fmt::Display| {
            Box::new(EntityReport::failed(remote_id.clone(), local_id, e.to_string()))
        };

        let linked = self.links.local_for(&remote_id).map_err(|e| fail(None, &e))?;
        let pairing = match linked {
            Some(local_id) => match self.local.load(&local_id) {
                Ok(Some(entity)) => Pairing::Linked(entity),
                Ok(None) => {
                    return Err(fail(
                        Some(local_id.clone()),
                        &Error::EntityNotFound { id: local_id },
                    ));
                }
                Err(e) => return Err(fail(Some(local_id), &e)),
            },
            None if self.options.import_unlinked && !targeted => {
                Pairing::Import(entity_from_remote(kind, &remote))
            }
            None => return Ok(None),
        };

        let local_entity = match &pairing {
            Pairing::Linked(entity) | Pairing::Import(entity) => entity,
        };
        let local_id = local_entity.id.clone();
        let local = self.normalizer.normalize_local(local_entity);

        let base = load_base(self.store.as_ref(), &remote_id).map_err(|e| fail(Some(local_id.clone()), &e))?;

        let detection = match &base {
            Some(stored)
                if fingerprint(&local) == stored.fingerprint
                    && fingerprint(&remote) == stored.fingerprint =>
            {
                None
            }
            _ => Some(self.detector.detect(base.as_ref().map(|b| &b.snapshot), &local, &remote)),
        };

        Ok(Some(EntityPlan {
            remote_id,
            local_id,
            pairing,
            remote,
            base,
            detection,
        }))
    }

    /// Re-plan under the entity lock if anything moved since planning.
    fn refresh(&self, kind: EntityKind, plan: EntityPlan) -> std::result::Result<Option<EntityPlan>, Box<EntityReport>> {
        let base_now = load_base(self.store.as_ref(), &plan.remote_id).ok().flatten();
        let local_now = match &plan.pairing {
            Pairing::Linked(entity) => self.local.load(&entity.id).ok().flatten(),
            Pairing::Import(_) => None,
        };
        let link_now = local_for_lossy(&self.links, &plan.remote_id);

        let unchanged = base_now.as_ref().map(|b| &b.fingerprint)
            == plan.base.as_ref().map(|b| &b.fingerprint)
            && match &plan.pairing {
                Pairing::Linked(before) => local_now.as_ref() == Some(before),
                Pairing::Import(_) => link_now.is_none(),
            };
        if unchanged {
            return Ok(Some(plan));
        }
        tracing::debug!(remote_id = %plan.remote_id, "state moved since planning, re-planning");
        let was_linked = matches!(plan.pairing, Pairing::Linked(_));
        self.plan(kind, plan.remote, was_linked)
    }

    async fn process(&self, collection: &Collection, plan: EntityPlan, abort: &AtomicBool) -> TaskResult {
        let remote_id = plan.remote_id.clone();
        if self.cancel.is_cancelled() || abort.load(Ordering::SeqCst) {
            return TaskResult {
                report: EntityReport::cancelled(remote_id, Some(plan.local_id)),
                fatal: None,
            };
        }

        let _guard = self.locks.lock(&remote_id).await;

        let plan = match self.refresh(collection.kind, plan) {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                return TaskResult {
                    report: EntityReport::failed(remote_id, None, "link removed during sync".to_string()),
                    fatal: None,
                };
            }
            Err(report) => {
                return TaskResult {
                    report: *report,
                    fatal: None,
                };
            }
        };

        match self.apply(collection, &plan).await {
            Ok(()) => {
                let report = plan.report();
                if plan.detection.is_some() {
                    self.sink.emit(SyncEvent::EntityCommitted {
                        local_id: plan.local_id.clone(),
                        remote_id: remote_id.clone(),
                        applied: report.changes.len(),
                    });
                }
                for conflict in &report.conflicts {
                    self.sink.emit(SyncEvent::ConflictDetected {
                        local_id: plan.local_id.clone(),
                        remote_id: remote_id.clone(),
                        field: conflict.field,
                    });
                }
                TaskResult { report, fatal: None }
            }
            Err(e) => {
                self.sink.emit(SyncEvent::EntityFailed {
                    remote_id: remote_id.clone(),
                    error: e.to_string(),
                });
                let fatal = match &e {
                    Error::Remote(remote) if remote.is_fatal() => {
                        Some(SyncError::Authentication(remote.to_string()))
                    }
                    _ => None,
                };
                let mut report = plan.report();
                report.outcome = Outcome::Failed;
                report.error = Some(e.to_string());
                TaskResult { report, fatal }
            }
        }
    }

    /// Push, save, commit. Compensates on failure after the first write.
    async fn apply(&self, collection: &Collection, plan: &EntityPlan) -> Result<()> {
        let Some(detection) = &plan.detection else {
            self.refresh_cache(plan);
            return Ok(());
        };

        let changes = detection.changes();
        let to_remote: Vec<&FieldChange> = changes
            .iter()
            .filter(|c| c.direction == Direction::ToRemote)
            .collect();
        let to_local: Vec<&FieldChange> = changes
            .iter()
            .filter(|c| c.direction == Direction::ToLocal)
            .collect();

        let is_import = matches!(plan.pairing, Pairing::Import(_));
        let conflicts = ConflictSet {
            local_id: plan.local_id.clone(),
            remote_id: plan.remote_id.clone(),
            detected_at: chrono::Utc::now().timestamp_millis(),
            conflicts: detection.conflicts(),
        };
        let conflicts_moved = load_conflicts(self.store.as_ref(), &plan.remote_id)?
            .map(|stored| stored.conflicts)
            .unwrap_or_default()
            != conflicts.conflicts;

        if to_remote.is_empty() && to_local.is_empty() && !is_import {
            let next_base = StoredBase::new(detection.next_base(&plan.remote));
            let base_moved = plan.base.as_ref().map(|b| &b.fingerprint) != Some(&next_base.fingerprint);
            if !base_moved && !conflicts_moved {
                self.refresh_cache(plan);
                return Ok(());
            }
        }

        let item_path = format!("{}/{}", collection.endpoint.trim_end_matches('/'), plan.remote_id);

        // 1. Remote
        let remote_after = if to_remote.is_empty() {
            plan.remote.clone()
        } else {
            let body = field_params(to_remote.iter().map(|c| (c.field, &c.value)));
            let response = self
                .fetcher
                .client()
                .request(Method::Patch, &item_path, &body)
                .await?;
            let remote_after = self.pushed_state(plan, &to_remote, response.body);
            let ignored: Vec<&str> = to_remote
                .iter()
                .filter(|c| remote_after.get(c.field) != c.value)
                .map(|c| c.field.as_str())
                .collect();
            if !ignored.is_empty() {
                self.compensate(plan, &item_path, &to_remote, false).await;
                return Err(SyncError::PushIgnored {
                    remote_id: plan.remote_id.clone(),
                    fields: ignored.join(", "),
                }
                .into());
            }
            remote_after
        };
        let next_base = StoredBase::new(detection.next_base(&remote_after));

        // 2. Local
        let before = plan.local_before();
        let local_written = !to_local.is_empty() || is_import;
        if local_written {
            let mut updated = before.clone();
            for change in &to_local {
                apply_to_local(&mut updated, change.field, &change.value);
            }
            updated.touch();
            if let Err(e) = self.local.save(&updated) {
                self.compensate(plan, &item_path, &to_remote, false).await;
                return Err(e);
            }
        }

        // 3. Link + cache + base + conflicts, atomically
        let batch = self
            .cache
            .put_op(&plan.remote_id, &remote_after)
            .and_then(|cache_op| {
                Ok(vec![
                    cache_op,
                    base_op(&plan.remote_id, &next_base)?,
                    conflicts_op(&conflicts)?,
                ])
            });
        let committed = batch.and_then(|writes| {
            self.links
                .commit_with(&plan.local_id, &plan.remote_id, writes)
                .map_err(Error::from)
        });
        if let Err(e) = committed {
            self.compensate(plan, &item_path, &to_remote, local_written).await;
            return Err(e);
        }

        Ok(())
    }

    /// Undo the local save and revert pushed remote fields, best effort.
    async fn compensate(&self, plan: &EntityPlan, item_path: &str, pushed: &[&FieldChange], local_written: bool) {
        let mut detail = Vec::new();

        if let Err(e) = self.cache.invalidate(&CacheScope::One(plan.remote_id.clone())) {
            tracing::warn!(remote_id = %plan.remote_id, error = %e, "cache invalidation failed");
        }

        if local_written {
            let restored = match &plan.pairing {
                Pairing::Linked(before) => self.local.save(before),
                Pairing::Import(created) => self.local.remove(&created.id).map(|_| ()),
            };
            match restored {
                Ok(()) => detail.push("local restored".to_string()),
                Err(e) => {
                    tracing::warn!(remote_id = %plan.remote_id, error = %e, "local restore failed");
                    detail.push(format!("local restore failed: {e}"));
                }
            }
        }

        if !pushed.is_empty() {
            let originals: Vec<(Field, FieldValue)> = pushed
                .iter()
                .map(|c| (c.field, plan.remote.get(c.field)))
                .collect();
            let body = field_params(originals.iter().map(|(field, value)| (*field, value)));
            match self.fetcher.client().request(Method::Patch, item_path, &body).await {
                Ok(_) => detail.push(format!("{} remote field(s) reverted", pushed.len())),
                Err(e) => {
                    tracing::warn!(remote_id = %plan.remote_id, error = %e, "remote revert failed");
                    detail.push(format!("remote revert failed: {e}"));
                }
            }
        }

        if !detail.is_empty() {
            self.sink.emit(SyncEvent::CompensationApplied {
                remote_id: plan.remote_id.clone(),
                detail: detail.join("; "),
            });
        }
    }
}

impl<C: RemoteClient + 'static> Inner<C> {
    /// Remote state after a push: the PATCH response when it normalizes,
    /// otherwise the listed state with the pushed fields applied.
    fn pushed_state(&self, plan: &EntityPlan, pushed: &[&FieldChange], body: Value) -> NormalizedSnapshot {
        let echoed = match body {
            Value::Null => None,
            Value::Object(map) if map.is_empty() => None,
            body => self.normalizer.normalize(&RawRemoteRecord::Payload(body)).present(),
        };
        if let Some(mut snapshot) = echoed {
            snapshot.id.clone_from(&plan.remote_id);
            return snapshot;
        }
        let mut snapshot = plan.remote.clone();
        for change in pushed {
            snapshot.set(change.field, change.value.clone());
        }
        snapshot
    }

    /// Cache the observed remote state of an entity that needed no writes.
    fn refresh_cache(&self, plan: &EntityPlan) {
        if let Err(e) = self.cache.put(&plan.remote_id, &plan.remote) {
            tracing::warn!(remote_id = %plan.remote_id, error = %e, "cache write failed");
        }
    }
}

/// JSON body for a field update.
fn field_params<'a>(fields: impl Iterator<Item = (Field, &'a FieldValue)>) -> Params {
    fields
        .map(|(field, value)| (field.as_str().to_string(), value.to_json()))
        .collect::<serde_json::Map<String, Value>>()
}

/// Write one resolved value into a local entity.
fn apply_to_local(entity: &mut LocalEntity, field: Field, value: &FieldValue) {
    let mut snapshot = NormalizedSnapshot::default();
    snapshot.set(field, value.clone());
    match field {
        Field::Title => entity.title = snapshot.title.unwrap_or_default(),
        Field::Status => entity.status = snapshot.status.unwrap_or_default(),
        Field::Assignee => entity.assignee = snapshot.assignee,
        Field::Milestone => entity.milestone = snapshot.milestone,
        Field::Description => entity.description = snapshot.description,
        Field::Labels => entity.labels = snapshot.labels,
    }
}

/// A new local entity mirroring a remote item.
fn entity_from_remote(kind: EntityKind, remote: &NormalizedSnapshot) -> LocalEntity {
    let mut entity = LocalEntity::new(kind, remote.title.clone().unwrap_or_default());
    entity.status = remote.status.clone().unwrap_or_default();
    entity.assignee = remote.assignee.clone();
    entity.milestone = remote.milestone.clone();
    entity.description = remote.description.clone();
    entity.labels = remote.labels.clone();
    entity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryLocalStore, MemoryStore};
    use crate::sync::cache::ManualClock;
    use crate::sync::conflict::EntityStatus;
    use crate::sync::events::RecordingSink;
    use crate::sync::state::list_conflicts;
    use crate::testing::{FlakyStore, ScriptedClient};
    use serde_json::json;

    struct Harness {
        client: Arc<ScriptedClient>,
        local: Arc<MemoryLocalStore>,
        store: Arc<dyn KeyValueStore>,
        sink: Arc<RecordingSink>,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        fn new(client: ScriptedClient) -> Self {
            Self::with_store(client, Arc::new(MemoryStore::new()))
        }

        fn with_store(client: ScriptedClient, store: Arc<dyn KeyValueStore>) -> Self {
            Self {
                client: Arc::new(client),
                local: Arc::new(MemoryLocalStore::new()),
                store,
                sink: Arc::new(RecordingSink::new()),
                clock: Arc::new(ManualClock::at(1_700_000_000_000)),
            }
        }

        /// Save a local entity and link it to `remote_id`.
        fn linked(&self, remote_id: &str, entity: LocalEntity) -> String {
            self.local.save(&entity).unwrap();
            LinkTable::new(self.store.clone())
                .link(&entity.id, remote_id)
                .unwrap();
            entity.id
        }

        fn orchestrator(&self, options: SyncOptions) -> SyncOrchestrator<ScriptedClient> {
            SyncOrchestrator::builder(self.client.clone(), self.local.clone(), self.store.clone())
                .options(options)
                .sink(self.sink.clone())
                .clock(self.clock.clone())
                .build()
        }

        fn entity(&self, id: &str) -> LocalEntity {
            self.local.load(id).unwrap().unwrap()
        }

        fn edit_local(&self, id: &str, f: impl FnOnce(&mut LocalEntity)) {
            let mut entity = self.entity(id);
            f(&mut entity);
            self.local.save(&entity).unwrap();
        }
    }

    fn issues() -> Collection {
        Collection::for_kind(EntityKind::Issue)
    }

    fn remote_issue(number: u64, title: &str, state: &str) -> Value {
        json!({
            "number": number,
            "title": title,
            "state": state,
            "assignee": {"login": "alice"},
            "updated_at": "2026-01-01T00:00:00Z",
        })
    }

    fn local_issue(title: &str, status: &str) -> LocalEntity {
        let mut entity = LocalEntity::new(EntityKind::Issue, title);
        entity.status = status.to_string();
        entity
    }

    /// One linked pair: remote #1 has an assignee the local copy lacks.
    fn seeded_pair() -> (Harness, String) {
        let harness = Harness::new(
            ScriptedClient::new().item("issues", remote_issue(1, "Fix login", "open")),
        );
        let local_id = harness.linked("1", local_issue("Fix login", "todo"));
        (harness, local_id)
    }

    #[tokio::test]
    async fn test_seed_fills_empty_local_fields() {
        let (harness, local_id) = seeded_pair();
        let report = harness.orchestrator(SyncOptions::default()).run(&issues()).await.unwrap();

        let entity = report.entity("1").unwrap();
        assert_eq!(entity.outcome, Outcome::Seeded);
        assert_eq!(entity.status, Some(EntityStatus::Partial));
        assert_eq!(entity.applied_local(), 1);
        assert_eq!(harness.entity(&local_id).assignee.as_deref(), Some("alice"));
        assert!(harness.client.patches().is_empty());
        assert!(load_base(harness.store.as_ref(), "1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let (harness, _) = seeded_pair();
        let orchestrator = harness.orchestrator(SyncOptions::default());
        orchestrator.run(&issues()).await.unwrap();

        let report = orchestrator.run(&issues()).await.unwrap();
        assert_eq!(report.count(Outcome::Unchanged), 1);
        assert_eq!(report.total_applied(), 0);
        assert!(harness.client.patches().is_empty());
    }

    #[tokio::test]
    async fn test_remote_edit_flows_to_local() {
        let (harness, local_id) = seeded_pair();
        let orchestrator = harness.orchestrator(SyncOptions::default());
        orchestrator.run(&issues()).await.unwrap();

        harness.client.edit("issues", "1", &json!({"state": "closed"}));
        let report = orchestrator.run(&issues()).await.unwrap();

        let entity = report.entity("1").unwrap();
        assert_eq!(entity.outcome, Outcome::Applied);
        assert_eq!(entity.status, Some(EntityStatus::Partial));
        assert_eq!(entity.applied_local(), 1);
        assert_eq!(harness.entity(&local_id).status, "done");
        assert!(harness.client.patches().is_empty());
    }

    #[tokio::test]
    async fn test_local_edit_is_pushed() {
        let (harness, local_id) = seeded_pair();
        let orchestrator = harness.orchestrator(SyncOptions::default());
        orchestrator.run(&issues()).await.unwrap();

        harness.edit_local(&local_id, |e| e.title = "Fix login page".into());
        let report = orchestrator.run(&issues()).await.unwrap();
        assert_eq!(report.entity("1").unwrap().applied_remote(), 1);

        let patches = harness.client.patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].0, "issues/1");
        assert_eq!(patches[0].1["title"], json!("Fix login page"));
        assert_eq!(
            harness.client.remote_item("issues", "1").unwrap()["title"],
            json!("Fix login page")
        );

        let report = orchestrator.run(&issues()).await.unwrap();
        assert_eq!(report.count(Outcome::Unchanged), 1);
        assert_eq!(harness.client.patches().len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_is_recorded_and_not_applied() {
        let (harness, local_id) = seeded_pair();
        let orchestrator = harness.orchestrator(SyncOptions::default());
        orchestrator.run(&issues()).await.unwrap();

        harness.edit_local(&local_id, |e| e.status = "in-progress".into());
        harness.client.edit("issues", "1", &json!({"state": "closed"}));

        let report = orchestrator.run(&issues()).await.unwrap();
        let entity = report.entity("1").unwrap();
        assert_eq!(entity.outcome, Outcome::Conflicted);
        assert_eq!(entity.status, Some(EntityStatus::Conflicted));
        assert_eq!(entity.conflicts.len(), 1);
        assert_eq!(entity.conflicts[0].field, Field::Status);

        assert_eq!(harness.entity(&local_id).status, "in-progress");
        assert!(harness.client.patches().is_empty());

        let base = load_base(harness.store.as_ref(), "1").unwrap().unwrap();
        assert_eq!(base.snapshot.status.as_deref(), Some("todo"));
        assert_eq!(list_conflicts(harness.store.as_ref()).unwrap().len(), 1);

        // Unresolved conflicts surface again on the next run.
        let report = orchestrator.run(&issues()).await.unwrap();
        assert_eq!(report.count(Outcome::Conflicted), 1);
        assert_eq!(
            harness.sink.count(|e| matches!(e, SyncEvent::ConflictDetected { .. })),
            2
        );
    }

    #[tokio::test]
    async fn test_resolving_a_conflict_clears_it() {
        let (harness, local_id) = seeded_pair();
        let orchestrator = harness.orchestrator(SyncOptions::default());
        orchestrator.run(&issues()).await.unwrap();

        harness.edit_local(&local_id, |e| e.status = "in-progress".into());
        harness.client.edit("issues", "1", &json!({"state": "closed"}));
        orchestrator.run(&issues()).await.unwrap();

        harness.edit_local(&local_id, |e| e.status = "done".into());
        let report = orchestrator.run(&issues()).await.unwrap();
        assert_eq!(report.count(Outcome::Conflicted), 0);
        assert!(list_conflicts(harness.store.as_ref()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_first_sync_never_conflicts() {
        let harness = Harness::new(
            ScriptedClient::new().item("issues", remote_issue(1, "Fix login", "closed")),
        );
        harness.linked("1", local_issue("Fix login", "blocked"));

        let report = harness.orchestrator(SyncOptions::default()).run(&issues()).await.unwrap();
        let entity = report.entity("1").unwrap();
        assert_eq!(entity.outcome, Outcome::Seeded);
        assert_ne!(entity.status, Some(EntityStatus::Conflicted));
        assert_eq!(
            harness.client.remote_item("issues", "1").unwrap()["status"],
            json!("blocked")
        );
    }

    #[tokio::test]
    async fn test_prefer_remote_seed_policy() {
        let harness = Harness::new(
            ScriptedClient::new().item("issues", remote_issue(1, "Fix login", "closed")),
        );
        let local_id = harness.linked("1", local_issue("Fix login", "blocked"));

        let options = SyncOptions {
            seed_policy: SeedPolicy::PreferRemote,
            ..SyncOptions::default()
        };
        harness.orchestrator(options).run(&issues()).await.unwrap();
        assert_eq!(harness.entity(&local_id).status, "done");
        assert!(harness.client.patches().is_empty());
    }

    #[tokio::test]
    async fn test_entity_failure_is_isolated() {
        let harness = Harness::new(
            ScriptedClient::new()
                .item("issues", remote_issue(1, "One", "open"))
                .item("issues", remote_issue(2, "Two", "open")),
        );
        let first = harness.linked("1", local_issue("One", "todo"));
        let second = harness.linked("2", local_issue("Two", "todo"));
        let orchestrator = harness.orchestrator(SyncOptions::default());
        orchestrator.run(&issues()).await.unwrap();

        harness.edit_local(&first, |e| e.title = "One!".into());
        harness.edit_local(&second, |e| e.title = "Two!".into());
        harness.client.fail(
            Method::Patch,
            "issues/2",
            RemoteError::Status {
                code: 500,
                body: "oops".into(),
            },
        );

        let report = orchestrator.run(&issues()).await.unwrap();
        assert!(report.has_failures());
        assert_eq!(report.entity("1").unwrap().outcome, Outcome::Applied);
        let failed = report.entity("2").unwrap();
        assert_eq!(failed.outcome, Outcome::Failed);
        assert!(failed.error.as_deref().unwrap().contains("500"));

        let base = load_base(harness.store.as_ref(), "2").unwrap().unwrap();
        assert_eq!(base.snapshot.title.as_deref(), Some("Two"));

        // Retried once the remote recovers.
        harness.client.clear_failures();
        let report = orchestrator.run(&issues()).await.unwrap();
        assert_eq!(report.entity("2").unwrap().outcome, Outcome::Applied);
    }

    #[tokio::test]
    async fn test_failed_commit_compensates_both_sides() {
        let store = Arc::new(FlakyStore::new());
        let harness = Harness::with_store(
            ScriptedClient::new().item("issues", remote_issue(1, "Fix login", "open")),
            store.clone(),
        );
        let local_id = harness.linked("1", local_issue("Fix login", "todo"));
        let orchestrator = harness.orchestrator(SyncOptions::default());
        orchestrator.run(&issues()).await.unwrap();

        harness.edit_local(&local_id, |e| e.title = "Fix login page".into());
        harness.client.edit("issues", "1", &json!({"state": "closed"}));
        store.fail_batches(true);

        let report = orchestrator.run(&issues()).await.unwrap();
        assert_eq!(report.entity("1").unwrap().outcome, Outcome::Failed);

        let entity = harness.entity(&local_id);
        assert_eq!(entity.status, "todo");
        assert_eq!(entity.title, "Fix login page");
        assert_eq!(
            harness.client.remote_item("issues", "1").unwrap()["title"],
            json!("Fix login")
        );
        assert_eq!(
            harness.sink.count(|e| matches!(e, SyncEvent::CompensationApplied { .. })),
            1
        );
        let base = load_base(harness.store.as_ref(), "1").unwrap().unwrap();
        assert_eq!(base.snapshot.status.as_deref(), Some("todo"));
    }

    #[tokio::test]
    async fn test_authentication_failure_aborts_listing() {
        let (harness, _) = seeded_pair();
        harness.client.fail(
            Method::Get,
            "issues",
            RemoteError::Authentication("bad token".into()),
        );
        let orchestrator = harness.orchestrator(SyncOptions::default());

        let err = orchestrator.run(&issues()).await.unwrap_err();
        assert!(matches!(err, Error::Sync(SyncError::Authentication(_))));
        assert_eq!(orchestrator.phase(), RunPhase::Failed);
    }

    #[tokio::test]
    async fn test_authentication_failure_aborts_push() {
        let (harness, local_id) = seeded_pair();
        let orchestrator = harness.orchestrator(SyncOptions::default());
        orchestrator.run(&issues()).await.unwrap();

        harness.edit_local(&local_id, |e| e.title = "Renamed".into());
        harness.client.fail(
            Method::Patch,
            "issues/1",
            RemoteError::Authentication("token revoked".into()),
        );

        let err = orchestrator.run(&issues()).await.unwrap_err();
        assert!(matches!(err, Error::Sync(SyncError::Authentication(_))));
        assert_eq!(orchestrator.phase(), RunPhase::Failed);
    }

    #[tokio::test]
    async fn test_listing_failure_is_reported() {
        let (harness, _) = seeded_pair();
        harness.client.fail(
            Method::Get,
            "issues",
            RemoteError::Status {
                code: 502,
                body: "bad gateway".into(),
            },
        );

        let err = harness
            .orchestrator(SyncOptions::default())
            .run(&issues())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Sync(SyncError::Listing { ref endpoint, .. }) if endpoint == "issues"));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let (harness, local_id) = seeded_pair();
        let options = SyncOptions {
            dry_run: true,
            ..SyncOptions::default()
        };
        let orchestrator = harness.orchestrator(options);

        let report = orchestrator.run(&issues()).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.entity("1").unwrap().outcome, Outcome::Seeded);
        assert_eq!(report.total_applied(), 1);

        assert_eq!(harness.entity(&local_id).assignee, None);
        assert!(load_base(harness.store.as_ref(), "1").unwrap().is_none());
        assert!(orchestrator.cache().is_empty().unwrap());
        assert!(harness.client.patches().is_empty());
    }

    #[tokio::test]
    async fn test_unlinked_items_are_skipped_or_imported() {
        let harness = Harness::new(
            ScriptedClient::new().item("issues", remote_issue(7, "Stray", "open")),
        );

        let report = harness.orchestrator(SyncOptions::default()).run(&issues()).await.unwrap();
        assert_eq!(report.skipped_unlinked, 1);
        assert!(report.entities.is_empty());
        assert!(harness.local.is_empty());

        let options = SyncOptions {
            import_unlinked: true,
            ..SyncOptions::default()
        };
        let orchestrator = harness.orchestrator(options);
        let report = orchestrator.run(&issues()).await.unwrap();
        let entity = report.entity("7").unwrap();
        assert_eq!(entity.outcome, Outcome::Created);

        let local_id = orchestrator.links().local_for("7").unwrap().unwrap();
        let created = harness.entity(&local_id);
        assert_eq!(created.title, "Stray");
        assert_eq!(created.assignee.as_deref(), Some("alice"));
        assert_eq!(harness.local.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_entities_uses_fresh_cache() {
        let (harness, local_id) = seeded_pair();
        let orchestrator = harness.orchestrator(SyncOptions::default());
        orchestrator.run(&issues()).await.unwrap();

        let report = orchestrator
            .sync_entities(&issues(), &[local_id.clone()])
            .await
            .unwrap();
        assert_eq!(report.count(Outcome::Unchanged), 1);
        assert_eq!(harness.client.requests_to("issues/1"), 0);

        harness.clock.advance(Duration::from_secs(301));
        orchestrator
            .sync_entities(&issues(), &[local_id])
            .await
            .unwrap();
        assert_eq!(harness.client.requests_to("issues/1"), 1);
    }

    #[tokio::test]
    async fn test_sync_entities_rejects_unlinked_ids() {
        let (harness, _) = seeded_pair();
        let err = harness
            .orchestrator(SyncOptions::default())
            .sync_entities(&issues(), &["issue_missing".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Link(LinkError::NotLinked { .. })));
    }

    #[tokio::test]
    async fn test_sync_entities_reports_deleted_remote() {
        let harness = Harness::new(ScriptedClient::new());
        let local_id = harness.linked("9", local_issue("Gone", "todo"));

        let report = harness
            .orchestrator(SyncOptions::default())
            .sync_entities(&issues(), &[local_id.clone()])
            .await
            .unwrap();
        let entity = report.entity("9").unwrap();
        assert_eq!(entity.outcome, Outcome::Failed);
        assert_eq!(entity.local_id.as_deref(), Some(local_id.as_str()));
    }

    #[tokio::test]
    async fn test_unnormalizable_item_is_reported() {
        let harness = Harness::new(
            ScriptedClient::new().item("issues", json!({"title": "no id"})),
        );
        let report = harness.orchestrator(SyncOptions::default()).run(&issues()).await.unwrap();

        assert_eq!(report.count(Outcome::Failed), 1);
        assert!(report.entities[0]
            .error
            .as_deref()
            .unwrap()
            .starts_with("normalization failed"));
        assert_eq!(
            harness.sink.count(|e| matches!(e, SyncEvent::NormalizationFailed { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_until_reset() {
        let (harness, local_id) = seeded_pair();
        let orchestrator = harness.orchestrator(SyncOptions::default());
        orchestrator.cancel_flag().cancel();

        let report = orchestrator.run(&issues()).await.unwrap();
        assert_eq!(report.count(Outcome::Cancelled), 1);
        assert_eq!(harness.entity(&local_id).assignee, None);

        let report = orchestrator.run(&issues()).await.unwrap();
        assert_eq!(report.count(Outcome::Cancelled), 1);

        orchestrator.cancel_flag().reset();
        let report = orchestrator.run(&issues()).await.unwrap();
        assert_eq!(report.count(Outcome::Seeded), 1);
    }

    #[tokio::test]
    async fn test_phases_in_order() {
        let (harness, _) = seeded_pair();
        let orchestrator = harness.orchestrator(SyncOptions::default());
        orchestrator.run(&issues()).await.unwrap();

        let phases: Vec<RunPhase> = harness
            .sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SyncEvent::PhaseChanged { phase } => Some(phase),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                RunPhase::Init,
                RunPhase::FetchRemote,
                RunPhase::Normalize,
                RunPhase::Compare,
                RunPhase::Apply,
                RunPhase::Report,
                RunPhase::Done,
            ]
        );
        assert_eq!(orchestrator.phase(), RunPhase::Done);
    }

    #[tokio::test]
    async fn test_parallel_run_over_many_entities() {
        let mut client = ScriptedClient::new();
        for n in 1..=10 {
            client = client.item("issues", remote_issue(n, &format!("Item {n}"), "open"));
        }
        let harness = Harness::new(client);
        for n in 1..=10 {
            harness.linked(&n.to_string(), local_issue(&format!("Item {n}"), "todo"));
        }

        let options = SyncOptions {
            concurrency: 3,
            ..SyncOptions::default()
        };
        let orchestrator = SyncOrchestrator::builder(
            harness.client.clone(),
            harness.local.clone(),
            harness.store.clone(),
        )
        .options(options)
        .page_limits(4, 10)
        .build();

        let report = orchestrator.run(&issues()).await.unwrap();
        assert_eq!(report.count(Outcome::Seeded), 10);
        let ids: Vec<&str> = report.entities.iter().map(|e| e.remote_id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
        assert!(harness
            .local
            .list(EntityKind::Issue)
            .unwrap()
            .iter()
            .all(|e| e.assignee.as_deref() == Some("alice")));
    }

    #[tokio::test]
    async fn test_relinked_remote_starts_from_seed() {
        let (harness, first_id) = seeded_pair();
        let orchestrator = harness.orchestrator(SyncOptions::default());
        orchestrator.run(&issues()).await.unwrap();

        orchestrator.links().unlink(&first_id).unwrap();
        assert!(load_base(harness.store.as_ref(), "1").unwrap().is_none());
        harness.client.edit("issues", "1", &json!({"state": "closed"}));
        let second_id = harness.linked("1", local_issue("Fix login", "blocked"));

        let report = orchestrator.run(&issues()).await.unwrap();
        let entity = report.entity("1").unwrap();
        assert_eq!(entity.outcome, Outcome::Seeded);
        assert_eq!(entity.local_id.as_deref(), Some(second_id.as_str()));
        assert!(entity.conflicts.is_empty());
        assert_eq!(harness.entity(&second_id).status, "blocked");
        assert!(list_conflicts(harness.store.as_ref()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_push_under_alias_key_is_not_reverted() {
        let harness = Harness::new(ScriptedClient::new().item(
            "issues",
            json!({"number": 1, "title": "Notes", "state": "open", "headline": "old text"}),
        ));
        let mut local = local_issue("Notes", "todo");
        local.description = Some("old text".into());
        let local_id = harness.linked("1", local);
        let orchestrator = harness.orchestrator(SyncOptions::default());
        orchestrator.run(&issues()).await.unwrap();
        let base_before = load_base(harness.store.as_ref(), "1").unwrap().unwrap();

        harness.edit_local(&local_id, |e| e.description = Some("new text".into()));
        for _ in 0..2 {
            let report = orchestrator.run(&issues()).await.unwrap();
            let entity = report.entity("1").unwrap();
            assert_eq!(entity.outcome, Outcome::Failed);
            assert!(entity.error.as_deref().unwrap().contains("description"));
            assert_eq!(harness.entity(&local_id).description.as_deref(), Some("new text"));
        }

        let remote = harness.client.remote_item("issues", "1").unwrap();
        assert_eq!(remote["headline"], json!("old text"));
        assert_eq!(remote["description"], json!("old text"));
        assert_eq!(load_base(harness.store.as_ref(), "1").unwrap().unwrap(), base_before);
    }

    #[tokio::test]
    async fn test_failed_compensation_leaves_no_stale_cache() {
        let store = Arc::new(FlakyStore::new());
        let harness = Harness::with_store(
            ScriptedClient::new().item("issues", remote_issue(1, "Fix login", "open")),
            store.clone(),
        );
        let local_id = harness.linked("1", local_issue("Fix login", "todo"));
        let orchestrator = harness.orchestrator(SyncOptions::default());
        orchestrator.run(&issues()).await.unwrap();
        assert!(orchestrator.cache().get("1").unwrap().is_some());

        harness.edit_local(&local_id, |e| e.title = "Fix login page".into());
        store.fail_batches(true);
        harness.client.fail_after(
            Method::Patch,
            "issues/1",
            1,
            RemoteError::Status {
                code: 503,
                body: "unavailable".into(),
            },
        );

        let report = orchestrator.run(&issues()).await.unwrap();
        assert_eq!(report.entity("1").unwrap().outcome, Outcome::Failed);
        assert_eq!(
            harness.client.remote_item("issues", "1").unwrap()["title"],
            json!("Fix login page")
        );
        assert!(orchestrator.cache().get("1").unwrap().is_none());

        store.fail_batches(false);
        harness.client.clear_failures();
        let report = orchestrator
            .sync_entities(&issues(), &[local_id])
            .await
            .unwrap();
        assert_eq!(harness.client.requests_to("issues/1"), 1);
        let entity = report.entity("1").unwrap();
        assert_ne!(entity.outcome, Outcome::Failed);
        assert!(entity.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_entity_locks_are_released() {
        let locks = KeyedLocks::default();
        {
            let _held = locks.lock("1").await;
            let _other = locks.lock("2").await;
            assert_eq!(locks.len(), 2);
        }
        assert_eq!(locks.len(), 0);

        let held = locks.lock("1").await;
        let waiter = {
            let lock = locks.locks.lock().get("1").cloned().unwrap();
            tokio::spawn(async move { drop(lock.lock_owned().await) })
        };
        drop(held);
        assert_eq!(locks.len(), 1);
        waiter.await.unwrap();
    }
}
