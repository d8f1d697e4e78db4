//! Structured sync events.
//!
//! Every sync component receives an [`EventSink`] at construction and
//! reports diagnostics through it instead of logging ad hoc. The default
//! [`TracingSink`] forwards to `tracing`; [`RecordingSink`] keeps events in
//! memory so tests can assert on degraded paths.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::model::Field;
use crate::sync::orchestrator::RunPhase;

/// A diagnostic emitted by a sync component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A page was received from the remote collection.
    PageFetched {
        endpoint: String,
        page: u32,
        items: usize,
    },
    /// Pagination stopped at the configured ceiling.
    PageLimitReached { endpoint: String, max_pages: u32 },
    /// A timestamp could not be extracted.
    TimestampDegraded { field: String, reason: String },
    /// A record could not be normalized.
    NormalizationFailed { reason: String },
    /// A status value is outside the canonical vocabulary.
    UnknownStatus {
        value: String,
        suggestion: Option<String>,
    },
    /// A stale cache entry was evicted on read.
    CacheEvicted { remote_id: String },
    /// The run moved to a new phase.
    PhaseChanged { phase: RunPhase },
    /// A field diverged on both sides.
    ConflictDetected {
        local_id: String,
        remote_id: String,
        field: Field,
    },
    /// An entity's resolved fields were committed.
    EntityCommitted {
        local_id: String,
        remote_id: String,
        applied: usize,
    },
    /// Processing one entity failed; the run continues.
    EntityFailed {
        remote_id: String,
        error: String,
    },
    /// Earlier writes for an entity were rolled back.
    CompensationApplied { remote_id: String, detail: String },
}

/// Receiver for [`SyncEvent`]s.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SyncEvent);
}

/// Shared handle passed to components.
pub type SharedSink = Arc<dyn EventSink>;

/// Forwards events to `tracing` at a level matching their severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: SyncEvent) {
        match &event {
            SyncEvent::PageFetched { endpoint, page, items } => {
                tracing::debug!(%endpoint, page, items, "page fetched");
            }
            SyncEvent::PhaseChanged { phase } => tracing::debug!(?phase, "sync phase"),
            SyncEvent::CacheEvicted { remote_id } => {
                tracing::debug!(%remote_id, "stale cache entry evicted");
            }
            SyncEvent::EntityCommitted {
                local_id,
                remote_id,
                applied,
            } => tracing::debug!(%local_id, %remote_id, applied, "entity committed"),
            SyncEvent::ConflictDetected {
                local_id,
                remote_id,
                field,
            } => tracing::info!(%local_id, %remote_id, %field, "conflict detected"),
            SyncEvent::UnknownStatus { value, suggestion } => {
                tracing::debug!(%value, ?suggestion, "status outside canonical set");
            }
            SyncEvent::PageLimitReached { .. }
            | SyncEvent::TimestampDegraded { .. }
            | SyncEvent::NormalizationFailed { .. }
            | SyncEvent::EntityFailed { .. }
            | SyncEvent::CompensationApplied { .. } => tracing::warn!(?event, "sync degraded"),
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    #[must_use]
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    /// Count events matching a predicate.
    pub fn count(&self, pred: impl Fn(&SyncEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: SyncEvent) {
        self.events.lock().push(event);
    }
}

/// Sink used when the caller does not provide one.
#[must_use]
pub fn default_sink() -> SharedSink {
    Arc::new(TracingSink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_collects() {
        let sink = RecordingSink::new();
        sink.emit(SyncEvent::CacheEvicted {
            remote_id: "7".into(),
        });
        sink.emit(SyncEvent::NormalizationFailed {
            reason: "empty".into(),
        });

        assert_eq!(sink.events().len(), 2);
        assert_eq!(
            sink.count(|e| matches!(e, SyncEvent::CacheEvicted { .. })),
            1
        );
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(SyncEvent::PageLimitReached {
            endpoint: "issues".into(),
            max_pages: 3,
        })
        .unwrap();
        assert_eq!(json["event"], "page_limit_reached");
        assert_eq!(json["max_pages"], 3);
    }
}
