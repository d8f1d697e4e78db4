//! Sync run reports.

use serde::Serialize;

use crate::model::EntityKind;
use crate::sync::conflict::{ConflictRecord, Direction, EntityStatus, FieldChange};

/// What happened to one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Unchanged,
    Applied,
    /// First sync of a linked pair.
    Seeded,
    /// A local entity was created for an unlinked remote item.
    Created,
    Conflicted,
    Failed,
    Cancelled,
}

impl Outcome {
    pub const ALL: [Self; 7] = [
        Self::Unchanged,
        Self::Applied,
        Self::Seeded,
        Self::Created,
        Self::Conflicted,
        Self::Failed,
        Self::Cancelled,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Applied => "applied",
            Self::Seeded => "seeded",
            Self::Created => "created",
            Self::Conflicted => "conflicted",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the entity's changes were (or, in a dry run, would be) written.
    #[must_use]
    pub const fn writes(&self) -> bool {
        matches!(
            self,
            Self::Applied | Self::Seeded | Self::Created | Self::Conflicted
        )
    }
}

/// Per-entity result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityReport {
    pub local_id: Option<String>,
    pub remote_id: String,
    /// `None` when the entity failed before comparison.
    pub status: Option<EntityStatus>,
    pub outcome: Outcome,
    pub changes: Vec<FieldChange>,
    pub conflicts: Vec<ConflictRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EntityReport {
    #[must_use]
    pub fn failed(remote_id: String, local_id: Option<String>, error: String) -> Self {
        Self {
            local_id,
            remote_id,
            status: None,
            outcome: Outcome::Failed,
            changes: Vec::new(),
            conflicts: Vec::new(),
            error: Some(error),
        }
    }

    #[must_use]
    pub fn cancelled(remote_id: String, local_id: Option<String>) -> Self {
        Self {
            local_id,
            remote_id,
            status: None,
            outcome: Outcome::Cancelled,
            changes: Vec::new(),
            conflicts: Vec::new(),
            error: None,
        }
    }

    /// Fields written to the local side.
    #[must_use]
    pub fn applied_local(&self) -> usize {
        self.applied(Direction::ToLocal)
    }

    /// Fields pushed to the remote side.
    #[must_use]
    pub fn applied_remote(&self) -> usize {
        self.applied(Direction::ToRemote)
    }

    fn applied(&self, direction: Direction) -> usize {
        if !self.outcome.writes() {
            return 0;
        }
        self.changes
            .iter()
            .filter(|c| c.direction == direction)
            .count()
    }
}

/// Aggregate result of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub kind: EntityKind,
    pub endpoint: String,
    pub dry_run: bool,
    pub entities: Vec<EntityReport>,
    /// Remote items with no link that were left alone.
    pub skipped_unlinked: usize,
    pub duration_ms: u64,
}

impl SyncReport {
    #[must_use]
    pub fn count(&self, outcome: Outcome) -> usize {
        self.entities.iter().filter(|e| e.outcome == outcome).count()
    }

    /// Total fields written across both sides.
    #[must_use]
    pub fn total_applied(&self) -> usize {
        self.entities
            .iter()
            .map(|e| e.applied_local() + e.applied_remote())
            .sum()
    }

    pub fn conflicts(&self) -> impl Iterator<Item = (&EntityReport, &ConflictRecord)> {
        self.entities
            .iter()
            .flat_map(|e| e.conflicts.iter().map(move |c| (e, c)))
    }

    #[must_use]
    pub fn entity(&self, remote_id: &str) -> Option<&EntityReport> {
        self.entities.iter().find(|e| e.remote_id == remote_id)
    }

    /// Whether any entity failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.count(Outcome::Failed) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Field, FieldValue};

    fn change(direction: Direction) -> FieldChange {
        FieldChange {
            field: Field::Title,
            direction,
            value: FieldValue::Text(Some("x".into())),
        }
    }

    #[test]
    fn test_failed_entities_apply_nothing() {
        let mut entity = EntityReport::failed("1".into(), None, "boom".into());
        entity.changes = vec![change(Direction::ToLocal)];
        assert_eq!(entity.applied_local(), 0);

        entity.outcome = Outcome::Applied;
        assert_eq!(entity.applied_local(), 1);
        assert_eq!(entity.applied_remote(), 0);
    }

    #[test]
    fn test_report_counts() {
        let mut applied = EntityReport::cancelled("2".into(), Some("issue_2".into()));
        applied.outcome = Outcome::Applied;
        applied.changes = vec![change(Direction::ToLocal), change(Direction::ToRemote)];

        let report = SyncReport {
            kind: EntityKind::Issue,
            endpoint: "issues".into(),
            dry_run: false,
            entities: vec![EntityReport::failed("1".into(), None, "boom".into()), applied],
            skipped_unlinked: 0,
            duration_ms: 0,
        };
        assert_eq!(report.count(Outcome::Failed), 1);
        assert_eq!(report.total_applied(), 2);
        assert!(report.has_failures());
        assert_eq!(report.entity("2").unwrap().local_id.as_deref(), Some("issue_2"));
    }
}
