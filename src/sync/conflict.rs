//! Three-way conflict detection.
//!
//! Each comparable field is classified from `(base, local, remote)`:
//!
//! | base vs local | base vs remote | local vs remote | classification |
//! |---|---|---|---|
//! | same | same | - | `Unchanged` |
//! | differs | same | - | `LocalOnly` |
//! | same | differs | - | `RemoteOnly` |
//! | differs | differs | same | `Converged` |
//! | differs | differs | differs | `Conflict` |
//!
//! Without a base there is nothing to compare against, so the pair is
//! seeded according to a [`SeedPolicy`] and never reported as a conflict.
//! Conflicting values are never merged.

use serde::{Deserialize, Serialize};

use crate::model::{Field, FieldValue, NormalizedSnapshot};

/// Per-field classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Unchanged,
    LocalOnly,
    RemoteOnly,
    Converged,
    Conflict,
}

impl Classification {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::LocalOnly => "local_only",
            Self::RemoteOnly => "remote_only",
            Self::Converged => "converged",
            Self::Conflict => "conflict",
        }
    }
}

/// Aggregate status of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    /// Nothing to apply.
    Clean,
    /// One-sided changes only.
    Partial,
    /// At least one field diverged on both sides.
    Conflicted,
}

impl EntityStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Partial => "partial",
            Self::Conflicted => "conflicted",
        }
    }
}

/// How to pair a local and remote entity that have never been synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedPolicy {
    /// Remote fills fields that are empty locally; local values win otherwise
    /// and are pushed to the remote.
    #[default]
    FillEmptyLocal,
    /// Remote values overwrite local ones wherever they differ.
    PreferRemote,
}

impl std::str::FromStr for SeedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "fill_empty_local" | "fill" => Ok(Self::FillEmptyLocal),
            "prefer_remote" | "remote" => Ok(Self::PreferRemote),
            _ => Err(format!("Unknown seed policy: {s}")),
        }
    }
}

/// Which side receives a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ToLocal,
    ToRemote,
}

/// A value to be written to one side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: Field,
    pub direction: Direction,
    pub value: FieldValue,
}

/// One field-level disagreement. Persisted until resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub field: Field,
    pub local_value: FieldValue,
    pub remote_value: FieldValue,
    pub base_value: FieldValue,
}

/// Classification of one field with the values it was computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldVerdict {
    pub field: Field,
    pub classification: Classification,
    pub base: FieldValue,
    pub local: FieldValue,
    pub remote: FieldValue,
}

/// Seed decision for one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedField {
    pub field: Field,
    pub local: FieldValue,
    pub remote: FieldValue,
    /// `None` when both sides already agree.
    pub direction: Option<Direction>,
}

/// Result of comparing one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    Seed(Vec<SeedField>),
    Classified(Vec<FieldVerdict>),
}

impl Detection {
    #[must_use]
    pub fn status(&self) -> EntityStatus {
        match self {
            Self::Seed(fields) if fields.iter().any(|f| f.direction.is_some()) => {
                EntityStatus::Partial
            }
            Self::Seed(_) => EntityStatus::Clean,
            Self::Classified(verdicts) => {
                let mut status = EntityStatus::Clean;
                for verdict in verdicts {
                    match verdict.classification {
                        Classification::Conflict => return EntityStatus::Conflicted,
                        Classification::LocalOnly | Classification::RemoteOnly => {
                            status = EntityStatus::Partial;
                        }
                        Classification::Unchanged | Classification::Converged => {}
                    }
                }
                status
            }
        }
    }

    #[must_use]
    pub const fn is_seed(&self) -> bool {
        matches!(self, Self::Seed(_))
    }

    /// Values to write, in field order. Conflicts contribute nothing.
    #[must_use]
    pub fn changes(&self) -> Vec<FieldChange> {
        match self {
            Self::Seed(fields) => fields
                .iter()
                .filter_map(|f| {
                    f.direction.map(|direction| FieldChange {
                        field: f.field,
                        direction,
                        value: match direction {
                            Direction::ToLocal => f.remote.clone(),
                            Direction::ToRemote => f.local.clone(),
                        },
                    })
                })
                .collect(),
            Self::Classified(verdicts) => verdicts
                .iter()
                .filter_map(|v| match v.classification {
                    Classification::LocalOnly => Some(FieldChange {
                        field: v.field,
                        direction: Direction::ToRemote,
                        value: v.local.clone(),
                    }),
                    Classification::RemoteOnly => Some(FieldChange {
                        field: v.field,
                        direction: Direction::ToLocal,
                        value: v.remote.clone(),
                    }),
                    _ => None,
                })
                .collect(),
        }
    }

    #[must_use]
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        match self {
            Self::Seed(_) => Vec::new(),
            Self::Classified(verdicts) => verdicts
                .iter()
                .filter(|v| v.classification == Classification::Conflict)
                .map(|v| ConflictRecord {
                    field: v.field,
                    local_value: v.local.clone(),
                    remote_value: v.remote.clone(),
                    base_value: v.base.clone(),
                })
                .collect(),
        }
    }

    /// The base snapshot to store once the changes are applied.
    ///
    /// Conflicting fields keep their previous base value so the conflict is
    /// detected again on the next run.
    #[must_use]
    pub fn next_base(&self, remote: &NormalizedSnapshot) -> NormalizedSnapshot {
        let mut base = remote.clone();
        match self {
            Self::Seed(fields) => {
                for f in fields {
                    let value = match f.direction {
                        Some(Direction::ToLocal) | None => f.remote.clone(),
                        Some(Direction::ToRemote) => f.local.clone(),
                    };
                    base.set(f.field, value);
                }
            }
            Self::Classified(verdicts) => {
                for v in verdicts {
                    let value = match v.classification {
                        Classification::Unchanged
                        | Classification::Converged
                        | Classification::LocalOnly => v.local.clone(),
                        Classification::RemoteOnly => v.remote.clone(),
                        Classification::Conflict => v.base.clone(),
                    };
                    base.set(v.field, value);
                }
            }
        }
        base
    }
}

/// Classifies fields of a `(base, local, remote)` triple.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictDetector {
    policy: SeedPolicy,
}

impl ConflictDetector {
    #[must_use]
    pub const fn new(policy: SeedPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub const fn policy(&self) -> SeedPolicy {
        self.policy
    }

    #[must_use]
    pub fn detect(
        &self,
        base: Option<&NormalizedSnapshot>,
        local: &NormalizedSnapshot,
        remote: &NormalizedSnapshot,
    ) -> Detection {
        let Some(base) = base else {
            return Detection::Seed(
                Field::ALL
                    .iter()
                    .map(|&field| self.seed_field(field, local.get(field), remote.get(field)))
                    .collect(),
            );
        };

        Detection::Classified(
            Field::ALL
                .iter()
                .map(|&field| {
                    let (b, l, r) = (base.get(field), local.get(field), remote.get(field));
                    FieldVerdict {
                        field,
                        classification: classify(&b, &l, &r),
                        base: b,
                        local: l,
                        remote: r,
                    }
                })
                .collect(),
        )
    }

    fn seed_field(&self, field: Field, local: FieldValue, remote: FieldValue) -> SeedField {
        let direction = if local == remote {
            None
        } else if local.is_empty() {
            Some(Direction::ToLocal)
        } else if remote.is_empty() {
            Some(Direction::ToRemote)
        } else {
            match self.policy {
                SeedPolicy::FillEmptyLocal => Some(Direction::ToRemote),
                SeedPolicy::PreferRemote => Some(Direction::ToLocal),
            }
        };
        SeedField {
            field,
            local,
            remote,
            direction,
        }
    }
}

fn classify(base: &FieldValue, local: &FieldValue, remote: &FieldValue) -> Classification {
    match (base == local, base == remote) {
        (true, true) => Classification::Unchanged,
        (false, true) => Classification::LocalOnly,
        (true, false) => Classification::RemoteOnly,
        (false, false) if local == remote => Classification::Converged,
        (false, false) => Classification::Conflict,
    }
}
