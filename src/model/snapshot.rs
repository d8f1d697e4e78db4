//! Canonical comparison record.
//!
//! Every representation of a work item (tracker payload, cached row,
//! local entity) is reduced to a `NormalizedSnapshot` before comparison.
//! Text fields treat `None` and `""` as the same empty value, and labels
//! are kept sorted and deduplicated so that ordering never registers as a
//! change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A comparable field of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Title,
    Status,
    Assignee,
    Milestone,
    Description,
    Labels,
}

impl Field {
    /// All comparable fields, in report order.
    pub const ALL: [Self; 6] = [
        Self::Title,
        Self::Status,
        Self::Assignee,
        Self::Milestone,
        Self::Description,
        Self::Labels,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Status => "status",
            Self::Assignee => "assignee",
            Self::Milestone => "milestone",
            Self::Description => "description",
            Self::Labels => "labels",
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The value of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(Option<String>),
    List(Vec<String>),
}

impl FieldValue {
    /// Whether the value carries no information.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.as_deref().is_none_or(str::is_empty),
            Self::List(items) => items.is_empty(),
        }
    }

    /// JSON form used when pushing the value to the remote tracker.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Text(Some(text)) => serde_json::Value::String(text.clone()),
            Self::Text(None) => serde_json::Value::Null,
            Self::List(items) => serde_json::Value::from(items.clone()),
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(Some(text)) => write!(f, "{text:?}"),
            Self::Text(None) => f.write_str("(empty)"),
            Self::List(items) if items.is_empty() => f.write_str("[]"),
            Self::List(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

/// Canonical, backend-agnostic representation of a work item.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NormalizedSnapshot {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub milestone: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl NormalizedSnapshot {
    /// Read one comparable field.
    #[must_use]
    pub fn get(&self, field: Field) -> FieldValue {
        match field {
            Field::Title => text(&self.title),
            Field::Status => text(&self.status),
            Field::Assignee => text(&self.assignee),
            Field::Milestone => text(&self.milestone),
            Field::Description => text(&self.description),
            Field::Labels => FieldValue::List(self.labels.clone()),
        }
    }

    /// Overwrite one comparable field.
    ///
    /// A list written to a text field (or vice versa) is coerced rather than
    /// rejected: lists join with `,`, text splits on `,`.
    pub fn set(&mut self, field: Field, value: FieldValue) {
        let slot = match field {
            Field::Title => &mut self.title,
            Field::Status => &mut self.status,
            Field::Assignee => &mut self.assignee,
            Field::Milestone => &mut self.milestone,
            Field::Description => &mut self.description,
            Field::Labels => {
                self.labels = match value {
                    FieldValue::List(items) => canonical_labels(items),
                    FieldValue::Text(text) => canonical_labels(
                        text.unwrap_or_default()
                            .split(',')
                            .map(str::to_string)
                            .collect(),
                    ),
                };
                return;
            }
        };
        *slot = match value {
            FieldValue::Text(text) => text.filter(|t| !t.is_empty()),
            FieldValue::List(items) if items.is_empty() => None,
            FieldValue::List(items) => Some(items.join(",")),
        };
    }

    /// Restore the text/label invariants after a snapshot was built by hand
    /// or decoded from a mapping.
    #[must_use]
    pub fn canonicalize(mut self) -> Self {
        for slot in [
            &mut self.title,
            &mut self.status,
            &mut self.assignee,
            &mut self.milestone,
            &mut self.description,
        ] {
            if slot.as_deref().is_some_and(str::is_empty) {
                *slot = None;
            }
        }
        self.labels = canonical_labels(std::mem::take(&mut self.labels));
        self
    }
}

fn text(value: &Option<String>) -> FieldValue {
    FieldValue::Text(value.clone().filter(|t| !t.is_empty()))
}

/// Trim, drop empties, sort, deduplicate.
#[must_use]
pub fn canonical_labels(labels: Vec<String>) -> Vec<String> {
    let mut labels: Vec<String> = labels
        .into_iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    labels.sort();
    labels.dedup();
    labels
}
