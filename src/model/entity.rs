//! Local work item model.
//!
//! A `LocalEntity` is the local copy of an issue, milestone, or project.
//! Local CRUD lives outside this crate; sync reads entities through
//! [`crate::storage::LocalStore`] and writes resolved fields back.

use serde::{Deserialize, Serialize};

/// Kind of work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    #[default]
    Issue,
    Milestone,
    Project,
}

impl EntityKind {
    /// Get the string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Milestone => "milestone",
            Self::Project => "project",
        }
    }

    /// Default remote collection endpoint for this kind.
    #[must_use]
    pub const fn default_endpoint(&self) -> &'static str {
        match self {
            Self::Issue => "issues",
            Self::Milestone => "milestones",
            Self::Project => "projects",
        }
    }

    /// Prefix used when generating local IDs.
    const fn id_prefix(&self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Milestone => "ms",
            Self::Project => "proj",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "issue" | "issues" => Ok(Self::Issue),
            "milestone" | "milestones" => Ok(Self::Milestone),
            "project" | "projects" => Ok(Self::Project),
            _ => Err(format!("Unknown entity kind: {s}")),
        }
    }
}

/// The local copy of a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEntity {
    /// Unique identifier (e.g. `issue_3f2a9c1b0d4e`)
    pub id: String,

    pub kind: EntityKind,

    pub title: String,

    /// Canonical status (see [`crate::validate::normalize_status`])
    pub status: String,

    pub assignee: Option<String>,

    /// Milestone title this item belongs to
    pub milestone: Option<String>,

    pub description: Option<String>,

    #[serde(default)]
    pub labels: Vec<String>,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl LocalEntity {
    /// Create a new entity with a generated ID and default values.
    pub fn new(kind: EntityKind, title: impl Into<String>) -> Self {
        let id = format!(
            "{}_{}",
            kind.id_prefix(),
            &uuid::Uuid::new_v4().simple().to_string()[..12]
        );

        Self {
            id,
            kind,
            title: title.into(),
            status: "todo".to_string(),
            assignee: None,
            milestone: None,
            description: None,
            labels: Vec::new(),
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Bump `updated_at` to now.
    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entity_ids() {
        let issue = LocalEntity::new(EntityKind::Issue, "Fix login");
        assert!(issue.id.starts_with("issue_"));
        assert_eq!(issue.id.len(), "issue_".len() + 12);
        assert_eq!(issue.status, "todo");
        assert!(issue.labels.is_empty());

        let ms = LocalEntity::new(EntityKind::Milestone, "v1.0");
        assert!(ms.id.starts_with("ms_"));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("Issues".parse::<EntityKind>(), Ok(EntityKind::Issue));
        assert_eq!("milestone".parse::<EntityKind>(), Ok(EntityKind::Milestone));
        assert!("epic".parse::<EntityKind>().is_err());
        assert_eq!(EntityKind::Project.default_endpoint(), "projects");
    }
}
