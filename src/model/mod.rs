//! Data models for tracklink.
//!
//! This module contains the domain models:
//! - LocalEntity (issue, milestone, project)
//! - NormalizedSnapshot (canonical comparison record)

pub mod entity;
pub mod snapshot;

pub use entity::{EntityKind, LocalEntity};
pub use snapshot::{canonical_labels, Field, FieldValue, NormalizedSnapshot};
