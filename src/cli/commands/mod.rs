//! Command implementations.

pub mod cache;
pub mod completions;
pub mod init;
pub mod link;
pub mod sync;
pub mod version;

use crate::config::resolve_db_path;
use crate::error::{Error, Result};
use crate::model::EntityKind;
use crate::storage::SqliteStorage;
use std::path::PathBuf;

/// Open the initialized database.
///
/// # Errors
///
/// Returns `NotInitialized` when the database file does not exist yet.
pub(crate) fn open_storage(db_path: Option<&PathBuf>, actor: Option<&str>) -> Result<SqliteStorage> {
    let db_path = resolve_db_path(db_path.map(PathBuf::as_path)).ok_or(Error::NotInitialized)?;
    if !db_path.exists() {
        return Err(Error::NotInitialized);
    }
    let storage = SqliteStorage::open(&db_path)?;
    Ok(match actor {
        Some(actor) => storage.with_actor(actor),
        None => storage.with_actor(crate::config::default_actor()),
    })
}

pub(crate) fn parse_kind(raw: &str) -> Result<EntityKind> {
    raw.parse().map_err(Error::InvalidArgument)
}

/// Format a Unix-millisecond timestamp for humans.
pub(crate) fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map_or_else(|| millis.to_string(), |ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
}
