//! `tl version`: package, schema and sync defaults.

use crate::error::Result;
use crate::storage::schema::CURRENT_SCHEMA_VERSION;
use crate::sync::DEFAULT_CONCURRENCY;
use serde::Serialize;

#[derive(Serialize)]
struct VersionInfo {
    version: &'static str,
    profile: &'static str,
    schema: i32,
    default_concurrency: usize,
}

impl VersionInfo {
    fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            profile: if cfg!(debug_assertions) { "dev" } else { "release" },
            schema: CURRENT_SCHEMA_VERSION,
            default_concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn execute(json: bool) -> Result<()> {
    let info = VersionInfo::current();
    if json {
        println!("{}", serde_json::to_string(&info)?);
    } else {
        println!(
            "tl {} ({}, schema v{})",
            info.version, info.profile, info.schema
        );
    }
    Ok(())
}
