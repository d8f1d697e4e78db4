//! Configuration management.
//!
//! Settings live in `~/.tracklink/config.json`; every key is optional.
//! Environment variables override the file, and CLI flags override both.
//!
//! ```json
//! {
//!   "remote_url": "https://tracker.example.com/api",
//!   "per_page": 50,
//!   "seed_policy": "fill_empty_local",
//!   "collections": [{ "kind": "issue", "endpoint": "repos/acme/web/issues" }]
//! }
//! ```

use crate::error::{Error, Result};
use crate::model::EntityKind;
use crate::remote::{DEFAULT_MAX_PAGES, DEFAULT_PER_PAGE};
use crate::sync::{Collection, SeedPolicy, SyncOptions, DEFAULT_CONCURRENCY};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default cache TTL in seconds.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Contents of `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_ttl_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_unlinked: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub collections: Vec<Collection>,
}

impl Settings {
    /// Remote base URL: `TRACKLINK_REMOTE_URL`, then the file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when neither is set.
    pub fn remote_url(&self) -> Result<String> {
        env_value("TRACKLINK_REMOTE_URL")
            .or_else(|| self.remote_url.clone())
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| Error::Config("remote_url is not configured".to_string()))
    }

    /// API token: `TRACKLINK_TOKEN`, then the file.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        env_value("TRACKLINK_TOKEN").or_else(|| self.token.clone())
    }

    #[must_use]
    pub fn per_page(&self) -> u32 {
        self.per_page.unwrap_or(DEFAULT_PER_PAGE).max(1)
    }

    #[must_use]
    pub fn max_pages(&self) -> u32 {
        self.max_pages.unwrap_or(DEFAULT_MAX_PAGES).max(1)
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs.unwrap_or(DEFAULT_CACHE_TTL_SECS))
    }

    /// Run options from the file, before CLI overrides.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an unknown `seed_policy`.
    pub fn sync_options(&self) -> Result<SyncOptions> {
        let seed_policy = match &self.seed_policy {
            Some(raw) => raw
                .parse::<SeedPolicy>()
                .map_err(|e| Error::Config(format!("seed_policy: {e}")))?,
            None => SeedPolicy::default(),
        };
        Ok(SyncOptions {
            dry_run: false,
            concurrency: self.concurrency.unwrap_or(DEFAULT_CONCURRENCY).max(1),
            seed_policy,
            import_unlinked: self.import_unlinked.unwrap_or(false),
        })
    }

    /// The configured collection for `kind`, or its default endpoint.
    #[must_use]
    pub fn collection(&self, kind: EntityKind) -> Collection {
        self.collections
            .iter()
            .find(|c| c.kind == kind)
            .cloned()
            .unwrap_or_else(|| Collection::for_kind(kind))
    }

    /// Collections a full run walks: the configured ones, or issues only.
    #[must_use]
    pub fn run_collections(&self) -> Vec<Collection> {
        if self.collections.is_empty() {
            vec![Collection::for_kind(EntityKind::Issue)]
        } else {
            self.collections.clone()
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Get the global tracklink directory (`~/.tracklink/`).
#[must_use]
pub fn global_tracklink_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|b| b.home_dir().join(".tracklink"))
}

/// Path of `config.json`.
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    global_tracklink_dir().map(|dir| dir.join("config.json"))
}

/// Load settings from `path`. A missing file yields defaults.
///
/// # Errors
///
/// Returns `Error::Config` if the file exists but is not valid JSON.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
        Err(e) => Err(e.into()),
    }
}

/// Load settings from the global config file.
///
/// # Errors
///
/// See [`load_settings_from`].
pub fn load_settings() -> Result<Settings> {
    match config_path() {
        Some(path) => load_settings_from(&path),
        None => Ok(Settings::default()),
    }
}

/// Write settings as pretty JSON, creating parent directories.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be written.
pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

/// Check if test mode is enabled.
///
/// Test mode is enabled by setting `TL_TEST_DB=1` (or any non-empty value).
/// This redirects all database operations to an isolated test database.
#[must_use]
pub fn is_test_mode() -> bool {
    std::env::var("TL_TEST_DB").is_ok_and(|v| is_truthy(&v))
}

fn is_truthy(value: &str) -> bool {
    !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
}

/// Get the test database path (`~/.tracklink/test/tracklink.db`).
#[must_use]
pub fn test_db_path() -> Option<PathBuf> {
    global_tracklink_dir().map(|dir| dir.join("test").join("tracklink.db"))
}

/// Resolve the database path.
///
/// Priority:
/// 1. If `explicit_path` is provided, use it directly
/// 2. `TL_TEST_DB` environment variable → uses test database
/// 3. `TRACKLINK_DB` environment variable
/// 4. Global location: `~/.tracklink/data/tracklink.db`
#[must_use]
pub fn resolve_db_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path.to_path_buf());
    }

    if is_test_mode() {
        return test_db_path();
    }

    if let Some(db_path) = env_value("TRACKLINK_DB") {
        return Some(PathBuf::from(db_path));
    }

    global_tracklink_dir().map(|dir| dir.join("data").join("tracklink.db"))
}

/// Get the default actor name for the audit trail.
///
/// Priority:
/// 1. `TL_ACTOR` environment variable
/// 2. System username
/// 3. "tl"
#[must_use]
pub fn default_actor() -> String {
    env_value("TL_ACTOR")
        .or_else(|| env_value("USER"))
        .unwrap_or_else(|| crate::storage::sqlite::DEFAULT_ACTOR.to_string())
}
