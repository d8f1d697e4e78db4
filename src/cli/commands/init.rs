//! Initialize the tracklink database and config file.
//!
//! `tl init` creates `~/.tracklink/data/tracklink.db` (or the `--db` path,
//! or `~/.tracklink/test/tracklink.db` when `TL_TEST_DB=1`) with the full
//! schema, and writes a starter `~/.tracklink/config.json` if none exists.

use crate::config::{config_path, resolve_db_path, save_settings_to, Settings};
use crate::error::{Error, Result};
use crate::storage::SqliteStorage;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize)]
struct InitOutput {
    database: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<PathBuf>,
    config_created: bool,
}

/// Execute the init command.
///
/// # Errors
///
/// Returns `AlreadyInitialized` if the database exists and `force` is not
/// set, or an error if the directory or database cannot be created.
pub fn execute(db_path: Option<&PathBuf>, force: bool, json: bool) -> Result<()> {
    let db_path = resolve_db_path(db_path.map(PathBuf::as_path)).ok_or_else(|| {
        Error::Config("Could not determine the tracklink directory".to_string())
    })?;
    let output = init_at(&db_path, config_path().as_deref(), force)?;

    if json {
        println!("{}", serde_json::to_string(&output)?);
    } else {
        println!("Initialized tracklink database");
        println!("  Database: {}", output.database.display());
        if let Some(config) = &output.config {
            if output.config_created {
                println!("  Config:   {} (created)", config.display());
                println!();
                println!("Next: set `remote_url` in the config, then `tl link add <local> <remote>`.");
            } else {
                println!("  Config:   {}", config.display());
            }
        }
    }
    Ok(())
}

fn init_at(db_path: &Path, config: Option<&Path>, force: bool) -> Result<InitOutput> {
    if db_path.exists() {
        if !force {
            return Err(Error::AlreadyInitialized {
                path: db_path.to_path_buf(),
            });
        }
        for suffix in ["", "-wal", "-shm"] {
            let file = PathBuf::from(format!("{}{suffix}", db_path.display()));
            if file.exists() {
                fs::remove_file(&file)?;
            }
        }
    }

    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }
    // Opening applies the schema.
    SqliteStorage::open(db_path)?;
    tracing::info!(path = %db_path.display(), "database initialized");

    let mut config_created = false;
    if let Some(path) = config {
        if !path.exists() {
            save_settings_to(path, &Settings::default())?;
            config_created = true;
        }
    }

    Ok(InitOutput {
        database: db_path.to_path_buf(),
        config: config.map(Path::to_path_buf),
        config_created,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_creates_database_and_config() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("data").join("tracklink.db");
        let config = dir.path().join("config.json");

        let output = init_at(&db, Some(&config), false).unwrap();
        assert!(db.exists());
        assert!(config.exists());
        assert!(output.config_created);

        // An existing config is left alone.
        let output = init_at(&db, Some(&config), true).unwrap();
        assert!(!output.config_created);
    }

    #[test]
    fn test_init_fails_if_already_initialized() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("tracklink.db");

        init_at(&db, None, false).unwrap();
        let result = init_at(&db, None, false);
        assert!(matches!(result, Err(Error::AlreadyInitialized { .. })));
    }

    #[test]
    fn test_force_recreates_database() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("tracklink.db");
        init_at(&db, None, false).unwrap();

        {
            let storage = SqliteStorage::open(&db).unwrap();
            crate::storage::KeyValueStore::put(&storage, "meta", "k", "v").unwrap();
        }
        init_at(&db, None, true).unwrap();

        let storage = SqliteStorage::open(&db).unwrap();
        assert_eq!(crate::storage::KeyValueStore::get(&storage, "meta", "k").unwrap(), None);
    }
}
