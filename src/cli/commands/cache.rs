//! `tl cache`: inspect and invalidate cached remote snapshots.

use crate::cli::commands::{format_millis, open_storage};
use crate::cli::CacheCommands;
use crate::config::load_settings;
use crate::error::Result;
use crate::sync::{default_sink, CacheEntry, CacheScope, CacheSummary, SyncCache};
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Serialize)]
struct EntryOutput<'a> {
    remote_id: &'a str,
    title: Option<&'a str>,
    fetched_at: i64,
    fresh: bool,
}

#[derive(Serialize)]
struct StatusOutput<'a> {
    ttl_secs: u64,
    #[serde(flatten)]
    summary: CacheSummary,
    entries: Vec<EntryOutput<'a>>,
}

#[derive(Serialize)]
struct ClearOutput<'a> {
    scope: &'a str,
    removed: usize,
}

/// Execute cache commands.
pub fn execute(
    command: &CacheCommands,
    db_path: Option<&PathBuf>,
    actor: Option<&str>,
    json: bool,
) -> Result<()> {
    let settings = load_settings()?;
    let storage = Arc::new(open_storage(db_path, actor)?);
    let cache = SyncCache::new(storage, default_sink()).with_ttl(settings.cache_ttl());

    match command {
        CacheCommands::Status => status(&cache, json),
        CacheCommands::Clear { remote_id } => {
            let scope = remote_id
                .as_ref()
                .map_or(CacheScope::All, |id| CacheScope::One(id.clone()));
            let removed = cache.invalidate(&scope)?;
            if json {
                let output = ClearOutput {
                    scope: remote_id.as_deref().unwrap_or("all"),
                    removed,
                };
                println!("{}", serde_json::to_string(&output)?);
            } else {
                println!("Removed {removed} cache entr{}", if removed == 1 { "y" } else { "ies" });
            }
            Ok(())
        }
    }
}

fn status(cache: &SyncCache, json: bool) -> Result<()> {
    let entries = cache.entries()?;
    let summary = cache.summary()?;
    let fresh: Vec<bool> = entries
        .iter()
        .map(|entry| cache.is_fresh(&entry.remote_id))
        .collect::<Result<_>>()?;

    if json {
        let output = StatusOutput {
            ttl_secs: cache.ttl().as_secs(),
            summary,
            entries: entries
                .iter()
                .zip(&fresh)
                .map(|(entry, &fresh)| EntryOutput {
                    remote_id: &entry.remote_id,
                    title: entry.snapshot.title.as_deref(),
                    fetched_at: entry.fetched_at,
                    fresh,
                })
                .collect(),
        };
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    println!(
        "{} {} entries ({} fresh, {} stale), TTL {}s",
        "Cache:".bold(),
        summary.total,
        summary.fresh.to_string().green(),
        summary.stale.to_string().yellow(),
        cache.ttl().as_secs()
    );
    for (entry, fresh) in entries.iter().zip(fresh) {
        print_entry(entry, fresh);
    }
    Ok(())
}

fn print_entry(entry: &CacheEntry, fresh: bool) {
    let marker = if fresh { "fresh".green() } else { "stale".yellow() };
    println!(
        "  {:<12} {marker}  {}  {}",
        entry.remote_id,
        format_millis(entry.fetched_at).dimmed(),
        entry.snapshot.title.as_deref().unwrap_or("")
    );
}
