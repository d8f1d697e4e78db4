//! `tl sync`: run the sync engine against the configured remote tracker.
//!
//! The local entities and all sync state (links, cache, bases, conflicts)
//! live in the same SQLite database, so one `SqliteStorage` backs both
//! store traits.

use crate::cli::commands::{format_millis, open_storage, parse_kind};
use crate::cli::{SyncCommands, SyncRunArgs};
use crate::config::{load_settings, Settings};
use crate::error::{Error, Result};
use crate::model::EntityKind;
use crate::remote::HttpRemoteClient;
use crate::storage::SqliteStorage;
use crate::sync::{
    default_sink, list_conflicts, load_base, CancelFlag, ConflictSet, EntityReport,
    LinkTable, Outcome, SyncCache, SyncOptions, SyncOrchestrator, SyncReport,
};
use colored::{ColoredString, Colorize};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Serialize)]
struct RunOutput<'a> {
    reports: &'a [SyncReport],
}

#[derive(Serialize)]
struct LinkStatus {
    local_id: String,
    remote_id: String,
    synced: bool,
    cached_fresh: bool,
    conflicts: usize,
}

#[derive(Serialize)]
struct StatusOutput {
    links: Vec<LinkStatus>,
    conflicted_entities: usize,
    local_entities: usize,
}

#[derive(Serialize)]
struct ConflictsOutput<'a> {
    count: usize,
    conflicts: &'a [ConflictSet],
}

/// Execute sync commands.
pub fn execute(
    command: &SyncCommands,
    db_path: Option<&PathBuf>,
    actor: Option<&str>,
    json: bool,
) -> Result<()> {
    match command {
        SyncCommands::Run(args) => run(args, db_path, actor, json),
        SyncCommands::Entity {
            local_ids,
            kind,
            dry_run,
        } => entity(local_ids, kind, *dry_run, db_path, actor, json),
        SyncCommands::Status => status(db_path, actor, json),
        SyncCommands::Conflicts => conflicts(db_path, actor, json),
    }
}

fn orchestrator(
    settings: &Settings,
    storage: Arc<SqliteStorage>,
    options: SyncOptions,
) -> Result<SyncOrchestrator<HttpRemoteClient>> {
    let client = Arc::new(HttpRemoteClient::new(settings.remote_url()?, settings.token()));
    Ok(SyncOrchestrator::builder(client, storage.clone(), storage)
        .options(options)
        .sink(default_sink())
        .page_limits(settings.per_page(), settings.max_pages())
        .cache_ttl(settings.cache_ttl())
        .build())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new()
        .map_err(|e| Error::Other(format!("Failed to create async runtime: {e}")))
}

/// Cancel the run on Ctrl-C; entities already in flight finish.
fn cancel_on_interrupt(flag: CancelFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, finishing in-flight entities");
            flag.cancel();
        }
    });
}

fn run(args: &SyncRunArgs, db_path: Option<&PathBuf>, actor: Option<&str>, json: bool) -> Result<()> {
    let settings = load_settings()?;
    let mut options = settings.sync_options()?;
    options.dry_run = args.dry_run;
    options.import_unlinked |= args.import_unlinked;
    if let Some(concurrency) = args.concurrency {
        options.concurrency = concurrency.max(1);
    }
    if let Some(policy) = &args.seed_policy {
        options.seed_policy = policy.parse().map_err(Error::InvalidArgument)?;
    }

    let collections = match &args.kind {
        Some(kind) => vec![settings.collection(parse_kind(kind)?)],
        None => settings.run_collections(),
    };

    let storage = Arc::new(open_storage(db_path, actor)?);
    let orchestrator = orchestrator(&settings, storage, options)?;

    let reports = runtime()?.block_on(async {
        cancel_on_interrupt(orchestrator.cancel_flag());
        let mut reports = Vec::with_capacity(collections.len());
        for collection in &collections {
            reports.push(orchestrator.run(collection).await?);
        }
        Ok::<_, Error>(reports)
    })?;

    if json {
        println!("{}", serde_json::to_string(&RunOutput { reports: &reports })?);
    } else {
        for report in &reports {
            print_report(report);
        }
    }
    Ok(())
}

fn entity(
    local_ids: &[String],
    kind: &str,
    dry_run: bool,
    db_path: Option<&PathBuf>,
    actor: Option<&str>,
    json: bool,
) -> Result<()> {
    let settings = load_settings()?;
    let mut options = settings.sync_options()?;
    options.dry_run = dry_run;
    let collection = settings.collection(parse_kind(kind)?);

    let storage = Arc::new(open_storage(db_path, actor)?);
    let orchestrator = orchestrator(&settings, storage, options)?;
    let report = runtime()?.block_on(orchestrator.sync_entities(&collection, local_ids))?;

    if json {
        let reports = [report];
        println!("{}", serde_json::to_string(&RunOutput { reports: &reports })?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn status(db_path: Option<&PathBuf>, actor: Option<&str>, json: bool) -> Result<()> {
    let settings = load_settings()?;
    let storage = Arc::new(open_storage(db_path, actor)?);
    let links = LinkTable::new(storage.clone());
    let cache = SyncCache::new(storage.clone(), default_sink()).with_ttl(settings.cache_ttl());
    let conflict_sets = list_conflicts(storage.as_ref())?;

    let mut rows = Vec::new();
    for record in links.list()? {
        let conflicts = conflict_sets
            .iter()
            .find(|set| set.remote_id == record.remote_id)
            .map_or(0, |set| set.conflicts.len());
        rows.push(LinkStatus {
            synced: load_base(storage.as_ref(), &record.remote_id)?.is_some(),
            cached_fresh: cache.is_fresh(&record.remote_id)?,
            conflicts,
            local_id: record.local_id,
            remote_id: record.remote_id,
        });
    }
    let local_entities = [EntityKind::Issue, EntityKind::Milestone, EntityKind::Project]
        .iter()
        .map(|&kind| storage.count_entities(kind))
        .sum::<Result<usize>>()?;

    let output = StatusOutput {
        conflicted_entities: conflict_sets.len(),
        local_entities,
        links: rows,
    };
    if json {
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    println!(
        "{} {} local entities, {} links, {} with conflicts",
        "Sync status:".bold(),
        output.local_entities,
        output.links.len(),
        output.conflicted_entities
    );
    for row in &output.links {
        let state = if row.conflicts > 0 {
            format!("{} conflict(s)", row.conflicts).red()
        } else if row.synced {
            "synced".green()
        } else {
            "never synced".yellow()
        };
        let cache = if row.cached_fresh { "cached" } else { "" };
        println!(
            "  {:<24} ↔ {:<12} {state}  {}",
            row.local_id,
            row.remote_id,
            cache.dimmed()
        );
    }
    Ok(())
}

fn conflicts(db_path: Option<&PathBuf>, actor: Option<&str>, json: bool) -> Result<()> {
    let storage = open_storage(db_path, actor)?;
    let sets = list_conflicts(&storage)?;

    if json {
        let output = ConflictsOutput {
            count: sets.len(),
            conflicts: &sets,
        };
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    if sets.is_empty() {
        println!("No unresolved conflicts.");
        return Ok(());
    }
    for set in &sets {
        println!(
            "{} ↔ {}  {}",
            set.local_id.cyan(),
            set.remote_id,
            format!("detected {}", format_millis(set.detected_at)).dimmed()
        );
        for conflict in &set.conflicts {
            println!(
                "  {:<12} base {}  local {}  remote {}",
                conflict.field.to_string().bold(),
                conflict.base_value,
                conflict.local_value.to_string().yellow(),
                conflict.remote_value.to_string().yellow()
            );
        }
    }
    println!();
    println!("Edit either side so the values agree, then run `tl sync run` again.");
    Ok(())
}

fn outcome_marker(outcome: Outcome) -> ColoredString {
    match outcome {
        Outcome::Unchanged => "·".dimmed(),
        Outcome::Applied | Outcome::Seeded | Outcome::Created => "✓".green(),
        Outcome::Conflicted => "!".yellow(),
        Outcome::Failed => "✗".red(),
        Outcome::Cancelled => "-".dimmed(),
    }
}

fn print_report(report: &SyncReport) {
    let header = format!("{} ({})", report.endpoint, report.kind);
    let mut summary = format!(
        "{} entities, {} fields applied, {} conflicted, {} failed",
        report.entities.len(),
        report.total_applied(),
        report.count(Outcome::Conflicted),
        report.count(Outcome::Failed)
    );
    if report.skipped_unlinked > 0 {
        summary.push_str(&format!(", {} unlinked skipped", report.skipped_unlinked));
    }
    if report.dry_run {
        summary.push_str(" [dry run]");
    }
    println!("{} {summary} in {}ms", header.bold(), report.duration_ms);

    for entity in report.entities.iter().filter(|e| e.outcome != Outcome::Unchanged) {
        print_entity(entity);
    }
}

fn print_entity(entity: &EntityReport) {
    println!(
        "  {} {:<12} {:<24} {}",
        outcome_marker(entity.outcome),
        entity.remote_id,
        entity.local_id.as_deref().unwrap_or("-"),
        entity.outcome.as_str()
    );
    for change in &entity.changes {
        let arrow = match change.direction {
            crate::sync::Direction::ToLocal => "→ local ",
            crate::sync::Direction::ToRemote => "→ remote",
        };
        println!("      {:<12} {arrow} {}", change.field.to_string(), change.value);
    }
    for conflict in &entity.conflicts {
        println!(
            "      {:<12} {} local {} vs remote {}",
            conflict.field.to_string(),
            "conflict".red(),
            conflict.local_value,
            conflict.remote_value
        );
    }
    if let Some(error) = &entity.error {
        println!("      {}", error.red());
    }
}
