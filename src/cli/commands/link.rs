//! `tl link`: manage the local ↔ remote identity table.

use crate::cli::commands::{format_millis, open_storage};
use crate::cli::LinkCommands;
use crate::error::Result;
use crate::storage::LocalStore;
use crate::sync::{LinkRecord, LinkTable};
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Serialize)]
struct LinkOutput<'a> {
    local_id: &'a str,
    remote_id: &'a str,
    local_exists: bool,
}

#[derive(Serialize)]
struct LinkListOutput {
    count: usize,
    links: Vec<LinkRecord>,
}

/// Execute link commands.
pub fn execute(
    command: &LinkCommands,
    db_path: Option<&PathBuf>,
    actor: Option<&str>,
    json: bool,
) -> Result<()> {
    let storage = Arc::new(open_storage(db_path, actor)?);
    let links = LinkTable::new(storage.clone());

    match command {
        LinkCommands::Add {
            local_id,
            remote_id,
        } => {
            links.link(local_id, remote_id)?;
            let local_exists = storage.load(local_id)?.is_some();
            if !local_exists {
                tracing::warn!(%local_id, "linked an id with no local entity");
            }

            if json {
                let output = LinkOutput {
                    local_id,
                    remote_id,
                    local_exists,
                };
                println!("{}", serde_json::to_string(&output)?);
            } else {
                println!("{} {local_id} ↔ {remote_id}", "Linked".green());
                if !local_exists {
                    println!("  {}", "No local entity with this ID exists yet.".yellow());
                }
            }
        }

        LinkCommands::Remove { local_id } => {
            let record = links.unlink(local_id)?;
            if json {
                println!("{}", serde_json::to_string(&record)?);
            } else {
                println!(
                    "{} {} ↔ {}",
                    "Unlinked".yellow(),
                    record.local_id,
                    record.remote_id
                );
            }
        }

        LinkCommands::List => {
            let records = links.list()?;
            if json {
                let output = LinkListOutput {
                    count: records.len(),
                    links: records,
                };
                println!("{}", serde_json::to_string(&output)?);
            } else if records.is_empty() {
                println!("No links.");
            } else {
                println!("{}", format!("{} link(s)", records.len()).bold());
                for record in &records {
                    println!(
                        "  {:<24} {:<16} {}",
                        record.local_id.cyan(),
                        record.remote_id,
                        format_millis(record.linked_at).dimmed()
                    );
                }
            }
        }
    }
    Ok(())
}
