//! CLI definitions using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

/// tracklink - keep local work items in sync with a remote tracker
#[derive(Parser, Debug)]
#[command(name = "tl", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database path (default: ~/.tracklink/data/tracklink.db)
    #[arg(long, global = true, env = "TRACKLINK_DB")]
    pub db: Option<PathBuf>,

    /// Actor name for audit trail
    #[arg(long, global = true, env = "TL_ACTOR")]
    pub actor: Option<String>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the database and a default config file
    Init {
        /// Overwrite an existing database
        #[arg(long)]
        force: bool,
    },

    /// Print version information
    Version,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Synchronize with the remote tracker
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },

    /// Manage local ↔ remote links
    Link {
        #[command(subcommand)]
        command: LinkCommands,
    },

    /// Inspect or clear the remote snapshot cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

/// Supported shells for completions.
#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

// ============================================================================
// Sync Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum SyncCommands {
    /// Sync every item of one or all configured collections
    Run(SyncRunArgs),

    /// Sync specific linked local entities
    Entity {
        /// Local entity IDs
        #[arg(required = true)]
        local_ids: Vec<String>,

        /// Entity kind (issue, milestone, project)
        #[arg(long, short = 'k', default_value = "issue")]
        kind: String,

        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Show links, cache freshness and pending conflicts
    Status,

    /// List unresolved conflicts
    Conflicts,
}

#[derive(clap::Args, Debug)]
pub struct SyncRunArgs {
    /// Only sync this kind (issue, milestone, project)
    #[arg(long, short = 'k')]
    pub kind: Option<String>,

    /// Report what would change without writing
    #[arg(long)]
    pub dry_run: bool,

    /// Entities processed in parallel
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Create local entities for unlinked remote items
    #[arg(long)]
    pub import_unlinked: bool,

    /// First-sync policy (fill_empty_local, prefer_remote)
    #[arg(long)]
    pub seed_policy: Option<String>,
}

// ============================================================================
// Link Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum LinkCommands {
    /// Link a local entity to a remote item
    Add {
        /// Local entity ID
        local_id: String,
        /// Remote item ID
        remote_id: String,
    },

    /// Remove the link of a local entity
    Remove {
        /// Local entity ID
        local_id: String,
    },

    /// List all links
    List,
}

// ============================================================================
// Cache Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Show cache entries and freshness
    Status,

    /// Invalidate one entry, or all of them
    Clear {
        /// Remote item ID (omit to clear everything)
        remote_id: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_sync_run() {
        let cli = Cli::parse_from(["tl", "sync", "run", "--kind", "issue", "--dry-run", "--concurrency", "2"]);
        match cli.command {
            Commands::Sync {
                command: SyncCommands::Run(args),
            } => {
                assert_eq!(args.kind.as_deref(), Some("issue"));
                assert!(args.dry_run);
                assert_eq!(args.concurrency, Some(2));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["tl", "link", "list", "--json", "--db", "/tmp/x.db"]);
        assert!(cli.json);
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
    }
}
