//! # Rapport CLI (`rapport`)
//!
//! ## Usage
//!
//! ```bash
//! rapport --config ./config/rapport.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rapport init` | Create the SQLite database and schema |
//! | `rapport serve` | Start the HTTP server (event intake + admin API) |
//! | `rapport ingest <file.jsonl>` | Ingest raw Slack events, one JSON object per line |
//! | `rapport import <dir>` | Import Slack channel histories |
//! | `rapport index-docs <dir>` | Index external documents |
//! | `rapport replay` | Re-apply the event log to profiles and index |
//! | `rapport profile <user>` | Show a user's profile |
//! | `rapport context <user> "<intent>"` | Print a context bundle as JSON |
//! | `rapport draft <user> "<intent>"` | Generate a reply draft for review |
//! | `rapport stats` | Store totals and most active users |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use rapport::progress::ProgressMode;
use rapport::{commands, config, logging, migrate};

/// Rapport: workspace activity profiles and grounded reply drafts for
/// Slack administrators.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rapport.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "rapport",
    about = "Rapport — workspace activity profiles and grounded reply drafts",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rapport.toml")]
    config: PathBuf,

    /// Debug-level logging (`RUST_LOG` takes precedence).
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    /// Progress output on stderr. Defaults to `human` on a TTY, else `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the HTTP server.
    Serve,

    /// Ingest raw Slack events from a JSON Lines file.
    Ingest {
        /// File with one event (or `event_callback` envelope) per line.
        path: PathBuf,
    },

    /// Import Slack channel histories from a directory.
    ///
    /// Accepts `{channel}_messages.json` files or a workspace export with
    /// one directory per channel.
    Import { dir: PathBuf },

    /// Index external documents (Markdown, text) for retrieval.
    IndexDocs { dir: PathBuf },

    /// Rebuild profiles and the index from the event log.
    Replay,

    /// Show a user's profile.
    Profile {
        user_id: String,

        /// Print the raw profile as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Assemble a context bundle and print it as JSON.
    Context {
        user_id: String,
        intent: String,

        /// Token budget (defaults to `[retrieval] default_budget`).
        #[arg(long)]
        budget: Option<usize>,
    },

    /// Generate a reply draft. Nothing is posted to Slack.
    Draft {
        user_id: String,
        intent: String,

        #[arg(long)]
        budget: Option<usize>,
    },

    /// Show store totals and the most active users.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose, cli.log_json);

    let cfg = config::load_config(&cli.config)?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => commands::run_serve(cfg).await?,
        Commands::Ingest { path } => commands::run_ingest(cfg, &path, progress).await?,
        Commands::Import { dir } => commands::run_import(cfg, &dir, progress).await?,
        Commands::IndexDocs { dir } => commands::run_index_docs(cfg, &dir, progress).await?,
        Commands::Replay => commands::run_replay(cfg).await?,
        Commands::Profile { user_id, json } => commands::run_profile(cfg, &user_id, json).await?,
        Commands::Context {
            user_id,
            intent,
            budget,
        } => commands::run_context(cfg, &user_id, &intent, budget).await?,
        Commands::Draft {
            user_id,
            intent,
            budget,
        } => commands::run_draft(cfg, &user_id, &intent, budget).await?,
        Commands::Stats => commands::run_stats(cfg).await?,
    }

    Ok(())
}
