//! # kb-sync CLI (`kbctl`)
//!
//! Operator interface for kb-sync: queue sync requests, run the worker,
//! rebuild the index, query it, and serve the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! kbctl --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbctl init [--index <id>]` | Create the database schema, optionally set the served index |
//! | `kbctl enqueue <index_id>` | Queue a sync request |
//! | `kbctl worker [--once]` | Consume sync requests |
//! | `kbctl reindex start` | Trigger a full rebuild |
//! | `kbctl reindex status [<id>]` | Show a reindex job (latest when omitted) |
//! | `kbctl reindex run <id>` | Drive a reindex job to completion |
//! | `kbctl search "<query>"` | Query the current index |
//! | `kbctl status` | Queue, syncs, reindex, and pointer overview |
//! | `kbctl serve` | Start the HTTP server (runs the worker too) |
//!
//! Logs go to stderr, filtered by `RUST_LOG` (default `info`).

use std::path::PathBuf;

use anyhow::bail;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use kb_sync::app::App;
use kb_sync::config;
use kb_sync::migrate;
use kb_sync::progress::ProgressMode;
use kb_sync::search;
use kb_sync::server;
use kb_sync::status;
use kb_sync::worker::WorkerStep;
use kb_sync_core::models::SyncRequest;
use kb_sync_core::store::{CutoverResult, JobStore, PointerStore, TriggerOutcome};

/// kb-sync: serialized index syncs and resumable reindexing for a managed
/// knowledge-base index.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kb.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "kbctl",
    about = "kb-sync: serialized index syncs and resumable reindexing",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    /// Reindex progress on stderr. Defaults to `human` on a terminal, `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent. With `--index`, also sets the index served to queries
    /// when none is set yet.
    Init {
        #[arg(long)]
        index: Option<String>,
    },

    /// Queue a sync request for an index.
    Enqueue {
        index_id: String,

        /// When the content was written (RFC 3339). Defaults to now.
        #[arg(long)]
        requested_at: Option<DateTime<Utc>>,
    },

    /// Consume queued sync requests.
    Worker {
        /// Process at most one message and exit.
        #[arg(long)]
        once: bool,
    },

    /// Full index rebuild.
    Reindex {
        #[command(subcommand)]
        action: ReindexAction,
    },

    /// Query the current index.
    Search {
        query: String,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show queue depth, recent syncs, the latest reindex, and the served index.
    Status,

    /// Start the HTTP server.
    Serve,
}

#[derive(Subcommand)]
enum ReindexAction {
    /// Create a reindex job (or report the one already running).
    Start,
    /// Show a reindex job; the latest one when no id is given.
    Status { id: Option<String> },
    /// Advance a reindex job until it completes or fails.
    Run { id: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    if let Commands::Init { ref index } = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        if let Some(index) = index {
            let app = App::open(cfg).await?;
            set_initial_index(&app, index).await?;
            app.close().await;
        }
        return Ok(());
    }

    let app = App::open(cfg).await?;

    match cli.command {
        Commands::Init { .. } => {}
        Commands::Enqueue {
            index_id,
            requested_at,
        } => {
            let request = SyncRequest::new(index_id, requested_at.unwrap_or_else(Utc::now));
            let outcome = app.queue.enqueue(&request).await?;
            if outcome.deduplicated {
                println!("Merged into pending message #{}.", outcome.message_id);
            } else {
                println!("Queued message #{}.", outcome.message_id);
            }
        }
        Commands::Worker { once } => {
            let worker = app.worker();
            if once {
                match worker.run_once().await? {
                    WorkerStep::Idle => println!("Queue is empty."),
                    WorkerStep::Handled {
                        message_id,
                        outcome,
                    } => println!("#{}: {:?}", message_id, outcome),
                    WorkerStep::Retrying { message_id, error } => {
                        println!("#{}: will retry ({})", message_id, error)
                    }
                    WorkerStep::DeadLettered { message_id, error } => {
                        println!("#{}: dead-lettered ({})", message_id, error)
                    }
                }
            } else {
                worker
                    .run(async {
                        let _ = tokio::signal::ctrl_c().await;
                    })
                    .await?;
            }
        }
        Commands::Reindex { action } => {
            let orchestrator = app.orchestrator().with_progress(progress.reporter());
            match action {
                ReindexAction::Start => match orchestrator.trigger().await? {
                    TriggerOutcome::Created(job) => {
                        println!("Created reindex {}.", job.execution_id);
                        println!("Run `kbctl reindex run {}` to drive it.", job.execution_id);
                    }
                    TriggerOutcome::Existing(job) => {
                        println!("Reindex {} is already running.", job.execution_id);
                        println!("{}", job.summary());
                    }
                },
                ReindexAction::Status { id } => {
                    let job = match id {
                        Some(id) => orchestrator.status(&id).await?,
                        None => match app.store.latest_reindex_job().await? {
                            Some(job) => job,
                            None => {
                                println!("No reindex has been run.");
                                app.close().await;
                                return Ok(());
                            }
                        },
                    };
                    println!("{}  {}", job.execution_id, job.summary());
                    for message in &job.error_messages {
                        println!("  {}", message);
                    }
                }
                ReindexAction::Run { id } => {
                    let job = orchestrator.drive(&id).await?;
                    println!("{}", job.summary());
                }
            }
        }
        Commands::Search { query, limit } => {
            search::run_search(&app, &query, limit).await?;
        }
        Commands::Status => {
            status::run_status(&app).await?;
        }
        Commands::Serve => {
            server::run_server(app.clone()).await?;
        }
    }

    app.close().await;
    Ok(())
}

async fn set_initial_index(app: &App, index: &str) -> anyhow::Result<()> {
    match app.store.current().await? {
        Some(p) if p.index_id == index => {
            println!("Already serving {}.", index);
            return Ok(());
        }
        Some(p) => bail!(
            "already serving {} (v{}); use `kbctl reindex start` to switch indexes",
            p.index_id,
            p.version
        ),
        None => {}
    }
    match app.store.compare_and_swap(None, index).await? {
        CutoverResult::Applied(p) => println!("Serving {} (v{}).", p.index_id, p.version),
        CutoverResult::Stale(current) => bail!(
            "pointer was set concurrently to {}",
            current.map_or_else(|| "<none>".to_string(), |p| p.index_id)
        ),
    }
    Ok(())
}
