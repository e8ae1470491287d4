//! # Sync Orchestrator CLI (`syncd`)
//!
//! The `syncd` binary drives the orchestrator: schema initialization, the
//! long-running server, source registry management, manual sync triggers,
//! and operator queue maintenance.
//!
//! ## Usage
//!
//! ```bash
//! syncd --config ./config/syncd.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `syncd init` | Create the SQLite database and run schema migrations |
//! | `syncd serve` | Run the HTTP surfaces and all background loops |
//! | `syncd source add\|list\|activate\|deactivate` | Manage registered sources |
//! | `syncd workers` | List connector workers and their health |
//! | `syncd sync <source_id> [--full]` | Trigger a sync from the CLI |
//! | `syncd status` | Counts of sources, runs, and queue depths |
//! | `syncd events requeue-dead-letter` | Requeue dead-lettered events |
//! | `syncd embeddings retry-failed` | Requeue permanently failed embedding jobs |

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use sync_orchestrator::models::{SourceType, TriggerType};
use sync_orchestrator::{
    config, db, embed_queue, events, migrate, protocol, runs, scheduler, server, sources,
};

/// Sync orchestrator — schedules, supervises, and recovers synchronization
/// runs executed by pluggable connector workers.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/syncd.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "syncd",
    about = "Sync orchestrator — schedules, supervises, and recovers connector sync runs",
    version,
    long_about = "The orchestrator keeps external sources (drive, messaging, wiki, CRM) \
    continuously synchronized into an indexing pipeline. Provider logic lives in \
    out-of-process connector workers; this process owns scheduling, admission, run \
    supervision, durable event delivery, embedding jobs, and webhook channel renewal."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/syncd.toml`. Database, server, scheduler,
    /// queue, and connector-worker settings are read from this file.
    #[arg(long, global = true, default_value = "./config/syncd.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// Run the orchestrator.
    ///
    /// Starts the scheduler, stale-sync sweep, event dispatcher, embedding
    /// worker pool, webhook renewal sweep, and the HTTP server for worker
    /// SDK callbacks and operator calls.
    Serve,

    /// Manage registered sources.
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// List configured connector workers and their health.
    ///
    /// Calls each worker's `/health` and `/manifest` endpoints. Useful for
    /// verifying connector configuration before registering sources.
    Workers,

    /// Trigger a sync for one source.
    ///
    /// Goes through the same admission path as the scheduler: a source
    /// with a run already in progress, or a saturated concurrency ceiling,
    /// is rejected rather than queued.
    Sync {
        /// Source id to sync.
        source_id: String,

        /// Ignore the saved checkpoint — re-scan everything from scratch.
        #[arg(long)]
        full: bool,
    },

    /// Show source, run, and queue counts.
    Status,

    /// Operator maintenance of the event queue.
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },

    /// Operator maintenance of the embedding queue.
    Embeddings {
        #[command(subcommand)]
        action: EmbeddingsAction,
    },
}

/// Source registry subcommands.
#[derive(Subcommand)]
enum SourceAction {
    /// Register a new source. Its first sync becomes due immediately.
    Add {
        /// Source type: `drive`, `messaging`, `wiki`, or `crm`.
        #[arg(long = "type")]
        source_type: String,

        /// Human-readable name.
        #[arg(long)]
        name: String,

        /// Connector configuration as a JSON object (non-secret).
        #[arg(long, default_value = "{}")]
        config: String,

        /// Encrypted credential blob from the credential service.
        #[arg(long)]
        credentials: Option<String>,

        /// Seconds between scheduled syncs.
        #[arg(long, default_value_t = 3600)]
        interval: i64,
    },

    /// List all registered sources.
    List,

    /// Re-enable a deactivated source.
    Activate {
        /// Source id.
        id: String,
    },

    /// Exclude a source from scheduling without deleting its history.
    Deactivate {
        /// Source id.
        id: String,
    },
}

/// Event queue subcommands.
#[derive(Subcommand)]
enum EventsAction {
    /// Move all dead-lettered events back to pending with a fresh retry
    /// budget.
    RequeueDeadLetter,
}

/// Embedding queue subcommands.
#[derive(Subcommand)]
enum EmbeddingsAction {
    /// Move all permanently failed embedding jobs back to pending.
    RetryFailed,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&config).await?;
            println!("Database initialized at {}", config.db.path.display());
        }
        Commands::Serve => {
            migrate::run_migrations(&config).await?;
            server::run_server(&config).await?;
        }
        Commands::Source { action } => {
            let pool = db::connect(&config).await?;
            match action {
                SourceAction::Add {
                    source_type,
                    name,
                    config: source_config,
                    credentials,
                    interval,
                } => {
                    let source_type = SourceType::parse(&source_type).with_context(|| {
                        format!(
                            "unknown source type '{}' (expected drive, messaging, wiki, or crm)",
                            source_type
                        )
                    })?;
                    let source = sources::add_source(
                        &pool,
                        source_type,
                        &name,
                        &source_config,
                        credentials.as_deref(),
                        interval,
                    )
                    .await?;
                    println!("Added source {} ({})", source.id, source.name);
                }
                SourceAction::List => {
                    let all = sources::list_sources(&pool).await?;
                    if all.is_empty() {
                        println!("No sources registered.");
                    }
                    for s in all {
                        println!(
                            "{}  {:<10} {:<24} active={} interval={}s next_sync_at={}",
                            s.id,
                            s.source_type,
                            s.name,
                            s.is_active,
                            s.sync_interval_seconds,
                            s.next_sync_at
                                .map(|t| t.to_string())
                                .unwrap_or_else(|| "-".to_string()),
                        );
                    }
                }
                SourceAction::Activate { id } => {
                    if sources::set_active(&pool, &id, true).await? {
                        println!("Source {} activated", id);
                    } else {
                        anyhow::bail!("source {} not found", id);
                    }
                }
                SourceAction::Deactivate { id } => {
                    if sources::set_active(&pool, &id, false).await? {
                        println!("Source {} deactivated", id);
                    } else {
                        anyhow::bail!("source {} not found", id);
                    }
                }
            }
        }
        Commands::Workers => {
            if config.connectors.is_empty() {
                println!("No connector workers configured.");
            }
            for (source_type, connector) in &config.connectors {
                let client = protocol::WorkerClient::for_connector(connector)?;
                match client.health().await {
                    Ok(()) => match client.manifest().await {
                        Ok(m) => println!(
                            "{:<10} {} — {} v{} (modes: {}; actions: {})",
                            source_type,
                            connector.url,
                            m.name,
                            m.version,
                            m.sync_modes.join(", "),
                            m.actions.join(", "),
                        ),
                        Err(e) => println!("{:<10} {} — healthy, manifest error: {}", source_type, connector.url, e),
                    },
                    Err(e) => println!("{:<10} {} — UNREACHABLE: {}", source_type, connector.url, e),
                }
            }
        }
        Commands::Sync { source_id, full } => {
            let pool = db::connect(&config).await?;
            let source = sources::get_source(&pool, &source_id)
                .await?
                .with_context(|| format!("source {} not found", source_id))?;
            let sync_type = scheduler::sync_type_for(&source, full);
            let run = runs::start_run(
                &pool,
                &config.scheduler,
                &source,
                TriggerType::Manual,
                sync_type,
            )
            .await?;
            println!("Started {} sync run {}", sync_type.as_str(), run.id);
            // Dispatch inline so the run actually reaches the worker even
            // though this process exits afterwards. A failed dispatch must
            // fail the run here, or the source stays blocked until the
            // stale sweep catches up.
            if let Err(e) = scheduler::dispatch_run(&pool, &config, &source, &run).await {
                runs::fail_run(&pool, &run.id, &format!("dispatch failed: {}", e)).await?;
                return Err(e.context(format!("dispatch failed for run {}", run.id)));
            }
            println!("Dispatched to {} worker", source.source_type);
        }
        Commands::Status => {
            let pool = db::connect(&config).await?;
            let source_count = sources::list_sources(&pool).await?.len();
            println!("Sources: {}", source_count);

            println!("Sync runs:");
            for (status, count) in runs::run_counts(&pool).await? {
                println!("  {:<12} {}", status, count);
            }
            println!("Connector events:");
            for (status, count) in events::event_counts(&pool).await? {
                println!("  {:<12} {}", status, count);
            }
            println!("Embedding jobs:");
            for (status, count) in embed_queue::job_counts(&pool).await? {
                println!("  {:<12} {}", status, count);
            }
        }
        Commands::Events { action } => match action {
            EventsAction::RequeueDeadLetter => {
                let pool = db::connect(&config).await?;
                let n = events::requeue_dead_letter(&pool).await?;
                println!("Requeued {} dead-lettered events", n);
            }
        },
        Commands::Embeddings { action } => match action {
            EmbeddingsAction::RetryFailed => {
                let pool = db::connect(&config).await?;
                let n = embed_queue::retry_failed(&pool).await?;
                println!("Requeued {} failed embedding jobs", n);
            }
        },
    }

    Ok(())
}
