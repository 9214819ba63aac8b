//! # dbt capsule CLI (`capsule`)
//!
//! The `capsule` binary indexes a compiled dbt project's records and answers
//! context queries against the index, either directly or through the tool
//! server.
//!
//! ## Usage
//!
//! ```bash
//! capsule --config ./config/capsule.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `capsule init` | Create the SQLite database and run schema migrations |
//! | `capsule index` | Ingest normalized records (incremental unless `--full`) |
//! | `capsule search "<query>"` | Rank models by relevance and centrality |
//! | `capsule get <model>` | Print everything known about a model |
//! | `capsule lineage <model>` | Print bounded upstream/downstream lineage |
//! | `capsule capsule "<task>"` | Print the context capsule for a task as JSON |
//! | `capsule stats` | Index statistics |
//! | `capsule usage` | Tool-call usage summary |
//! | `capsule serve mcp` | Start the HTTP tool server and MCP endpoint |
//!
//! Results go to stdout; logs go to stderr and are filtered by `RUST_LOG`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use dbt_capsule::traversal::get_lineage;
use dbt_capsule::{capsule, config, engine, get, migrate, search, server, stats, usage};

/// dbt capsule: ranked, token-budgeted dbt DAG context for coding agents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "capsule",
    about = "dbt capsule — ranked, token-budgeted dbt DAG context for coding agents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/capsule.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest normalized project records.
    ///
    /// Incremental by default: records whose content hash is unchanged are
    /// reused, and centrality is recomputed only where the graph changed.
    Index {
        /// Records file. Defaults to `[ingest].records_path`.
        #[arg(long)]
        records: Option<PathBuf>,

        /// Rebuild every entity and all centrality from scratch.
        #[arg(long)]
        full: bool,
    },

    /// Search models by text relevance and structural importance.
    Search {
        query: String,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<i64>,

        /// Restrict to one layer: staging, intermediate, marts, other.
        #[arg(long)]
        layer: Option<String>,
    },

    /// Show the full detail view of a model.
    Get {
        /// Model name or unique id.
        model: String,
    },

    /// Show upstream and downstream lineage of a model.
    Lineage {
        /// Model name or unique id.
        model: String,

        /// upstream, downstream or both.
        #[arg(long)]
        direction: Option<String>,

        /// Maximum hops in each direction.
        #[arg(long, allow_negative_numbers = true)]
        depth: Option<i64>,
    },

    /// Assemble the context capsule for a task and print it as JSON.
    Capsule {
        task: String,

        /// Anchor on this model instead of searching.
        #[arg(long)]
        focus: Option<String>,

        /// Approximate token budget.
        #[arg(long, allow_negative_numbers = true)]
        budget: Option<i64>,
    },

    /// Print index statistics.
    Stats,

    /// Summarize recorded tool calls.
    Usage {
        /// Window size in days.
        #[arg(long, default_value_t = 7)]
        days: i64,
    },

    /// Start a server.
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },
}

#[derive(Subcommand)]
enum ServeService {
    /// Start the HTTP tool server with the MCP endpoint at `/mcp`.
    Mcp,
}

async fn run_lineage(
    cfg: &config::Config,
    model: &str,
    direction: Option<&str>,
    depth: Option<i64>,
) -> anyhow::Result<()> {
    let engine = engine::Engine::open(cfg.clone()).await?;
    let lineage = get_lineage(
        &engine.snapshot(),
        &cfg.retrieval,
        model,
        direction,
        depth,
    )?;
    engine.close().await;

    println!("{} ({})", lineage.model, lineage.unique_id);
    for (label, nodes) in [("upstream", &lineage.upstream), ("downstream", &lineage.downstream)] {
        if nodes.is_empty() {
            continue;
        }
        println!("\n{}:", label);
        for n in nodes {
            println!(
                "  {}{} [{}, {}]",
                "  ".repeat(n.distance.saturating_sub(1)),
                n.name,
                n.kind,
                n.layer
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Index { records, full } => {
            engine::run_index(&cfg, records.as_deref(), full).await?;
        }
        Commands::Search {
            query,
            limit,
            layer,
        } => {
            search::run_search(&cfg, &query, limit, layer).await?;
        }
        Commands::Get { model } => {
            get::run_get(&cfg, &model).await?;
        }
        Commands::Lineage {
            model,
            direction,
            depth,
        } => {
            run_lineage(&cfg, &model, direction.as_deref(), depth).await?;
        }
        Commands::Capsule {
            task,
            focus,
            budget,
        } => {
            capsule::run_capsule(&cfg, &task, focus.as_deref(), budget).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Usage { days } => {
            usage::run_usage(&cfg, days).await?;
        }
        Commands::Serve { service } => match service {
            ServeService::Mcp => {
                server::run_server(&cfg).await?;
            }
        },
    }

    Ok(())
}
