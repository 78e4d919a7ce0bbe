//! # ragnote CLI
//!
//! Database initialization, local ingestion, search, question answering,
//! document management, embedding maintenance, and the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! ragnote --config ./config/ragnote.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragnote init` | Create the SQLite database and run schema migrations |
//! | `ragnote ingest <paths>` | Extract, chunk, and index local files |
//! | `ragnote search "<query>"` | Search indexed documents |
//! | `ragnote ask "<question>"` | Answer a question from indexed documents |
//! | `ragnote documents` | List indexed documents |
//! | `ragnote get <id>` | Show a document and its chunks |
//! | `ragnote delete <id>` | Remove a document |
//! | `ragnote embed pending` | Backfill missing or stale embeddings |
//! | `ragnote embed rebuild` | Delete and regenerate all embeddings |
//! | `ragnote stats` | Index statistics |
//! | `ragnote serve` | Start the HTTP API |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use ragnote::config::{self, SearchMode};
use ragnote::{chat, documents, embed_cmd, ingest, migrate, search, server, stats};

/// ragnote: upload documents, search them, and ask questions grounded in them.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ragnote.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "ragnote", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragnote.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Index local files or directories.
    ///
    /// Directories are walked recursively; only supported file types
    /// (pdf, docx, pptx, txt, md) are indexed. Unchanged files are skipped.
    Ingest {
        /// Files or directories to index.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Glob patterns to restrict which files are indexed (e.g. `**/*.md`).
        #[arg(long)]
        include: Vec<String>,
    },

    /// Search indexed documents.
    Search {
        query: String,

        /// `keyword`, `semantic`, or `hybrid`. Defaults to `[retrieval].mode`.
        #[arg(long)]
        mode: Option<String>,

        #[arg(long)]
        limit: Option<i64>,
    },

    /// Answer a question from the indexed documents.
    Ask {
        question: String,

        /// Number of passages to retrieve.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// List indexed documents.
    Documents,

    /// Show a document with its metadata and chunks.
    Get { id: String },

    /// Remove a document, its chunks, and its vectors.
    Delete { id: String },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Show index statistics.
    Stats,

    /// Start the HTTP API.
    Serve,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks that are missing or stale embeddings.
    Pending {
        #[arg(long)]
        limit: Option<usize>,

        /// Override `[embedding].batch_size`.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Only count pending chunks.
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete and regenerate all embeddings.
    Rebuild {
        #[arg(long)]
        batch_size: Option<usize>,
    },
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
            std::fs::create_dir_all(&cfg.server.uploads_dir)?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { paths, include } => {
            ingest::run_ingest(&cfg, &paths, &include).await?;
        }
        Commands::Search { query, mode, limit } => {
            let mode = mode.map(|m| m.parse::<SearchMode>()).transpose()?;
            search::run_search(&cfg, &query, mode, limit).await?;
        }
        Commands::Ask { question, top_k } => {
            chat::run_ask(&cfg, &question, top_k).await?;
        }
        Commands::Documents => {
            documents::run_list(&cfg).await?;
        }
        Commands::Get { id } => {
            documents::run_get(&cfg, &id).await?;
        }
        Commands::Delete { id } => {
            documents::run_delete(&cfg, &id).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending {
                limit,
                batch_size,
                dry_run,
            } => {
                embed_cmd::run_embed_pending(&cfg, limit, batch_size, dry_run).await?;
            }
            EmbedAction::Rebuild { batch_size } => {
                embed_cmd::run_embed_rebuild(&cfg, batch_size).await?;
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
