//! # scope-rag CLI (`rag`)
//!
//! The `rag` binary is the primary interface for scope-rag. It provides
//! commands for database initialization, bulk document ingestion, index
//! inspection, one-shot questions, and starting the HTTP API server.
//!
//! ## Usage
//!
//! ```bash
//! rag --config ./config/rag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rag init` | Create the SQLite database and run schema migrations |
//! | `rag serve` | Start the HTTP API server |
//! | `rag ingest <path>` | Chunk and index a file or directory into a scope |
//! | `rag inspect` | Print index statistics |
//! | `rag ask "<question>"` | One-shot retrieval + generation, no persistence |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! rag init --config ./config/rag.toml
//!
//! # Load shared reference documents into the global scope
//! rag ingest ./docs --config ./config/rag.toml
//!
//! # Load markdown files only, into a specific conversation scope
//! rag ingest ./notes --scope 7f3c... --include "**/*.md"
//!
//! # Check what landed where
//! rag inspect
//!
//! # Smoke-test retrieval and generation without the server
//! rag ask "What is the launch code?"
//!
//! # Start the API server
//! rag serve --config ./config/rag.toml
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use scope_rag::{ask, config, index, ingest, inspect, migrate, server};

/// scope-rag CLI — a scoped retrieval-augmented chat service over SQLite.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "rag",
    about = "scope-rag — a scoped retrieval-augmented chat service over SQLite",
    version,
    long_about = "scope-rag ingests documents into per-conversation and global scopes, \
    retrieves the most relevant chunks for each question, and answers through a \
    configurable generation backend (Groq or Gemini), exposed via a CLI and an HTTP API."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/rag.toml`. Database, server, auth, chunking,
    /// retrieval, and provider settings are read from this file.
    #[arg(long, global = true, default_value = "./config/rag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (users,
    /// conversations, messages, chunks, chunks_fts, chunk_vectors).
    /// This command is idempotent — running it multiple times is safe.
    Init,

    /// Start the HTTP API server.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// chat API. Refuses to start if the generation provider's API key or
    /// `[auth].token_secret` is missing.
    Serve,

    /// Chunk and index a file or directory.
    ///
    /// Files are split into size-bounded chunks and upserted under the given
    /// scope. Re-ingesting the same file replaces its chunks wholesale;
    /// unsupported files are skipped with a warning.
    Ingest {
        /// File or directory to ingest.
        path: PathBuf,

        /// Scope to write into: `global` (the default) or a conversation id.
        #[arg(long, default_value = index::GLOBAL_SCOPE)]
        scope: String,

        /// Glob patterns to include when walking a directory (e.g. `**/*.md`).
        /// May be repeated. Defaults to all files.
        #[arg(long = "include")]
        include: Vec<String>,
    },

    /// Print index statistics.
    ///
    /// Shows totals and a per-document breakdown of chunk counts by scope.
    Inspect,

    /// Ask a one-shot question against the index.
    ///
    /// Retrieves from the global scope (plus a conversation scope when
    /// `--conversation` is given), generates an answer, and prints it with
    /// citations. Nothing is persisted.
    Ask {
        /// The question to ask.
        question: String,

        /// Also retrieve from this conversation's scope.
        #[arg(long)]
        conversation: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ingest {
            path,
            scope,
            include,
        } => {
            ingest::run_ingest(&cfg, &path, &scope, &include).await?;
        }
        Commands::Inspect => {
            inspect::run_inspect(&cfg).await?;
        }
        Commands::Ask {
            question,
            conversation,
        } => {
            ask::run_ask(&cfg, &question, conversation.as_deref()).await?;
        }
    }

    Ok(())
}
