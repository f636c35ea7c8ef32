//! # IMOS CLI (`imos`)
//!
//! Connect a Google Drive account, import documents and ask questions
//! about them.
//!
//! ## Usage
//!
//! ```bash
//! imos --config ./config/imos.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `imos init` | Create the SQLite database and run schema migrations |
//! | `imos connect` | Authorize read-only Drive access |
//! | `imos disconnect` | Forget the stored credential |
//! | `imos status` | Show connection, store and model settings |
//! | `imos list` | List importable Drive documents |
//! | `imos import <id>...` | Import documents by id (or `--all`) |
//! | `imos documents` | List imported documents |
//! | `imos purge <id>` | Remove an imported document |
//! | `imos ask "<question>"` | Answer one question from the documents |
//! | `imos chat` | Interactive conversation |

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use imos::commands::{self, ImportArgs};
use imos::config;
use imos::logging;
use imos::progress::ProgressMode;

/// IMOS: chat with the documents in your Google Drive.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/imos.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "imos",
    about = "Intelligent Memory OS: chat with the documents in your Google Drive",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/imos.toml`. A missing file means built-in
    /// defaults plus environment overrides.
    #[arg(long, global = true, default_value = "./config/imos.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Authorize read-only access to Google Drive.
    ///
    /// Prints a consent URL, then reads the authorization code (or the
    /// whole redirect URL) from stdin.
    Connect,

    /// Forget the stored credential. Imported documents are kept.
    Disconnect,

    /// Show connection state, store contents and model settings.
    Status,

    /// List importable documents in the connected Drive.
    List {
        /// Case-insensitive substring of the name or folder.
        #[arg(long)]
        search: Option<String>,

        /// Glob on the file name, e.g. `*minutes*.pdf`.
        #[arg(long)]
        glob: Option<String>,
    },

    /// Import documents into the local store.
    ///
    /// Each document is downloaded, extracted, chunked and embedded.
    /// Documents that fail are skipped and reported; the rest are kept.
    Import {
        /// Drive file ids (see `imos list`).
        ids: Vec<String>,

        /// Import every listed document (after --search/--glob).
        #[arg(long, conflicts_with = "ids")]
        all: bool,

        #[arg(long)]
        search: Option<String>,

        #[arg(long)]
        glob: Option<String>,

        /// Progress on stderr. Defaults to `human` on a terminal, else `off`.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// List imported documents.
    Documents,

    /// Remove an imported document and its chunks.
    Purge {
        /// Drive file id.
        id: String,
    },

    /// Answer a single question.
    Ask {
        question: String,
    },

    /// Interactive conversation over stdin.
    Chat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => commands::run_init(&cfg).await?,
        Commands::Connect => commands::run_connect(&cfg).await?,
        Commands::Disconnect => commands::run_disconnect(&cfg).await?,
        Commands::Status => commands::run_status(&cfg).await?,
        Commands::List { search, glob } => commands::run_list(&cfg, search, glob).await?,
        Commands::Import {
            ids,
            all,
            search,
            glob,
            progress,
        } => {
            let args = ImportArgs {
                ids,
                all,
                search,
                glob,
                progress,
            };
            commands::run_import(&cfg, args).await?
        }
        Commands::Documents => commands::run_documents(&cfg).await?,
        Commands::Purge { id } => commands::run_purge(&cfg, &id).await?,
        Commands::Ask { question } => commands::run_ask(&cfg, &question).await?,
        Commands::Chat => commands::run_chat(&cfg).await?,
    }

    Ok(())
}
