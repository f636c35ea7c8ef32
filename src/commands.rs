//! CLI command handlers.
//!
//! Each `run_*` function backs one `imos` subcommand: it builds the
//! production [`SessionController`], resumes the stored session and prints
//! plain `key: value` output on stdout. Progress and logs go to stderr.

use std::collections::HashSet;
use std::io::{BufRead, Write};

use anyhow::{bail, Result};

use crate::assemble::Answer;
use crate::config::Config;
use crate::db;
use crate::error::Error;
use crate::migrate;
use crate::models::SourceDocument;
use crate::progress::ProgressMode;
use crate::session::{SessionContext, SessionController, SessionState};

/// Controller plus a context resumed from the stored credential.
async fn open_session(config: &Config) -> Result<(SessionController, SessionContext)> {
    let controller = SessionController::from_config(config).await?;
    let mut ctx = SessionContext::new();
    controller.resume(&mut ctx).await?;
    Ok((controller, ctx))
}

pub async fn run_init(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    pool.close().await;
    println!("Database initialized successfully.");
    Ok(())
}

/// Interactive authorization: print the consent URL, read back the code.
pub async fn run_connect(config: &Config) -> Result<()> {
    let (controller, mut ctx) = open_session(config).await?;
    if ctx.state() != &SessionState::Disconnected {
        println!("Already connected. Run `imos disconnect` first to switch accounts.");
        return Ok(());
    }

    let url = controller.begin_connect(&mut ctx)?;
    println!("Open this URL in your browser and grant read-only Drive access:");
    println!();
    println!("  {}", url);
    println!();
    print!("Paste the authorization code (or the full redirect URL): ");
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().lock().read_line(&mut input)?;
    if input.trim().is_empty() {
        bail!("no authorization code entered");
    }

    controller.complete_connect(&mut ctx, input.trim()).await?;
    println!("Connected to Google Drive.");
    Ok(())
}

pub async fn run_disconnect(config: &Config) -> Result<()> {
    let (controller, mut ctx) = open_session(config).await?;
    controller.disconnect(&mut ctx).await?;
    println!("Disconnected. Imported documents were kept; use `imos purge` to remove them.");
    Ok(())
}

pub async fn run_status(config: &Config) -> Result<()> {
    let (controller, ctx) = open_session(config).await?;
    let store = controller.store();
    let documents = store.list_documents().await?;
    let chunks = store.chunk_count().await?;
    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("IMOS status");
    println!("===========");
    println!();
    println!("  Session:     {}", ctx.state());
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Documents:   {}", documents.len());
    println!("  Chunks:      {}", chunks);
    match store.dims().await? {
        Some(dims) => println!("  Dimensions:  {}", dims),
        None => println!("  Dimensions:  -"),
    }
    println!(
        "  Embedding:   {} ({})",
        config.embedding.provider,
        config.embedding.model.as_deref().unwrap_or("default model")
    );
    println!(
        "  Chat model:  {} (api key {})",
        config.llm.model,
        if config.llm.has_api_key() {
            "set"
        } else {
            "missing"
        }
    );
    println!();
    Ok(())
}

pub async fn run_list(
    config: &Config,
    search: Option<String>,
    glob: Option<String>,
) -> Result<()> {
    let (controller, mut ctx) = open_session(config).await?;
    let docs = controller
        .list_candidates(&mut ctx, search, glob, false)
        .await?;

    if docs.is_empty() {
        println!("No importable documents found.");
        return Ok(());
    }
    println!(
        "{:<34} {:>10}  {:<20} {}",
        "ID", "SIZE", "MODIFIED", "NAME"
    );
    for doc in &docs {
        println!(
            "{:<34} {:>10}  {:<20} {} ({})",
            doc.id,
            doc.size.map(format_bytes).unwrap_or_else(|| "-".to_string()),
            doc.modified_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string()),
            doc.name,
            doc.parent
        );
    }
    println!();
    println!("{} document(s)", docs.len());
    Ok(())
}

pub struct ImportArgs {
    pub ids: Vec<String>,
    pub all: bool,
    pub search: Option<String>,
    pub glob: Option<String>,
    pub progress: Option<ProgressMode>,
}

pub async fn run_import(config: &Config, args: ImportArgs) -> Result<()> {
    if args.ids.is_empty() && !args.all {
        bail!("name the document ids to import, or pass --all");
    }
    let (controller, mut ctx) = open_session(config).await?;
    let candidates = controller
        .list_candidates(&mut ctx, args.search, args.glob, false)
        .await?;
    let selected = select_documents(candidates, &args.ids, args.all)?;
    if selected.is_empty() {
        println!("Nothing to import.");
        return Ok(());
    }

    let mode = args.progress.unwrap_or_else(ProgressMode::default_for_tty);
    let reporter = mode.reporter();
    let report = controller
        .import(&mut ctx, &selected, reporter.as_ref())
        .await?;

    for doc in &report.imported {
        println!("imported: {} ({} chunks)", doc.name, doc.chunks);
    }
    for doc in &report.skipped {
        println!("skipped:  {}: {}", doc.name, doc.reason);
    }
    println!("{}", report.summary());
    Ok(())
}

/// Pick `ids` out of `candidates` (listing order), or all of them.
fn select_documents(
    candidates: Vec<SourceDocument>,
    ids: &[String],
    all: bool,
) -> Result<Vec<SourceDocument>> {
    if all {
        return Ok(candidates);
    }
    let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let known: HashSet<&str> = candidates.iter().map(|d| d.id.as_str()).collect();
    let mut missing: Vec<&str> = ids
        .iter()
        .map(String::as_str)
        .filter(|id| !known.contains(id))
        .collect();
    if !missing.is_empty() {
        missing.dedup();
        bail!(
            "not importable (unknown id or unsupported type): {}",
            missing.join(", ")
        );
    }
    Ok(candidates
        .into_iter()
        .filter(|d| wanted.contains(d.id.as_str()))
        .collect())
}

pub async fn run_documents(config: &Config) -> Result<()> {
    let (controller, _ctx) = open_session(config).await?;
    let documents = controller.store().list_documents().await?;
    if documents.is_empty() {
        println!("No documents imported yet.");
        return Ok(());
    }
    for doc in &documents {
        println!("--- {} ---", doc.name);
        println!("id:          {}", doc.id);
        println!("type:        {}", doc.mime_type);
        println!("chunks:      {}", doc.chunk_count);
        println!("imported_at: {}", doc.imported_at.format("%Y-%m-%d %H:%M:%S"));
        println!("link:        {}", doc.web_link);
        println!();
    }
    Ok(())
}

pub async fn run_purge(config: &Config, id: &str) -> Result<()> {
    let (controller, mut ctx) = open_session(config).await?;
    if controller.purge(&mut ctx, id).await? {
        println!("Removed document {}.", id);
    } else {
        println!("No imported document with id {}.", id);
    }
    Ok(())
}

pub async fn run_ask(config: &Config, question: &str) -> Result<()> {
    let (controller, mut ctx) = open_session(config).await?;
    let answer = controller.ask(&mut ctx, question).await?;
    print_answer(&answer);
    Ok(())
}

/// Read questions from stdin until EOF or `/quit`.
pub async fn run_chat(config: &Config) -> Result<()> {
    let (controller, mut ctx) = open_session(config).await?;
    println!("Ask about your documents. /clear resets the conversation, /quit exits.");

    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                controller.clear_conversation(&mut ctx)?;
                println!("Conversation cleared.");
                continue;
            }
            question => match controller.ask(&mut ctx, question).await {
                Ok(answer) => print_answer(&answer),
                Err(e) => eprintln!("error: {}", chat_error(e)?),
            },
        }
    }
    Ok(())
}

/// A failed turn ends the chat only when the session cannot go on;
/// anything else is shown and the next question is read.
fn chat_error(e: Error) -> Result<Error> {
    if e.is_fatal() {
        return Err(e.into());
    }
    Ok(e)
}

fn print_answer(answer: &Answer) {
    println!("{}", answer.text.trim());
    if answer.sources.is_empty() {
        return;
    }
    println!();
    println!("Sources:");
    let mut seen = HashSet::new();
    for source in &answer.sources {
        if !seen.insert(source.chunk.document_id.as_str()) {
            continue;
        }
        println!(
            "  {:.3}  {}  {}",
            source.score,
            source.chunk.document_name,
            crate::drive::web_link(&source.chunk.document_id)
        );
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
