//! Configuration loading.
//!
//! Settings come from a TOML file (default `./config/imos.toml`) with one
//! section per concern. Every field has a default, so a missing file is
//! valid and yields a working local setup. A handful of environment
//! variables override the file; API keys and OAuth secrets are expected
//! to arrive that way rather than being written to disk.
//!
//! ```toml
//! [db]
//! path = "./data/imos.sqlite"
//!
//! [chunking]
//! size = 500
//! overlap = 50
//!
//! [retrieval]
//! top_k = 5
//!
//! [drive]
//! mime_types = ["application/pdf"]
//! max_file_size = 20971520
//!
//! [llm]
//! model = "llama-3.1-8b-instant"
//! ```
//!
//! # Environment overrides
//!
//! | Variable | Field |
//! |----------|-------|
//! | `API_KEY` (or `GROQ_API_KEY`) | `llm.api_key` |
//! | `CHUNK_SIZE` | `chunking.size` |
//! | `CHUNK_OVERLAP` | `chunking.overlap` |
//! | `TOP_K` | `retrieval.top_k` |
//! | `MAX_FILE_SIZE` | `drive.max_file_size` |
//! | `GOOGLE_CLIENT_ID` | `auth.client_id` |
//! | `GOOGLE_CLIENT_SECRET` | `auth.client_secret` |
//! | `GOOGLE_REFRESH_TOKEN` | `auth.refresh_token` |

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::{drive, extract};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub drive: DriveConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/imos.sqlite")
}

/// OAuth2 client settings for the Google account connection.
#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Google `credentials.json` (either `installed` or `web` layout).
    #[serde(default)]
    pub client_secrets_path: Option<PathBuf>,
    /// Where the token blob is persisted between runs.
    #[serde(default = "default_token_path")]
    pub token_path: PathBuf,
    /// Refresh token supplied as a secret; bootstraps a credential when
    /// no token file exists yet.
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            client_secrets_path: None,
            token_path: default_token_path(),
            refresh_token: None,
            auth_uri: default_auth_uri(),
            token_uri: default_token_uri(),
            redirect_uri: default_redirect_uri(),
            scopes: default_scopes(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_token_path() -> PathBuf {
    PathBuf::from("./data/token.json")
}
fn default_auth_uri() -> String {
    "https://accounts.google.com/o/oauth2/auth".to_string()
}
fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}
fn default_redirect_uri() -> String {
    "http://localhost".to_string()
}
fn default_scopes() -> Vec<String> {
    vec!["https://www.googleapis.com/auth/drive.readonly".to_string()]
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct DriveConfig {
    #[serde(default = "default_drive_api_base")]
    pub api_base: String,
    /// MIME types offered for import.
    #[serde(default = "default_mime_types")]
    pub mime_types: Vec<String>,
    /// Download cap in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Upper bound on files returned by one listing.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Download attempts per document on transient failures.
    #[serde(default = "default_drive_retries")]
    pub max_retries: u32,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            api_base: default_drive_api_base(),
            mime_types: default_mime_types(),
            max_file_size: default_max_file_size(),
            max_results: default_max_results(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_drive_retries(),
        }
    }
}

fn default_drive_api_base() -> String {
    "https://www.googleapis.com/drive/v3".to_string()
}
fn default_mime_types() -> Vec<String> {
    vec!["application/pdf".to_string()]
}
fn default_max_file_size() -> u64 {
    20 * 1024 * 1024
}
fn default_max_results() -> usize {
    1000
}
fn default_drive_retries() -> u32 {
    2
}

/// Sliding-window chunking, measured in characters.
#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size: default_chunk_size(),
            overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `local` (fastembed), `openai`, or `hash`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the `openai` provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Chunks scoring below this are dropped after ranking.
    #[serde(default)]
    pub min_score: Option<f32>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: None,
        }
    }
}

fn default_top_k() -> usize {
    5
}

/// Hosted chat-completion endpoint (OpenAI-compatible).
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Usually supplied through `API_KEY` rather than the file.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}
fn default_llm_model() -> String {
    "llama-3.1-8b-instant".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1500
}
fn default_llm_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversationConfig {
    /// Most recent turns forwarded to the LLM with each question.
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
    /// Replaces the built-in instructions at the top of the system prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_history_turns: default_max_history_turns(),
            system_prompt: None,
        }
    }
}

fn default_max_history_turns() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default level: `error`, `warn`, `info`, `debug` or `trace`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Per-module overrides, e.g. `ingest = "debug"`.
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl LlmConfig {
    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

/// Load configuration from `path`, apply environment overrides, validate.
///
/// A missing file is not an error: defaults are used instead.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

/// Apply the recognized environment overrides using `lookup` to read
/// variables.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(key) = lookup("API_KEY").or_else(|| lookup("GROQ_API_KEY")) {
        config.llm.api_key = Some(key);
    }
    if let Some(v) = lookup("CHUNK_SIZE") {
        config.chunking.size = parse_env("CHUNK_SIZE", &v)?;
    }
    if let Some(v) = lookup("CHUNK_OVERLAP") {
        config.chunking.overlap = parse_env("CHUNK_OVERLAP", &v)?;
    }
    if let Some(v) = lookup("TOP_K") {
        config.retrieval.top_k = parse_env("TOP_K", &v)?;
    }
    if let Some(v) = lookup("MAX_FILE_SIZE") {
        config.drive.max_file_size = parse_env("MAX_FILE_SIZE", &v)?;
    }
    if let Some(v) = lookup("GOOGLE_CLIENT_ID") {
        config.auth.client_id = Some(v);
    }
    if let Some(v) = lookup("GOOGLE_CLIENT_SECRET") {
        config.auth.client_secret = Some(v);
    }
    if let Some(v) = lookup("GOOGLE_REFRESH_TOKEN") {
        config.auth.refresh_token = Some(v);
    }
    Ok(())
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer, got '{}'", name, value))
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.size == 0 {
        bail!("chunking.size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.size {
        bail!(
            "chunking.overlap ({}) must be smaller than chunking.size ({})",
            config.chunking.overlap,
            config.chunking.size
        );
    }
    if config.retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.drive.max_file_size == 0 {
        bail!("drive.max_file_size must be > 0");
    }
    if config.drive.mime_types.is_empty() {
        bail!("drive.mime_types must name at least one type");
    }
    if let Some(unsupported) = config
        .drive
        .mime_types
        .iter()
        .find(|m| !extract::is_supported(m.as_str()) && m.as_str() != drive::MIME_GOOGLE_DOC)
    {
        bail!("drive.mime_types: no text extractor for '{}'", unsupported);
    }
    if config.conversation.max_history_turns < 1 {
        bail!("conversation.max_history_turns must be >= 1");
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    match config.embedding.provider.as_str() {
        "local" | "hash" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                bail!("embedding.model must be specified when provider is 'openai'");
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!("embedding.dims must be > 0 when provider is 'openai'");
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be local, openai, or hash.",
            other
        ),
    }

    Ok(())
}
