//! Google Drive document source.
//!
//! Lists importable files through the Drive v3 `files.list` endpoint and
//! downloads their content. Every request carries a bearer token from the
//! [`CredentialStore`], refreshed there as needed.
//!
//! # Listing
//!
//! The query filters by MIME type and excludes trashed files; pages are
//! followed through `nextPageToken` up to `drive.max_results`. Each file
//! is enriched with its parent folder's name (`"Drive"` when it has none
//! or the lookup fails) and a web view link. The optional substring
//! search and name glob of a [`DocumentFilter`] are applied locally.
//!
//! # Downloads
//!
//! Binary files come from `files/{id}?alt=media`; native Google Docs are
//! exported as `text/plain`. The size cap is checked against the listing,
//! then `Content-Length`, then the bytes actually received.
//!
//! # Errors
//!
//! | Condition | Error |
//! |-----------|-------|
//! | HTTP 401 | [`Error::Auth`] |
//! | HTTP 403, rate-limit reason | [`Error::TransientNetwork`] |
//! | HTTP 403 on a download (`cannotDownloadFile`, `downloadQuotaExceeded`, ...) | [`Error::Forbidden`] |
//! | HTTP 403 on listing, any other reason | [`Error::Auth`] |
//! | HTTP 404 | [`Error::NotFound`] |
//! | HTTP 429 / 5xx, connect failure, timeout | [`Error::TransientNetwork`] |
//! | Unexpected JSON | [`Error::Schema`] |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobMatcher};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::config::DriveConfig;
use crate::credentials::CredentialStore;
use crate::error::{Error, Result};
use crate::extract::MIME_TEXT;
use crate::models::SourceDocument;

pub const MIME_GOOGLE_DOC: &str = "application/vnd.google-apps.document";
const DEFAULT_PARENT: &str = "Drive";
const MAX_PAGE_SIZE: usize = 1000;

/// Source of importable documents.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Files in the connected account that match `filter`.
    async fn list_candidates(&self, filter: &DocumentFilter) -> Result<Vec<SourceDocument>>;

    /// Content of a listed file, bounded by the configured size cap.
    async fn download(&self, doc: &SourceDocument) -> Result<Vec<u8>>;
}

/// Which files a listing should return.
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub mime_types: Vec<String>,
    /// Case-insensitive substring matched against file or folder name.
    pub search: Option<String>,
    /// Glob matched against the file name, case-insensitively.
    pub name_glob: Option<String>,
}

impl DocumentFilter {
    pub fn from_config(config: &DriveConfig) -> Self {
        Self {
            mime_types: config.mime_types.clone(),
            search: None,
            name_glob: None,
        }
    }

    pub fn with_search(mut self, search: Option<String>) -> Self {
        self.search = search.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_glob(mut self, glob: Option<String>) -> Self {
        self.name_glob = glob.filter(|g| !g.trim().is_empty());
        self
    }

    /// Drive `q` expression for this filter.
    pub fn drive_query(&self) -> String {
        let types: Vec<String> = self
            .mime_types
            .iter()
            .map(|m| format!("mimeType='{}'", escape_query(m)))
            .collect();
        match types.len() {
            0 => "trashed=false".to_string(),
            1 => format!("{} and trashed=false", types[0]),
            _ => format!("({}) and trashed=false", types.join(" or ")),
        }
    }

    fn matcher(&self) -> Result<Option<GlobMatcher>> {
        self.name_glob
            .as_deref()
            .map(|pattern| {
                GlobBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map(|g| g.compile_matcher())
                    .map_err(|e| Error::Config(format!("invalid glob '{}': {}", pattern, e)))
            })
            .transpose()
    }

    /// Apply the local parts of the filter (search and glob).
    pub fn retain(&self, docs: Vec<SourceDocument>) -> Result<Vec<SourceDocument>> {
        let matcher = self.matcher()?;
        let needle = self.search.as_deref().map(|s| s.trim().to_lowercase());
        Ok(docs
            .into_iter()
            .filter(|d| {
                needle.as_deref().map_or(true, |n| {
                    d.name.to_lowercase().contains(n) || d.parent.to_lowercase().contains(n)
                })
            })
            .filter(|d| matcher.as_ref().map_or(true, |m| m.is_match(&d.name)))
            .collect())
    }
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// MIME type of the bytes [`DocumentSource::download`] returns for `doc`.
pub fn content_mime(doc: &SourceDocument) -> &str {
    if doc.mime_type == MIME_GOOGLE_DOC {
        MIME_TEXT
    } else {
        &doc.mime_type
    }
}

pub fn web_link(file_id: &str) -> String {
    format!("https://drive.google.com/file/d/{}/view", file_id)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    /// Drive reports sizes as decimal strings.
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    parents: Vec<String>,
}

/// `{"error": {"code": 403, "message": "...", "errors": [{"reason": "..."}]}}`
#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorReason>,
}

#[derive(Deserialize)]
struct ErrorReason {
    reason: String,
}

const RATE_LIMIT_REASONS: &[&str] = &["userRateLimitExceeded", "rateLimitExceeded"];

/// What a request was for; a 403 on a single file's content only
/// concerns that file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scope {
    Account,
    File,
}

#[derive(Deserialize)]
struct FolderName {
    name: String,
}

pub struct DriveClient {
    config: DriveConfig,
    credentials: Arc<CredentialStore>,
    http: reqwest::Client,
    folder_names: Mutex<HashMap<String, String>>,
}

impl DriveClient {
    pub fn new(config: &DriveConfig, credentials: Arc<CredentialStore>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            config: config.clone(),
            credentials,
            http,
            folder_names: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
        scope: Scope,
    ) -> Result<reqwest::Response> {
        let token = self.credentials.access_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(network_error)?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(status_error(status, &body, scope))
        }
    }

    async fn folder_name(&self, folder_id: &str) -> String {
        if let Some(name) = self.folder_names.lock().await.get(folder_id) {
            return name.clone();
        }
        let lookup = async {
            let response = self
                .get(
                    &self.url(&format!("files/{}", folder_id)),
                    &[("fields", "name".to_string())],
                    Scope::Account,
                )
                .await?;
            let folder: FolderName = response.json().await.map_err(schema_error)?;
            Ok::<_, Error>(folder.name)
        };
        let name = match lookup.await {
            Ok(name) => name,
            Err(e) => {
                tracing::debug!(folder_id, error = %e, "folder name lookup failed");
                DEFAULT_PARENT.to_string()
            }
        };
        self.folder_names
            .lock()
            .await
            .insert(folder_id.to_string(), name.clone());
        name
    }

    async fn to_source_document(&self, file: DriveFile) -> SourceDocument {
        let parent = match file.parents.first() {
            Some(id) => self.folder_name(id).await,
            None => DEFAULT_PARENT.to_string(),
        };
        SourceDocument {
            web_link: web_link(&file.id),
            size: file.size.and_then(|s| s.parse().ok()),
            id: file.id,
            name: file.name,
            mime_type: file.mime_type,
            modified_at: file.modified_time,
            parent,
        }
    }

    fn size_error(&self, doc: &SourceDocument, size: u64) -> Error {
        Error::SizeLimit {
            name: doc.name.clone(),
            size,
            limit: self.config.max_file_size,
        }
    }
}

#[async_trait]
impl DocumentSource for DriveClient {
    async fn list_candidates(&self, filter: &DocumentFilter) -> Result<Vec<SourceDocument>> {
        let query = filter.drive_query();
        let max_results = self.config.max_results.max(1);
        let mut files: Vec<DriveFile> = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page_size = (max_results - files.len()).min(MAX_PAGE_SIZE);
            let mut params = vec![
                ("q", query.clone()),
                (
                    "fields",
                    "nextPageToken, files(id, name, mimeType, size, modifiedTime, parents)"
                        .to_string(),
                ),
                ("pageSize", page_size.to_string()),
                ("orderBy", "modifiedTime desc".to_string()),
            ];
            if let Some(token) = page_token.take() {
                params.push(("pageToken", token));
            }

            let response = self
                .get(&self.url("files"), &params, Scope::Account)
                .await?;
            let page: FileList = response.json().await.map_err(schema_error)?;
            tracing::debug!(count = page.files.len(), "listed Drive page");
            files.extend(page.files);

            match page.next_page_token {
                Some(token) if files.len() < max_results => page_token = Some(token),
                _ => break,
            }
        }
        files.truncate(max_results);

        let mut docs = Vec::with_capacity(files.len());
        for file in files {
            docs.push(self.to_source_document(file).await);
        }
        filter.retain(docs)
    }

    async fn download(&self, doc: &SourceDocument) -> Result<Vec<u8>> {
        let limit = self.config.max_file_size;
        if let Some(size) = doc.size.filter(|s| *s > limit) {
            return Err(self.size_error(doc, size));
        }

        let mut response = if doc.mime_type == MIME_GOOGLE_DOC {
            self.get(
                &self.url(&format!("files/{}/export", doc.id)),
                &[("mimeType", MIME_TEXT.to_string())],
                Scope::File,
            )
            .await?
        } else {
            self.get(
                &self.url(&format!("files/{}", doc.id)),
                &[("alt", "media".to_string())],
                Scope::File,
            )
            .await?
        };

        if let Some(length) = response.content_length().filter(|l| *l > limit) {
            return Err(self.size_error(doc, length));
        }

        let mut bytes = Vec::new();
        while let Some(piece) = response.chunk().await.map_err(network_error)? {
            bytes.extend_from_slice(&piece);
            if bytes.len() as u64 > limit {
                return Err(self.size_error(doc, bytes.len() as u64));
            }
        }
        tracing::debug!(id = %doc.id, bytes = bytes.len(), "downloaded document");
        Ok(bytes)
    }
}

fn network_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::TransientNetwork(format!("Drive request timed out: {}", e))
    } else {
        Error::TransientNetwork(format!("Drive request failed: {}", e))
    }
}

fn schema_error(e: reqwest::Error) -> Error {
    Error::Schema {
        service: "Drive",
        detail: e.to_string(),
    }
}

fn status_error(status: StatusCode, body: &str, scope: Scope) -> Error {
    let parsed = serde_json::from_str::<ErrorResponse>(body).ok();
    let reasons: Vec<&str> = parsed
        .as_ref()
        .map(|r| r.error.errors.iter().map(|e| e.reason.as_str()).collect())
        .unwrap_or_default();
    let message = parsed
        .as_ref()
        .and_then(|r| r.error.message.as_deref())
        .unwrap_or(body)
        .trim();
    let detail = if reasons.is_empty() {
        format!("Drive returned {}: {}", status, message)
    } else {
        format!("Drive returned {} ({}): {}", status, reasons.join(", "), message)
    };

    match status.as_u16() {
        401 => Error::Auth(detail),
        403 if reasons.iter().any(|r| RATE_LIMIT_REASONS.contains(r)) => {
            Error::TransientNetwork(detail)
        }
        403 if scope == Scope::File => Error::Forbidden(detail),
        403 => Error::Auth(detail),
        404 => Error::NotFound(detail),
        429 => Error::TransientNetwork(detail),
        _ if status.is_server_error() => Error::TransientNetwork(detail),
        _ => Error::Schema {
            service: "Drive",
            detail,
        },
    }
}
