//! Session controller: sequences connect → import → chat.
//!
//! All per-session state lives in an explicit [`SessionContext`] that the
//! caller owns and passes to every call. The controller holds only the
//! shared services (credentials, document source, store, retrieval, LLM).
//!
//! ```text
//! Disconnected ──begin_connect──▶ Connecting ──complete_connect──▶ Connected
//!                                                                     │ import
//!          ┌───────────── ask ──────────────┐                         ▼
//!       Chatting ◀──────── ask ─────────── Ready ◀────────────── Importing
//!          └──────────── import ───────────────────────────────────▲
//! ```
//!
//! Credential and store failures move the session to
//! [`SessionState::Error`]; from there only `disconnect` and `reset` are
//! accepted. A call made from the wrong state fails with
//! [`Error::InvalidState`] and leaves the context untouched.

use std::fmt;
use std::sync::Arc;

use crate::assemble::{Answer, Assembler};
use crate::config::Config;
use crate::credentials::{AuthRequest, CredentialStore};
use crate::drive::{DocumentFilter, DocumentSource, DriveClient};
use crate::embedding::{create_embedder, Embedder};
use crate::error::{Error, Result};
use crate::ingest::{ImportReport, Importer};
use crate::llm::{ChatClient, ChatModel};
use crate::models::{ConversationTurn, SourceDocument};
use crate::progress::ImportProgressReporter;
use crate::retrieve::Retriever;
use crate::store::{DocumentStore, SqliteStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Importing,
    Ready,
    Chatting,
    Error(String),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Importing => write!(f, "importing"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::Chatting => write!(f, "chatting"),
            SessionState::Error(reason) => write!(f, "in error ({})", reason),
        }
    }
}

/// Everything one user session owns.
#[derive(Debug, Clone)]
pub struct SessionContext {
    state: SessionState,
    history: Vec<ConversationTurn>,
    pending_auth: Option<AuthRequest>,
    listing: Option<Vec<SourceDocument>>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            history: Vec::new(),
            pending_auth: None,
            listing: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    pub fn pending_auth(&self) -> Option<&AuthRequest> {
        self.pending_auth.as_ref()
    }

    /// Last listing fetched from the document source, if any.
    pub fn cached_listing(&self) -> Option<&[SourceDocument]> {
        self.listing.as_deref()
    }
}

fn ensure(ctx: &SessionContext, action: &'static str, allowed: bool) -> Result<()> {
    if allowed {
        Ok(())
    } else {
        Err(Error::InvalidState {
            action,
            state: ctx.state.to_string(),
        })
    }
}

/// Record a fatal error on the context before handing it back.
fn escalate(ctx: &mut SessionContext, e: Error) -> Error {
    if e.is_fatal() {
        tracing::error!(error = %e, "session entered error state");
        ctx.state = SessionState::Error(e.to_string());
    }
    e
}

pub struct SessionController {
    credentials: Arc<CredentialStore>,
    source: Arc<dyn DocumentSource>,
    store: Arc<dyn DocumentStore>,
    importer: Importer,
    assembler: Assembler,
    filter: DocumentFilter,
}

impl SessionController {
    pub fn new(
        config: &Config,
        credentials: Arc<CredentialStore>,
        source: Arc<dyn DocumentSource>,
        store: Arc<dyn DocumentStore>,
        embedder: Arc<dyn Embedder>,
        chat: Arc<dyn ChatModel>,
    ) -> Result<Self> {
        let importer = Importer::new(source.clone(), embedder.clone(), store.clone(), config)?;
        let retriever = Retriever::new(store.clone(), embedder)
            .with_min_score(config.retrieval.min_score);
        let assembler = Assembler::new(
            retriever,
            chat,
            config.retrieval.top_k,
            config.conversation.clone(),
        );
        Ok(Self {
            credentials,
            source,
            store,
            importer,
            assembler,
            filter: DocumentFilter::from_config(&config.drive),
        })
    }

    /// Wire up the production services: SQLite, Google Drive, the
    /// configured embedder and the hosted chat model.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let credentials = Arc::new(CredentialStore::new(&config.auth)?);
        let source = Arc::new(DriveClient::new(&config.drive, credentials.clone())?);
        let store = Arc::new(SqliteStore::open(config).await?);
        let embedder = create_embedder(&config.embedding)?;
        let chat = Arc::new(ChatClient::new(&config.llm)?);
        Self::new(config, credentials, source, store, embedder, chat)
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Pick up where a previous run left off: stored credential and
    /// imported documents.
    pub async fn resume(&self, ctx: &mut SessionContext) -> Result<()> {
        ensure(ctx, "resume", ctx.state == SessionState::Disconnected)?;
        let loaded = self
            .credentials
            .load()
            .await
            .map_err(|e| escalate(ctx, e))?;
        if loaded.is_some() {
            ctx.state = SessionState::Connected;
            self.settle(ctx).await?;
        }
        Ok(())
    }

    /// Start connecting; returns the consent URL to show the user.
    pub fn begin_connect(&self, ctx: &mut SessionContext) -> Result<String> {
        ensure(
            ctx,
            "connect",
            matches!(
                ctx.state,
                SessionState::Disconnected | SessionState::Connecting
            ),
        )?;
        let request = self.credentials.begin_auth()?;
        let url = request.url.clone();
        ctx.pending_auth = Some(request);
        ctx.state = SessionState::Connecting;
        Ok(url)
    }

    /// Finish connecting with the code (or redirect URL) the user pasted.
    ///
    /// A rejected code returns the session to `Disconnected`; a network
    /// failure leaves it `Connecting` so the same code can be retried.
    pub async fn complete_connect(&self, ctx: &mut SessionContext, code: &str) -> Result<()> {
        ensure(
            ctx,
            "complete the connection",
            ctx.state == SessionState::Connecting && ctx.pending_auth.is_some(),
        )?;
        let Some(request) = ctx.pending_auth.clone() else {
            return Err(Error::InvalidState {
                action: "complete the connection",
                state: ctx.state.to_string(),
            });
        };

        match self.credentials.complete_auth(&request, code).await {
            Ok(_) => {
                ctx.pending_auth = None;
                ctx.listing = None;
                ctx.state = SessionState::Connected;
                self.settle(ctx).await
            }
            Err(e) if e.is_retryable() => Err(e),
            Err(e @ Error::Auth(_)) => {
                ctx.pending_auth = None;
                ctx.state = SessionState::Disconnected;
                Err(e)
            }
            Err(e) => Err(escalate(ctx, e)),
        }
    }

    /// Importable documents, from the cache unless `refresh` is set or
    /// nothing has been listed yet.
    pub async fn list_candidates(
        &self,
        ctx: &mut SessionContext,
        search: Option<String>,
        glob: Option<String>,
        refresh: bool,
    ) -> Result<Vec<SourceDocument>> {
        ensure(
            ctx,
            "list documents",
            matches!(
                ctx.state,
                SessionState::Connected | SessionState::Ready | SessionState::Chatting
            ),
        )?;

        let listing = match ctx.listing.as_ref() {
            Some(cached) if !refresh => cached.clone(),
            _ => {
                let fresh = self
                    .source
                    .list_candidates(&self.filter)
                    .await
                    .map_err(|e| escalate(ctx, e))?;
                ctx.listing = Some(fresh.clone());
                fresh
            }
        };

        self.filter
            .clone()
            .with_search(search)
            .with_glob(glob)
            .retain(listing)
    }

    /// Import `docs`, skipping the ones that fail individually.
    pub async fn import(
        &self,
        ctx: &mut SessionContext,
        docs: &[SourceDocument],
        progress: &dyn ImportProgressReporter,
    ) -> Result<ImportReport> {
        ensure(
            ctx,
            "import",
            matches!(
                ctx.state,
                SessionState::Connected | SessionState::Ready | SessionState::Chatting
            ),
        )?;

        let previous = ctx.state.clone();
        ctx.state = SessionState::Importing;
        match self.importer.import_documents(docs, progress).await {
            Ok(report) => {
                ctx.state = SessionState::Connected;
                self.settle(ctx).await?;
                Ok(report)
            }
            Err(e) if e.is_fatal() => Err(escalate(ctx, e)),
            Err(e) => {
                ctx.state = previous;
                Err(e)
            }
        }
    }

    /// Answer a question from the imported documents.
    ///
    /// On success the user turn and the assistant turn are appended to the
    /// history. On failure the history is unchanged.
    pub async fn ask(&self, ctx: &mut SessionContext, query: &str) -> Result<Answer> {
        ensure(
            ctx,
            "ask",
            !matches!(
                ctx.state,
                SessionState::Error(_) | SessionState::Connecting | SessionState::Importing
            ),
        )?;
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::Config("question is empty".to_string()));
        }
        // An empty store is reported as such whatever the connection state.
        if self.store.chunk_count().await.map_err(|e| escalate(ctx, e))? == 0 {
            return Err(Error::EmptyStore);
        }
        ensure(
            ctx,
            "ask",
            matches!(ctx.state, SessionState::Ready | SessionState::Chatting),
        )?;

        let answer = self
            .assembler
            .ask(query, &ctx.history)
            .await
            .map_err(|e| escalate(ctx, e))?;
        ctx.history.push(ConversationTurn::user(query));
        ctx.history.push(ConversationTurn::assistant(&answer.text));
        ctx.state = SessionState::Chatting;
        Ok(answer)
    }

    pub fn clear_conversation(&self, ctx: &mut SessionContext) -> Result<()> {
        ensure(
            ctx,
            "clear the conversation",
            !matches!(ctx.state, SessionState::Error(_)),
        )?;
        ctx.history.clear();
        if ctx.state == SessionState::Chatting {
            ctx.state = SessionState::Ready;
        }
        Ok(())
    }

    /// Remove an imported document. Returns whether it existed.
    pub async fn purge(&self, ctx: &mut SessionContext, document_id: &str) -> Result<bool> {
        ensure(
            ctx,
            "purge",
            !matches!(
                ctx.state,
                SessionState::Error(_) | SessionState::Connecting | SessionState::Importing
            ),
        )?;
        let removed = self
            .store
            .purge(document_id)
            .await
            .map_err(|e| escalate(ctx, e))?;
        if matches!(ctx.state, SessionState::Ready | SessionState::Chatting) {
            ctx.state = SessionState::Connected;
            self.settle(ctx).await?;
        }
        Ok(removed)
    }

    /// Sign out: forget the credential and all session state. Imported
    /// documents stay in the store.
    pub async fn disconnect(&self, ctx: &mut SessionContext) -> Result<()> {
        *ctx = SessionContext::new();
        self.credentials.disconnect().await
    }

    /// Drop all in-memory session state without touching the credential.
    pub fn reset(&self, ctx: &mut SessionContext) {
        *ctx = SessionContext::new();
    }

    /// From `Connected`, move on to `Ready` when documents are available.
    async fn settle(&self, ctx: &mut SessionContext) -> Result<()> {
        let count = self
            .store
            .chunk_count()
            .await
            .map_err(|e| escalate(ctx, e))?;
        ctx.state = if count > 0 {
            if ctx.history.is_empty() {
                SessionState::Ready
            } else {
                SessionState::Chatting
            }
        } else {
            SessionState::Connected
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::llm::ChatMessage;
    use crate::models::Credential;
    use crate::progress::NoProgress;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct StaticSource {
        docs: Vec<SourceDocument>,
        bodies: HashMap<String, String>,
        listings: Mutex<usize>,
    }

    #[async_trait]
    impl DocumentSource for StaticSource {
        async fn list_candidates(&self, filter: &DocumentFilter) -> Result<Vec<SourceDocument>> {
            *self.listings.lock().unwrap() += 1;
            filter.retain(self.docs.clone())
        }

        async fn download(&self, doc: &SourceDocument) -> Result<Vec<u8>> {
            self.bodies
                .get(&doc.id)
                .map(|b| b.as_bytes().to_vec())
                .ok_or_else(|| Error::NotFound(doc.id.clone()))
        }
    }

    struct CannedModel {
        reply: Result<String>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl ChatModel for CannedModel {
        async fn complete(&self, _messages: &[ChatMessage]) -> Result<String> {
            *self.calls.lock().unwrap() += 1;
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(_) => Err(Error::LlmUnavailable("503 Service Unavailable".into())),
            }
        }
    }

    fn text_doc(id: &str, name: &str) -> SourceDocument {
        SourceDocument {
            id: id.to_string(),
            name: name.to_string(),
            mime_type: "text/plain".to_string(),
            modified_at: None,
            size: None,
            parent: "Drive".to_string(),
            web_link: crate::drive::web_link(id),
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        controller: SessionController,
        store: Arc<InMemoryStore>,
        model: Arc<CannedModel>,
        source: Arc<StaticSource>,
    }

    fn harness(connected: bool, reply: Result<String>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.auth.token_path = dir.path().join("token.json");
        config.auth.client_id = Some("client".into());
        if connected {
            let credential = Credential {
                access_token: "ya29.ok".into(),
                refresh_token: Some("1//r".into()),
                expires_at: Utc::now() + chrono::Duration::hours(1),
                scopes: vec![],
            };
            std::fs::write(
                &config.auth.token_path,
                serde_json::to_string(&credential).unwrap(),
            )
            .unwrap();
        }

        let source = Arc::new(StaticSource {
            docs: vec![
                text_doc("lease", "Office lease.txt"),
                text_doc("menu", "Lunch menu.txt"),
                text_doc("gone", "Deleted file.txt"),
            ],
            bodies: HashMap::from([
                (
                    "lease".to_string(),
                    "The office lease renews every March.".to_string(),
                ),
                (
                    "menu".to_string(),
                    "Soup of the day is tomato.".to_string(),
                ),
            ]),
            listings: Mutex::new(0),
        });
        let store = Arc::new(InMemoryStore::new());
        let model = Arc::new(CannedModel {
            reply,
            calls: Mutex::new(0),
        });
        let controller = SessionController::new(
            &config,
            Arc::new(CredentialStore::new(&config.auth).unwrap()),
            source.clone(),
            store.clone(),
            Arc::new(HashEmbedder::new(128)),
            model.clone(),
        )
        .unwrap();
        Harness {
            _dir: dir,
            controller,
            store,
            model,
            source,
        }
    }

    #[tokio::test]
    async fn full_flow_reaches_chatting() {
        let h = harness(true, Ok("It renews in March.".into()));
        let mut ctx = SessionContext::new();

        h.controller.resume(&mut ctx).await.unwrap();
        assert_eq!(ctx.state(), &SessionState::Connected);

        let docs = h
            .controller
            .list_candidates(&mut ctx, None, None, false)
            .await
            .unwrap();
        assert_eq!(docs.len(), 3);

        let report = h
            .controller
            .import(&mut ctx, &docs, &NoProgress)
            .await
            .unwrap();
        assert_eq!(report.imported.len(), 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(ctx.state(), &SessionState::Ready);

        let answer = h
            .controller
            .ask(&mut ctx, "When does the office lease renew?")
            .await
            .unwrap();
        assert_eq!(answer.text, "It renews in March.");
        assert_eq!(answer.sources[0].chunk.document_id, "lease");
        assert_eq!(ctx.state(), &SessionState::Chatting);
        assert_eq!(ctx.history().len(), 2);

        // Chatting loops on itself and can import more.
        h.controller.ask(&mut ctx, "And the menu?").await.unwrap();
        assert_eq!(ctx.history().len(), 4);
        h.controller
            .import(&mut ctx, &docs[..1], &NoProgress)
            .await
            .unwrap();
        assert_eq!(ctx.state(), &SessionState::Chatting);

        h.controller.clear_conversation(&mut ctx).unwrap();
        assert!(ctx.history().is_empty());
        assert_eq!(ctx.state(), &SessionState::Ready);
    }

    #[tokio::test]
    async fn resume_with_documents_is_ready() {
        let h = harness(true, Ok("ok".into()));
        let mut ctx = SessionContext::new();
        h.controller.resume(&mut ctx).await.unwrap();
        let docs = h
            .controller
            .list_candidates(&mut ctx, Some("lease".into()), None, false)
            .await
            .unwrap();
        h.controller
            .import(&mut ctx, &docs, &NoProgress)
            .await
            .unwrap();

        let mut next = SessionContext::new();
        h.controller.resume(&mut next).await.unwrap();
        assert_eq!(next.state(), &SessionState::Ready);
    }

    #[tokio::test]
    async fn listing_is_cached_until_refreshed() {
        let h = harness(true, Ok("ok".into()));
        let mut ctx = SessionContext::new();
        h.controller.resume(&mut ctx).await.unwrap();

        h.controller
            .list_candidates(&mut ctx, None, None, false)
            .await
            .unwrap();
        let filtered = h
            .controller
            .list_candidates(&mut ctx, Some("MENU".into()), None, false)
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(*h.source.listings.lock().unwrap(), 1);
        assert_eq!(ctx.cached_listing().map(|l| l.len()), Some(3));

        h.controller
            .list_candidates(&mut ctx, None, None, true)
            .await
            .unwrap();
        assert_eq!(*h.source.listings.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn ask_on_empty_store_makes_no_llm_call() {
        let h = harness(true, Ok("unused".into()));
        let mut ctx = SessionContext::new();
        h.controller.resume(&mut ctx).await.unwrap();

        let err = h.controller.ask(&mut ctx, "anything?").await.unwrap_err();
        assert!(matches!(err, Error::EmptyStore));
        assert_eq!(*h.model.calls.lock().unwrap(), 0);
        assert!(ctx.history().is_empty());
        assert_eq!(ctx.state(), &SessionState::Connected);
    }

    #[tokio::test]
    async fn failed_llm_turn_is_not_recorded() {
        let h = harness(true, Err(Error::LlmUnavailable("down".into())));
        let mut ctx = SessionContext::new();
        h.controller.resume(&mut ctx).await.unwrap();
        let docs = h
            .controller
            .list_candidates(&mut ctx, None, None, false)
            .await
            .unwrap();
        h.controller
            .import(&mut ctx, &docs, &NoProgress)
            .await
            .unwrap();

        let err = h.controller.ask(&mut ctx, "lease?").await.unwrap_err();
        assert!(matches!(err, Error::LlmUnavailable(_)));
        assert!(ctx.history().is_empty());
        assert_eq!(ctx.state(), &SessionState::Ready);
    }

    #[tokio::test]
    async fn illegal_transitions_leave_state_unchanged() {
        let h = harness(false, Ok("ok".into()));
        let mut ctx = SessionContext::new();
        h.controller.resume(&mut ctx).await.unwrap();
        assert_eq!(ctx.state(), &SessionState::Disconnected);

        let err = h
            .controller
            .list_candidates(&mut ctx, None, None, false)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot list documents while disconnected");
        let err = h
            .controller
            .import(&mut ctx, &[], &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        let err = h
            .controller
            .complete_connect(&mut ctx, "code")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(ctx.state(), &SessionState::Disconnected);
    }

    #[tokio::test]
    async fn begin_connect_moves_to_connecting() {
        let h = harness(false, Ok("ok".into()));
        let mut ctx = SessionContext::new();
        let url = h.controller.begin_connect(&mut ctx).unwrap();
        assert!(url.contains("access_type=offline"));
        assert_eq!(ctx.state(), &SessionState::Connecting);
        assert!(ctx.pending_auth().is_some());

        h.controller.reset(&mut ctx);
        assert_eq!(ctx.state(), &SessionState::Disconnected);
        assert!(ctx.pending_auth().is_none());
    }

    #[tokio::test]
    async fn dimension_mismatch_enters_error_until_reset() {
        let h = harness(true, Ok("ok".into()));
        // Chunks from a different model already in the store.
        let mut stale = crate::store::testing::chunk("old", 0, "stale", vec![1.0, 0.0]);
        stale.document_name = "old.pdf".into();
        h.store
            .insert_chunks(&crate::store::testing::doc("old"), &[stale])
            .await
            .unwrap();

        let mut ctx = SessionContext::new();
        h.controller.resume(&mut ctx).await.unwrap();
        assert_eq!(ctx.state(), &SessionState::Ready);

        let err = h.controller.ask(&mut ctx, "stale?").await.unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
        assert!(matches!(ctx.state(), SessionState::Error(_)));

        let err = h.controller.ask(&mut ctx, "again?").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        h.controller.disconnect(&mut ctx).await.unwrap();
        assert_eq!(ctx.state(), &SessionState::Disconnected);
        assert!(!h.controller.credentials().is_connected().await);
    }

    #[tokio::test]
    async fn purging_the_last_document_leaves_ready() {
        let h = harness(true, Ok("ok".into()));
        let mut ctx = SessionContext::new();
        h.controller.resume(&mut ctx).await.unwrap();
        let docs = h
            .controller
            .list_candidates(&mut ctx, Some("lease".into()), None, false)
            .await
            .unwrap();
        h.controller
            .import(&mut ctx, &docs, &NoProgress)
            .await
            .unwrap();
        assert_eq!(ctx.state(), &SessionState::Ready);

        assert!(h.controller.purge(&mut ctx, "lease").await.unwrap());
        assert_eq!(ctx.state(), &SessionState::Connected);
        assert!(!h.controller.purge(&mut ctx, "lease").await.unwrap());
    }
}
