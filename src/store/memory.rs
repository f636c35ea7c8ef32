//! In-memory [`DocumentStore`] for tests and throwaway sessions.
//!
//! State lives behind a single `RwLock`; a batch is validated before the
//! lock's contents change, so a rejected insert leaves nothing behind.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{validate_batch, DocumentStore};
use crate::error::{Error, Result};
use crate::models::{Chunk, DocumentSummary, SourceDocument};

struct StoredDocument {
    doc: SourceDocument,
    imported_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    documents: Vec<StoredDocument>,
    /// Kept in insertion order.
    chunks: Vec<Chunk>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> Error {
    Error::Config("in-memory store lock poisoned".to_string())
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn insert_chunks(&self, doc: &SourceDocument, chunks: &[Chunk]) -> Result<()> {
        let mut state = self.state.write().map_err(|_| poisoned())?;

        let existing = state
            .chunks
            .iter()
            .find(|c| c.document_id != doc.id)
            .map(|c| c.vector.len());
        validate_batch(doc, chunks, existing)?;

        state.chunks.retain(|c| c.document_id != doc.id);
        state.documents.retain(|d| d.doc.id != doc.id);
        state.documents.push(StoredDocument {
            doc: doc.clone(),
            imported_at: Utc::now(),
        });
        state.chunks.extend(chunks.iter().map(|c| Chunk {
            document_name: doc.name.clone(),
            ..c.clone()
        }));
        Ok(())
    }

    async fn all_chunks(&self) -> Result<Vec<Chunk>> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.chunks.clone())
    }

    async fn purge(&self, document_id: &str) -> Result<bool> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        let before = state.documents.len();
        state.documents.retain(|d| d.doc.id != document_id);
        state.chunks.retain(|c| c.document_id != document_id);
        Ok(state.documents.len() != before)
    }

    async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        let state = self.state.read().map_err(|_| poisoned())?;
        let mut docs: Vec<DocumentSummary> = state
            .documents
            .iter()
            .map(|d| DocumentSummary {
                id: d.doc.id.clone(),
                name: d.doc.name.clone(),
                mime_type: d.doc.mime_type.clone(),
                web_link: d.doc.web_link.clone(),
                chunk_count: state
                    .chunks
                    .iter()
                    .filter(|c| c.document_id == d.doc.id)
                    .count() as i64,
                imported_at: d.imported_at,
            })
            .collect();
        docs.sort_by(|a, b| {
            b.imported_at
                .cmp(&a.imported_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(docs)
    }

    async fn chunk_count(&self) -> Result<i64> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.chunks.len() as i64)
    }

    async fn dims(&self) -> Result<Option<usize>> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.chunks.first().map(|c| c.vector.len()))
    }
}
