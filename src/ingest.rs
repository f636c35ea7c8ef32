//! Import pipeline: download → extract → chunk → embed → store.
//!
//! Documents are imported one at a time. A failure confined to one
//! document (missing file, size cap, unreadable format, exhausted
//! retries) is recorded in the [`ImportReport`] and the import moves on.
//! Credential and store failures abort the run; documents imported
//! before that point stay in the store.
//!
//! Within a document, a chunk the embedder cannot encode is dropped with
//! a warning. The surviving chunks keep their original indices.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::chunk::{chunk_text, ChunkParams};
use crate::config::Config;
use crate::drive::{content_mime, DocumentSource};
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::extract::extract_text;
use crate::models::{Chunk, SourceDocument};
use crate::progress::{ImportProgressEvent, ImportProgressReporter};
use crate::store::DocumentStore;

#[derive(Debug, Clone, PartialEq)]
pub struct ImportedDocument {
    pub id: String,
    pub name: String,
    pub chunks: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedDocument {
    pub id: String,
    pub name: String,
    pub reason: String,
}

/// Outcome of one import run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportReport {
    pub requested: usize,
    pub imported: Vec<ImportedDocument>,
    pub skipped: Vec<SkippedDocument>,
}

impl ImportReport {
    pub fn chunks_written(&self) -> usize {
        self.imported.iter().map(|d| d.chunks).sum()
    }

    pub fn summary(&self) -> String {
        format!(
            "Successfully imported {} out of {} documents",
            self.imported.len(),
            self.requested
        )
    }
}

pub struct Importer {
    source: Arc<dyn DocumentSource>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn DocumentStore>,
    params: ChunkParams,
    batch_size: usize,
    max_retries: u32,
    retry_delay: Duration,
}

impl Importer {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn DocumentStore>,
        config: &Config,
    ) -> Result<Self> {
        Ok(Self {
            source,
            embedder,
            store,
            params: ChunkParams::new(config.chunking.size, config.chunking.overlap)?,
            batch_size: config.embedding.batch_size.max(1),
            max_retries: config.drive.max_retries,
            retry_delay: Duration::from_secs(1),
        })
    }

    /// Base delay between download attempts; doubles on each retry.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub async fn import_documents(
        &self,
        docs: &[SourceDocument],
        progress: &dyn ImportProgressReporter,
    ) -> Result<ImportReport> {
        let mut report = ImportReport {
            requested: docs.len(),
            ..Default::default()
        };
        let total = docs.len() as u64;

        for (i, doc) in docs.iter().enumerate() {
            progress.report(ImportProgressEvent::Started {
                n: i as u64 + 1,
                total,
                name: doc.name.clone(),
            });

            match self.import_one(doc).await {
                Ok(chunks) => {
                    tracing::info!(id = %doc.id, name = %doc.name, chunks, "imported document");
                    progress.report(ImportProgressEvent::Imported {
                        name: doc.name.clone(),
                        chunks: chunks as u64,
                    });
                    report.imported.push(ImportedDocument {
                        id: doc.id.clone(),
                        name: doc.name.clone(),
                        chunks,
                    });
                }
                Err(e) if e.is_document_local() => {
                    tracing::warn!(id = %doc.id, name = %doc.name, error = %e, "skipped document");
                    progress.report(ImportProgressEvent::Skipped {
                        name: doc.name.clone(),
                        reason: e.to_string(),
                    });
                    report.skipped.push(SkippedDocument {
                        id: doc.id.clone(),
                        name: doc.name.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::error!(
                        id = %doc.id,
                        imported = report.imported.len(),
                        error = %e,
                        "import aborted"
                    );
                    return Err(e);
                }
            }
        }

        Ok(report)
    }

    /// Import a single document, returning the number of chunks stored.
    async fn import_one(&self, doc: &SourceDocument) -> Result<usize> {
        let bytes = self.download_with_retry(doc).await?;
        let text = extract_text(&bytes, content_mime(doc))?;
        let pieces = chunk_text(&text, self.params);
        tracing::debug!(id = %doc.id, chars = text.chars().count(), chunks = pieces.len(), "chunked document");

        let vectors = self.embed_pieces(&pieces).await?;
        let created_at = Utc::now();
        let chunks: Vec<Chunk> = pieces
            .into_iter()
            .zip(vectors)
            .enumerate()
            .filter_map(|(i, (text, vector))| {
                vector.map(|vector| Chunk {
                    document_id: doc.id.clone(),
                    document_name: doc.name.clone(),
                    chunk_index: i as i64,
                    text,
                    vector,
                    created_at,
                })
            })
            .collect();

        if chunks.is_empty() {
            return Err(Error::Encoding(format!(
                "no chunk of '{}' could be encoded",
                doc.name
            )));
        }

        self.store.insert_chunks(doc, &chunks).await?;
        Ok(chunks.len())
    }

    async fn download_with_retry(&self, doc: &SourceDocument) -> Result<Vec<u8>> {
        let mut attempt = 0;
        loop {
            match self.source.download(doc).await {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.retry_delay * (1u32 << (attempt - 1).min(5));
                    tracing::debug!(id = %doc.id, attempt, error = %e, "retrying download");
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    /// One vector per piece; `None` where the piece could not be encoded.
    async fn embed_pieces(&self, pieces: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        let mut out = Vec::with_capacity(pieces.len());
        for batch in pieces.chunks(self.batch_size) {
            match self.embedder.embed_batch(batch).await {
                Ok(vectors) => out.extend(vectors.into_iter().map(Some)),
                Err(Error::Encoding(reason)) => {
                    tracing::debug!(%reason, "batch encoding failed, encoding chunks one by one");
                    for piece in batch {
                        match self.embedder.encode(piece).await {
                            Ok(v) => out.push(Some(v)),
                            Err(Error::Encoding(reason)) => {
                                tracing::warn!(%reason, "skipping chunk that could not be encoded");
                                out.push(None);
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}
