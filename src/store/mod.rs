//! Persistent chunk storage.
//!
//! The [`DocumentStore`] trait is what the import and retrieval paths
//! depend on. Two backends implement it:
//!
//! - [`SqliteStore`]: the on-disk store used by the CLI.
//! - [`InMemoryStore`]: same semantics without a database, for tests.
//!
//! Both enforce the same rules:
//!
//! | Rule | Behavior |
//! |------|----------|
//! | Per-document atomicity | all chunks of a document land, or none do |
//! | Re-import | existing chunks of that document are replaced, not appended |
//! | Chunk index | unique within a document |
//! | Dimensionality | every stored vector has the same length ([`Error::DimensionMismatch`]) |
//! | Scan order | [`all_chunks`](DocumentStore::all_chunks) returns insertion order |

pub mod memory;
pub mod sqlite;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::{Chunk, DocumentSummary, SourceDocument};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Replace everything stored for `doc` with `chunks`, atomically.
    async fn insert_chunks(&self, doc: &SourceDocument, chunks: &[Chunk]) -> Result<()>;

    /// Every stored chunk in insertion order.
    async fn all_chunks(&self) -> Result<Vec<Chunk>>;

    /// Delete a document and its chunks. Returns whether anything was removed.
    async fn purge(&self, document_id: &str) -> Result<bool>;

    /// Imported documents, most recently imported first.
    async fn list_documents(&self) -> Result<Vec<DocumentSummary>>;

    async fn chunk_count(&self) -> Result<i64>;

    /// Vector length shared by all stored chunks; `None` when empty.
    async fn dims(&self) -> Result<Option<usize>>;
}

/// Check a batch before anything is written.
///
/// `existing_dims` is the dimensionality of chunks stored for *other*
/// documents, if any. Returns the dimensionality of the batch.
pub(crate) fn validate_batch(
    doc: &SourceDocument,
    chunks: &[Chunk],
    existing_dims: Option<usize>,
) -> Result<Option<usize>> {
    let mut seen = HashSet::new();
    let mut batch_dims = existing_dims;

    for chunk in chunks {
        if chunk.document_id != doc.id {
            return Err(Error::Config(format!(
                "chunk {} belongs to document '{}', not '{}'",
                chunk.chunk_index, chunk.document_id, doc.id
            )));
        }
        if !seen.insert(chunk.chunk_index) {
            return Err(Error::Config(format!(
                "duplicate chunk index {} for document '{}'",
                chunk.chunk_index, doc.id
            )));
        }
        let dims = chunk.vector.len();
        match batch_dims {
            Some(expected) if expected != dims => {
                return Err(Error::DimensionMismatch {
                    expected,
                    actual: dims,
                });
            }
            None if dims == 0 => {
                return Err(Error::DimensionMismatch {
                    expected: 1,
                    actual: 0,
                });
            }
            _ => batch_dims = Some(dims),
        }
    }

    Ok(if chunks.is_empty() { None } else { batch_dims })
}


#[cfg(test)]
mod tests {
    use super::testing::{chunk, doc};
    use super::*;

    #[test]
    fn batch_with_mixed_dims_is_rejected() {
        let d = doc("a");
        let chunks = vec![
            chunk("a", 0, "one", vec![1.0, 0.0]),
            chunk("a", 1, "two", vec![1.0, 0.0, 0.0]),
        ];
        assert!(matches!(
            validate_batch(&d, &chunks, None),
            Err(Error::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
    }

    #[test]
    fn batch_must_match_existing_dims() {
        let d = doc("a");
        let chunks = vec![chunk("a", 0, "one", vec![1.0, 0.0])];
        assert!(validate_batch(&d, &chunks, Some(2)).is_ok());
        assert!(matches!(
            validate_batch(&d, &chunks, Some(384)),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn duplicate_indices_are_rejected() {
        let d = doc("a");
        let chunks = vec![
            chunk("a", 0, "one", vec![1.0]),
            chunk("a", 0, "again", vec![1.0]),
        ];
        assert!(matches!(validate_batch(&d, &chunks, None), Err(Error::Config(_))));
    }

    #[test]
    fn foreign_chunks_are_rejected() {
        let d = doc("a");
        let chunks = vec![chunk("b", 0, "one", vec![1.0])];
        assert!(validate_batch(&d, &chunks, None).is_err());
    }
}
