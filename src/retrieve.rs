//! Brute-force cosine retrieval over the document store.

use std::sync::Arc;

use crate::embedding::{cosine_similarity, Embedder};
use crate::error::{Error, Result};
use crate::models::ScoredChunk;
use crate::store::DocumentStore;

pub struct Retriever {
    store: Arc<dyn DocumentStore>,
    embedder: Arc<dyn Embedder>,
    min_score: Option<f32>,
}

impl Retriever {
    pub fn new(store: Arc<dyn DocumentStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            store,
            embedder,
            min_score: None,
        }
    }

    /// Drop results scoring below `min_score` after ranking.
    pub fn with_min_score(mut self, min_score: Option<f32>) -> Self {
        self.min_score = min_score;
        self
    }

    /// The `top_k` stored chunks most similar to `text`, best first.
    ///
    /// Equal scores keep insertion order. Fails with
    /// [`Error::EmptyStore`] before encoding anything when no chunks
    /// exist, and with [`Error::DimensionMismatch`] when the store was
    /// built with a different model.
    pub async fn query(&self, text: &str, top_k: usize) -> Result<Vec<ScoredChunk>> {
        if self.store.chunk_count().await? == 0 {
            return Err(Error::EmptyStore);
        }

        let query_vec = self.embedder.encode(text).await?;
        if let Some(dims) = self.store.dims().await? {
            if dims != query_vec.len() {
                return Err(Error::DimensionMismatch {
                    expected: dims,
                    actual: query_vec.len(),
                });
            }
        }

        let chunks = self.store.all_chunks().await?;
        let mut scored: Vec<ScoredChunk> = chunks
            .into_iter()
            .map(|chunk| ScoredChunk {
                score: cosine_similarity(&query_vec, &chunk.vector),
                chunk,
            })
            .collect();

        // Stable sort: ties stay in scan (insertion) order.
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k.max(1));
        if let Some(min) = self.min_score {
            scored.retain(|s| s.score >= min);
        }

        tracing::debug!(
            results = scored.len(),
            top_score = scored.first().map(|s| s.score),
            "retrieved chunks"
        );
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::store::testing::{chunk, doc};
    use crate::store::InMemoryStore;

    /// One single-chunk document per entry, inserted in order.
    async fn retriever_with(texts: &[(&str, &str)]) -> Retriever {
        let embedder = Arc::new(HashEmbedder::new(256));
        let store = Arc::new(InMemoryStore::new());
        for (doc_id, text) in texts {
            let vector = embedder.vector_for(text).unwrap();
            store
                .insert_chunks(&doc(doc_id), &[chunk(doc_id, 0, text, vector)])
                .await
                .unwrap();
        }
        Retriever::new(store, embedder)
    }

    #[tokio::test]
    async fn empty_store_is_an_error() {
        let retriever = retriever_with(&[]).await;
        assert!(matches!(
            retriever.query("anything", 5).await,
            Err(Error::EmptyStore)
        ));
    }

    #[tokio::test]
    async fn exact_text_ranks_first_with_unit_score() {
        let retriever = retriever_with(&[
            ("a", "the office lease renews in March"),
            ("b", "quarterly revenue grew eleven percent"),
            ("c", "remember to water the plants"),
        ])
        .await;
        let results = retriever
            .query("quarterly revenue grew eleven percent", 5)
            .await
            .unwrap();

        assert_eq!(results[0].chunk.document_id, "b");
        assert!((results[0].score - 1.0).abs() < 1e-5);
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn never_returns_more_than_top_k() {
        let texts: Vec<(String, String)> = (0..12)
            .map(|i| (format!("d{i}"), format!("document number {i} about budgets")))
            .collect();
        let refs: Vec<(&str, &str)> = texts
            .iter()
            .map(|(a, b)| (a.as_str(), b.as_str()))
            .collect();
        let retriever = retriever_with(&refs).await;

        assert_eq!(retriever.query("budgets", 5).await.unwrap().len(), 5);
        assert_eq!(retriever.query("budgets", 50).await.unwrap().len(), 12);
        // Zero is clamped to one result.
        assert_eq!(retriever.query("budgets", 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ties_keep_insertion_order() {
        let retriever = retriever_with(&[
            ("first", "identical text"),
            ("second", "identical text"),
            ("third", "identical text"),
        ])
        .await;
        let ids: Vec<String> = retriever
            .query("identical text", 3)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.chunk.document_id)
            .collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn min_score_drops_weak_matches() {
        let retriever = retriever_with(&[
            ("a", "alpha beta gamma"),
            ("b", "completely unrelated words here"),
        ])
        .await
        .with_min_score(Some(0.5));
        let results = retriever.query("alpha beta gamma", 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.document_id, "a");
    }

    #[tokio::test]
    async fn model_change_is_a_dimension_mismatch() {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_chunks(&doc("a"), &[chunk("a", 0, "text", vec![1.0, 0.0])])
            .await
            .unwrap();
        let retriever = Retriever::new(store, Arc::new(HashEmbedder::new(8)));
        assert!(matches!(
            retriever.query("text", 5).await,
            Err(Error::DimensionMismatch {
                expected: 2,
                actual: 8
            })
        ));
    }
}
