//! Text embedding providers and vector utilities.
//!
//! [`Embedder`] turns text into fixed-dimension vectors. Implementations:
//! - **[`LocalEmbedder`]**: fastembed on the local machine (default
//!   `all-minilm-l6-v2`, 384 dims). The model is downloaded once and
//!   cached; inference runs on a blocking thread.
//! - **[`OpenAIEmbedder`]**: any OpenAI-compatible `/embeddings` endpoint,
//!   with batching, retry and backoff.
//! - **[`HashEmbedder`]**: deterministic hashed bag-of-words vectors. No
//!   model, no network; meant for tests and offline smoke runs.
//!
//! Use [`create_embedder`] to build one from `[embedding]` configuration.
//! The same embedder must encode documents and queries, otherwise cosine
//! scores are meaningless.
//!
//! # Retry Strategy
//!
//! The OpenAI provider retries HTTP 429, 5xx and network errors with
//! exponential backoff (1s, 2s, 4s, ... capped at 32s). Other 4xx
//! responses fail immediately.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

const DEFAULT_LOCAL_MODEL: &str = "all-minilm-l6-v2";
const DEFAULT_HASH_DIMS: usize = 384;
const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier, e.g. `all-minilm-l6-v2`.
    fn model_name(&self) -> &str;

    /// Length of every vector this embedder produces.
    fn dims(&self) -> usize;

    /// Encode a batch of texts, returning vectors in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Encode a single text.
    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::Encoding("embedding response was empty".to_string()))
    }
}

fn reject_blank(texts: &[String]) -> Result<()> {
    if let Some(i) = texts.iter().position(|t| t.trim().is_empty()) {
        return Err(Error::Encoding(format!("input {} is empty", i)));
    }
    Ok(())
}

/// Check that a provider returned one vector of the right length per input.
fn check_vectors(vectors: &[Vec<f32>], expected: usize, dims: usize) -> Result<()> {
    if vectors.len() != expected {
        return Err(Error::Encoding(format!(
            "expected {} vectors, got {}",
            expected,
            vectors.len()
        )));
    }
    if let Some(v) = vectors.iter().find(|v| v.len() != dims) {
        return Err(Error::Encoding(format!(
            "expected {}-dimensional vectors, got {}",
            dims,
            v.len()
        )));
    }
    Ok(())
}

// ============ Hash Embedder ============

/// Deterministic hashed bag-of-words embedder.
///
/// Each lowercase alphanumeric token is hashed into one of `dims` buckets
/// with a hash-derived sign, and the result is L2-normalized. Texts that
/// share words score higher, which is enough to exercise retrieval end to
/// end without a real model.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn vector_for(&self, text: &str) -> Result<Vec<f32>> {
        let mut vec = vec![0.0f32; self.dims];
        let mut tokens = 0usize;
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vec[idx] += sign;
            tokens += 1;
        }
        if tokens == 0 {
            return Err(Error::Encoding("text has no encodable tokens".to_string()));
        }

        let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm < f32::EPSILON {
            // Every token cancelled out; fall back to a fixed direction.
            vec[0] = 1.0;
        } else {
            vec.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(vec)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.vector_for(t)).collect()
    }
}

// ============ OpenAI-compatible Embedder ============

/// Embedder backed by an OpenAI-compatible `/embeddings` endpoint.
///
/// Reads the key from `OPENAI_API_KEY`.
pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    max_retries: u32,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::Config("OPENAI_API_KEY environment variable not set".into()))?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &EmbeddingConfig, api_key: impl Into<String>) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::Config("embedding.model required for openai provider".into()))?;
        let dims = config
            .dims
            .ok_or_else(|| Error::Config("embedding.dims required for openai provider".into()))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string());
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            max_retries: config.max_retries,
            http,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        reject_blank(texts)?;

        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .http
                .post(format!("{}/embeddings", self.url))
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let parsed: EmbeddingResponse =
                            response.json().await.map_err(|e| Error::Schema {
                                service: "embeddings",
                                detail: e.to_string(),
                            })?;
                        let mut data = parsed.data;
                        data.sort_by_key(|d| d.index);
                        let vectors: Vec<Vec<f32>> =
                            data.into_iter().map(|d| d.embedding).collect();
                        check_vectors(&vectors, texts.len(), self.dims)?;
                        return Ok(vectors);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::debug!(%status, attempt, "embedding request failed, retrying");
                        last_err = Some(Error::TransientNetwork(format!(
                            "embeddings API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }
                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        return Err(Error::Config(format!(
                            "embeddings API rejected the API key ({})",
                            status
                        )));
                    }
                    return Err(Error::Encoding(format!(
                        "embeddings API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(Error::TransientNetwork(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::TransientNetwork("embedding failed after retries".into())))
    }
}

// ============ Local Embedder (fastembed) ============

fn resolve_local_model(config: &EmbeddingConfig) -> (String, usize) {
    let model_name = config
        .model
        .clone()
        .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string());

    let dims = config.dims.unwrap_or(match model_name.as_str() {
        "all-minilm-l6-v2" | "bge-small-en-v1.5" | "multilingual-e5-small" => 384,
        "bge-base-en-v1.5" | "nomic-embed-text-v1.5" | "multilingual-e5-base" => 768,
        "bge-large-en-v1.5" | "multilingual-e5-large" => 1024,
        _ => 384,
    });

    (model_name, dims)
}

/// Sentence embedder running locally through fastembed.
///
/// The ONNX model loads on first use and is reused for every later call.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    model: fastembed::EmbeddingModel,
    batch_size: usize,
    engine: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => Err(Error::Config(format!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1.5, multilingual-e5-small, multilingual-e5-base, \
             multilingual-e5-large",
            other
        ))),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model_name, dims) = resolve_local_model(config);
        let model = config_to_fastembed_model(&model_name)?;
        Ok(Self {
            model_name,
            dims,
            model,
            batch_size: config.batch_size,
            engine: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        reject_blank(texts)?;

        let engine = Arc::clone(&self.engine);
        let model = self.model.clone();
        let batch_size = self.batch_size;
        let texts = texts.to_vec();
        let expected = texts.len();

        let vectors = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
            let mut guard = engine
                .lock()
                .map_err(|_| Error::Encoding("local embedding model lock poisoned".into()))?;
            if guard.is_none() {
                tracing::info!(?model, "loading local embedding model");
                let loaded = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(model).with_show_download_progress(false),
                )
                .map_err(|e| {
                    Error::Config(format!("Failed to initialize local embedding model: {}", e))
                })?;
                *guard = Some(loaded);
            }
            match guard.as_mut() {
                Some(engine) => engine
                    .embed(texts, Some(batch_size))
                    .map_err(|e| Error::Encoding(format!("Local embedding failed: {}", e))),
                None => Err(Error::Encoding("local embedding model not loaded".into())),
            }
        })
        .await
        .map_err(|e| Error::Encoding(format!("embedding task failed: {}", e)))??;

        check_vectors(&vectors, expected, self.dims)?;
        Ok(vectors)
    }
}

/// Build the embedder named by `embedding.provider`.
///
/// | Value | Embedder |
/// |-------|----------|
/// | `"local"` | [`LocalEmbedder`] (requires the `local-embeddings-fastembed` feature) |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"hash"` | [`HashEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(
            config.dims.unwrap_or(DEFAULT_HASH_DIMS),
        ))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => {
            let (model, _) = resolve_local_model(config);
            Err(Error::Config(format!(
                "Local embedding model '{}' requires --features local-embeddings-fastembed",
                model
            )))
        }
        other => Err(Error::Config(format!(
            "Unknown embedding provider: {}",
            other
        ))),
    }
}

/// Encode a vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or a
/// zero-norm vector.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn cosine_basics() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let e = HashEmbedder::new(64);
        let a = e.encode("Quarterly revenue grew").await.unwrap();
        let b = e.encode("quarterly REVENUE grew").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn hash_embedder_ranks_shared_words_higher() {
        let e = HashEmbedder::new(384);
        let query = e.encode("refund policy").await.unwrap();
        let related = e.encode("our refund policy allows returns").await.unwrap();
        let unrelated = e.encode("kubernetes cluster upgrade notes").await.unwrap();
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[tokio::test]
    async fn hash_embedder_rejects_text_without_tokens() {
        let e = HashEmbedder::new(16);
        assert!(matches!(e.encode("").await, Err(Error::Encoding(_))));
        assert!(matches!(e.encode(" --- ").await, Err(Error::Encoding(_))));
    }

    #[test]
    fn unknown_provider_is_a_config_error() {
        let config = EmbeddingConfig {
            provider: "word2vec".into(),
            ..Default::default()
        };
        assert!(matches!(create_embedder(&config), Err(Error::Config(_))));
    }

    #[test]
    fn hash_provider_uses_configured_dims() {
        let config = EmbeddingConfig {
            provider: "hash".into(),
            dims: Some(32),
            ..Default::default()
        };
        let e = create_embedder(&config).unwrap();
        assert_eq!(e.dims(), 32);
        assert_eq!(e.model_name(), "hash");
    }

    fn openai_config(url: &str) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "openai".into(),
            model: Some("text-embedding-3-small".into()),
            dims: Some(3),
            url: Some(url.to_string()),
            max_retries: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn openai_embedder_orders_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"index": 1, "embedding": [0.0, 1.0, 0.0]},
                    {"index": 0, "embedding": [1.0, 0.0, 0.0]}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let e = OpenAIEmbedder::with_api_key(&openai_config(&server.uri()), "sk-test").unwrap();
        let vectors = e
            .embed_batch(&["first".to_string(), "second".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]]);
    }

    #[tokio::test]
    async fn openai_embedder_rejects_wrong_dimension() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"index": 0, "embedding": [1.0, 0.0]}]
            })))
            .mount(&server)
            .await;

        let e = OpenAIEmbedder::with_api_key(&openai_config(&server.uri()), "sk-test").unwrap();
        assert!(matches!(e.encode("hello").await, Err(Error::Encoding(_))));
    }

    #[tokio::test]
    async fn openai_embedder_reports_server_errors_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let e = OpenAIEmbedder::with_api_key(&openai_config(&server.uri()), "sk-test").unwrap();
        let err = e.encode("hello").await.unwrap_err();
        assert!(err.is_retryable(), "got {err:?}");
    }
}
