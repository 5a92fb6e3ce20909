use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::EmbeddingSettings;
use crate::errors::AppError;

// ────────────────────────────────────────────────────────────────────────────
// Trait definition
// ────────────────────────────────────────────────────────────────────────────

/// Turns text into a fixed-length vector. Shared by the embedding pipeline and
/// per-message query embedding, so both sides always use the same model.
///
/// Implementations make a single attempt; callers own retries and timeouts.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError>;
}

/// Picks the remote provider when one is configured, otherwise the local hasher.
pub fn embedder_from_settings(
    settings: &EmbeddingSettings,
) -> anyhow::Result<Arc<dyn Embedder>> {
    match &settings.api_url {
        Some(url) => Ok(Arc::new(OpenAiEmbedder::new(
            url.clone(),
            settings.api_key.clone(),
            settings.model.clone(),
            settings.dims,
        )?)),
        None => Ok(Arc::new(HashingEmbedder::new(settings.dims))),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// OpenAiEmbedder: any OpenAI-compatible /v1/embeddings endpoint
// ────────────────────────────────────────────────────────────────────────────

pub struct OpenAiEmbedder {
    client: Client,
    url: String,
    api_key: Option<String>,
    model: String,
    dims: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        model: String,
        dims: usize,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            client,
            url: format!("{}/v1/embeddings", base_url.trim_end_matches('/')),
            api_key,
            model,
            dims,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let body = json!({
            "model": self.model,
            "input": text,
            "dimensions": self.dims,
        });
        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::transient("embedding", e.to_string()))?;
        let status = response.status();

        // Rate limited or server error: the caller's retry policy takes over.
        if status.as_u16() == 429 || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            warn!("Embedding API returned {status}: {body}");
            return Err(AppError::transient("embedding", format!("status {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Internal(anyhow::anyhow!(
                "embedding API error {status}: {body}"
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| AppError::transient("embedding", e.to_string()))?;
        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("embedding response had no data")))?;

        if vector.len() != self.dims {
            return Err(AppError::Internal(anyhow::anyhow!(
                "embedding model returned {} dims, expected {}",
                vector.len(),
                self.dims
            )));
        }
        debug!("Embedded {} chars with {}", text.len(), self.model);
        Ok(vector)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// HashingEmbedder: deterministic local fallback
// ────────────────────────────────────────────────────────────────────────────

/// Feature-hashing bag-of-words embedder.
///
/// Each non-stopword token lands in one of `dims` buckets chosen by its
/// SHA-256 digest, with a digest-derived sign, and the result is L2-normalised.
/// Texts sharing vocabulary land close together; unrelated texts land near
/// orthogonal. No network, no model weights.
pub struct HashingEmbedder {
    dims: usize,
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "did", "do", "does", "for", "from",
    "has", "have", "he", "her", "his", "how", "i", "in", "is", "it", "its", "me", "my", "of",
    "on", "or", "our", "she", "so", "that", "the", "their", "them", "they", "this", "to", "was",
    "we", "were", "what", "when", "where", "which", "who", "why", "will", "with", "you", "your",
];

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in tokens(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '+' || c == '#'))
        .map(|t| t.to_lowercase())
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(&t.as_str()))
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        "hashing-v1"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        Ok(self.embed_sync(text))
    }
}
