use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cancel::CancelFlag;
use crate::config::EngineConfig;
use crate::embedding::chunker::chunk_text;
use crate::embedding::classify::{classify, importance};
use crate::embedding::embedder::Embedder;
use crate::errors::AppError;
use crate::models::chunk::ContentChunk;
use crate::models::document::StructuredDocument;
use crate::retry::{with_timeout, RetryPolicy};

/// A chunk that could not be embedded and was left out of the result.
#[derive(Debug, Clone, Serialize)]
pub struct CoverageWarning {
    pub section: String,
    pub ordinal: u32,
    pub message: String,
}

#[derive(Debug)]
pub struct PipelineOutput {
    pub chunks: Vec<ContentChunk>,
    pub warnings: Vec<CoverageWarning>,
    /// Embedding attempts made, retries included.
    pub embedding_calls: u32,
}

impl PipelineOutput {
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Turns structured document sections into embedded, classified chunks.
///
/// Chunk boundaries and ordinals depend only on the document and the chunking
/// settings; ordinals are assigned before any embedding call so concurrency
/// and dropped chunks never shift them.
#[derive(Clone)]
pub struct EmbeddingPipeline {
    embedder: Arc<dyn Embedder>,
    chunk_token_budget: u32,
    chunk_token_overlap: u32,
    concurrency: usize,
    retry: RetryPolicy,
    embed_timeout: Duration,
}

impl EmbeddingPipeline {
    pub fn new(embedder: Arc<dyn Embedder>, engine: &EngineConfig) -> Self {
        Self {
            embedder,
            chunk_token_budget: engine.chunk_token_budget,
            chunk_token_overlap: engine.chunk_token_overlap,
            concurrency: engine.embedding_concurrency.max(1),
            retry: RetryPolicy::new(
                engine.embedding_max_attempts,
                engine.backoff_base,
                engine.backoff_max,
            ),
            embed_timeout: engine.embed_timeout,
        }
    }

    /// Splits the document into unembedded chunks with final ordinals.
    /// Blank sections are skipped.
    pub fn plan(&self, user_id: Uuid, document: &StructuredDocument) -> Vec<ContentChunk> {
        let mut planned = Vec::new();
        let mut ordinal = 0u32;
        for section in &document.sections {
            if section.is_blank() {
                continue;
            }
            let body = section.body();
            for piece in chunk_text(&body, self.chunk_token_budget, self.chunk_token_overlap) {
                planned.push(ContentChunk {
                    id: Uuid::new_v4(),
                    user_id,
                    portal_id: None,
                    generation_id: None,
                    section: section.label.clone(),
                    ordinal,
                    content_hash: format!("{:x}", Sha256::digest(piece.text.as_bytes())),
                    importance: importance(&section.label, &piece.text),
                    content_type: classify(&section.label, &piece.text),
                    token_count: piece.token_count,
                    text: piece.text,
                    embedding: Vec::new(),
                });
                ordinal += 1;
            }
        }
        planned
    }

    pub async fn generate_embeddings(
        &self,
        user_id: Uuid,
        document: &StructuredDocument,
    ) -> Result<PipelineOutput, AppError> {
        self.generate_embeddings_with(user_id, document, None).await
    }

    /// Like `generate_embeddings`, but checks `cancel` before every attempt.
    pub async fn generate_embeddings_with(
        &self,
        user_id: Uuid,
        document: &StructuredDocument,
        cancel: Option<&CancelFlag>,
    ) -> Result<PipelineOutput, AppError> {
        let planned = self.plan(user_id, document);
        let calls = AtomicU32::new(0);

        let embedder: &dyn Embedder = self.embedder.as_ref();
        let retry = &self.retry;
        let timeout = self.embed_timeout;
        let calls_ref = &calls;

        // `buffered` keeps output in input order.
        let embedded: Vec<(ContentChunk, Result<Vec<f32>, AppError>)> = stream::iter(planned)
            .map(|chunk| async move {
                let input = embedding_input(&chunk);
                let result = retry
                    .run("embed chunk", cancel, |_| {
                        calls_ref.fetch_add(1, Ordering::Relaxed);
                        with_timeout("embedding", timeout, embedder.embed(&input))
                    })
                    .await;
                (chunk, result)
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut chunks = Vec::with_capacity(embedded.len());
        let mut warnings = Vec::new();
        for (mut chunk, result) in embedded {
            match result {
                Ok(vector) => {
                    chunk.embedding = vector;
                    chunks.push(chunk);
                }
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    warn!(
                        "Dropping chunk {} of section '{}': {e}",
                        chunk.ordinal, chunk.section
                    );
                    warnings.push(CoverageWarning {
                        section: chunk.section,
                        ordinal: chunk.ordinal,
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Embedding pipeline produced {} chunks ({} dropped) with {}",
            chunks.len(),
            warnings.len(),
            self.embedder.model_name()
        );

        Ok(PipelineOutput {
            chunks,
            warnings,
            embedding_calls: calls.load(Ordering::Relaxed),
        })
    }
}

/// The section label travels with the text so short list sections still carry
/// their topic ("Skills: Python, Go").
fn embedding_input(chunk: &ContentChunk) -> String {
    format!("{}: {}", chunk.section, chunk.text)
}
