//! In-memory [`VectorStore`] for tests. Brute-force cosine over every chunk.

use std::sync::RwLock;

use async_trait::async_trait;

use crate::errors::AppError;
use crate::models::chunk::{ContentChunk, ScoredChunk};

use super::store::{ChunkFilter, VectorStore};
use super::{cosine_similarity, rank};

pub struct InMemoryVectorStore {
    chunks: RwLock<Vec<ContentChunk>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(Vec::new()),
        }
    }

    pub fn all(&self) -> Vec<ContentChunk> {
        self.chunks.read().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> AppError {
    AppError::Internal(anyhow::anyhow!("vector store lock poisoned"))
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn insert(&self, chunks: &[ContentChunk]) -> Result<(), AppError> {
        let mut stored = self.chunks.write().map_err(|_| poisoned())?;
        stored.extend(chunks.iter().cloned());
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        filter: &ChunkFilter,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, AppError> {
        let stored = self.chunks.read().map_err(|_| poisoned())?;
        let mut results: Vec<ScoredChunk> = stored
            .iter()
            .filter(|c| filter.matches(c))
            .map(|c| ScoredChunk {
                similarity: cosine_similarity(embedding, &c.embedding),
                chunk: c.clone(),
            })
            .collect();
        rank(&mut results);
        results.truncate(k);
        Ok(results)
    }

    async fn delete(&self, filter: &ChunkFilter) -> Result<u64, AppError> {
        let mut stored = self.chunks.write().map_err(|_| poisoned())?;
        let before = stored.len();
        stored.retain(|c| !filter.matches(c));
        Ok((before - stored.len()) as u64)
    }
}
