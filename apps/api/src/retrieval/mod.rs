//! Vector retrieval engine.
//!
//! Scoped nearest-neighbour search over a user's chunks. Results carry a
//! similarity in [0, 1], are ordered by similarity, then importance, then
//! ordinal, and never include anything below the grounding floor. An empty
//! result means "insufficient grounding", not an error.

#[cfg(test)]
pub mod memory;
pub mod postgres;
pub mod store;

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::AppError;
use crate::models::chunk::{ContentType, ScoredChunk};

pub use store::{ChunkFilter, GenerationScope, VectorStore};

/// Cosine similarity in [-1, 1]. Empty or mismatched vectors score 0.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
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

/// Deterministic result order: similarity desc, importance desc, ordinal asc.
pub fn rank(results: &mut [ScoredChunk]) {
    results.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b.chunk
                    .importance
                    .partial_cmp(&a.chunk.importance)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.chunk.ordinal.cmp(&b.chunk.ordinal))
    });
}

/// Query-time filters on top of the mandatory owner scope.
#[derive(Debug, Clone, Default)]
pub struct RetrievalFilters {
    pub portal_id: Option<Uuid>,
    /// Restrict to the chunks of one deployment run.
    pub generation_id: Option<Uuid>,
    pub content_types: Vec<ContentType>,
    pub min_importance: Option<f32>,
}

#[derive(Clone)]
pub struct RetrievalEngine {
    store: Arc<dyn VectorStore>,
    overfetch: usize,
    grounding_floor: f32,
}

impl RetrievalEngine {
    pub fn new(store: Arc<dyn VectorStore>, engine: &EngineConfig) -> Self {
        Self {
            store,
            overfetch: engine.retrieval_overfetch.max(1),
            grounding_floor: engine.grounding_floor,
        }
    }

    /// Top `top_k` chunks of `user_id` nearest to `query_embedding`.
    ///
    /// Over-fetches `overfetch × top_k` candidates so the importance
    /// post-filter does not silently under-fill the result.
    pub async fn query(
        &self,
        user_id: Uuid,
        query_embedding: &[f32],
        filters: &RetrievalFilters,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, AppError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let mut scope = ChunkFilter::for_user(user_id).content_types(filters.content_types.clone());
        if let Some(portal_id) = filters.portal_id {
            scope = scope.portal(portal_id);
        }
        if let Some(generation_id) = filters.generation_id {
            scope = scope.generation(GenerationScope::Only(generation_id));
        }

        let fetched = self
            .store
            .query(query_embedding, &scope, top_k.saturating_mul(self.overfetch))
            .await?;
        let candidates = fetched.len();

        let min_importance = filters.min_importance.unwrap_or(0.0);
        let mut results: Vec<ScoredChunk> = fetched
            .into_iter()
            .filter(|r| r.chunk.importance >= min_importance)
            .map(|mut r| {
                r.similarity = r.similarity.clamp(0.0, 1.0);
                r
            })
            .filter(|r| r.similarity >= self.grounding_floor)
            .collect();
        rank(&mut results);
        results.truncate(top_k);

        debug!(
            "Retrieval for user {user_id}: {candidates} candidates, {} above floor {}",
            results.len(),
            self.grounding_floor
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::memory::InMemoryVectorStore;
    use super::*;
    use crate::embedding::{EmbeddingPipeline, HashingEmbedder};
    use crate::models::chunk::ContentChunk;
    use crate::testing::{chunk_with, resume_document};

    fn engine_with(floor: f32) -> EngineConfig {
        EngineConfig {
            grounding_floor: floor,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[tokio::test]
    async fn test_top_k_bound_and_non_increasing_scores() {
        let user = Uuid::new_v4();
        let store = Arc::new(InMemoryVectorStore::new());
        let chunks: Vec<ContentChunk> = (0..20)
            .map(|i| chunk_with(user, i, vec![1.0, i as f32 * 0.1, 0.0], 0.5))
            .collect();
        store.insert(&chunks).await.unwrap();

        let engine = RetrievalEngine::new(store, &engine_with(0.0));
        let results = engine
            .query(user, &[1.0, 0.0, 0.0], &RetrievalFilters::default(), 5)
            .await
            .unwrap();
        assert_eq!(results.len(), 5);
        for pair in results.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
        assert!(results
            .iter()
            .all(|r| (0.0..=1.0).contains(&r.similarity)));
    }

    #[tokio::test]
    async fn test_ties_break_by_importance_then_ordinal() {
        let user = Uuid::new_v4();
        let store = Arc::new(InMemoryVectorStore::new());
        store
            .insert(&[
                chunk_with(user, 3, vec![1.0, 0.0], 0.4),
                chunk_with(user, 1, vec![1.0, 0.0], 0.4),
                chunk_with(user, 2, vec![1.0, 0.0], 0.9),
            ])
            .await
            .unwrap();

        let engine = RetrievalEngine::new(store, &engine_with(0.0));
        let results = engine
            .query(user, &[1.0, 0.0], &RetrievalFilters::default(), 3)
            .await
            .unwrap();
        let ordinals: Vec<u32> = results.iter().map(|r| r.chunk.ordinal).collect();
        assert_eq!(ordinals, vec![2, 1, 3]);
    }

    #[tokio::test]
    async fn test_overfetch_fills_result_after_importance_filter() {
        let user = Uuid::new_v4();
        let store = Arc::new(InMemoryVectorStore::new());
        // The two nearest chunks are unimportant; the next two qualify.
        store
            .insert(&[
                chunk_with(user, 0, vec![1.0, 0.0], 0.1),
                chunk_with(user, 1, vec![1.0, 0.05], 0.1),
                chunk_with(user, 2, vec![1.0, 0.2], 0.8),
                chunk_with(user, 3, vec![1.0, 0.3], 0.8),
            ])
            .await
            .unwrap();

        let engine = RetrievalEngine::new(store, &engine_with(0.0));
        let filters = RetrievalFilters {
            min_importance: Some(0.5),
            ..RetrievalFilters::default()
        };
        let results = engine.query(user, &[1.0, 0.0], &filters, 2).await.unwrap();
        let ordinals: Vec<u32> = results.iter().map(|r| r.chunk.ordinal).collect();
        assert_eq!(ordinals, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_results_are_scoped_to_owner() {
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let store = Arc::new(InMemoryVectorStore::new());
        store
            .insert(&[
                chunk_with(owner, 0, vec![0.0, 1.0], 0.5),
                chunk_with(stranger, 0, vec![1.0, 0.0], 0.5),
            ])
            .await
            .unwrap();

        let engine = RetrievalEngine::new(store, &engine_with(0.0));
        let results = engine
            .query(owner, &[1.0, 0.0], &RetrievalFilters::default(), 5)
            .await
            .unwrap();
        assert!(results.iter().all(|r| r.chunk.user_id == owner));
    }

    #[tokio::test]
    async fn test_nothing_above_floor_is_empty_not_error() {
        let user = Uuid::new_v4();
        let store = Arc::new(InMemoryVectorStore::new());
        store
            .insert(&[chunk_with(user, 0, vec![0.0, 1.0], 0.5)])
            .await
            .unwrap();

        let engine = RetrievalEngine::new(store, &engine_with(0.3));
        let results = engine
            .query(user, &[1.0, 0.0], &RetrievalFilters::default(), 5)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_languages_question_finds_skills_chunk() {
        let user = Uuid::new_v4();
        let config = engine_with(0.1);
        let embedder = Arc::new(HashingEmbedder::new(256));
        let pipeline = EmbeddingPipeline::new(embedder.clone(), &config);
        let output = pipeline
            .generate_embeddings(user, &resume_document())
            .await
            .unwrap();

        let store = Arc::new(InMemoryVectorStore::new());
        store.insert(&output.chunks).await.unwrap();
        let engine = RetrievalEngine::new(store, &config);

        let query = embedder.embed_sync("What languages does this candidate know?");
        let results = engine
            .query(user, &query, &RetrievalFilters::default(), 5)
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].chunk.section, "Skills");
        assert!(results[0].similarity > config.grounding_floor);
    }
}
