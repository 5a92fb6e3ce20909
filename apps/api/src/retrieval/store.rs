use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::chunk::{ContentChunk, ContentType, ScoredChunk};

/// Which generations of a portal's chunks a filter covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationScope {
    Only(Uuid),
    Except(Uuid),
}

/// Store-level chunk filter. Every query and delete is scoped to one owner.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFilter {
    pub user_id: Uuid,
    pub portal_id: Option<Uuid>,
    pub generation: Option<GenerationScope>,
    /// Empty matches every content type.
    pub content_types: Vec<ContentType>,
}

impl ChunkFilter {
    pub fn for_user(user_id: Uuid) -> Self {
        Self {
            user_id,
            portal_id: None,
            generation: None,
            content_types: Vec::new(),
        }
    }

    pub fn portal(mut self, portal_id: Uuid) -> Self {
        self.portal_id = Some(portal_id);
        self
    }

    pub fn generation(mut self, scope: GenerationScope) -> Self {
        self.generation = Some(scope);
        self
    }

    pub fn content_types(mut self, types: Vec<ContentType>) -> Self {
        self.content_types = types;
        self
    }

    pub fn matches(&self, chunk: &ContentChunk) -> bool {
        if chunk.user_id != self.user_id {
            return false;
        }
        if let Some(portal_id) = self.portal_id {
            if chunk.portal_id != Some(portal_id) {
                return false;
            }
        }
        match self.generation {
            Some(GenerationScope::Only(id)) if chunk.generation_id != Some(id) => return false,
            Some(GenerationScope::Except(id)) if chunk.generation_id == Some(id) => return false,
            _ => {}
        }
        self.content_types.is_empty() || self.content_types.contains(&chunk.content_type)
    }
}

/// Durable chunk storage with nearest-neighbour search.
///
/// `query` returns at most `k` chunks matching `filter`, ranked by raw cosine
/// similarity (which may be negative); callers normalise and post-filter.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn insert(&self, chunks: &[ContentChunk]) -> Result<(), AppError>;

    async fn query(
        &self,
        embedding: &[f32],
        filter: &ChunkFilter,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, AppError>;

    /// Removes every chunk matching `filter`, returning how many went.
    async fn delete(&self, filter: &ChunkFilter) -> Result<u64, AppError>;
}
