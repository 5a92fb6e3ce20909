use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;

/// Coarse classification of what a chunk talks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    FreeText,
    Skill,
    Organization,
    Title,
    Achievement,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::FreeText => "free_text",
            ContentType::Skill => "skill",
            ContentType::Organization => "organization",
            ContentType::Title => "title",
            ContentType::Achievement => "achievement",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "free_text" => Ok(ContentType::FreeText),
            "skill" => Ok(ContentType::Skill),
            "organization" => Ok(ContentType::Organization),
            "title" => Ok(ContentType::Title),
            "achievement" => Ok(ContentType::Achievement),
            other => Err(AppError::Internal(anyhow::anyhow!(
                "unknown content type '{other}'"
            ))),
        }
    }
}

/// A bounded span of document text with its embedding.
///
/// Chunks belong to the user. `portal_id` and `generation_id` are metadata used
/// to scope queries, not ownership links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentChunk {
    pub id: Uuid,
    pub user_id: Uuid,
    pub portal_id: Option<Uuid>,
    /// Deployment run that produced this chunk.
    pub generation_id: Option<Uuid>,
    pub section: String,
    /// Position within the whole document, assigned before embedding.
    pub ordinal: u32,
    pub text: String,
    /// SHA-256 of `text`, for diffing regenerations.
    pub content_hash: String,
    #[serde(skip_serializing)]
    pub embedding: Vec<f32>,
    pub importance: f32,
    pub token_count: u32,
    pub content_type: ContentType,
}

/// A chunk returned by retrieval with its similarity in [0, 1].
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: ContentChunk,
    pub similarity: f32,
}
