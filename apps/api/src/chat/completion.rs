use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::chat::prompts::assistant_system_prompt;
use crate::errors::AppError;
use crate::llm_client::{strip_json_fences, LlmClient, LlmMessage};
use crate::models::chat::SenderRole;

// ────────────────────────────────────────────────────────────────────────────
// Request / response types
// ────────────────────────────────────────────────────────────────────────────

/// A retrieved chunk as handed to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextBlock {
    pub chunk_id: Uuid,
    pub section: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryTurn {
    pub role: SenderRole,
    pub text: String,
}

/// Everything needed for one grounded answer. `history` ends with the
/// visitor's current question.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Display name of the portal owner.
    pub subject: String,
    pub language: String,
    pub context: Vec<ContextBlock>,
    pub history: Vec<HistoryTurn>,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    /// Chunk ids the model says it relied on. May be empty or contain ids
    /// outside the context; the caller reconciles them.
    pub used_chunk_ids: Vec<Uuid>,
}

// ────────────────────────────────────────────────────────────────────────────
// Trait definition
// ────────────────────────────────────────────────────────────────────────────

/// Generates a reply from retrieved context. One attempt per call; the chat
/// manager owns retries, timeouts and the concurrency cap.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, AppError>;
}

#[derive(Debug, Deserialize)]
struct CompletionJson {
    answer: String,
    #[serde(default)]
    used_chunk_ids: Vec<Uuid>,
}

/// Parses the model's JSON reply. Plain prose is accepted as the answer
/// with no citations.
fn parse_completion(raw: &str) -> Result<Completion, AppError> {
    match serde_json::from_str::<CompletionJson>(strip_json_fences(raw)) {
        Ok(parsed) => Ok(Completion {
            text: parsed.answer,
            used_chunk_ids: parsed.used_chunk_ids,
        }),
        Err(e) => {
            let text = raw.trim();
            if text.is_empty() {
                return Err(AppError::Llm("empty completion".to_string()));
            }
            warn!("Completion was not valid JSON ({e}); using raw text");
            Ok(Completion {
                text: text.to_string(),
                used_chunk_ids: Vec::new(),
            })
        }
    }
}

#[async_trait]
impl CompletionService for LlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, AppError> {
        let system = assistant_system_prompt(&request.subject, &request.language, &request.context);
        let messages: Vec<LlmMessage> = request
            .history
            .iter()
            .map(|turn| match turn.role {
                SenderRole::Assistant => LlmMessage::assistant(turn.text.clone()),
                SenderRole::Visitor | SenderRole::System => LlmMessage::user(turn.text.clone()),
            })
            .collect();

        let raw = self.call_text(&system, &messages).await?;
        parse_completion(&raw)
    }
}
