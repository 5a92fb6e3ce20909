use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    Visitor,
    Assistant,
    System,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderRole::Visitor => "visitor",
            SenderRole::Assistant => "assistant",
            SenderRole::System => "system",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "visitor" => Ok(SenderRole::Visitor),
            "assistant" => Ok(SenderRole::Assistant),
            "system" => Ok(SenderRole::System),
            other => Err(AppError::Internal(anyhow::anyhow!("unknown sender role '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    /// Answered from a fallback because a dependency failed.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: Uuid,
    pub section: String,
    pub similarity: f32,
}

/// Immutable once persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: SenderRole,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub citations: Vec<Citation>,
    pub confidence: Option<f32>,
    pub delivery: DeliveryStatus,
}

impl ChatMessage {
    pub fn visitor(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: SenderRole::Visitor,
            text: text.into(),
            created_at: Utc::now(),
            citations: Vec::new(),
            confidence: None,
            delivery: DeliveryStatus::Delivered,
        }
    }

    pub fn assistant(
        text: impl Into<String>,
        citations: Vec<Citation>,
        confidence: Option<f32>,
        delivery: DeliveryStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: SenderRole::Assistant,
            text: text.into(),
            created_at: Utc::now(),
            citations,
            confidence,
            delivery,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    Closed,
    Inactivity,
    PortalSuspended,
}

impl SessionEndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEndReason::Closed => "closed",
            SessionEndReason::Inactivity => "inactivity",
            SessionEndReason::PortalSuspended => "portal_suspended",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "closed" => Ok(SessionEndReason::Closed),
            "inactivity" => Ok(SessionEndReason::Inactivity),
            "portal_suspended" => Ok(SessionEndReason::PortalSuspended),
            other => Err(AppError::Internal(anyhow::anyhow!("unknown end reason '{other}'"))),
        }
    }
}

/// One visitor conversation against a deployed portal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub portal_id: Uuid,
    /// Anonymous bearer token handed to the visitor.
    pub token: String,
    pub messages: Vec<ChatMessage>,
    pub is_active: bool,
    pub rate_limit: RateLimitState,
    pub language: String,
    pub last_query: Option<String>,
    pub referenced_chunk_ids: Vec<Uuid>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<SessionEndReason>,
}

impl ChatSession {
    pub fn open(portal_id: Uuid, language: String, rate_limit: RateLimitState) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            portal_id,
            token: new_session_token(),
            messages: Vec::new(),
            is_active: true,
            rate_limit,
            language,
            last_query: None,
            referenced_chunk_ids: Vec::new(),
            started_at: now,
            last_activity_at: now,
            ended_at: None,
            end_reason: None,
        }
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn end(&mut self, reason: SessionEndReason) {
        let now = Utc::now().max(self.started_at);
        self.is_active = false;
        self.ended_at = Some(now);
        self.end_reason = Some(reason);
    }
}

/// Session fields written alongside a visitor/assistant exchange.
#[derive(Debug, Clone)]
pub struct SessionUpdate {
    pub rate_limit: RateLimitState,
    pub last_query: String,
    pub referenced_chunk_ids: Vec<Uuid>,
}

fn new_session_token() -> String {
    format!("cs_{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}
