use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::deployment::RunError;

/// Portal lifecycle status.
///
/// ```text
/// DRAFT ──► GENERATING ──► ACTIVE ◄──► SUSPENDED
///   ▲            │           │ (regeneration keeps ACTIVE)
///   │            ▼           ▼
///   └──────── FAILED     any ──► EXPIRED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortalStatus {
    Draft,
    Generating,
    Active,
    Failed,
    Suspended,
    Expired,
}

impl PortalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortalStatus::Draft => "draft",
            PortalStatus::Generating => "generating",
            PortalStatus::Active => "active",
            PortalStatus::Failed => "failed",
            PortalStatus::Suspended => "suspended",
            PortalStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "draft" => Ok(PortalStatus::Draft),
            "generating" => Ok(PortalStatus::Generating),
            "active" => Ok(PortalStatus::Active),
            "failed" => Ok(PortalStatus::Failed),
            "suspended" => Ok(PortalStatus::Suspended),
            "expired" => Ok(PortalStatus::Expired),
            other => Err(AppError::Internal(anyhow::anyhow!(
                "unknown portal status '{other}'"
            ))),
        }
    }

    pub fn can_transition_to(&self, next: PortalStatus) -> bool {
        use PortalStatus::*;
        matches!(
            (self, next),
            (Draft, Generating)
                | (Failed, Generating)
                | (Generating, Active)
                | (Generating, Failed)
                | (Active, Active)
                | (Active, Suspended)
                | (Suspended, Active)
                | (Draft | Generating | Active | Failed | Suspended, Expired)
        )
    }

    /// Status a portal takes when a new generation starts.
    /// A serving portal keeps serving while the new generation is built.
    pub fn on_generation_start(&self) -> Result<PortalStatus, AppError> {
        match self {
            PortalStatus::Draft | PortalStatus::Failed | PortalStatus::Generating => {
                Ok(PortalStatus::Generating)
            }
            PortalStatus::Active => Ok(PortalStatus::Active),
            PortalStatus::Suspended | PortalStatus::Expired => Err(AppError::StateConflict(
                format!("portal is {} and cannot be regenerated", self.as_str()),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Unlisted,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Unlisted => "unlisted",
            Visibility::Private => "private",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "public" => Ok(Visibility::Public),
            "unlisted" => Ok(Visibility::Unlisted),
            "private" => Ok(Visibility::Private),
            other => Err(AppError::Validation(format!("unknown visibility '{other}'"))),
        }
    }

    /// Whether anonymous visitors may load the portal and chat with it.
    pub fn is_visitor_facing(&self) -> bool {
        !matches!(self, Visibility::Private)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalFeatures {
    pub chat_enabled: bool,
    pub show_contact: bool,
    pub resume_download: bool,
}

impl Default for PortalFeatures {
    fn default() -> Self {
        Self {
            chat_enabled: true,
            show_contact: true,
            resume_download: false,
        }
    }
}

/// One generated micro-site.
///
/// `active_run_id` points at the in-flight generation, `current_run_id` at the
/// generation being served. Only a successful TESTING phase moves
/// `current_run_id`, so the serving generation is never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfiguration {
    pub id: Uuid,
    pub user_id: Uuid,
    pub document_id: Uuid,
    pub name: String,
    pub slug: String,
    pub status: PortalStatus,
    pub visibility: Visibility,
    /// Enabled document sections, matched case-insensitively. Empty enables all.
    pub sections: Vec<String>,
    pub theme: String,
    pub features: PortalFeatures,
    pub view_count: i64,
    pub session_count: i64,
    pub active_run_id: Option<Uuid>,
    pub current_run_id: Option<Uuid>,
    pub last_error: Option<RunError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deployed_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl PortalConfiguration {
    pub fn new_draft(user_id: Uuid, document_id: Uuid, name: String, slug: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            document_id,
            name,
            slug,
            status: PortalStatus::Draft,
            visibility: Visibility::Public,
            sections: Vec::new(),
            theme: "classic".to_string(),
            features: PortalFeatures::default(),
            view_count: 0,
            session_count: 0,
            active_run_id: None,
            current_run_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            deployed_at: None,
            expired_at: None,
        }
    }

    pub fn section_enabled(&self, label: &str) -> bool {
        self.sections.is_empty() || self.sections.iter().any(|s| s.eq_ignore_ascii_case(label))
    }

    /// ACTIVE implies a deploy timestamp and a served generation;
    /// FAILED implies an error record.
    pub fn invariants_hold(&self) -> bool {
        let active_ok = self.status != PortalStatus::Active
            || (self.deployed_at.is_some() && self.current_run_id.is_some() && !self.slug.is_empty());
        let failed_ok = self.status != PortalStatus::Failed || self.last_error.is_some();
        active_ok && failed_ok
    }
}

/// Counters bumped by visitor traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalCounter {
    Views,
    Sessions,
}

const SLUG_MIN: usize = 3;
const SLUG_MAX: usize = 63;

/// Slugs are lowercase ASCII letters, digits and single inner hyphens.
pub fn validate_slug(slug: &str) -> Result<(), AppError> {
    if slug.len() < SLUG_MIN || slug.len() > SLUG_MAX {
        return Err(AppError::Validation(format!(
            "slug must be {SLUG_MIN}-{SLUG_MAX} characters"
        )));
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(AppError::Validation(
            "slug may only contain lowercase letters, digits and hyphens".to_string(),
        ));
    }
    if slug.starts_with('-') || slug.ends_with('-') || slug.contains("--") {
        return Err(AppError::Validation(
            "slug may not start or end with a hyphen or contain consecutive hyphens".to_string(),
        ));
    }
    Ok(())
}
