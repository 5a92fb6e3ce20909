//! Record storage for portals, deployment runs and chat sessions.
//!
//! Every state change that other invariants hang on is a single conditional
//! write here: one live run per portal, terminal runs are immutable, and
//! promotion swaps the serving generation in the same write that completes
//! the run.

#[cfg(test)]
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::chat::{ChatMessage, ChatSession, SessionEndReason, SessionUpdate};
use crate::models::deployment::DeploymentRun;
use crate::models::portal::{PortalConfiguration, PortalCounter, PortalStatus};

#[async_trait]
pub trait RecordStore: Send + Sync {
    // ── Portals ────────────────────────────────────────────────────────────

    /// Fails with `StateConflict` when the slug is taken.
    async fn insert_portal(&self, portal: &PortalConfiguration) -> Result<(), AppError>;

    async fn get_portal(&self, id: Uuid) -> Result<Option<PortalConfiguration>, AppError>;

    async fn get_portal_by_slug(&self, slug: &str)
        -> Result<Option<PortalConfiguration>, AppError>;

    async fn list_portals(&self, user_id: Uuid) -> Result<Vec<PortalConfiguration>, AppError>;

    /// Writes the owner-editable fields: name, visibility, sections, theme, features.
    async fn update_portal_settings(&self, portal: &PortalConfiguration) -> Result<(), AppError>;

    /// Moves the portal to `to` if its current status is one of `from`.
    async fn set_portal_status(
        &self,
        id: Uuid,
        from: &[PortalStatus],
        to: PortalStatus,
    ) -> Result<PortalConfiguration, AppError>;

    async fn increment_counter(&self, id: Uuid, counter: PortalCounter) -> Result<(), AppError>;

    // ── Deployment runs ────────────────────────────────────────────────────

    /// Creates the portal's next run and marks it as the in-flight generation.
    /// Fails with `StateConflict` while another run of the portal is live or
    /// when the portal cannot be regenerated.
    async fn create_run_exclusive(&self, portal_id: Uuid) -> Result<DeploymentRun, AppError>;

    async fn get_run(&self, id: Uuid) -> Result<Option<DeploymentRun>, AppError>;

    /// Newest first.
    async fn list_runs(&self, portal_id: Uuid) -> Result<Vec<DeploymentRun>, AppError>;

    /// Persists a non-terminal run. Returns `false` when the stored run has
    /// already reached a terminal phase, e.g. after a cancel.
    async fn save_run_progress(&self, run: &DeploymentRun) -> Result<bool, AppError>;

    /// Persists `run` (already moved to FAILED) if the stored run is still live,
    /// and releases the portal: the in-flight pointer is cleared, and a portal
    /// that was still GENERATING becomes FAILED with the run's error. A portal
    /// serving an older generation keeps serving it. Returns `false` if the
    /// stored run was already terminal or holds a promotion claim.
    async fn fail_run(&self, run: &DeploymentRun) -> Result<bool, AppError>;

    /// Points the portal's serving generation at a live run while the run
    /// stays in TESTING. Until the claim is finished by `promote_run` or undone
    /// by `release_promotion`, `fail_run` refuses the run.
    async fn claim_promotion(&self, run: &DeploymentRun) -> Result<PromotionClaim, AppError>;

    /// Undoes a claim: the portal goes back to `previous_run_id` if it still
    /// points at `run`.
    async fn release_promotion(
        &self,
        run: &DeploymentRun,
        previous_run_id: Option<Uuid>,
    ) -> Result<(), AppError>;

    /// Persists `run` (already moved to COMPLETED) if the stored run is still
    /// live, and in the same write makes it the portal's serving generation.
    /// Returns `false` if the stored run was already terminal.
    async fn promote_run(&self, run: &DeploymentRun) -> Result<bool, AppError>;

    // ── Chat sessions ──────────────────────────────────────────────────────

    async fn insert_session(&self, session: &ChatSession) -> Result<(), AppError>;

    async fn get_session(&self, token: &str) -> Result<Option<ChatSession>, AppError>;

    /// Appends `messages` in order and writes `update`. Fails with
    /// `StateConflict` if the session has ended.
    async fn append_exchange(
        &self,
        token: &str,
        messages: &[ChatMessage],
        update: &SessionUpdate,
    ) -> Result<(), AppError>;

    /// Returns `false` if the session had already ended.
    async fn end_session(&self, token: &str, reason: SessionEndReason) -> Result<bool, AppError>;

    /// Tokens of the portal's sessions that are still active.
    async fn list_active_sessions(&self, portal_id: Uuid) -> Result<Vec<String>, AppError>;

    /// Tokens of active sessions, across all portals, with no activity since
    /// `inactive_since`.
    async fn list_idle_sessions(
        &self,
        inactive_since: DateTime<Utc>,
    ) -> Result<Vec<String>, AppError>;
}

/// Portal status after its in-flight run fails.
/// Result of `RecordStore::claim_promotion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionClaim {
    /// The portal now points at the run; `previous_run_id` was serving before.
    Claimed { previous_run_id: Option<Uuid> },
    /// The stored run had already ended.
    Lost,
}

pub(crate) fn status_after_failure(current: PortalStatus) -> PortalStatus {
    match current {
        PortalStatus::Generating => PortalStatus::Failed,
        other => other,
    }
}

/// Portal status after a run is promoted.
pub(crate) fn status_after_promotion(current: PortalStatus) -> PortalStatus {
    match current {
        PortalStatus::Generating | PortalStatus::Active => PortalStatus::Active,
        other => other,
    }
}
