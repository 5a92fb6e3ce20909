//! In-memory [`RecordStore`] for tests.
//!
//! Portals and runs share one mutex so run exclusivity is checked and claimed
//! atomically. Sessions live in a `DashMap`, so chat traffic on different
//! sessions never contends on the portal lock.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::chat::{ChatMessage, ChatSession, SessionEndReason, SessionUpdate};
use crate::models::deployment::DeploymentRun;
use crate::models::portal::{PortalConfiguration, PortalCounter, PortalStatus};

use super::{status_after_failure, status_after_promotion, PromotionClaim, RecordStore};

#[derive(Default)]
struct Records {
    portals: HashMap<Uuid, PortalConfiguration>,
    runs: HashMap<Uuid, DeploymentRun>,
}

#[derive(Default)]
pub struct InMemoryRecordStore {
    records: Mutex<Records>,
    sessions: DashMap<String, ChatSession>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Records>, AppError> {
        self.records
            .lock()
            .map_err(|_| AppError::Internal(anyhow::anyhow!("record store lock poisoned")))
    }

    /// Live runs of a portal; used by tests to check exclusivity.
    pub fn live_run_count(&self, portal_id: Uuid) -> usize {
        self.records
            .lock()
            .map(|r| {
                r.runs
                    .values()
                    .filter(|run| run.portal_id == portal_id && !run.phase.is_terminal())
                    .count()
            })
            .unwrap_or(0)
    }
}

fn portal_not_found(id: Uuid) -> AppError {
    AppError::NotFound(format!("portal {id} not found"))
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert_portal(&self, portal: &PortalConfiguration) -> Result<(), AppError> {
        let mut records = self.lock()?;
        if records.portals.values().any(|p| p.slug == portal.slug) {
            return Err(AppError::StateConflict(format!(
                "slug '{}' is already taken",
                portal.slug
            )));
        }
        records.portals.insert(portal.id, portal.clone());
        Ok(())
    }

    async fn get_portal(&self, id: Uuid) -> Result<Option<PortalConfiguration>, AppError> {
        Ok(self.lock()?.portals.get(&id).cloned())
    }

    async fn get_portal_by_slug(
        &self,
        slug: &str,
    ) -> Result<Option<PortalConfiguration>, AppError> {
        Ok(self
            .lock()?
            .portals
            .values()
            .find(|p| p.slug == slug)
            .cloned())
    }

    async fn list_portals(&self, user_id: Uuid) -> Result<Vec<PortalConfiguration>, AppError> {
        let mut portals: Vec<_> = self
            .lock()?
            .portals
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        portals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(portals)
    }

    async fn update_portal_settings(&self, portal: &PortalConfiguration) -> Result<(), AppError> {
        let mut records = self.lock()?;
        let stored = records
            .portals
            .get_mut(&portal.id)
            .ok_or_else(|| portal_not_found(portal.id))?;
        stored.name = portal.name.clone();
        stored.visibility = portal.visibility;
        stored.sections = portal.sections.clone();
        stored.theme = portal.theme.clone();
        stored.features = portal.features.clone();
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn set_portal_status(
        &self,
        id: Uuid,
        from: &[PortalStatus],
        to: PortalStatus,
    ) -> Result<PortalConfiguration, AppError> {
        let mut records = self.lock()?;
        let portal = records.portals.get_mut(&id).ok_or_else(|| portal_not_found(id))?;
        if !from.contains(&portal.status) {
            return Err(AppError::StateConflict(format!(
                "portal is {}, cannot move to {}",
                portal.status.as_str(),
                to.as_str()
            )));
        }
        portal.status = to;
        portal.updated_at = Utc::now();
        if to == PortalStatus::Expired {
            portal.expired_at = Some(portal.updated_at);
        }
        Ok(portal.clone())
    }

    async fn increment_counter(&self, id: Uuid, counter: PortalCounter) -> Result<(), AppError> {
        let mut records = self.lock()?;
        let portal = records.portals.get_mut(&id).ok_or_else(|| portal_not_found(id))?;
        match counter {
            PortalCounter::Views => portal.view_count += 1,
            PortalCounter::Sessions => portal.session_count += 1,
        }
        Ok(())
    }

    async fn create_run_exclusive(&self, portal_id: Uuid) -> Result<DeploymentRun, AppError> {
        let mut records = self.lock()?;
        let portal = records
            .portals
            .get(&portal_id)
            .ok_or_else(|| portal_not_found(portal_id))?;
        let next_status = portal.status.on_generation_start()?;

        let mut run_number = 0;
        for run in records.runs.values().filter(|r| r.portal_id == portal_id) {
            if !run.phase.is_terminal() {
                return Err(AppError::StateConflict(format!(
                    "portal {portal_id} already has deployment {} in progress",
                    run.id
                )));
            }
            run_number = run_number.max(run.run_number);
        }

        let run = DeploymentRun::new(portal_id, run_number + 1);
        records.runs.insert(run.id, run.clone());
        if let Some(portal) = records.portals.get_mut(&portal_id) {
            portal.status = next_status;
            portal.active_run_id = Some(run.id);
            portal.updated_at = Utc::now();
        }
        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<DeploymentRun>, AppError> {
        Ok(self.lock()?.runs.get(&id).cloned())
    }

    async fn list_runs(&self, portal_id: Uuid) -> Result<Vec<DeploymentRun>, AppError> {
        let mut runs: Vec<_> = self
            .lock()?
            .runs
            .values()
            .filter(|r| r.portal_id == portal_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.run_number.cmp(&a.run_number));
        Ok(runs)
    }

    async fn save_run_progress(&self, run: &DeploymentRun) -> Result<bool, AppError> {
        let mut records = self.lock()?;
        match records.runs.get_mut(&run.id) {
            Some(stored) if !stored.phase.is_terminal() => {
                *stored = run.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(AppError::NotFound(format!("run {} not found", run.id))),
        }
    }

    async fn fail_run(&self, run: &DeploymentRun) -> Result<bool, AppError> {
        let mut records = self.lock()?;
        let claimed = records
            .portals
            .get(&run.portal_id)
            .is_some_and(|p| p.current_run_id == Some(run.id));
        match records.runs.get_mut(&run.id) {
            Some(stored) if !stored.phase.is_terminal() && !claimed => *stored = run.clone(),
            Some(_) => return Ok(false),
            None => return Err(AppError::NotFound(format!("run {} not found", run.id))),
        }
        if let Some(portal) = records.portals.get_mut(&run.portal_id) {
            if portal.active_run_id == Some(run.id) {
                portal.active_run_id = None;
                portal.status = status_after_failure(portal.status);
                portal.last_error = run.error.clone();
                portal.updated_at = Utc::now();
            }
        }
        Ok(true)
    }

    async fn claim_promotion(&self, run: &DeploymentRun) -> Result<PromotionClaim, AppError> {
        let mut records = self.lock()?;
        match records.runs.get(&run.id) {
            Some(stored) if !stored.phase.is_terminal() => {}
            Some(_) => return Ok(PromotionClaim::Lost),
            None => return Err(AppError::NotFound(format!("run {} not found", run.id))),
        }
        let portal = records
            .portals
            .get_mut(&run.portal_id)
            .ok_or_else(|| portal_not_found(run.portal_id))?;
        let previous_run_id = portal.current_run_id;
        portal.current_run_id = Some(run.id);
        portal.updated_at = Utc::now();
        Ok(PromotionClaim::Claimed { previous_run_id })
    }

    async fn release_promotion(
        &self,
        run: &DeploymentRun,
        previous_run_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        let mut records = self.lock()?;
        if let Some(portal) = records.portals.get_mut(&run.portal_id) {
            if portal.current_run_id == Some(run.id) {
                portal.current_run_id = previous_run_id;
                portal.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn promote_run(&self, run: &DeploymentRun) -> Result<bool, AppError> {
        let mut records = self.lock()?;
        match records.runs.get_mut(&run.id) {
            Some(stored) if !stored.phase.is_terminal() => *stored = run.clone(),
            Some(_) => return Ok(false),
            None => return Err(AppError::NotFound(format!("run {} not found", run.id))),
        }
        let portal = records
            .portals
            .get_mut(&run.portal_id)
            .ok_or_else(|| portal_not_found(run.portal_id))?;
        let now = Utc::now();
        portal.current_run_id = Some(run.id);
        if portal.active_run_id == Some(run.id) {
            portal.active_run_id = None;
        }
        portal.status = status_after_promotion(portal.status);
        portal.deployed_at = Some(now);
        portal.last_error = None;
        portal.updated_at = now;
        Ok(true)
    }

    async fn insert_session(&self, session: &ChatSession) -> Result<(), AppError> {
        self.sessions.insert(session.token.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, token: &str) -> Result<Option<ChatSession>, AppError> {
        Ok(self.sessions.get(token).map(|s| s.clone()))
    }

    async fn append_exchange(
        &self,
        token: &str,
        messages: &[ChatMessage],
        update: &SessionUpdate,
    ) -> Result<(), AppError> {
        let mut session = self
            .sessions
            .get_mut(token)
            .ok_or_else(|| AppError::NotFound("chat session not found".to_string()))?;
        if !session.is_active {
            return Err(AppError::StateConflict("chat session has ended".to_string()));
        }
        session.messages.extend(messages.iter().cloned());
        session.rate_limit = update.rate_limit;
        session.last_query = Some(update.last_query.clone());
        session.referenced_chunk_ids = update.referenced_chunk_ids.clone();
        session.last_activity_at = Utc::now();
        Ok(())
    }

    async fn end_session(&self, token: &str, reason: SessionEndReason) -> Result<bool, AppError> {
        let mut session = self
            .sessions
            .get_mut(token)
            .ok_or_else(|| AppError::NotFound("chat session not found".to_string()))?;
        if !session.is_active {
            return Ok(false);
        }
        session.end(reason);
        Ok(true)
    }

    async fn list_active_sessions(&self, portal_id: Uuid) -> Result<Vec<String>, AppError> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| s.portal_id == portal_id && s.is_active)
            .map(|s| s.token.clone())
            .collect())
    }

    async fn list_idle_sessions(
        &self,
        inactive_since: DateTime<Utc>,
    ) -> Result<Vec<String>, AppError> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| s.is_active && s.last_activity_at < inactive_since)
            .map(|s| s.token.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::deployment::{DeploymentPhase, RunError};

    async fn seeded(status: PortalStatus) -> (InMemoryRecordStore, PortalConfiguration) {
        let store = InMemoryRecordStore::new();
        let mut portal = PortalConfiguration::new_draft(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "Jane Doe".into(),
            format!("jane-{}", &Uuid::new_v4().simple().to_string()[..6]),
        );
        portal.status = status;
        store.insert_portal(&portal).await.unwrap();
        (store, portal)
    }

    #[tokio::test]
    async fn test_second_live_run_is_rejected() {
        let (store, portal) = seeded(PortalStatus::Draft).await;
        let first = store.create_run_exclusive(portal.id).await.unwrap();
        assert_eq!(first.run_number, 1);
        let err = store.create_run_exclusive(portal.id).await.unwrap_err();
        assert!(matches!(err, AppError::StateConflict(_)));

        let stored = store.get_portal(portal.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PortalStatus::Generating);
        assert_eq!(stored.active_run_id, Some(first.id));
    }

    #[tokio::test]
    async fn test_failed_first_run_fails_portal() {
        let (store, portal) = seeded(PortalStatus::Draft).await;
        let mut run = store.create_run_exclusive(portal.id).await.unwrap();
        run.fail(RunError::cancelled(DeploymentPhase::Initializing))
            .unwrap();
        assert!(store.fail_run(&run).await.unwrap());
        assert!(!store.fail_run(&run).await.unwrap());

        let stored = store.get_portal(portal.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PortalStatus::Failed);
        assert!(stored.last_error.is_some());
        assert!(stored.active_run_id.is_none());
        assert!(stored.invariants_hold());

        // A new run can start once the previous one is terminal.
        let next = store.create_run_exclusive(portal.id).await.unwrap();
        assert_eq!(next.run_number, 2);
    }

    #[tokio::test]
    async fn test_promotion_after_cancel_is_refused() {
        let (store, portal) = seeded(PortalStatus::Draft).await;
        let run = store.create_run_exclusive(portal.id).await.unwrap();

        let mut cancelled = run.clone();
        cancelled
            .fail(RunError::cancelled(DeploymentPhase::Testing))
            .unwrap();
        store.fail_run(&cancelled).await.unwrap();

        let mut completed = run;
        for phase in DeploymentPhase::PIPELINE.iter().skip(1) {
            completed.advance_to(*phase).unwrap();
        }
        completed.advance_to(DeploymentPhase::Completed).unwrap();
        assert!(!store.promote_run(&completed).await.unwrap());
        let stored = store.get_portal(portal.id).await.unwrap().unwrap();
        assert!(stored.current_run_id.is_none());
    }

    #[tokio::test]
    async fn test_promotion_claim_blocks_failure_until_released() {
        let (store, portal) = seeded(PortalStatus::Draft).await;
        let run = store.create_run_exclusive(portal.id).await.unwrap();

        let claim = store.claim_promotion(&run).await.unwrap();
        assert_eq!(claim, PromotionClaim::Claimed { previous_run_id: None });
        let stored = store.get_portal(portal.id).await.unwrap().unwrap();
        assert_eq!(stored.current_run_id, Some(run.id));

        let mut cancelled = run.clone();
        cancelled
            .fail(RunError::cancelled(DeploymentPhase::Testing))
            .unwrap();
        assert!(!store.fail_run(&cancelled).await.unwrap());

        store.release_promotion(&run, None).await.unwrap();
        let stored = store.get_portal(portal.id).await.unwrap().unwrap();
        assert!(stored.current_run_id.is_none());
        assert!(store.fail_run(&cancelled).await.unwrap());

        // An ended run cannot be claimed.
        assert_eq!(store.claim_promotion(&run).await.unwrap(), PromotionClaim::Lost);
    }

    #[tokio::test]
    async fn test_release_leaves_a_newer_pointer_alone() {
        let (store, portal) = seeded(PortalStatus::Draft).await;
        let run = store.create_run_exclusive(portal.id).await.unwrap();
        store.claim_promotion(&run).await.unwrap();

        let mut other = run.clone();
        other.id = Uuid::new_v4();
        store.release_promotion(&other, None).await.unwrap();

        let stored = store.get_portal(portal.id).await.unwrap().unwrap();
        assert_eq!(stored.current_run_id, Some(run.id));
    }

    #[tokio::test]
    async fn test_suspended_portal_cannot_start_run() {
        let (store, portal) = seeded(PortalStatus::Suspended).await;
        assert!(matches!(
            store.create_run_exclusive(portal.id).await,
            Err(AppError::StateConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_slug_conflicts() {
        let (store, portal) = seeded(PortalStatus::Draft).await;
        let twin = PortalConfiguration::new_draft(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "Other".into(),
            portal.slug.clone(),
        );
        assert!(matches!(
            store.insert_portal(&twin).await,
            Err(AppError::StateConflict(_))
        ));
    }
}
