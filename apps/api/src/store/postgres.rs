use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::chat::{
    ChatMessage, ChatSession, Citation, DeliveryStatus, RateLimitState, SenderRole,
    SessionEndReason, SessionUpdate,
};
use crate::models::deployment::{
    DeploymentPhase, DeploymentRun, OperationLog, ResourceUsage, RunError,
};
use crate::models::portal::{
    PortalConfiguration, PortalCounter, PortalFeatures, PortalStatus, Visibility,
};

use super::{status_after_failure, status_after_promotion, PromotionClaim, RecordStore};

/// Postgres-backed record store. Schema: `migrations/0001_portal_engine.sql`.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Row types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, FromRow)]
struct PortalRow {
    id: Uuid,
    user_id: Uuid,
    document_id: Uuid,
    name: String,
    slug: String,
    status: String,
    visibility: String,
    sections: Vec<String>,
    theme: String,
    features: Json<PortalFeatures>,
    view_count: i64,
    session_count: i64,
    active_run_id: Option<Uuid>,
    current_run_id: Option<Uuid>,
    last_error: Option<Json<RunError>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deployed_at: Option<DateTime<Utc>>,
    expired_at: Option<DateTime<Utc>>,
}

impl TryFrom<PortalRow> for PortalConfiguration {
    type Error = AppError;

    fn try_from(row: PortalRow) -> Result<Self, AppError> {
        Ok(PortalConfiguration {
            id: row.id,
            user_id: row.user_id,
            document_id: row.document_id,
            name: row.name,
            slug: row.slug,
            status: PortalStatus::parse(&row.status)?,
            visibility: Visibility::parse(&row.visibility)?,
            sections: row.sections,
            theme: row.theme,
            features: row.features.0,
            view_count: row.view_count,
            session_count: row.session_count,
            active_run_id: row.active_run_id,
            current_run_id: row.current_run_id,
            last_error: row.last_error.map(|e| e.0),
            created_at: row.created_at,
            updated_at: row.updated_at,
            deployed_at: row.deployed_at,
            expired_at: row.expired_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct RunRow {
    id: Uuid,
    portal_id: Uuid,
    run_number: i32,
    phase: String,
    progress: i16,
    logs: Json<Vec<OperationLog>>,
    retry_count: i32,
    usage: Json<ResourceUsage>,
    error: Option<Json<RunError>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<RunRow> for DeploymentRun {
    type Error = AppError;

    fn try_from(row: RunRow) -> Result<Self, AppError> {
        Ok(DeploymentRun {
            id: row.id,
            portal_id: row.portal_id,
            run_number: row.run_number,
            phase: DeploymentPhase::parse(&row.phase)?,
            progress: row.progress.clamp(0, 100) as u8,
            logs: row.logs.0,
            retry_count: row.retry_count.max(0) as u32,
            usage: row.usage.0,
            error: row.error.map(|e| e.0),
            created_at: row.created_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: Uuid,
    portal_id: Uuid,
    token: String,
    is_active: bool,
    remaining: i32,
    reset_at: DateTime<Utc>,
    language: String,
    last_query: Option<String>,
    referenced_chunk_ids: Vec<Uuid>,
    started_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    end_reason: Option<String>,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: Uuid,
    role: String,
    text: String,
    citations: Json<Vec<Citation>>,
    confidence: Option<f32>,
    delivery: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for ChatMessage {
    type Error = AppError;

    fn try_from(row: MessageRow) -> Result<Self, AppError> {
        let delivery = match row.delivery.as_str() {
            "degraded" => DeliveryStatus::Degraded,
            _ => DeliveryStatus::Delivered,
        };
        Ok(ChatMessage {
            id: row.id,
            role: SenderRole::parse(&row.role)?,
            text: row.text,
            created_at: row.created_at,
            citations: row.citations.0,
            confidence: row.confidence,
            delivery,
        })
    }
}

fn delivery_str(delivery: DeliveryStatus) -> &'static str {
    match delivery {
        DeliveryStatus::Delivered => "delivered",
        DeliveryStatus::Degraded => "degraded",
    }
}

/// Maps a unique-constraint violation to a state conflict.
fn conflict_on_unique(e: sqlx::Error, message: impl FnOnce() -> String) -> AppError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::StateConflict(message())
        }
        _ => AppError::Database(e),
    }
}

async fn lock_portal(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<PortalConfiguration, AppError> {
    let row = sqlx::query_as::<_, PortalRow>("SELECT * FROM portals WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("portal {id} not found")))?;
    PortalConfiguration::try_from(row)
}

/// Writes every mutable run column, but only while the stored run is live.
async fn write_live_run(
    tx: &mut Transaction<'_, Postgres>,
    run: &DeploymentRun,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        r#"
        UPDATE deployment_runs
        SET phase = $2, progress = $3, logs = $4, retry_count = $5, usage = $6,
            error = $7, updated_at = $8, finished_at = $9
        WHERE id = $1 AND phase NOT IN ('completed', 'failed')
        "#,
    )
    .bind(run.id)
    .bind(run.phase.as_str())
    .bind(run.progress as i16)
    .bind(Json(&run.logs))
    .bind(run.retry_count as i32)
    .bind(Json(&run.usage))
    .bind(run.error.as_ref().map(Json))
    .bind(run.updated_at)
    .bind(run.finished_at)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() == 1)
}

// ────────────────────────────────────────────────────────────────────────────
// RecordStore implementation
// ────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn insert_portal(&self, portal: &PortalConfiguration) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO portals
                (id, user_id, document_id, name, slug, status, visibility, sections, theme,
                 features, view_count, session_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(portal.id)
        .bind(portal.user_id)
        .bind(portal.document_id)
        .bind(&portal.name)
        .bind(&portal.slug)
        .bind(portal.status.as_str())
        .bind(portal.visibility.as_str())
        .bind(&portal.sections)
        .bind(&portal.theme)
        .bind(Json(&portal.features))
        .bind(portal.view_count)
        .bind(portal.session_count)
        .bind(portal.created_at)
        .bind(portal.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, || format!("slug '{}' is already taken", portal.slug)))?;
        Ok(())
    }

    async fn get_portal(&self, id: Uuid) -> Result<Option<PortalConfiguration>, AppError> {
        sqlx::query_as::<_, PortalRow>("SELECT * FROM portals WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(PortalConfiguration::try_from)
            .transpose()
    }

    async fn get_portal_by_slug(
        &self,
        slug: &str,
    ) -> Result<Option<PortalConfiguration>, AppError> {
        sqlx::query_as::<_, PortalRow>("SELECT * FROM portals WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?
            .map(PortalConfiguration::try_from)
            .transpose()
    }

    async fn list_portals(&self, user_id: Uuid) -> Result<Vec<PortalConfiguration>, AppError> {
        sqlx::query_as::<_, PortalRow>(
            "SELECT * FROM portals WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(PortalConfiguration::try_from)
        .collect()
    }

    async fn update_portal_settings(&self, portal: &PortalConfiguration) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE portals
            SET name = $2, visibility = $3, sections = $4, theme = $5, features = $6,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(portal.id)
        .bind(&portal.name)
        .bind(portal.visibility.as_str())
        .bind(&portal.sections)
        .bind(&portal.theme)
        .bind(Json(&portal.features))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("portal {} not found", portal.id)));
        }
        Ok(())
    }

    async fn set_portal_status(
        &self,
        id: Uuid,
        from: &[PortalStatus],
        to: PortalStatus,
    ) -> Result<PortalConfiguration, AppError> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let row = sqlx::query_as::<_, PortalRow>(
            r#"
            UPDATE portals
            SET status = $3,
                updated_at = NOW(),
                expired_at = CASE WHEN $3 = 'expired' THEN NOW() ELSE expired_at END
            WHERE id = $1 AND status = ANY($2)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&from)
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => PortalConfiguration::try_from(row),
            None => match self.get_portal(id).await? {
                Some(current) => Err(AppError::StateConflict(format!(
                    "portal is {}, cannot move to {}",
                    current.status.as_str(),
                    to.as_str()
                ))),
                None => Err(AppError::NotFound(format!("portal {id} not found"))),
            },
        }
    }

    async fn increment_counter(&self, id: Uuid, counter: PortalCounter) -> Result<(), AppError> {
        let sql = match counter {
            PortalCounter::Views => "UPDATE portals SET view_count = view_count + 1 WHERE id = $1",
            PortalCounter::Sessions => {
                "UPDATE portals SET session_count = session_count + 1 WHERE id = $1"
            }
        };
        sqlx::query(sql).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn create_run_exclusive(&self, portal_id: Uuid) -> Result<DeploymentRun, AppError> {
        let mut tx = self.pool.begin().await?;
        let portal = lock_portal(&mut tx, portal_id).await?;
        let next_status = portal.status.on_generation_start()?;

        let live: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM deployment_runs
            WHERE portal_id = $1 AND phase NOT IN ('completed', 'failed')
            "#,
        )
        .bind(portal_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(live) = live {
            return Err(AppError::StateConflict(format!(
                "portal {portal_id} already has deployment {live} in progress"
            )));
        }

        let last: Option<i32> =
            sqlx::query_scalar("SELECT MAX(run_number) FROM deployment_runs WHERE portal_id = $1")
                .bind(portal_id)
                .fetch_one(&mut *tx)
                .await?;
        let run = DeploymentRun::new(portal_id, last.unwrap_or(0) + 1);

        sqlx::query(
            r#"
            INSERT INTO deployment_runs
                (id, portal_id, run_number, phase, progress, logs, retry_count, usage,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(run.id)
        .bind(run.portal_id)
        .bind(run.run_number)
        .bind(run.phase.as_str())
        .bind(run.progress as i16)
        .bind(Json(&run.logs))
        .bind(run.retry_count as i32)
        .bind(Json(&run.usage))
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || format!("portal {portal_id} already has a deployment in progress"))
        })?;

        sqlx::query(
            "UPDATE portals SET status = $2, active_run_id = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(portal_id)
        .bind(next_status.as_str())
        .bind(run.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<DeploymentRun>, AppError> {
        sqlx::query_as::<_, RunRow>("SELECT * FROM deployment_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(DeploymentRun::try_from)
            .transpose()
    }

    async fn list_runs(&self, portal_id: Uuid) -> Result<Vec<DeploymentRun>, AppError> {
        sqlx::query_as::<_, RunRow>(
            "SELECT * FROM deployment_runs WHERE portal_id = $1 ORDER BY run_number DESC",
        )
        .bind(portal_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(DeploymentRun::try_from)
        .collect()
    }

    async fn save_run_progress(&self, run: &DeploymentRun) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;
        let written = write_live_run(&mut tx, run).await?;
        tx.commit().await?;
        Ok(written)
    }

    async fn fail_run(&self, run: &DeploymentRun) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;
        let portal = lock_portal(&mut tx, run.portal_id).await?;
        if portal.current_run_id == Some(run.id) || !write_live_run(&mut tx, run).await? {
            return Ok(false);
        }

        if portal.active_run_id == Some(run.id) {
            sqlx::query(
                r#"
                UPDATE portals
                SET active_run_id = NULL, status = $2, last_error = $3, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(portal.id)
            .bind(status_after_failure(portal.status).as_str())
            .bind(run.error.as_ref().map(Json))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn claim_promotion(&self, run: &DeploymentRun) -> Result<PromotionClaim, AppError> {
        let mut tx = self.pool.begin().await?;
        let portal = lock_portal(&mut tx, run.portal_id).await?;
        let live: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM deployment_runs
            WHERE id = $1 AND phase NOT IN ('completed', 'failed')
            FOR UPDATE
            "#,
        )
        .bind(run.id)
        .fetch_optional(&mut *tx)
        .await?;
        if live.is_none() {
            return Ok(PromotionClaim::Lost);
        }

        sqlx::query("UPDATE portals SET current_run_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(portal.id)
            .bind(run.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(PromotionClaim::Claimed {
            previous_run_id: portal.current_run_id,
        })
    }

    async fn release_promotion(
        &self,
        run: &DeploymentRun,
        previous_run_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE portals
            SET current_run_id = $3, updated_at = NOW()
            WHERE id = $1 AND current_run_id = $2
            "#,
        )
        .bind(run.portal_id)
        .bind(run.id)
        .bind(previous_run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn promote_run(&self, run: &DeploymentRun) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;
        let portal = lock_portal(&mut tx, run.portal_id).await?;
        if !write_live_run(&mut tx, run).await? {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE portals
            SET current_run_id = $2,
                active_run_id = CASE WHEN active_run_id = $2 THEN NULL ELSE active_run_id END,
                status = $3,
                deployed_at = NOW(),
                last_error = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(portal.id)
        .bind(run.id)
        .bind(status_after_promotion(portal.status).as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn insert_session(&self, session: &ChatSession) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO chat_sessions
                (id, portal_id, token, is_active, remaining, reset_at, language,
                 referenced_chunk_ids, message_count, started_at, last_activity_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9, $10)
            "#,
        )
        .bind(session.id)
        .bind(session.portal_id)
        .bind(&session.token)
        .bind(session.is_active)
        .bind(session.rate_limit.remaining as i32)
        .bind(session.rate_limit.reset_at)
        .bind(&session.language)
        .bind(&session.referenced_chunk_ids)
        .bind(session.started_at)
        .bind(session.last_activity_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, token: &str) -> Result<Option<ChatSession>, AppError> {
        let Some(row) =
            sqlx::query_as::<_, SessionRow>("SELECT * FROM chat_sessions WHERE token = $1")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?
        else {
            return Ok(None);
        };

        let messages = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, role, text, citations, confidence, delivery, created_at
            FROM chat_messages WHERE session_id = $1 ORDER BY seq
            "#,
        )
        .bind(row.id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ChatMessage::try_from)
        .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(ChatSession {
            id: row.id,
            portal_id: row.portal_id,
            token: row.token,
            messages,
            is_active: row.is_active,
            rate_limit: RateLimitState {
                remaining: row.remaining.max(0) as u32,
                reset_at: row.reset_at,
            },
            language: row.language,
            last_query: row.last_query,
            referenced_chunk_ids: row.referenced_chunk_ids,
            started_at: row.started_at,
            last_activity_at: row.last_activity_at,
            ended_at: row.ended_at,
            end_reason: row.end_reason.as_deref().map(SessionEndReason::parse).transpose()?,
        }))
    }

    async fn append_exchange(
        &self,
        token: &str,
        messages: &[ChatMessage],
        update: &SessionUpdate,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        let session: Option<(Uuid, bool, i32)> = sqlx::query_as(
            "SELECT id, is_active, message_count FROM chat_sessions WHERE token = $1 FOR UPDATE",
        )
        .bind(token)
        .fetch_optional(&mut *tx)
        .await?;
        let (session_id, is_active, mut seq) =
            session.ok_or_else(|| AppError::NotFound("chat session not found".to_string()))?;
        if !is_active {
            return Err(AppError::StateConflict("chat session has ended".to_string()));
        }

        for message in messages {
            sqlx::query(
                r#"
                INSERT INTO chat_messages
                    (id, session_id, seq, role, text, citations, confidence, delivery, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(message.id)
            .bind(session_id)
            .bind(seq)
            .bind(message.role.as_str())
            .bind(&message.text)
            .bind(Json(&message.citations))
            .bind(message.confidence)
            .bind(delivery_str(message.delivery))
            .bind(message.created_at)
            .execute(&mut *tx)
            .await?;
            seq += 1;
        }

        sqlx::query(
            r#"
            UPDATE chat_sessions
            SET message_count = $2, remaining = $3, reset_at = $4, last_query = $5,
                referenced_chunk_ids = $6, last_activity_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(session_id)
        .bind(seq)
        .bind(update.rate_limit.remaining as i32)
        .bind(update.rate_limit.reset_at)
        .bind(&update.last_query)
        .bind(&update.referenced_chunk_ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn end_session(&self, token: &str, reason: SessionEndReason) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE chat_sessions
            SET is_active = FALSE, ended_at = GREATEST(NOW(), started_at), end_reason = $2
            WHERE token = $1 AND is_active
            "#,
        )
        .bind(token)
        .bind(reason.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM chat_sessions WHERE token = $1")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(AppError::NotFound("chat session not found".to_string())),
        }
    }

    async fn list_active_sessions(&self, portal_id: Uuid) -> Result<Vec<String>, AppError> {
        let tokens = sqlx::query_scalar(
            "SELECT token FROM chat_sessions WHERE portal_id = $1 AND is_active",
        )
        .bind(portal_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tokens)
    }

    async fn list_idle_sessions(
        &self,
        inactive_since: DateTime<Utc>,
    ) -> Result<Vec<String>, AppError> {
        let tokens = sqlx::query_scalar(
            "SELECT token FROM chat_sessions WHERE is_active AND last_activity_at < $1",
        )
        .bind(inactive_since)
        .fetch_all(&self.pool)
        .await?;
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_row(phase: &str, progress: i16, retry_count: i32) -> RunRow {
        let now = Utc::now();
        RunRow {
            id: Uuid::new_v4(),
            portal_id: Uuid::new_v4(),
            run_number: 1,
            phase: phase.into(),
            progress,
            logs: Json(Vec::new()),
            retry_count,
            usage: Json(ResourceUsage::default()),
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    fn message_row(role: &str, delivery: &str) -> MessageRow {
        MessageRow {
            id: Uuid::new_v4(),
            role: role.into(),
            text: "hello".into(),
            citations: Json(Vec::new()),
            confidence: Some(0.4),
            delivery: delivery.into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_run_row_clamps_counters() {
        let run = DeploymentRun::try_from(run_row("building", 180, -2)).unwrap();
        assert_eq!(run.phase, DeploymentPhase::Building);
        assert_eq!(run.progress, 100);
        assert_eq!(run.retry_count, 0);
    }

    #[test]
    fn test_run_row_rejects_unknown_phase() {
        assert!(DeploymentRun::try_from(run_row("rolling_back", 0, 0)).is_err());
    }

    #[test]
    fn test_phase_strings_match_live_run_predicate() {
        // `write_live_run` and the partial unique index filter on these literals.
        assert_eq!(DeploymentPhase::Completed.as_str(), "completed");
        assert_eq!(DeploymentPhase::Failed.as_str(), "failed");
    }

    #[test]
    fn test_message_row_delivery() {
        let degraded = ChatMessage::try_from(message_row("assistant", "degraded")).unwrap();
        assert_eq!(degraded.delivery, DeliveryStatus::Degraded);
        assert_eq!(delivery_str(degraded.delivery), "degraded");

        let delivered = ChatMessage::try_from(message_row("visitor", "delivered")).unwrap();
        assert_eq!(delivered.delivery, DeliveryStatus::Delivered);
        assert_eq!(delivered.role, SenderRole::Visitor);
    }

    #[test]
    fn test_non_unique_errors_stay_database_errors() {
        let err = conflict_on_unique(sqlx::Error::RowNotFound, || "slug taken".into());
        assert!(matches!(err, AppError::Database(_)));
    }
}
