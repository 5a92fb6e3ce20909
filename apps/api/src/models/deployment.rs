use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;

/// Deployment run phases, in execution order. `Failed` is reachable from every
/// non-terminal phase; everything else only advances to the next phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentPhase {
    Initializing,
    ProcessingDocument,
    GeneratingEmbeddings,
    PreparingContent,
    UploadingAssets,
    Building,
    Deploying,
    Testing,
    Completed,
    Failed,
}

impl DeploymentPhase {
    /// The working phases, in order.
    pub const PIPELINE: [DeploymentPhase; 8] = [
        DeploymentPhase::Initializing,
        DeploymentPhase::ProcessingDocument,
        DeploymentPhase::GeneratingEmbeddings,
        DeploymentPhase::PreparingContent,
        DeploymentPhase::UploadingAssets,
        DeploymentPhase::Building,
        DeploymentPhase::Deploying,
        DeploymentPhase::Testing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentPhase::Initializing => "initializing",
            DeploymentPhase::ProcessingDocument => "processing_document",
            DeploymentPhase::GeneratingEmbeddings => "generating_embeddings",
            DeploymentPhase::PreparingContent => "preparing_content",
            DeploymentPhase::UploadingAssets => "uploading_assets",
            DeploymentPhase::Building => "building",
            DeploymentPhase::Deploying => "deploying",
            DeploymentPhase::Testing => "testing",
            DeploymentPhase::Completed => "completed",
            DeploymentPhase::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        DeploymentPhase::PIPELINE
            .iter()
            .chain([DeploymentPhase::Completed, DeploymentPhase::Failed].iter())
            .find(|p| p.as_str() == s)
            .copied()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("unknown deployment phase '{s}'")))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentPhase::Completed | DeploymentPhase::Failed)
    }

    fn ordinal(&self) -> usize {
        match self {
            DeploymentPhase::Completed => DeploymentPhase::PIPELINE.len(),
            DeploymentPhase::Failed => usize::MAX,
            other => DeploymentPhase::PIPELINE
                .iter()
                .position(|p| p == other)
                .unwrap_or(0),
        }
    }

    pub fn next(&self) -> Option<DeploymentPhase> {
        match self {
            DeploymentPhase::Testing => Some(DeploymentPhase::Completed),
            DeploymentPhase::Completed | DeploymentPhase::Failed => None,
            other => DeploymentPhase::PIPELINE.get(other.ordinal() + 1).copied(),
        }
    }

    pub fn can_transition_to(&self, next: DeploymentPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == DeploymentPhase::Failed || self.next() == Some(next)
    }

    /// Progress reported when a run enters this phase.
    pub fn progress_on_entry(&self) -> u8 {
        match self {
            DeploymentPhase::Completed => 100,
            DeploymentPhase::Failed => 0,
            other => ((other.ordinal() * 100) / (DeploymentPhase::PIPELINE.len() + 1)) as u8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Succeeded,
    Retrying,
    Warning,
    Failed,
}

/// One entry of a run's operation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLog {
    pub name: String,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub embedding_calls: u32,
    pub chunks_generated: u32,
    pub chunks_dropped: u32,
    pub assets_uploaded: u32,
    pub bytes_uploaded: u64,
}

/// Terminal error record of a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub code: String,
    pub message: String,
    pub phase: DeploymentPhase,
    pub retryable: bool,
    pub remediation: String,
}

impl RunError {
    pub fn from_app_error(phase: DeploymentPhase, error: &AppError) -> Self {
        let code = match (error, phase) {
            (AppError::TransientDependency { message, .. }, _) if message.starts_with("timed out") => {
                "PHASE_TIMEOUT"
            }
            _ => error.code(),
        };
        Self {
            code: code.to_string(),
            message: error.to_string(),
            phase,
            retryable: error.is_retryable(),
            remediation: remediation_for(error, phase).to_string(),
        }
    }

    pub fn cancelled(phase: DeploymentPhase) -> Self {
        Self {
            code: "CANCELLED".to_string(),
            message: "Deployment cancelled by request".to_string(),
            phase,
            retryable: false,
            remediation: "Start a new deployment when you are ready.".to_string(),
        }
    }
}

fn remediation_for(error: &AppError, phase: DeploymentPhase) -> &'static str {
    match error {
        AppError::Validation(_) if phase == DeploymentPhase::ProcessingDocument => {
            "Your résumé produced no usable content. Re-upload the document or enable more sections."
        }
        AppError::Validation(_) => "Fix the portal settings and start a new deployment.",
        AppError::NotFound(_) => "The source document is missing. Re-upload it and try again.",
        AppError::CapabilityDenied { .. } => "Upgrade your plan to publish a portal.",
        AppError::TransientDependency { .. } if phase == DeploymentPhase::Testing => {
            "The new site did not pass its health check. The previous version is still live; retry shortly."
        }
        AppError::TransientDependency { .. } => {
            "A service we depend on was unavailable. Retrying the deployment usually resolves this."
        }
        AppError::Cancelled => "Start a new deployment when you are ready.",
        _ => "An unexpected error occurred. Retry, and contact support if it persists.",
    }
}

/// One attempt to (re)generate a portal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRun {
    pub id: Uuid,
    pub portal_id: Uuid,
    pub run_number: i32,
    pub phase: DeploymentPhase,
    pub progress: u8,
    pub logs: Vec<OperationLog>,
    pub retry_count: u32,
    pub usage: ResourceUsage,
    pub error: Option<RunError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DeploymentRun {
    pub fn new(portal_id: Uuid, run_number: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            portal_id,
            run_number,
            phase: DeploymentPhase::Initializing,
            progress: 0,
            logs: Vec::new(),
            retry_count: 0,
            usage: ResourceUsage::default(),
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Moves to `next`, enforcing the phase graph and monotonic progress.
    pub fn advance_to(&mut self, next: DeploymentPhase) -> Result<(), AppError> {
        if self.phase == next && !next.is_terminal() {
            return Ok(());
        }
        if !self.phase.can_transition_to(next) {
            return Err(AppError::StateConflict(format!(
                "run {} cannot move from {} to {}",
                self.id,
                self.phase.as_str(),
                next.as_str()
            )));
        }
        self.phase = next;
        self.progress = self.progress.max(next.progress_on_entry());
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.finished_at = Some(self.updated_at);
        }
        Ok(())
    }

    pub fn fail(&mut self, error: RunError) -> Result<(), AppError> {
        self.advance_to(DeploymentPhase::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    /// Opens a log entry and returns its index.
    pub fn begin_op(&mut self, name: impl Into<String>) -> usize {
        self.logs.push(OperationLog {
            name: name.into(),
            status: OperationStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            message: None,
        });
        self.logs.len() - 1
    }

    pub fn end_op(&mut self, index: usize, status: OperationStatus, message: Option<String>) {
        if let Some(entry) = self.logs.get_mut(index) {
            entry.status = status;
            entry.ended_at = Some(Utc::now());
            entry.message = message;
        }
        self.updated_at = Utc::now();
    }

    /// Records an instantaneous entry such as a coverage warning.
    pub fn note(&mut self, name: impl Into<String>, status: OperationStatus, message: String) {
        let index = self.begin_op(name);
        self.end_op(index, status, Some(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_advance_in_order_to_completion() {
        let mut run = DeploymentRun::new(Uuid::new_v4(), 1);
        let mut last_progress = run.progress;
        for phase in DeploymentPhase::PIPELINE.iter().skip(1) {
            run.advance_to(*phase).unwrap();
            assert!(run.progress >= last_progress);
            last_progress = run.progress;
        }
        run.advance_to(DeploymentPhase::Completed).unwrap();
        assert_eq!(run.progress, 100);
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_skipping_a_phase_is_rejected() {
        let mut run = DeploymentRun::new(Uuid::new_v4(), 1);
        let err = run.advance_to(DeploymentPhase::Building).unwrap_err();
        assert!(matches!(err, AppError::StateConflict(_)));
        assert_eq!(run.phase, DeploymentPhase::Initializing);
    }

    #[test]
    fn test_failed_reachable_from_every_working_phase() {
        for phase in DeploymentPhase::PIPELINE {
            assert!(phase.can_transition_to(DeploymentPhase::Failed));
        }
        assert!(!DeploymentPhase::Completed.can_transition_to(DeploymentPhase::Failed));
        assert!(!DeploymentPhase::Failed.can_transition_to(DeploymentPhase::Initializing));
    }

    #[test]
    fn test_terminal_runs_are_immutable() {
        let mut run = DeploymentRun::new(Uuid::new_v4(), 1);
        run.fail(RunError::cancelled(DeploymentPhase::Initializing))
            .unwrap();
        assert!(run.fail(RunError::cancelled(DeploymentPhase::Initializing)).is_err());
        assert!(run.advance_to(DeploymentPhase::ProcessingDocument).is_err());
    }

    #[test]
    fn test_failure_keeps_progress() {
        let mut run = DeploymentRun::new(Uuid::new_v4(), 1);
        run.advance_to(DeploymentPhase::ProcessingDocument).unwrap();
        run.advance_to(DeploymentPhase::GeneratingEmbeddings).unwrap();
        let before = run.progress;
        run.fail(RunError::cancelled(DeploymentPhase::GeneratingEmbeddings))
            .unwrap();
        assert_eq!(run.progress, before);
    }

    #[test]
    fn test_phase_storage_form_round_trips() {
        for phase in DeploymentPhase::PIPELINE
            .into_iter()
            .chain([DeploymentPhase::Completed, DeploymentPhase::Failed])
        {
            assert_eq!(DeploymentPhase::parse(phase.as_str()).unwrap(), phase);
        }
    }

    #[test]
    fn test_timeouts_get_their_own_code() {
        let err = AppError::timeout("phase", std::time::Duration::from_secs(3));
        let record = RunError::from_app_error(DeploymentPhase::Building, &err);
        assert_eq!(record.code, "PHASE_TIMEOUT");
        assert!(record.retryable);

        let record =
            RunError::from_app_error(DeploymentPhase::Testing, &AppError::transient("health", "502"));
        assert_eq!(record.code, "DEPENDENCY_UNAVAILABLE");
        assert!(record.remediation.contains("previous version"));
    }
}
