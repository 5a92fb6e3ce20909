//! Deployment Orchestrator: drives one portal generation through its phases.
//!
//! Flow: INITIALIZING → PROCESSING_DOCUMENT → GENERATING_EMBEDDINGS →
//!       PREPARING_CONTENT → UPLOADING_ASSETS → BUILDING → DEPLOYING →
//!       TESTING → COMPLETED, with FAILED reachable from every working phase.
//!
//! Each phase runs under its own budget. Retryable errors re-enter the same
//! phase with backoff; anything else fails the run. The serving generation
//! (`current_run_id`) only moves after TESTING passes, so a failed or
//! cancelled run never disturbs what visitors see.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cancel::CancelFlag;
use crate::collaborators::analytics::{
    DEPLOYMENT_COMPLETED, DEPLOYMENT_FAILED, DEPLOYMENT_STARTED,
};
use crate::collaborators::{
    require_capability, AnalyticsSink, DocumentSource, EntitlementChecker, PORTAL_CAPABILITY,
};
use crate::config::{ConcurrentStartPolicy, EngineConfig};
use crate::deployment::publish::{PublishTarget, RunTarget, SiteAsset};
use crate::deployment::site::{health_marker, render_site};
use crate::embedding::EmbeddingPipeline;
use crate::errors::AppError;
use crate::models::deployment::{DeploymentPhase, DeploymentRun, OperationStatus, RunError};
use crate::models::document::StructuredDocument;
use crate::models::portal::{validate_slug, PortalConfiguration};
use crate::retrieval::{ChunkFilter, GenerationScope, VectorStore};
use crate::retry::RetryPolicy;
use crate::store::{PromotionClaim, RecordStore};

/// Collaborators the orchestrator drives.
pub struct DeployerDeps {
    pub records: Arc<dyn RecordStore>,
    pub documents: Arc<dyn DocumentSource>,
    pub entitlements: Arc<dyn EntitlementChecker>,
    pub pipeline: EmbeddingPipeline,
    pub vectors: Arc<dyn VectorStore>,
    pub publish: Arc<dyn PublishTarget>,
    pub analytics: Arc<dyn AnalyticsSink>,
}

struct DeployerInner {
    deps: DeployerDeps,
    config: EngineConfig,
    retry: RetryPolicy,
    /// Cancellation flags of runs executing in this process.
    cancels: DashMap<Uuid, CancelFlag>,
}

#[derive(Clone)]
pub struct Deployer {
    inner: Arc<DeployerInner>,
}

/// Data handed from one phase to the next.
#[derive(Default)]
struct RunContext {
    portal: Option<PortalConfiguration>,
    document: Option<StructuredDocument>,
    chunk_count: usize,
    assets: Vec<SiteAsset>,
    preview_url: Option<String>,
}

impl RunContext {
    fn portal(&self) -> Result<&PortalConfiguration, AppError> {
        self.portal
            .as_ref()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("portal not loaded")))
    }

    fn target(&self, run_id: Uuid) -> Result<RunTarget, AppError> {
        let portal = self.portal()?;
        Ok(RunTarget {
            portal_id: portal.id,
            run_id,
            slug: portal.slug.clone(),
        })
    }
}

enum PhaseOutcome {
    Advanced,
    /// The run was cancelled or otherwise finished by someone else.
    Stopped,
    Failed,
}

impl Deployer {
    pub fn new(deps: DeployerDeps, config: EngineConfig) -> Self {
        let retry = RetryPolicy::new(
            config.deploy_max_attempts,
            config.backoff_base,
            config.backoff_max,
        );
        Self {
            inner: Arc::new(DeployerInner {
                deps,
                config,
                retry,
                cancels: DashMap::new(),
            }),
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // Public contract
    // ────────────────────────────────────────────────────────────────────────

    /// StartDeployment: creates the portal's next run and executes it in the
    /// background. At most one run per portal is live at any time.
    pub async fn start_deployment(&self, portal_id: Uuid) -> Result<DeploymentRun, AppError> {
        let deps = &self.inner.deps;
        let portal = deps
            .records
            .get_portal(portal_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("portal {portal_id} not found")))?;
        require_capability(deps.entitlements.as_ref(), portal.user_id, PORTAL_CAPABILITY).await?;
        validate_slug(&portal.slug)?;
        portal.status.on_generation_start()?;

        let run = self.create_run(portal_id).await?;
        let flag = CancelFlag::new();
        self.inner.cancels.insert(run.id, flag.clone());

        info!(
            "Starting deployment run {} (#{}) for portal {portal_id}",
            run.id, run.run_number
        );
        deps.analytics.emit(
            DEPLOYMENT_STARTED,
            json!({
                "portal_id": portal_id,
                "run_id": run.id,
                "run_number": run.run_number,
            }),
        );

        tokio::spawn(self.clone().execute(run.clone(), flag));
        Ok(run)
    }

    /// GetStatus
    pub async fn get_status(&self, run_id: Uuid) -> Result<DeploymentRun, AppError> {
        self.inner
            .deps
            .records
            .get_run(run_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("deployment {run_id} not found")))
    }

    pub async fn list_runs(&self, portal_id: Uuid) -> Result<Vec<DeploymentRun>, AppError> {
        let records = &self.inner.deps.records;
        if records.get_portal(portal_id).await?.is_none() {
            return Err(AppError::NotFound(format!("portal {portal_id} not found")));
        }
        records.list_runs(portal_id).await
    }

    /// Cancel: moves a live run straight to FAILED and signals its executor.
    pub async fn cancel(&self, run_id: Uuid) -> Result<DeploymentRun, AppError> {
        let mut run = self.get_status(run_id).await?;
        if run.phase.is_terminal() {
            return Err(AppError::StateConflict(format!(
                "deployment {run_id} already {}",
                run.phase.as_str()
            )));
        }
        let phase = run.phase;
        run.fail(RunError::cancelled(phase))?;
        if !self.inner.deps.records.fail_run(&run).await? {
            return Err(AppError::StateConflict(format!(
                "deployment {run_id} finished before it could be cancelled"
            )));
        }
        if let Some((_, flag)) = self.inner.cancels.remove(&run_id) {
            flag.cancel();
        }

        info!("Cancelled deployment run {run_id} during {}", phase.as_str());
        self.inner.deps.analytics.emit(
            DEPLOYMENT_FAILED,
            json!({
                "portal_id": run.portal_id,
                "run_id": run_id,
                "phase": phase.as_str(),
                "code": "CANCELLED",
            }),
        );
        Ok(run)
    }

    // ────────────────────────────────────────────────────────────────────────
    // Run creation
    // ────────────────────────────────────────────────────────────────────────

    async fn create_run(&self, portal_id: Uuid) -> Result<DeploymentRun, AppError> {
        let records = &self.inner.deps.records;
        let config = &self.inner.config;
        match config.start_policy {
            ConcurrentStartPolicy::Reject => records.create_run_exclusive(portal_id).await,
            ConcurrentStartPolicy::Queue => {
                let deadline = Instant::now() + config.queue_wait;
                loop {
                    match records.create_run_exclusive(portal_id).await {
                        Err(AppError::StateConflict(msg)) if Instant::now() < deadline => {
                            info!("Deployment for portal {portal_id} queued: {msg}");
                            tokio::time::sleep(config.cancel_poll_interval).await;
                        }
                        other => return other,
                    }
                }
            }
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // Executor
    // ────────────────────────────────────────────────────────────────────────

    async fn execute(self, mut run: DeploymentRun, flag: CancelFlag) {
        let run_id = run.id;
        let mut ctx = RunContext::default();

        loop {
            let phase = run.phase;
            match self.run_phase_with_retries(&mut run, &mut ctx, &flag).await {
                PhaseOutcome::Advanced => {}
                PhaseOutcome::Stopped | PhaseOutcome::Failed => break,
            }

            let Some(next) = phase.next() else { break };
            if next == DeploymentPhase::Completed {
                self.promote(&mut run, &ctx).await;
                break;
            }
            if let Err(e) = run.advance_to(next) {
                self.fail(&mut run, &e).await;
                break;
            }
        }

        self.inner.cancels.remove(&run_id);
    }

    /// Runs the current phase until it succeeds, fails fatally, exhausts its
    /// attempts or the run is cancelled.
    async fn run_phase_with_retries(
        &self,
        run: &mut DeploymentRun,
        ctx: &mut RunContext,
        flag: &CancelFlag,
    ) -> PhaseOutcome {
        let phase = run.phase;
        let budget = self.inner.config.phase_budgets.budget_for(phase);
        let mut attempt = 1;

        loop {
            let op = run.begin_op(phase.as_str());
            if !self.save_progress(run).await {
                self.discard_generation(run).await;
                return PhaseOutcome::Stopped;
            }

            let result = tokio::select! {
                outcome = tokio::time::timeout(budget, self.run_phase(phase, run, ctx, flag)) => {
                    outcome.unwrap_or_else(|_| Err(AppError::timeout("deployment phase", budget)))
                }
                _ = flag.cancelled() => Err(AppError::Cancelled),
            };

            match result {
                Ok(()) => {
                    run.end_op(op, OperationStatus::Succeeded, None);
                    return PhaseOutcome::Advanced;
                }
                Err(AppError::Cancelled) => {
                    info!("Run {} observed cancellation in {}", run.id, phase.as_str());
                    self.discard_generation(run).await;
                    return PhaseOutcome::Stopped;
                }
                Err(e) if self.inner.retry.should_retry(attempt, &e) => {
                    let delay = self.inner.retry.delay_for(attempt);
                    warn!(
                        "Run {} phase {} attempt {attempt} failed: {e}; retrying in {}ms",
                        run.id,
                        phase.as_str(),
                        delay.as_millis()
                    );
                    run.end_op(op, OperationStatus::Retrying, Some(e.to_string()));
                    run.retry_count += 1;
                    if !self.save_progress(run).await || flag.sleep(delay).await.is_err() {
                        self.discard_generation(run).await;
                        return PhaseOutcome::Stopped;
                    }
                    attempt += 1;
                }
                Err(e) => {
                    run.end_op(op, OperationStatus::Failed, Some(e.to_string()));
                    self.fail(run, &e).await;
                    return PhaseOutcome::Failed;
                }
            }
        }
    }

    async fn run_phase(
        &self,
        phase: DeploymentPhase,
        run: &mut DeploymentRun,
        ctx: &mut RunContext,
        flag: &CancelFlag,
    ) -> Result<(), AppError> {
        let deps = &self.inner.deps;
        match phase {
            DeploymentPhase::Initializing => {
                let portal = deps
                    .records
                    .get_portal(run.portal_id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("portal {} not found", run.portal_id)))?;
                if portal.active_run_id != Some(run.id) {
                    return Err(AppError::StateConflict(format!(
                        "portal {} is no longer generating run {}",
                        portal.id, run.id
                    )));
                }
                validate_slug(&portal.slug)?;
                if portal.theme.trim().is_empty() {
                    return Err(AppError::Validation("portal has no theme".to_string()));
                }
                ctx.portal = Some(portal);
                Ok(())
            }

            DeploymentPhase::ProcessingDocument => {
                let portal = ctx.portal()?;
                let mut document = deps
                    .documents
                    .get_structured_document(portal.document_id)
                    .await?;
                document.sections.retain(|s| portal.section_enabled(&s.label));
                if !document.has_content() {
                    return Err(AppError::Validation(
                        "the résumé has no content in the enabled sections".to_string(),
                    ));
                }
                ctx.document = Some(document);
                Ok(())
            }

            DeploymentPhase::GeneratingEmbeddings => {
                let portal = ctx.portal()?;
                let document = ctx
                    .document
                    .as_ref()
                    .ok_or_else(|| AppError::Internal(anyhow::anyhow!("document not loaded")))?;

                // Re-entry after a retry starts from a clean generation.
                deps.vectors.delete(&own_generation(portal, run.id)).await?;

                let output = deps
                    .pipeline
                    .generate_embeddings_with(portal.user_id, document, Some(flag))
                    .await?;
                run.usage.embedding_calls += output.embedding_calls;
                if output.chunks.is_empty() {
                    return Err(AppError::transient(
                        "embedding",
                        format!("all {} chunks failed to embed", output.warnings.len()),
                    ));
                }

                if output.is_degraded() {
                    warn!(
                        "Run {} continues with {} of {} chunks embedded",
                        run.id,
                        output.chunks.len(),
                        output.chunks.len() + output.warnings.len()
                    );
                }
                for warning in &output.warnings {
                    run.note(
                        "coverage",
                        OperationStatus::Warning,
                        format!(
                            "dropped chunk {} of '{}': {}",
                            warning.ordinal, warning.section, warning.message
                        ),
                    );
                }
                let mut chunks = output.chunks;
                for chunk in &mut chunks {
                    chunk.portal_id = Some(portal.id);
                    chunk.generation_id = Some(run.id);
                }
                deps.vectors.insert(&chunks).await?;

                run.usage.chunks_generated = chunks.len() as u32;
                run.usage.chunks_dropped = output.warnings.len() as u32;
                ctx.chunk_count = chunks.len();
                Ok(())
            }

            DeploymentPhase::PreparingContent => {
                let document = ctx
                    .document
                    .as_ref()
                    .ok_or_else(|| AppError::Internal(anyhow::anyhow!("document not loaded")))?;
                ctx.assets = render_site(ctx.portal()?, document, run.id, ctx.chunk_count)?;
                Ok(())
            }

            DeploymentPhase::UploadingAssets => {
                let target = ctx.target(run.id)?;
                run.usage.assets_uploaded = 0;
                run.usage.bytes_uploaded = 0;
                for asset in &ctx.assets {
                    flag.check()?;
                    deps.publish.upload_asset(&target, asset).await?;
                    run.usage.assets_uploaded += 1;
                    run.usage.bytes_uploaded += asset.body.len() as u64;
                }
                Ok(())
            }

            DeploymentPhase::Building => {
                let target = ctx.target(run.id)?;
                deps.publish.build(&target, &ctx.assets, flag).await
            }

            DeploymentPhase::Deploying => {
                let target = ctx.target(run.id)?;
                ctx.preview_url = Some(deps.publish.deploy(&target).await?);
                Ok(())
            }

            DeploymentPhase::Testing => {
                let portal = ctx.portal()?;
                let url = ctx
                    .preview_url
                    .as_deref()
                    .ok_or_else(|| AppError::Internal(anyhow::anyhow!("generation not staged")))?;
                if deps.publish.health_check(url, &health_marker(&portal.slug)).await? {
                    Ok(())
                } else {
                    Err(AppError::transient(
                        "publish target",
                        format!("health check of {url} did not find the portal"),
                    ))
                }
            }

            DeploymentPhase::Completed | DeploymentPhase::Failed => Ok(()),
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // Terminal transitions
    // ────────────────────────────────────────────────────────────────────────

    /// Blue/green swap: claim the serving pointer in the record store, write
    /// the slug pointer, then complete the run. A cancel is refused while the
    /// claim is held. Older generations' chunks are retired only after the swap.
    async fn promote(&self, run: &mut DeploymentRun, ctx: &RunContext) {
        let deps = &self.inner.deps;
        let (portal, target) = match (ctx.portal(), ctx.target(run.id)) {
            (Ok(portal), Ok(target)) => (portal, target),
            (Err(e), _) | (_, Err(e)) => {
                self.fail(run, &e).await;
                return;
            }
        };

        let op = run.begin_op("promote");
        let previous_run_id = match deps.records.claim_promotion(run).await {
            Ok(PromotionClaim::Claimed { previous_run_id }) => previous_run_id,
            Ok(PromotionClaim::Lost) => {
                run.end_op(op, OperationStatus::Failed, Some("run ended before promotion".into()));
                warn!("Run {} ended before promotion; nothing to swap", run.id);
                self.discard_generation(run).await;
                return;
            }
            Err(e) => {
                run.end_op(op, OperationStatus::Failed, Some(e.to_string()));
                self.fail(run, &e).await;
                return;
            }
        };

        let publish = deps.publish.as_ref();
        let target_ref = &target;
        let written = self
            .inner
            .retry
            .run("promote", None, move |_| publish.promote(target_ref))
            .await;
        if let Err(e) = written {
            run.end_op(op, OperationStatus::Failed, Some(e.to_string()));
            self.release_claim(run, previous_run_id).await;
            self.fail(run, &e).await;
            return;
        }
        run.end_op(op, OperationStatus::Succeeded, None);

        let completed = match run.advance_to(DeploymentPhase::Completed) {
            Ok(()) => deps.records.promote_run(run).await,
            Err(e) => Err(e),
        };
        match completed {
            Ok(true) => {}
            Ok(false) => {
                warn!("Run {} ended during promotion; restoring", run.id);
                self.restore_previous(portal, previous_run_id).await;
                self.release_claim(run, previous_run_id).await;
                self.discard_generation(run).await;
                return;
            }
            Err(e) => {
                error!("Failed to record promotion of run {}: {e}", run.id);
                self.restore_previous(portal, previous_run_id).await;
                self.release_claim(run, previous_run_id).await;
                self.discard_generation(run).await;
                return;
            }
        }

        let retired = deps
            .vectors
            .delete(
                &ChunkFilter::for_user(portal.user_id)
                    .portal(portal.id)
                    .generation(GenerationScope::Except(run.id)),
            )
            .await;
        match retired {
            Ok(n) => info!("Retired {n} chunks of earlier generations of portal {}", portal.id),
            Err(e) => warn!("Failed to retire old chunks of portal {}: {e}", portal.id),
        }

        info!("Deployment run {} completed for portal {}", run.id, portal.id);
        deps.analytics.emit(
            DEPLOYMENT_COMPLETED,
            json!({
                "portal_id": portal.id,
                "run_id": run.id,
                "chunks": run.usage.chunks_generated,
                "retries": run.retry_count,
            }),
        );
    }

    async fn release_claim(&self, run: &DeploymentRun, previous_run_id: Option<Uuid>) {
        if let Err(e) = self
            .inner
            .deps
            .records
            .release_promotion(run, previous_run_id)
            .await
        {
            error!("Failed to release promotion claim of run {}: {e}", run.id);
        }
    }

    /// Points the slug back at the generation that was serving before.
    async fn restore_previous(&self, portal: &PortalConfiguration, previous_run_id: Option<Uuid>) {
        let Some(run_id) = previous_run_id else {
            return;
        };
        let target = RunTarget {
            portal_id: portal.id,
            run_id,
            slug: portal.slug.clone(),
        };
        if let Err(e) = self.inner.deps.publish.promote(&target).await {
            error!("Failed to restore generation {run_id} of portal {}: {e}", portal.id);
        }
    }

    async fn fail(&self, run: &mut DeploymentRun, e: &AppError) {
        let deps = &self.inner.deps;
        let phase = run.phase;
        if let Err(transition) = run.fail(RunError::from_app_error(phase, e)) {
            error!("Run {} cannot be failed: {transition}", run.id);
            return;
        }

        match deps.records.fail_run(run).await {
            Ok(true) => {
                warn!("Deployment run {} failed in {}: {e}", run.id, phase.as_str());
                deps.analytics.emit(
                    DEPLOYMENT_FAILED,
                    json!({
                        "portal_id": run.portal_id,
                        "run_id": run.id,
                        "phase": phase.as_str(),
                        "code": run.error.as_ref().map(|err| err.code.clone()),
                        "retryable": e.is_retryable(),
                    }),
                );
            }
            Ok(false) => info!("Run {} already finished; failure not recorded", run.id),
            Err(store_err) => error!("Failed to record failure of run {}: {store_err}", run.id),
        }
        self.discard_generation(run).await;
    }

    /// Writes progress. `false` means the stored run already reached a
    /// terminal phase and this executor must stop.
    async fn save_progress(&self, run: &DeploymentRun) -> bool {
        match self.inner.deps.records.save_run_progress(run).await {
            Ok(saved) => saved,
            Err(e) => {
                warn!("Failed to save progress of run {}: {e}", run.id);
                true
            }
        }
    }

    /// Deletes the chunks this run wrote. They were never served.
    async fn discard_generation(&self, run: &DeploymentRun) {
        let deps = &self.inner.deps;
        let owner = match deps.records.get_portal(run.portal_id).await {
            Ok(Some(portal)) => portal,
            Ok(None) => return,
            Err(e) => {
                warn!("Cannot load portal to discard run {}: {e}", run.id);
                return;
            }
        };
        if let Err(e) = deps.vectors.delete(&own_generation(&owner, run.id)).await {
            warn!("Failed to discard chunks of run {}: {e}", run.id);
        }
    }
}

fn own_generation(portal: &PortalConfiguration, run_id: Uuid) -> ChunkFilter {
    ChunkFilter::for_user(portal.user_id)
        .portal(portal.id)
        .generation(GenerationScope::Only(run_id))
}
