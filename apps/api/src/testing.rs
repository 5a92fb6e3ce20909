//! Fixtures and scripted collaborators shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::cancel::CancelFlag;
use crate::chat::completion::{Completion, CompletionRequest, CompletionService};
use crate::collaborators::{AnalyticsSink, DocumentSource, EntitlementChecker};
use crate::config::EngineConfig;
use crate::deployment::publish::{PublishTarget, RunTarget, SiteAsset};
use crate::embedding::{Embedder, EmbeddingPipeline, HashingEmbedder};
use crate::errors::AppError;
use crate::models::chunk::{ContentChunk, ContentType};
use crate::models::deployment::DeploymentPhase;
use crate::models::document::{DocumentSection, StructuredDocument};
use crate::models::portal::PortalConfiguration;
use crate::retrieval::memory::InMemoryVectorStore;
use crate::retrieval::VectorStore;
use crate::store::memory::InMemoryRecordStore;
use crate::store::RecordStore;

pub const TEST_DIMS: usize = 256;

// ────────────────────────────────────────────────────────────────────────────
// Fixtures
// ────────────────────────────────────────────────────────────────────────────

/// Summary, two-role Experience (text only, index 1), Skills (items only) and
/// Education. Only Skills mentions languages or Kubernetes.
pub fn resume_document() -> StructuredDocument {
    let section = |label: &str, text: &str, items: &[&str]| DocumentSection {
        label: label.to_string(),
        text: text.to_string(),
        items: items.iter().map(|i| i.to_string()).collect(),
    };
    StructuredDocument {
        document_id: Uuid::new_v4(),
        sections: vec![
            section(
                "Summary",
                "Backend engineer with eight years building payment and data platforms. \
                 Enjoys mentoring teams and pragmatic system design.",
                &[],
            ),
            section(
                "Experience",
                "Senior Engineer, Northwind Payments (2019 - present)\n\
                 Led the ledger service rewrite, cutting settlement latency by 40%.\n\n\
                 Software Engineer, Contoso Data (2015 - 2019)\n\
                 Built streaming ingestion pipelines processing two billion events a day.",
                &[],
            ),
            section(
                "Skills",
                "",
                &[
                    "Languages: Python, Go",
                    "Rust",
                    "PostgreSQL",
                    "Kubernetes",
                    "Terraform",
                    "Kafka",
                    "Redis",
                    "gRPC",
                    "AWS",
                    "Distributed systems",
                ],
            ),
            section(
                "Education",
                "B.Sc. Computer Science, University of Leeds, 2015",
                &[],
            ),
        ],
    }
}

pub fn chunk_with(user_id: Uuid, ordinal: u32, embedding: Vec<f32>, importance: f32) -> ContentChunk {
    let text = format!("chunk {ordinal}");
    ContentChunk {
        id: Uuid::new_v4(),
        user_id,
        portal_id: None,
        generation_id: None,
        section: "Experience".to_string(),
        ordinal,
        content_hash: format!("hash-{ordinal}"),
        token_count: 2,
        text,
        embedding,
        importance,
        content_type: ContentType::FreeText,
    }
}

fn unique_slug() -> String {
    format!("portal-{}", &Uuid::new_v4().simple().to_string()[..12])
}

pub async fn draft_portal(records: &InMemoryRecordStore, user_id: Uuid) -> PortalConfiguration {
    let portal = PortalConfiguration::new_draft(
        user_id,
        Uuid::new_v4(),
        "Jordan Reyes".to_string(),
        unique_slug(),
    );
    records.insert_portal(&portal).await.unwrap();
    portal
}

/// An ACTIVE portal serving one completed generation built from
/// `resume_document`.
pub async fn seed_active_portal(
    records: &InMemoryRecordStore,
    vectors: &InMemoryVectorStore,
    user_id: Uuid,
) -> PortalConfiguration {
    let portal = draft_portal(records, user_id).await;
    let mut run = records.create_run_exclusive(portal.id).await.unwrap();
    for phase in DeploymentPhase::PIPELINE.iter().skip(1) {
        run.advance_to(*phase).unwrap();
    }
    run.advance_to(DeploymentPhase::Completed).unwrap();

    let pipeline = EmbeddingPipeline::new(
        std::sync::Arc::new(HashingEmbedder::new(TEST_DIMS)),
        &EngineConfig::default(),
    );
    let mut chunks = pipeline
        .generate_embeddings(user_id, &resume_document())
        .await
        .unwrap()
        .chunks;
    for chunk in &mut chunks {
        chunk.portal_id = Some(portal.id);
        chunk.generation_id = Some(run.id);
    }
    vectors.insert(&chunks).await.unwrap();

    assert!(records.promote_run(&run).await.unwrap());
    records.get_portal(portal.id).await.unwrap().unwrap()
}

// ────────────────────────────────────────────────────────────────────────────
// Collaborators
// ────────────────────────────────────────────────────────────────────────────

pub struct StaticEntitlements {
    allow: bool,
}

impl StaticEntitlements {
    pub fn allow_all() -> Self {
        Self { allow: true }
    }

    pub fn deny_all() -> Self {
        Self { allow: false }
    }
}

#[async_trait]
impl EntitlementChecker for StaticEntitlements {
    async fn has_capability(&self, _user_id: Uuid, _capability: &str) -> Result<bool, AppError> {
        Ok(self.allow)
    }
}

/// Serves the same document for any id.
pub struct StaticDocuments {
    document: StructuredDocument,
}

impl StaticDocuments {
    pub fn new(document: StructuredDocument) -> Self {
        Self { document }
    }
}

#[async_trait]
impl DocumentSource for StaticDocuments {
    async fn get_structured_document(
        &self,
        document_id: Uuid,
    ) -> Result<StructuredDocument, AppError> {
        Ok(StructuredDocument {
            document_id,
            sections: self.document.sections.clone(),
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, Value)>>,
}

impl RecordingSink {
    pub fn count(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == event_type)
            .count()
    }
}

impl AnalyticsSink for RecordingSink {
    fn emit(&self, event_type: &str, payload: Value) {
        self.events
            .lock()
            .unwrap()
            .push((event_type.to_string(), payload));
    }
}

/// Embedder that fails transiently on a schedule, otherwise hashes.
pub struct FlakyEmbedder {
    inner: HashingEmbedder,
    fail_first: u32,
    always_fail_on: Option<String>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl FlakyEmbedder {
    /// Every distinct text fails `n` times before succeeding.
    pub fn failing_first(n: u32) -> Self {
        Self {
            inner: HashingEmbedder::new(32),
            fail_first: n,
            always_fail_on: None,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Texts containing `needle` never embed.
    pub fn always_failing_on(needle: &str) -> Self {
        Self {
            inner: HashingEmbedder::new(32),
            fail_first: 0,
            always_fail_on: Some(needle.to_string()),
            attempts: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    fn model_name(&self) -> &str {
        "flaky"
    }

    fn dims(&self) -> usize {
        32
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        if let Some(needle) = &self.always_fail_on {
            if text.contains(needle.as_str()) {
                return Err(AppError::transient("embedding", "503 from provider"));
            }
        }
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let seen = attempts.entry(text.to_string()).or_insert(0);
            *seen += 1;
            *seen
        };
        if attempt <= self.fail_first {
            return Err(AppError::transient("embedding", format!("attempt {attempt} refused")));
        }
        Ok(self.inner.embed_sync(text))
    }
}

/// Completion fake. `echo` answers with `echo_of(question)` and cites the
/// top context chunk.
pub struct ScriptedCompletion {
    fail: bool,
    delay: Duration,
    calls: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedCompletion {
    fn build(fail: bool) -> Self {
        Self {
            fail,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn echo() -> Self {
        Self::build(false)
    }

    pub fn failing() -> Self {
        Self::build(true)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn echo_of(question: &str) -> String {
        format!("You asked: {question}")
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            return Err(AppError::transient("completion", "overloaded"));
        }
        let question = request
            .history
            .last()
            .map(|turn| turn.text.as_str())
            .unwrap_or_default();
        Ok(Completion {
            text: Self::echo_of(question),
            used_chunk_ids: request.context.iter().take(1).map(|b| b.chunk_id).collect(),
        })
    }
}

/// Publish target that records calls. `holding_build` keeps BUILDING busy
/// until the run is cancelled or the phase budget runs out.
pub struct FakePublishTarget {
    hold_build: bool,
    healthy: bool,
    reject_promote: bool,
    promote_delay: Duration,
    build_calls: AtomicU32,
    promote_calls: AtomicU32,
    health_checks: AtomicU32,
    promoted: Mutex<Vec<Uuid>>,
}

impl Default for FakePublishTarget {
    fn default() -> Self {
        Self {
            hold_build: false,
            healthy: true,
            reject_promote: false,
            promote_delay: Duration::ZERO,
            build_calls: AtomicU32::new(0),
            promote_calls: AtomicU32::new(0),
            health_checks: AtomicU32::new(0),
            promoted: Mutex::new(Vec::new()),
        }
    }
}

impl FakePublishTarget {
    pub fn holding_build() -> Self {
        Self {
            hold_build: true,
            ..Self::default()
        }
    }

    pub fn unhealthy() -> Self {
        Self {
            healthy: false,
            ..Self::default()
        }
    }

    /// Every slug pointer write fails.
    pub fn rejecting_promote() -> Self {
        Self {
            reject_promote: true,
            ..Self::default()
        }
    }

    /// Slug pointer writes take `delay`.
    pub fn slow_promote(delay: Duration) -> Self {
        Self {
            promote_delay: delay,
            ..Self::default()
        }
    }

    pub fn promote_calls(&self) -> u32 {
        self.promote_calls.load(Ordering::SeqCst)
    }

    pub fn promoted(&self) -> Vec<Uuid> {
        self.promoted.lock().unwrap().clone()
    }

    pub fn build_calls(&self) -> u32 {
        self.build_calls.load(Ordering::SeqCst)
    }

    pub fn health_checks(&self) -> u32 {
        self.health_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PublishTarget for FakePublishTarget {
    async fn upload_asset(&self, _target: &RunTarget, _asset: &SiteAsset) -> Result<(), AppError> {
        Ok(())
    }

    async fn build(
        &self,
        _target: &RunTarget,
        _assets: &[SiteAsset],
        cancel: &CancelFlag,
    ) -> Result<(), AppError> {
        self.build_calls.fetch_add(1, Ordering::SeqCst);
        while self.hold_build {
            cancel.check()?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }

    async fn deploy(&self, target: &RunTarget) -> Result<String, AppError> {
        Ok(format!("https://preview.test/{}/{}", target.portal_id, target.run_id))
    }

    async fn health_check(&self, _url: &str, _marker: &str) -> Result<bool, AppError> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.healthy)
    }

    async fn promote(&self, target: &RunTarget) -> Result<(), AppError> {
        self.promote_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.promote_delay).await;
        if self.reject_promote {
            return Err(AppError::transient("publish target", "pointer write rejected"));
        }
        self.promoted.lock().unwrap().push(target.run_id);
        Ok(())
    }
}
