use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::models::deployment::DeploymentPhase;

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub s3_bucket: String,
    pub s3_endpoint: String,
    /// Base URL under which uploaded bucket objects are publicly readable.
    pub s3_public_url: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub anthropic_api_key: String,
    /// Visitor-facing base URL; a portal lives at `{base}/{slug}`.
    pub portal_public_base_url: String,
    pub embedding: EmbeddingSettings,
    pub engine: EngineConfig,
    pub port: u16,
    pub rust_log: String,
}

/// Remote embedding provider settings. When `api_url` is unset the local
/// hashing embedder is used instead.
#[derive(Debug, Clone)]
pub struct EmbeddingSettings {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub dims: usize,
}

/// What `StartDeployment` does when the portal already has a live run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrentStartPolicy {
    Reject,
    Queue,
}

impl FromStr for ConcurrentStartPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "queue" => Ok(Self::Queue),
            other => anyhow::bail!("unknown deployment start policy '{other}' (use reject|queue)"),
        }
    }
}

/// Tunables for chunking, retrieval, chat quotas and deployment phases.
/// None of these are invariants; they are meant to be tuned per environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chunk_token_budget: u32,
    pub chunk_token_overlap: u32,
    pub embedding_max_attempts: u32,
    pub embedding_concurrency: usize,

    pub retrieval_top_k: usize,
    pub retrieval_overfetch: usize,
    pub grounding_floor: f32,

    pub context_token_budget: u32,
    pub history_turns: usize,
    pub session_quota: u32,
    pub session_window: Duration,
    pub portal_quota: u32,
    pub portal_window: Duration,
    pub portal_max_concurrent_completions: usize,
    pub session_idle_timeout: Duration,
    pub chat_max_attempts: u32,

    pub embed_timeout: Duration,
    pub retrieval_timeout: Duration,
    pub completion_timeout: Duration,

    pub deploy_max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub cancel_poll_interval: Duration,
    pub start_policy: ConcurrentStartPolicy,
    pub queue_wait: Duration,
    pub phase_budgets: PhaseBudgets,
}

/// Execution budget per deployment phase.
#[derive(Debug, Clone)]
pub struct PhaseBudgets {
    pub initializing: Duration,
    pub processing_document: Duration,
    pub generating_embeddings: Duration,
    pub preparing_content: Duration,
    pub uploading_assets: Duration,
    pub building: Duration,
    pub deploying: Duration,
    pub testing: Duration,
}

impl PhaseBudgets {
    pub fn budget_for(&self, phase: DeploymentPhase) -> Duration {
        match phase {
            DeploymentPhase::Initializing => self.initializing,
            DeploymentPhase::ProcessingDocument => self.processing_document,
            DeploymentPhase::GeneratingEmbeddings => self.generating_embeddings,
            DeploymentPhase::PreparingContent => self.preparing_content,
            DeploymentPhase::UploadingAssets => self.uploading_assets,
            DeploymentPhase::Building => self.building,
            DeploymentPhase::Deploying => self.deploying,
            DeploymentPhase::Testing => self.testing,
            // Terminal phases do no work.
            DeploymentPhase::Completed | DeploymentPhase::Failed => Duration::ZERO,
        }
    }
}

impl Default for PhaseBudgets {
    fn default() -> Self {
        Self {
            initializing: Duration::from_secs(10),
            processing_document: Duration::from_secs(30),
            generating_embeddings: Duration::from_secs(300),
            preparing_content: Duration::from_secs(30),
            uploading_assets: Duration::from_secs(120),
            building: Duration::from_secs(180),
            deploying: Duration::from_secs(60),
            testing: Duration::from_secs(60),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_token_budget: 500,
            chunk_token_overlap: 50,
            embedding_max_attempts: 3,
            embedding_concurrency: 4,
            retrieval_top_k: 5,
            retrieval_overfetch: 2,
            grounding_floor: 0.15,
            context_token_budget: 1500,
            history_turns: 6,
            session_quota: 20,
            session_window: Duration::from_secs(600),
            portal_quota: 300,
            portal_window: Duration::from_secs(600),
            portal_max_concurrent_completions: 8,
            session_idle_timeout: Duration::from_secs(900),
            chat_max_attempts: 2,
            embed_timeout: Duration::from_secs(15),
            retrieval_timeout: Duration::from_secs(5),
            completion_timeout: Duration::from_secs(60),
            deploy_max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
            cancel_poll_interval: Duration::from_millis(250),
            start_policy: ConcurrentStartPolicy::Reject,
            queue_wait: Duration::from_secs(120),
            phase_budgets: PhaseBudgets::default(),
        }
    }
}

impl EngineConfig {
    /// Reads every tunable from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let engine = Self {
            chunk_token_budget: env_or("CHUNK_TOKEN_BUDGET", d.chunk_token_budget)?,
            chunk_token_overlap: env_or("CHUNK_TOKEN_OVERLAP", d.chunk_token_overlap)?,
            embedding_max_attempts: env_or("EMBEDDING_MAX_ATTEMPTS", d.embedding_max_attempts)?,
            embedding_concurrency: env_or("EMBEDDING_CONCURRENCY", d.embedding_concurrency)?,
            retrieval_top_k: env_or("RETRIEVAL_TOP_K", d.retrieval_top_k)?,
            retrieval_overfetch: env_or("RETRIEVAL_OVERFETCH", d.retrieval_overfetch)?,
            grounding_floor: env_or("GROUNDING_FLOOR", d.grounding_floor)?,
            context_token_budget: env_or("CONTEXT_TOKEN_BUDGET", d.context_token_budget)?,
            history_turns: env_or("CHAT_HISTORY_TURNS", d.history_turns)?,
            session_quota: env_or("SESSION_QUOTA", d.session_quota)?,
            session_window: env_secs("SESSION_QUOTA_WINDOW_SECS", d.session_window)?,
            portal_quota: env_or("PORTAL_QUOTA", d.portal_quota)?,
            portal_window: env_secs("PORTAL_QUOTA_WINDOW_SECS", d.portal_window)?,
            portal_max_concurrent_completions: env_or(
                "PORTAL_MAX_CONCURRENT_COMPLETIONS",
                d.portal_max_concurrent_completions,
            )?,
            session_idle_timeout: env_secs("SESSION_IDLE_TIMEOUT_SECS", d.session_idle_timeout)?,
            chat_max_attempts: env_or("CHAT_MAX_ATTEMPTS", d.chat_max_attempts)?,
            embed_timeout: env_secs("EMBED_TIMEOUT_SECS", d.embed_timeout)?,
            retrieval_timeout: env_secs("RETRIEVAL_TIMEOUT_SECS", d.retrieval_timeout)?,
            completion_timeout: env_secs("COMPLETION_TIMEOUT_SECS", d.completion_timeout)?,
            deploy_max_attempts: env_or("DEPLOY_MAX_ATTEMPTS", d.deploy_max_attempts)?,
            backoff_base: env_millis("BACKOFF_BASE_MS", d.backoff_base)?,
            backoff_max: env_millis("BACKOFF_MAX_MS", d.backoff_max)?,
            cancel_poll_interval: env_millis("CANCEL_POLL_INTERVAL_MS", d.cancel_poll_interval)?,
            start_policy: env_or("DEPLOY_START_POLICY", d.start_policy)?,
            queue_wait: env_secs("DEPLOY_QUEUE_WAIT_SECS", d.queue_wait)?,
            phase_budgets: d.phase_budgets,
        };
        engine.validate()?;
        Ok(engine)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_token_overlap >= self.chunk_token_budget {
            anyhow::bail!("CHUNK_TOKEN_OVERLAP must be smaller than CHUNK_TOKEN_BUDGET");
        }
        if self.context_token_budget < self.chunk_token_budget {
            anyhow::bail!("CONTEXT_TOKEN_BUDGET must fit at least one chunk");
        }
        if !(0.0..=1.0).contains(&self.grounding_floor) {
            anyhow::bail!("GROUNDING_FLOOR must be within [0, 1]");
        }
        if self.retrieval_top_k == 0 || self.retrieval_overfetch == 0 {
            anyhow::bail!("RETRIEVAL_TOP_K and RETRIEVAL_OVERFETCH must be positive");
        }
        if self.session_quota == 0 || self.portal_quota == 0 {
            anyhow::bail!("SESSION_QUOTA and PORTAL_QUOTA must be positive");
        }
        if self.session_window.is_zero()
            || self.portal_window.is_zero()
            || self.session_idle_timeout.is_zero()
        {
            anyhow::bail!("quota windows and SESSION_IDLE_TIMEOUT_SECS must be non-zero");
        }
        Ok(())
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let s3_endpoint = require_env("S3_ENDPOINT")?;
        let s3_bucket = require_env("S3_BUCKET")?;
        let s3_public_url = std::env::var("S3_PUBLIC_URL")
            .unwrap_or_else(|_| format!("{}/{}", s3_endpoint.trim_end_matches('/'), s3_bucket));

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            redis_url: require_env("REDIS_URL")?,
            s3_bucket,
            s3_endpoint,
            s3_public_url,
            aws_access_key_id: require_env("AWS_ACCESS_KEY_ID")?,
            aws_secret_access_key: require_env("AWS_SECRET_ACCESS_KEY")?,
            anthropic_api_key: require_env("ANTHROPIC_API_KEY")?,
            portal_public_base_url: require_env("PORTAL_PUBLIC_BASE_URL")?,
            embedding: EmbeddingSettings {
                api_url: std::env::var("EMBEDDING_API_URL").ok(),
                api_key: std::env::var("EMBEDDING_API_KEY").ok(),
                model: std::env::var("EMBEDDING_MODEL")
                    .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
                dims: env_or("EMBEDDING_DIMS", 256)?,
            },
            engine: EngineConfig::from_env()?,
            port: env_or("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{key} has an invalid value '{raw}': {e}")),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    env_or(key, default.as_secs()).map(Duration::from_secs)
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    env_or(key, default.as_millis() as u64).map(Duration::from_millis)
}
