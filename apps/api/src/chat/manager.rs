//! Chat Session Manager.
//!
//! Each live session gets one worker task fed by an mpsc queue, so messages
//! of a session are answered strictly in arrival order while different
//! sessions run in parallel. A worker starts when its session opens and ends
//! the session after `session_idle_timeout` without traffic. Sessions whose
//! worker is gone (a restart) are ended by the idle sweep.
//!
//! Per message:
//!   validate → quota (session + portal, atomic) → embed → retrieve →
//!   (empty: "not covered" reply) → context window → completion → cite →
//!   append both messages → emit

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chat::completion::{CompletionRequest, CompletionService};
use crate::chat::context_window::{
    assemble, cite, context_blocks, history_window, not_covered_reply, DEGRADED_REPLY,
};
use crate::chat::quota::{QuotaKey, QuotaLedger};
use crate::collaborators::analytics::{
    CHAT_MESSAGE_ANSWERED, CHAT_SESSION_ENDED, CHAT_SESSION_OPENED,
};
use crate::collaborators::{require_capability, AnalyticsSink, EntitlementChecker, PORTAL_CAPABILITY};
use crate::config::EngineConfig;
use crate::embedding::Embedder;
use crate::errors::{AppError, QuotaScope};
use crate::models::chat::{
    ChatMessage, ChatSession, DeliveryStatus, RateLimitState, SessionEndReason, SessionUpdate,
};
use crate::models::portal::{PortalConfiguration, PortalCounter, PortalStatus};
use crate::retrieval::{RetrievalEngine, RetrievalFilters};
use crate::retry::{with_timeout, RetryPolicy};
use crate::store::RecordStore;

const MAX_MESSAGE_CHARS: usize = 2000;
const QUEUE_CAPACITY: usize = 64;
const DEFAULT_LANGUAGE: &str = "en";

/// Collaborators the chat manager calls out to.
pub struct ChatDeps {
    pub records: Arc<dyn RecordStore>,
    pub retrieval: RetrievalEngine,
    pub embedder: Arc<dyn Embedder>,
    pub completion: Arc<dyn CompletionService>,
    pub quota: Arc<dyn QuotaLedger>,
    pub entitlements: Arc<dyn EntitlementChecker>,
    pub analytics: Arc<dyn AnalyticsSink>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenedSession {
    pub token: String,
    pub session_id: Uuid,
    pub portal_id: Uuid,
    pub language: String,
    pub rate_limit: RateLimitState,
}

enum SessionCommand {
    Message {
        text: String,
        reply: oneshot::Sender<Result<ChatMessage, AppError>>,
    },
    Close {
        reason: SessionEndReason,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
}

impl SessionCommand {
    fn reject(self) {
        match self {
            SessionCommand::Message { reply, .. } => {
                let _ = reply.send(Err(session_ended()));
            }
            SessionCommand::Close { reply, .. } => {
                let _ = reply.send(Ok(()));
            }
        }
    }
}

struct SessionWorker {
    id: u64,
    tx: mpsc::Sender<SessionCommand>,
}

struct ChatInner {
    deps: ChatDeps,
    config: EngineConfig,
    embed_retry: RetryPolicy,
    chat_retry: RetryPolicy,
    workers: DashMap<String, SessionWorker>,
    portal_permits: DashMap<Uuid, Arc<Semaphore>>,
    next_worker_id: AtomicU64,
}

/// Cheap to clone; all clones share the worker registry.
#[derive(Clone)]
pub struct ChatManager {
    inner: Arc<ChatInner>,
}

fn session_ended() -> AppError {
    AppError::StateConflict("chat session has ended".to_string())
}

fn session_not_found() -> AppError {
    AppError::NotFound("chat session not found".to_string())
}

/// Portals answer visitors only while ACTIVE, visible and chat-enabled.
/// A private portal is reported as missing.
fn ensure_portal_serves_chat(portal: &PortalConfiguration) -> Result<(), AppError> {
    if !portal.visibility.is_visitor_facing() {
        return Err(AppError::NotFound(format!("portal {} not found", portal.id)));
    }
    if portal.status != PortalStatus::Active {
        return Err(AppError::StateConflict(format!(
            "portal is {} and not accepting chat",
            portal.status.as_str()
        )));
    }
    if !portal.features.chat_enabled {
        return Err(AppError::StateConflict(
            "chat is disabled for this portal".to_string(),
        ));
    }
    Ok(())
}

fn normalize_language(language: Option<&str>) -> Result<String, AppError> {
    let Some(raw) = language.map(str::trim).filter(|l| !l.is_empty()) else {
        return Ok(DEFAULT_LANGUAGE.to_string());
    };
    let valid = raw.len() <= 16 && raw.chars().all(|c| c.is_ascii_alphabetic() || c == '-');
    if !valid {
        return Err(AppError::Validation(format!("unsupported language '{raw}'")));
    }
    Ok(raw.to_ascii_lowercase())
}

fn validate_message(text: &str) -> Result<&str, AppError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(AppError::Validation("message must not be empty".to_string()));
    }
    if text.chars().count() > MAX_MESSAGE_CHARS {
        return Err(AppError::Validation(format!(
            "message must be at most {MAX_MESSAGE_CHARS} characters"
        )));
    }
    Ok(text)
}

impl ChatManager {
    pub fn new(deps: ChatDeps, config: EngineConfig) -> Self {
        let embed_retry = RetryPolicy::new(
            config.embedding_max_attempts,
            config.backoff_base,
            config.backoff_max,
        );
        let chat_retry =
            RetryPolicy::new(config.chat_max_attempts, config.backoff_base, config.backoff_max);
        Self {
            inner: Arc::new(ChatInner {
                deps,
                config,
                embed_retry,
                chat_retry,
                workers: DashMap::new(),
                portal_permits: DashMap::new(),
                next_worker_id: AtomicU64::new(1),
            }),
        }
    }

    // ── Public operations ─────────────────────────────────────────────────

    /// OpenSession: starts an anonymous conversation against an ACTIVE portal.
    pub async fn open_session(
        &self,
        portal_id: Uuid,
        language: Option<&str>,
    ) -> Result<OpenedSession, AppError> {
        let deps = &self.inner.deps;
        let language = normalize_language(language)?;
        let portal = deps
            .records
            .get_portal(portal_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("portal {portal_id} not found")))?;
        ensure_portal_serves_chat(&portal)?;
        require_capability(deps.entitlements.as_ref(), portal.user_id, PORTAL_CAPABILITY).await?;

        let config = &self.inner.config;
        let rate_limit = RateLimitState {
            remaining: config.session_quota,
            reset_at: Utc::now()
                + chrono::Duration::milliseconds(config.session_window.as_millis() as i64),
        };
        let session = ChatSession::open(portal.id, language, rate_limit);
        deps.records.insert_session(&session).await?;
        deps.records
            .increment_counter(portal.id, PortalCounter::Sessions)
            .await?;
        // Starts the inactivity timer even if no message ever arrives.
        self.ensure_worker(&session.token).await?;

        info!("Opened chat session {} on portal {}", session.id, portal.id);
        deps.analytics.emit(
            CHAT_SESSION_OPENED,
            json!({
                "portal_id": portal.id,
                "session_id": session.id,
                "language": session.language,
            }),
        );

        Ok(OpenedSession {
            token: session.token,
            session_id: session.id,
            portal_id: portal.id,
            language: session.language,
            rate_limit: session.rate_limit,
        })
    }

    /// SendMessage: queues the message on the session's worker and waits for
    /// the assistant reply.
    pub async fn send_message(&self, token: &str, text: &str) -> Result<ChatMessage, AppError> {
        let text = validate_message(text)?;

        // A worker that idled out between lookup and send has closed its queue;
        // the second pass reloads the session and reports it as ended.
        for _ in 0..2 {
            let tx = self.ensure_worker(token).await?;
            let (reply, response) = oneshot::channel();
            let command = SessionCommand::Message {
                text: text.to_string(),
                reply,
            };
            if tx.send(command).await.is_err() {
                continue;
            }
            return response.await.map_err(|_| {
                AppError::Internal(anyhow::anyhow!("chat worker stopped before replying"))
            })?;
        }
        Err(session_ended())
    }

    /// CloseSession: idempotent for sessions that already ended.
    pub async fn close_session(&self, token: &str) -> Result<(), AppError> {
        self.close_with(token, SessionEndReason::Closed).await
    }

    pub async fn transcript(&self, token: &str) -> Result<ChatSession, AppError> {
        self.inner
            .deps
            .records
            .get_session(token)
            .await?
            .ok_or_else(session_not_found)
    }

    /// Ends every active session of a portal. Returns how many were ended.
    pub async fn end_portal_sessions(&self, portal_id: Uuid) -> Result<usize, AppError> {
        let tokens = self.inner.deps.records.list_active_sessions(portal_id).await?;
        let mut ended = 0;
        for token in &tokens {
            match self.close_with(token, SessionEndReason::PortalSuspended).await {
                Ok(()) => ended += 1,
                Err(e) => warn!("Failed to end session on portal {portal_id}: {e}"),
            }
        }
        info!("Ended {ended} chat sessions on portal {portal_id}");
        Ok(ended)
    }

    /// Ends active sessions that have been quiet for `session_idle_timeout`
    /// and have no worker in this process. Returns how many were ended.
    pub async fn sweep_idle_sessions(&self) -> Result<usize, AppError> {
        let idle = chrono::Duration::milliseconds(
            i64::try_from(self.inner.config.session_idle_timeout.as_millis()).unwrap_or(i64::MAX),
        );
        let cutoff = Utc::now()
            .checked_sub_signed(idle)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let tokens = self.inner.deps.records.list_idle_sessions(cutoff).await?;

        let mut ended = 0;
        for token in tokens.iter().filter(|t| !self.inner.workers.contains_key(t.as_str())) {
            match self.end_session(token, SessionEndReason::Inactivity).await {
                Ok(()) => ended += 1,
                Err(e) => warn!("Failed to end idle chat session: {e}"),
            }
        }
        if ended > 0 {
            info!("Idle sweep ended {ended} chat sessions");
        }
        Ok(ended)
    }

    /// Runs the idle sweep every `every` for the life of the process.
    pub fn spawn_idle_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = manager.sweep_idle_sessions().await {
                    warn!("Idle session sweep failed: {e}");
                }
            }
        })
    }

    // ── Session workers ───────────────────────────────────────────────────

    /// Closing through the worker lets messages already queued finish first.
    async fn close_with(&self, token: &str, reason: SessionEndReason) -> Result<(), AppError> {
        let tx = self.inner.workers.get(token).map(|w| w.tx.clone());
        if let Some(tx) = tx {
            let (reply, response) = oneshot::channel();
            if tx.send(SessionCommand::Close { reason, reply }).await.is_ok() {
                if let Ok(result) = response.await {
                    return result;
                }
            }
        }
        self.end_session(token, reason).await
    }

    async fn ensure_worker(&self, token: &str) -> Result<mpsc::Sender<SessionCommand>, AppError> {
        let existing = self.inner.workers.get(token).map(|w| w.tx.clone());
        if let Some(tx) = existing {
            return Ok(tx);
        }

        let session = self
            .inner
            .deps
            .records
            .get_session(token)
            .await?
            .ok_or_else(session_not_found)?;
        if !session.is_active {
            return Err(session_ended());
        }

        let tx = match self.inner.workers.entry(token.to_string()) {
            Entry::Occupied(entry) => entry.get().tx.clone(),
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
                let id = self.inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
                entry.insert(SessionWorker { id, tx: tx.clone() });
                tokio::spawn(self.clone().run_worker(token.to_string(), id, rx));
                debug!("Started chat worker {id} for session {}", session.id);
                tx
            }
        };
        Ok(tx)
    }

    async fn run_worker(self, token: String, id: u64, mut rx: mpsc::Receiver<SessionCommand>) {
        let idle = self.inner.config.session_idle_timeout;
        loop {
            match tokio::time::timeout(idle, rx.recv()).await {
                Ok(Some(SessionCommand::Message { text, reply })) => {
                    let result = self.handle_message(&token, &text).await;
                    let _ = reply.send(result);
                }
                Ok(Some(SessionCommand::Close { reason, reply })) => {
                    let result = self.end_session(&token, reason).await;
                    let _ = reply.send(result);
                    self.retire_worker(&token, id, &mut rx);
                    return;
                }
                Ok(None) => return,
                Err(_) => {
                    if let Err(e) = self.end_session(&token, SessionEndReason::Inactivity).await {
                        warn!("Failed to end idle chat session: {e}");
                    }
                    self.retire_worker(&token, id, &mut rx);
                    return;
                }
            }
        }
    }

    /// Unregisters the worker and stops accepting commands. Commands that
    /// were already queued are answered as if the session had ended.
    fn retire_worker(&self, token: &str, id: u64, rx: &mut mpsc::Receiver<SessionCommand>) {
        self.inner.workers.remove_if(token, |_, worker| worker.id == id);
        rx.close();
        while let Ok(command) = rx.try_recv() {
            command.reject();
        }
    }

    async fn end_session(&self, token: &str, reason: SessionEndReason) -> Result<(), AppError> {
        let deps = &self.inner.deps;
        let session = deps
            .records
            .get_session(token)
            .await?
            .ok_or_else(session_not_found)?;
        if deps.records.end_session(token, reason).await? {
            info!("Chat session {} ended ({})", session.id, reason.as_str());
            deps.analytics.emit(
                CHAT_SESSION_ENDED,
                json!({
                    "portal_id": session.portal_id,
                    "session_id": session.id,
                    "reason": reason.as_str(),
                    "messages": session.message_count(),
                }),
            );
        }
        Ok(())
    }

    // ── Message handling ──────────────────────────────────────────────────

    async fn handle_message(&self, token: &str, text: &str) -> Result<ChatMessage, AppError> {
        let deps = &self.inner.deps;
        let config = &self.inner.config;

        let session = deps
            .records
            .get_session(token)
            .await?
            .ok_or_else(session_not_found)?;
        if !session.is_active {
            return Err(session_ended());
        }
        let portal = deps
            .records
            .get_portal(session.portal_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("portal {} not found", session.portal_id)))?;
        ensure_portal_serves_chat(&portal)?;

        let states = deps
            .quota
            .try_consume(&[
                QuotaKey {
                    scope: QuotaScope::Session,
                    id: session.id.to_string(),
                    limit: config.session_quota,
                    window: config.session_window,
                },
                QuotaKey {
                    scope: QuotaScope::Portal,
                    id: portal.id.to_string(),
                    limit: config.portal_quota,
                    window: config.portal_window,
                },
            ])
            .await?;
        let rate_limit = states
            .first()
            .copied()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("quota ledger returned no state")))?;

        let visitor = ChatMessage::visitor(text);
        let reply = match self.answer(&portal, &session, text).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Answering on session {} degraded: {e}", session.id);
                ChatMessage::assistant(DEGRADED_REPLY, Vec::new(), None, DeliveryStatus::Degraded)
            }
        };

        let update = SessionUpdate {
            rate_limit,
            last_query: text.to_string(),
            referenced_chunk_ids: reply.citations.iter().map(|c| c.chunk_id).collect(),
        };
        deps.records
            .append_exchange(token, &[visitor, reply.clone()], &update)
            .await?;

        deps.analytics.emit(
            CHAT_MESSAGE_ANSWERED,
            json!({
                "portal_id": portal.id,
                "session_id": session.id,
                "grounded": !reply.citations.is_empty(),
                "degraded": reply.delivery == DeliveryStatus::Degraded,
                "citations": reply.citations.len(),
                "confidence": reply.confidence,
            }),
        );
        Ok(reply)
    }

    /// Produces the assistant reply. Any error here means a dependency failed
    /// after retries and the caller degrades the reply.
    async fn answer(
        &self,
        portal: &PortalConfiguration,
        session: &ChatSession,
        text: &str,
    ) -> Result<ChatMessage, AppError> {
        let deps = &self.inner.deps;
        let config = &self.inner.config;

        let Some(generation_id) = portal.current_run_id else {
            return Ok(not_covered());
        };

        let embedder = deps.embedder.as_ref();
        let embed_timeout = config.embed_timeout;
        let query_embedding = self
            .inner
            .embed_retry
            .run("embed query", None, move |_| {
                with_timeout("embedding", embed_timeout, embedder.embed(text))
            })
            .await?;

        let filters = RetrievalFilters {
            portal_id: Some(portal.id),
            generation_id: Some(generation_id),
            ..RetrievalFilters::default()
        };
        let retrieval = &deps.retrieval;
        let retrieval_timeout = config.retrieval_timeout;
        let owner = portal.user_id;
        let top_k = config.retrieval_top_k;
        let embedding = query_embedding.as_slice();
        let filters_ref = &filters;
        let results = self
            .inner
            .chat_retry
            .run("retrieve", None, move |_| {
                with_timeout(
                    "retrieval",
                    retrieval_timeout,
                    retrieval.query(owner, embedding, filters_ref, top_k),
                )
            })
            .await?;

        if results.is_empty() {
            debug!("No grounding for question on portal {}", portal.id);
            return Ok(not_covered());
        }

        let window = assemble(&results, config.context_token_budget);
        let request = CompletionRequest {
            subject: portal.name.clone(),
            language: session.language.clone(),
            context: context_blocks(&window),
            history: history_window(&session.messages, config.history_turns, text),
        };

        let completion_timeout = config.completion_timeout;
        let semaphore = self.portal_permits(portal.id);
        let _permit = tokio::time::timeout(completion_timeout, semaphore.acquire_owned())
            .await
            .map_err(|_| AppError::transient("completion", "portal at completion capacity"))?
            .map_err(|_| AppError::Internal(anyhow::anyhow!("completion semaphore closed")))?;

        let completion_service = deps.completion.as_ref();
        let request_ref = &request;
        let completion = self
            .inner
            .chat_retry
            .run("complete", None, move |_| {
                with_timeout(
                    "completion",
                    completion_timeout,
                    completion_service.complete(request_ref),
                )
            })
            .await?;

        let (citations, confidence) = cite(&window, &completion.used_chunk_ids);
        Ok(ChatMessage::assistant(
            completion.text,
            citations,
            confidence,
            DeliveryStatus::Delivered,
        ))
    }

    /// Bounds concurrent completion calls per portal without serializing
    /// sessions on a shared lock.
    fn portal_permits(&self, portal_id: Uuid) -> Arc<Semaphore> {
        let permits = self.inner.config.portal_max_concurrent_completions.max(1);
        self.inner
            .portal_permits
            .entry(portal_id)
            .or_insert_with(|| Arc::new(Semaphore::new(permits)))
            .clone()
    }
}

fn not_covered() -> ChatMessage {
    ChatMessage::assistant(
        not_covered_reply(),
        Vec::new(),
        Some(0.0),
        DeliveryStatus::Delivered,
    )
}
