use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

pub const DEPLOYMENT_STARTED: &str = "deployment.started";
pub const DEPLOYMENT_COMPLETED: &str = "deployment.completed";
pub const DEPLOYMENT_FAILED: &str = "deployment.failed";
pub const PORTAL_VIEWED: &str = "portal.viewed";
pub const CHAT_SESSION_OPENED: &str = "chat.session_opened";
pub const CHAT_MESSAGE_ANSWERED: &str = "chat.message_answered";
pub const CHAT_SESSION_ENDED: &str = "chat.session_ended";

/// Fire-and-forget event sink. `emit` never blocks and never fails the caller.
pub trait AnalyticsSink: Send + Sync {
    fn emit(&self, event_type: &str, payload: Value);
}

/// Appends events to a Redis stream from a spawned task.
pub struct RedisAnalyticsSink {
    client: redis::Client,
    stream: String,
}

impl RedisAnalyticsSink {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            stream: "portal:events".to_string(),
        }
    }
}

impl AnalyticsSink for RedisAnalyticsSink {
    fn emit(&self, event_type: &str, payload: Value) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("Dropping analytics event {event_type}: no runtime");
            return;
        };
        let client = self.client.clone();
        let stream = self.stream.clone();
        let event_type = event_type.to_string();

        handle.spawn(async move {
            let mut conn = match client.get_multiplexed_async_connection().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Analytics sink unavailable, dropping {event_type}: {e}");
                    return;
                }
            };
            let result: redis::RedisResult<String> = redis::cmd("XADD")
                .arg(&stream)
                .arg("MAXLEN")
                .arg("~")
                .arg(100_000)
                .arg("*")
                .arg("type")
                .arg(&event_type)
                .arg("payload")
                .arg(payload.to_string())
                .arg("at")
                .arg(Utc::now().to_rfc3339())
                .query_async(&mut conn)
                .await;
            match result {
                Ok(id) => debug!("Analytics event {event_type} recorded as {id}"),
                Err(e) => warn!("Failed to record analytics event {event_type}: {e}"),
            }
        });
    }
}
