//! Rate-limit quotas for chat.
//!
//! Each key allows `limit` grants within any sliding `window`: a grant is
//! recorded with its timestamp and counts until it is `window` old. A message
//! consumes one unit from its session key and its portal key together, or from
//! neither. `reset_at` is when the oldest counted grant leaves the window.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::MultiplexedConnection;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::errors::{AppError, QuotaScope};
use crate::models::chat::RateLimitState;

#[derive(Debug, Clone)]
pub struct QuotaKey {
    pub scope: QuotaScope,
    pub id: String,
    pub limit: u32,
    pub window: Duration,
}

impl QuotaKey {
    fn storage_key(&self) -> String {
        format!("quota:{}:{}", self.scope.as_str(), self.id)
    }

    fn window_millis(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }
}

#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Atomically takes one unit from every key. On success returns each key's
    /// state after the grant, in key order; if any key is exhausted nothing
    /// is consumed and `RateLimitExceeded` names the first exhausted key.
    async fn try_consume(&self, keys: &[QuotaKey]) -> Result<Vec<RateLimitState>, AppError>;
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

// ────────────────────────────────────────────────────────────────────────────
// RedisQuotaLedger
// ────────────────────────────────────────────────────────────────────────────

/// One sorted set of grant timestamps per key. Trims, checks every key, then
/// records the grant on every key in one script, so concurrent messages for
/// the same session or portal cannot both pass a nearly exhausted quota.
///
/// Replies `{0, key_index, reset_ms}` on rejection and
/// `{1, remaining_1, reset_1, remaining_2, reset_2, ...}` on success.
const CONSUME_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local member = ARGV[2]
local function oldest(key)
  local first = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
  return tonumber(first[2]) or now
end
local counts = {}
for i = 1, #KEYS do
  local limit = tonumber(ARGV[2 * i + 1])
  local window = tonumber(ARGV[2 * i + 2])
  redis.call('ZREMRANGEBYSCORE', KEYS[i], '-inf', now - window)
  local count = redis.call('ZCARD', KEYS[i])
  if count >= limit then
    return {0, i, oldest(KEYS[i]) + window}
  end
  counts[i] = count
end
local out = {1}
for i = 1, #KEYS do
  local limit = tonumber(ARGV[2 * i + 1])
  local window = tonumber(ARGV[2 * i + 2])
  redis.call('ZADD', KEYS[i], now, member)
  redis.call('PEXPIRE', KEYS[i], window)
  table.insert(out, limit - counts[i] - 1)
  table.insert(out, oldest(KEYS[i]) + window)
end
return out
"#;

pub struct RedisQuotaLedger {
    client: redis::Client,
    conn: OnceCell<MultiplexedConnection>,
    script: redis::Script,
}

impl RedisQuotaLedger {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            conn: OnceCell::new(),
            script: redis::Script::new(CONSUME_SCRIPT),
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, AppError> {
        self.conn
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await
            .cloned()
            .map_err(|e| AppError::transient("quota", e.to_string()))
    }
}

#[async_trait]
impl QuotaLedger for RedisQuotaLedger {
    async fn try_consume(&self, keys: &[QuotaKey]) -> Result<Vec<RateLimitState>, AppError> {
        let mut conn = self.connection().await?;
        let mut invocation = self.script.prepare_invoke();
        invocation
            .arg(Utc::now().timestamp_millis())
            .arg(Uuid::new_v4().to_string());
        for key in keys {
            invocation
                .key(key.storage_key())
                .arg(key.limit)
                .arg(key.window_millis());
        }
        let reply: Vec<i64> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AppError::transient("quota", e.to_string()))?;

        parse_consume_reply(&reply, keys)
    }
}

/// Maps the script's reply onto per-key states or a rate-limit error.
fn parse_consume_reply(reply: &[i64], keys: &[QuotaKey]) -> Result<Vec<RateLimitState>, AppError> {
    match reply {
        [0, index, reset] => {
            let key = usize::try_from(*index - 1)
                .ok()
                .and_then(|i| keys.get(i))
                .ok_or_else(|| AppError::Internal(anyhow::anyhow!("bad quota reply {reply:?}")))?;
            Err(AppError::RateLimitExceeded {
                scope: key.scope,
                reset_at: millis_to_datetime(*reset),
            })
        }
        [1, states @ ..] if states.len() == keys.len() * 2 => Ok(states
            .chunks(2)
            .map(|pair| RateLimitState {
                remaining: u32::try_from(pair[0].max(0)).unwrap_or(0),
                reset_at: millis_to_datetime(pair[1]),
            })
            .collect()),
        _ => Err(AppError::Internal(anyhow::anyhow!(
            "unexpected quota script reply {reply:?}"
        ))),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// In-memory ledger (tests)
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub use memory::InMemoryQuotaLedger;
