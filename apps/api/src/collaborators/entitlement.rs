use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::AppError;

/// Capability required to deploy a portal or serve it to visitors.
pub const PORTAL_CAPABILITY: &str = "portal";

#[async_trait]
pub trait EntitlementChecker: Send + Sync {
    async fn has_capability(&self, user_id: Uuid, capability: &str) -> Result<bool, AppError>;
}

/// Fails fast with `CapabilityDenied` when the user lacks `capability`.
pub async fn require_capability(
    checker: &dyn EntitlementChecker,
    user_id: Uuid,
    capability: &str,
) -> Result<(), AppError> {
    if checker.has_capability(user_id, capability).await? {
        Ok(())
    } else {
        Err(AppError::CapabilityDenied {
            capability: capability.to_string(),
        })
    }
}

/// Reads the subscription tier from `users.tier`. Portals come with every
/// paid tier; unknown users have no capabilities.
pub struct TierEntitlements {
    pool: PgPool,
}

impl TierEntitlements {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn tier_grants(tier: &str, capability: &str) -> bool {
    match capability {
        PORTAL_CAPABILITY => !tier.eq_ignore_ascii_case("free"),
        _ => false,
    }
}

#[async_trait]
impl EntitlementChecker for TierEntitlements {
    async fn has_capability(&self, user_id: Uuid, capability: &str) -> Result<bool, AppError> {
        let tier: Option<String> = sqlx::query_scalar("SELECT tier FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(tier.is_some_and(|t| tier_grants(&t, capability)))
    }
}
