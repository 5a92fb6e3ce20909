//! Narrow interfaces to systems this service consumes but does not own:
//! entitlements, parsed documents and the analytics stream.

pub mod analytics;
pub mod documents;
pub mod entitlement;

pub use analytics::{AnalyticsSink, RedisAnalyticsSink};
pub use documents::{DocumentSource, PgDocumentSource};
pub use entitlement::{require_capability, EntitlementChecker, TierEntitlements, PORTAL_CAPABILITY};
