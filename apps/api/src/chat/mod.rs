//! Chat Session Manager: visitor conversations answered from retrieved
//! résumé content.

pub mod completion;
pub mod context_window;
pub mod handlers;
pub mod manager;
pub mod prompts;
pub mod quota;

pub use completion::CompletionService;
pub use manager::{ChatDeps, ChatManager};
pub use quota::{QuotaLedger, RedisQuotaLedger};
