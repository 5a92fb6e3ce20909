//! Deployment Orchestrator: builds a portal generation from the owner's
//! résumé, publishes it and swaps it in once it passes its health check.

pub mod handlers;
pub mod orchestrator;
pub mod publish;
pub mod site;

pub use orchestrator::{Deployer, DeployerDeps};
pub use publish::{PublishTarget, S3PublishTarget};
