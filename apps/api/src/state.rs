use crate::chat::ChatManager;
use crate::deployment::Deployer;
use crate::portals::PortalService;

/// Shared application state injected into all route handlers via Axum extractors.
/// Each service holds its collaborators as `Arc<dyn Trait>`, chosen in `main`.
#[derive(Clone)]
pub struct AppState {
    pub portals: PortalService,
    pub deployer: Deployer,
    pub chat: ChatManager,
}
