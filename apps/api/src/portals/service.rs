//! Portal management: owner-side lifecycle and the public lookup.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::chat::ChatManager;
use crate::collaborators::analytics::PORTAL_VIEWED;
use crate::collaborators::{
    require_capability, AnalyticsSink, EntitlementChecker, PORTAL_CAPABILITY,
};
use crate::errors::AppError;
use crate::models::portal::{
    validate_slug, PortalConfiguration, PortalCounter, PortalFeatures, PortalStatus, Visibility,
};
use crate::store::RecordStore;

const NAME_MAX: usize = 120;

#[derive(Debug, Deserialize)]
pub struct NewPortal {
    pub user_id: Uuid,
    pub document_id: Uuid,
    pub name: String,
    pub slug: String,
}

/// Owner edit. Absent fields keep their current value.
#[derive(Debug, Default, Deserialize)]
pub struct PortalSettingsPatch {
    pub name: Option<String>,
    pub visibility: Option<Visibility>,
    pub sections: Option<Vec<String>>,
    pub theme: Option<String>,
    pub features: Option<PortalFeatures>,
}

/// What an anonymous visitor learns about a portal.
#[derive(Debug, Serialize)]
pub struct PublicPortal {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub url: String,
    pub theme: String,
    pub features: PortalFeatures,
    pub generation_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct PortalService {
    records: Arc<dyn RecordStore>,
    entitlements: Arc<dyn EntitlementChecker>,
    analytics: Arc<dyn AnalyticsSink>,
    chat: ChatManager,
    public_base_url: String,
}

fn portal_not_found(id: Uuid) -> AppError {
    AppError::NotFound(format!("portal {id} not found"))
}

fn validate_name(name: &str) -> Result<String, AppError> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > NAME_MAX {
        return Err(AppError::Validation(format!(
            "portal name must be 1-{NAME_MAX} characters"
        )));
    }
    Ok(name.to_string())
}

fn validate_theme(theme: &str) -> Result<String, AppError> {
    let theme = theme.trim();
    if theme.is_empty()
        || !theme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(AppError::Validation(format!("invalid theme '{theme}'")));
    }
    Ok(theme.to_string())
}

impl PortalService {
    pub fn new(
        records: Arc<dyn RecordStore>,
        entitlements: Arc<dyn EntitlementChecker>,
        analytics: Arc<dyn AnalyticsSink>,
        chat: ChatManager,
        public_base_url: String,
    ) -> Self {
        Self {
            records,
            entitlements,
            analytics,
            chat,
            public_base_url,
        }
    }

    pub async fn create(&self, new: NewPortal) -> Result<PortalConfiguration, AppError> {
        let name = validate_name(&new.name)?;
        let slug = new.slug.trim().to_ascii_lowercase();
        validate_slug(&slug)?;
        require_capability(self.entitlements.as_ref(), new.user_id, PORTAL_CAPABILITY).await?;

        let portal = PortalConfiguration::new_draft(new.user_id, new.document_id, name, slug);
        self.records.insert_portal(&portal).await?;
        info!("Created portal {} ('{}') for user {}", portal.id, portal.slug, portal.user_id);
        Ok(portal)
    }

    pub async fn get(&self, id: Uuid) -> Result<PortalConfiguration, AppError> {
        self.records
            .get_portal(id)
            .await?
            .ok_or_else(|| portal_not_found(id))
    }

    pub async fn list(&self, user_id: Uuid) -> Result<Vec<PortalConfiguration>, AppError> {
        self.records.list_portals(user_id).await
    }

    /// Settings take effect for visitors on the next deployment; visibility
    /// and chat enablement take effect immediately.
    pub async fn update_settings(
        &self,
        id: Uuid,
        patch: PortalSettingsPatch,
    ) -> Result<PortalConfiguration, AppError> {
        let mut portal = self.get(id).await?;
        if portal.status == PortalStatus::Expired {
            return Err(AppError::StateConflict(format!("portal {id} has expired")));
        }

        if let Some(name) = patch.name {
            portal.name = validate_name(&name)?;
        }
        if let Some(visibility) = patch.visibility {
            portal.visibility = visibility;
        }
        if let Some(sections) = patch.sections {
            portal.sections = sections
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(theme) = patch.theme {
            portal.theme = validate_theme(&theme)?;
        }
        if let Some(features) = patch.features {
            portal.features = features;
        }

        self.records.update_portal_settings(&portal).await?;
        self.get(id).await
    }

    /// Takes an active portal offline and ends every live chat session on it.
    pub async fn suspend(&self, id: Uuid) -> Result<PortalConfiguration, AppError> {
        let portal = self
            .records
            .set_portal_status(id, &[PortalStatus::Active], PortalStatus::Suspended)
            .await?;
        let ended = self.chat.end_portal_sessions(id).await?;
        info!("Suspended portal {id}; ended {ended} chat sessions");
        Ok(portal)
    }

    pub async fn resume(&self, id: Uuid) -> Result<PortalConfiguration, AppError> {
        let portal = self
            .records
            .set_portal_status(id, &[PortalStatus::Suspended], PortalStatus::Active)
            .await?;
        info!("Resumed portal {id}");
        Ok(portal)
    }

    /// Soft-expire. Terminal; the record and its history stay.
    pub async fn expire(&self, id: Uuid) -> Result<PortalConfiguration, AppError> {
        let portal = self
            .records
            .set_portal_status(
                id,
                &[
                    PortalStatus::Draft,
                    PortalStatus::Generating,
                    PortalStatus::Active,
                    PortalStatus::Failed,
                    PortalStatus::Suspended,
                ],
                PortalStatus::Expired,
            )
            .await?;
        let ended = self.chat.end_portal_sessions(id).await?;
        info!("Expired portal {id}; ended {ended} chat sessions");
        Ok(portal)
    }

    /// Visitor-facing lookup. Anything a visitor may not see is reported as
    /// missing.
    pub async fn public_lookup(&self, slug: &str) -> Result<PublicPortal, AppError> {
        let not_found = || AppError::NotFound(format!("portal '{slug}' not found"));
        let portal = self
            .records
            .get_portal_by_slug(slug)
            .await?
            .ok_or_else(not_found)?;
        if portal.status != PortalStatus::Active || !portal.visibility.is_visitor_facing() {
            return Err(not_found());
        }

        self.records
            .increment_counter(portal.id, PortalCounter::Views)
            .await?;
        self.analytics.emit(
            PORTAL_VIEWED,
            json!({ "portal_id": portal.id, "generation_id": portal.current_run_id }),
        );

        Ok(PublicPortal {
            id: portal.id,
            url: format!("{}/{}", self.public_base_url.trim_end_matches('/'), portal.slug),
            name: portal.name,
            slug: portal.slug,
            theme: portal.theme,
            features: portal.features,
            generation_id: portal.current_run_id,
        })
    }
}
