use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cancel::CancelFlag;
use crate::errors::AppError;

/// One file of a generated portal site, relative to the generation root.
#[derive(Debug, Clone)]
pub struct SiteAsset {
    pub path: String,
    pub content_type: &'static str,
    pub body: Bytes,
}

impl SiteAsset {
    pub fn sha256(&self) -> String {
        format!("{:x}", Sha256::digest(&self.body))
    }
}

/// The generation being published.
#[derive(Debug, Clone)]
pub struct RunTarget {
    pub portal_id: Uuid,
    pub run_id: Uuid,
    pub slug: String,
}

impl RunTarget {
    /// Every generation lives under its own prefix; nothing is overwritten in place.
    pub fn prefix(&self) -> String {
        format!("portals/{}/runs/{}", self.portal_id, self.run_id)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Trait definition
// ────────────────────────────────────────────────────────────────────────────

/// Where generated sites are uploaded, built, staged and promoted.
///
/// Calls make a single attempt; the orchestrator owns retries, phase budgets
/// and cancellation checks between assets.
#[async_trait]
pub trait PublishTarget: Send + Sync {
    async fn upload_asset(&self, target: &RunTarget, asset: &SiteAsset) -> Result<(), AppError>;

    /// Verifies the uploaded generation and writes its manifest. Checks
    /// `cancel` between assets.
    async fn build(
        &self,
        target: &RunTarget,
        assets: &[SiteAsset],
        cancel: &CancelFlag,
    ) -> Result<(), AppError>;

    /// Stages the built generation and returns the URL it can be previewed at.
    async fn deploy(&self, target: &RunTarget) -> Result<String, AppError>;

    /// Fetches `url` and reports whether it serves a page containing `marker`.
    async fn health_check(&self, url: &str, marker: &str) -> Result<bool, AppError>;

    /// Points the portal's public slug at `target`'s generation.
    async fn promote(&self, target: &RunTarget) -> Result<(), AppError>;
}

// ────────────────────────────────────────────────────────────────────────────
// S3PublishTarget
// ────────────────────────────────────────────────────────────────────────────

const DEPENDENCY: &str = "publish target";

fn unavailable(e: impl std::fmt::Display) -> AppError {
    AppError::transient(DEPENDENCY, e.to_string())
}

/// Publishes generations to an S3 bucket (MinIO locally). The slug pointer
/// `portals/{slug}/current.json` is the only object ever rewritten.
pub struct S3PublishTarget {
    s3: S3Client,
    bucket: String,
    public_base_url: String,
    http: reqwest::Client,
}

impl S3PublishTarget {
    pub fn new(s3: S3Client, bucket: String, public_base_url: String) -> anyhow::Result<Self> {
        Ok(Self {
            s3,
            bucket,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()?,
        })
    }

    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<(), AppError> {
        self.s3
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(unavailable)?;
        debug!("Uploaded s3://{}/{}", self.bucket, key);
        Ok(())
    }

    async fn object_size(&self, key: &str) -> Result<Option<i64>, AppError> {
        let head = self
            .s3
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(unavailable)?;
        Ok(head.content_length())
    }
}

#[async_trait]
impl PublishTarget for S3PublishTarget {
    async fn upload_asset(&self, target: &RunTarget, asset: &SiteAsset) -> Result<(), AppError> {
        let key = format!("{}/{}", target.prefix(), asset.path);
        self.put(&key, asset.body.clone(), asset.content_type).await
    }

    async fn build(
        &self,
        target: &RunTarget,
        assets: &[SiteAsset],
        cancel: &CancelFlag,
    ) -> Result<(), AppError> {
        let mut files = Vec::with_capacity(assets.len());
        for asset in assets {
            cancel.check()?;
            let key = format!("{}/{}", target.prefix(), asset.path);
            let size = self.object_size(&key).await?;
            if size != Some(asset.body.len() as i64) {
                return Err(AppError::transient(
                    DEPENDENCY,
                    format!("{key} is incomplete ({size:?} of {} bytes)", asset.body.len()),
                ));
            }
            files.push(json!({
                "path": asset.path,
                "sha256": asset.sha256(),
                "bytes": asset.body.len(),
            }));
        }

        cancel.check()?;
        let manifest = json!({
            "portal_id": target.portal_id,
            "run_id": target.run_id,
            "slug": target.slug,
            "files": files,
        });
        self.put(
            &format!("{}/manifest.json", target.prefix()),
            Bytes::from(manifest.to_string()),
            "application/json",
        )
        .await
    }

    async fn deploy(&self, target: &RunTarget) -> Result<String, AppError> {
        let manifest_key = format!("{}/manifest.json", target.prefix());
        if self.object_size(&manifest_key).await?.is_none() {
            return Err(AppError::transient(
                DEPENDENCY,
                format!("{manifest_key} missing after build"),
            ));
        }
        Ok(format!("{}/{}/index.html", self.public_base_url, target.prefix()))
    }

    async fn health_check(&self, url: &str, marker: &str) -> Result<bool, AppError> {
        let response = self.http.get(url).send().await.map_err(unavailable)?;
        if !response.status().is_success() {
            info!("Health check of {url} returned {}", response.status());
            return Ok(false);
        }
        let body = response.text().await.map_err(unavailable)?;
        Ok(body.contains(marker))
    }

    async fn promote(&self, target: &RunTarget) -> Result<(), AppError> {
        let pointer = json!({
            "portal_id": target.portal_id,
            "run_id": target.run_id,
            "root": format!("{}/", target.prefix()),
            "promoted_at": Utc::now(),
        });
        self.put(
            &format!("portals/{}/current.json", target.slug),
            Bytes::from(pointer.to_string()),
            "application/json",
        )
        .await?;
        info!(
            "Portal {} now serves generation {}",
            target.portal_id, target.run_id
        );
        Ok(())
    }
}
