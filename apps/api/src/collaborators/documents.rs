use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::document::{DocumentSection, StructuredDocument};

/// Read-only access to parsed résumés.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn get_structured_document(
        &self,
        document_id: Uuid,
    ) -> Result<StructuredDocument, AppError>;
}

/// Reads the `sections` JSON written by document ingestion.
pub struct PgDocumentSource {
    pool: PgPool,
}

impl PgDocumentSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentSource for PgDocumentSource {
    async fn get_structured_document(
        &self,
        document_id: Uuid,
    ) -> Result<StructuredDocument, AppError> {
        let sections: Option<Json<Vec<DocumentSection>>> =
            sqlx::query_scalar("SELECT sections FROM documents WHERE id = $1")
                .bind(document_id)
                .fetch_optional(&self.pool)
                .await?;
        let Json(sections) = sections
            .ok_or_else(|| AppError::NotFound(format!("document {document_id} not found")))?;
        Ok(StructuredDocument {
            document_id,
            sections,
        })
    }
}
