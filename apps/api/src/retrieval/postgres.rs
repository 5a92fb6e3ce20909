use async_trait::async_trait;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::chunk::{ContentChunk, ContentType, ScoredChunk};

use super::store::{ChunkFilter, GenerationScope, VectorStore};
use super::{cosine_similarity, rank};

/// Chunks live in `content_chunks` with the embedding as a `REAL[]` column.
/// Filtering happens in SQL; cosine scoring happens here.
#[derive(Clone)]
pub struct PgVectorStore {
    pool: PgPool,
}

impl PgVectorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct ChunkRow {
    id: Uuid,
    user_id: Uuid,
    portal_id: Option<Uuid>,
    generation_id: Option<Uuid>,
    section: String,
    ordinal: i32,
    text: String,
    content_hash: String,
    embedding: Vec<f32>,
    importance: f32,
    token_count: i32,
    content_type: String,
}

const CHUNK_COLUMNS: &str = "id, user_id, portal_id, generation_id, section, ordinal, text, \
     content_hash, embedding, importance, token_count, content_type";

impl TryFrom<ChunkRow> for ContentChunk {
    type Error = AppError;

    fn try_from(row: ChunkRow) -> Result<Self, AppError> {
        Ok(ContentChunk {
            id: row.id,
            user_id: row.user_id,
            portal_id: row.portal_id,
            generation_id: row.generation_id,
            section: row.section,
            ordinal: row.ordinal.max(0) as u32,
            text: row.text,
            content_hash: row.content_hash,
            embedding: row.embedding,
            importance: row.importance,
            token_count: row.token_count.max(0) as u32,
            content_type: ContentType::parse(&row.content_type)?,
        })
    }
}

/// Appends the WHERE clause shared by query and delete.
fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &ChunkFilter) {
    builder.push(" WHERE user_id = ");
    builder.push_bind(filter.user_id);
    if let Some(portal_id) = filter.portal_id {
        builder.push(" AND portal_id = ");
        builder.push_bind(portal_id);
    }
    match filter.generation {
        Some(GenerationScope::Only(id)) => {
            builder.push(" AND generation_id = ");
            builder.push_bind(id);
        }
        Some(GenerationScope::Except(id)) => {
            builder.push(" AND generation_id IS DISTINCT FROM ");
            builder.push_bind(id);
        }
        None => {}
    }
    if !filter.content_types.is_empty() {
        let types: Vec<String> = filter
            .content_types
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        builder.push(" AND content_type = ANY(");
        builder.push_bind(types);
        builder.push(")");
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn insert(&self, chunks: &[ContentChunk]) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO content_chunks
                    (id, user_id, portal_id, generation_id, section, ordinal, text,
                     content_hash, embedding, importance, token_count, content_type)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(chunk.id)
            .bind(chunk.user_id)
            .bind(chunk.portal_id)
            .bind(chunk.generation_id)
            .bind(&chunk.section)
            .bind(chunk.ordinal as i32)
            .bind(&chunk.text)
            .bind(&chunk.content_hash)
            .bind(&chunk.embedding)
            .bind(chunk.importance)
            .bind(chunk.token_count as i32)
            .bind(chunk.content_type.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        filter: &ChunkFilter,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, AppError> {
        let mut builder = QueryBuilder::new(format!("SELECT {CHUNK_COLUMNS} FROM content_chunks"));
        push_filter(&mut builder, filter);
        let rows: Vec<ChunkRow> = builder.build_query_as().fetch_all(&self.pool).await?;

        let mut results = rows
            .into_iter()
            .map(|row| {
                let chunk = ContentChunk::try_from(row)?;
                Ok(ScoredChunk {
                    similarity: cosine_similarity(embedding, &chunk.embedding),
                    chunk,
                })
            })
            .collect::<Result<Vec<_>, AppError>>()?;
        rank(&mut results);
        results.truncate(k);
        Ok(results)
    }

    async fn delete(&self, filter: &ChunkFilter) -> Result<u64, AppError> {
        let mut builder = QueryBuilder::new("DELETE FROM content_chunks");
        push_filter(&mut builder, filter);
        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
