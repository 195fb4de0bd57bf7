use crate::database::DbPool;
use crate::document::PromotionLevel;
use crate::tenant::TenantFilter;
use crate::utils::error::ApiError;
use async_trait::async_trait;
use pgvector::Vector;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

/// Metadata attached to every indexed vector. The full tenant triple is
/// mandatory so searches can filter at the storage layer.
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub file_path: String,
    pub chunk_index: i32,
    pub promotion_level: PromotionLevel,
    pub tenant: TenantFilter,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorHit {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub file_path: String,
    pub chunk_index: i32,
    pub promotion_level: String,
    /// Cosine similarity in [0, 1], higher is closer.
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct VectorSearchFilter {
    pub tenant: TenantFilter,
    pub promotion_floor: Option<PromotionLevel>,
    pub min_score: Option<f32>,
}

impl VectorSearchFilter {
    pub fn tenant_only(tenant: TenantFilter) -> Self {
        Self {
            tenant,
            promotion_floor: None,
            min_score: None,
        }
    }

    fn allowed_levels(&self) -> Vec<String> {
        let floor = self.promotion_floor.unwrap_or(PromotionLevel::Standard);
        [
            PromotionLevel::Standard,
            PromotionLevel::Important,
            PromotionLevel::Critical,
        ]
        .iter()
        .filter(|level| **level >= floor)
        .map(|level| level.as_str().to_string())
        .collect()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn index(&self, entry: VectorEntry) -> Result<(), ApiError>;

    async fn bulk_index(&self, entries: Vec<VectorEntry>) -> Result<(), ApiError>;

    /// Must honour the tenant filter so one tenant cannot evict another's
    /// vectors for a colliding document id.
    async fn delete_by_document(
        &self,
        document_id: Uuid,
        tenant: &TenantFilter,
    ) -> Result<u64, ApiError>;

    /// Promotion changes are metadata-only; vectors are never re-embedded
    /// for them, but their stored level must follow the document.
    async fn update_promotion(
        &self,
        document_id: Uuid,
        tenant: &TenantFilter,
        level: PromotionLevel,
    ) -> Result<u64, ApiError>;

    /// k-NN by cosine similarity; results are sorted by score descending
    /// and contain no duplicate chunk ids.
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &VectorSearchFilter,
    ) -> Result<Vec<VectorHit>, ApiError>;
}

/// pgvector-backed adapter over the shared connection pool.
pub struct PgVectorStore {
    pool: DbPool,
}

impl PgVectorStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn index(&self, entry: VectorEntry) -> Result<(), ApiError> {
        self.bulk_index(vec![entry]).await
    }

    async fn bulk_index(&self, entries: Vec<VectorEntry>) -> Result<(), ApiError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut transaction = self
            .pool
            .get_pool()
            .begin()
            .await
            .map_err(|e| ApiError::StorageFailed(e.to_string()))?;

        let count = entries.len();
        for entry in entries {
            sqlx::query(
                r#"INSERT INTO chunk_vectors
                       (chunk_id, document_id, project_name, branch_name, path_hash,
                        file_path, chunk_index, promotion_level, embedding)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                   ON CONFLICT (chunk_id) DO UPDATE SET
                       embedding = EXCLUDED.embedding,
                       promotion_level = EXCLUDED.promotion_level,
                       file_path = EXCLUDED.file_path"#,
            )
            .bind(entry.chunk_id)
            .bind(entry.document_id)
            .bind(&entry.tenant.project_name)
            .bind(&entry.tenant.branch_name)
            .bind(&entry.tenant.path_hash)
            .bind(&entry.file_path)
            .bind(entry.chunk_index)
            .bind(entry.promotion_level.as_str())
            .bind(Vector::from(entry.embedding))
            .execute(&mut *transaction)
            .await
            .map_err(|e| ApiError::StorageFailed(e.to_string()))?;
        }

        transaction
            .commit()
            .await
            .map_err(|e| ApiError::StorageFailed(e.to_string()))?;

        debug!(vectors = count, "Indexed chunk vectors");
        Ok(())
    }

    async fn delete_by_document(
        &self,
        document_id: Uuid,
        tenant: &TenantFilter,
    ) -> Result<u64, ApiError> {
        let result = sqlx::query(
            r#"DELETE FROM chunk_vectors
               WHERE document_id = $1
                 AND project_name = $2 AND branch_name = $3 AND path_hash = $4"#,
        )
        .bind(document_id)
        .bind(&tenant.project_name)
        .bind(&tenant.branch_name)
        .bind(&tenant.path_hash)
        .execute(self.pool.get_pool())
        .await
        .map_err(|e| ApiError::StorageFailed(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn update_promotion(
        &self,
        document_id: Uuid,
        tenant: &TenantFilter,
        level: PromotionLevel,
    ) -> Result<u64, ApiError> {
        let result = sqlx::query(
            r#"UPDATE chunk_vectors SET promotion_level = $5
               WHERE document_id = $1
                 AND project_name = $2 AND branch_name = $3 AND path_hash = $4"#,
        )
        .bind(document_id)
        .bind(&tenant.project_name)
        .bind(&tenant.branch_name)
        .bind(&tenant.path_hash)
        .bind(level.as_str())
        .execute(self.pool.get_pool())
        .await
        .map_err(|e| ApiError::StorageFailed(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &VectorSearchFilter,
    ) -> Result<Vec<VectorHit>, ApiError> {
        #[derive(sqlx::FromRow)]
        struct Row {
            chunk_id: Uuid,
            document_id: Uuid,
            file_path: String,
            chunk_index: i32,
            promotion_level: String,
            score: f64,
        }

        let rows = sqlx::query_as::<_, Row>(
            r#"SELECT chunk_id, document_id, file_path, chunk_index, promotion_level,
                      1 - (embedding <=> $4) AS score
               FROM chunk_vectors
               WHERE project_name = $1 AND branch_name = $2 AND path_hash = $3
                 AND promotion_level = ANY($5)
               ORDER BY embedding <=> $4
               LIMIT $6"#,
        )
        .bind(&filter.tenant.project_name)
        .bind(&filter.tenant.branch_name)
        .bind(&filter.tenant.path_hash)
        .bind(Vector::from(query.to_vec()))
        .bind(filter.allowed_levels())
        .bind(top_k as i64)
        .fetch_all(self.pool.get_pool())
        .await
        .map_err(|e| ApiError::StorageFailed(e.to_string()))?;

        let min_score = filter.min_score.unwrap_or(f32::MIN);
        let hits = rows
            .into_iter()
            .map(|r| VectorHit {
                chunk_id: r.chunk_id,
                document_id: r.document_id,
                file_path: r.file_path,
                chunk_index: r.chunk_index,
                promotion_level: r.promotion_level,
                score: r.score as f32,
            })
            .filter(|hit| hit.score >= min_score)
            .collect();

        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_with_floor(floor: Option<PromotionLevel>) -> VectorSearchFilter {
        VectorSearchFilter {
            tenant: TenantFilter::new("proj", "main", "hash").unwrap(),
            promotion_floor: floor,
            min_score: None,
        }
    }

    #[test]
    fn promotion_floor_restricts_levels() {
        assert_eq!(
            filter_with_floor(None).allowed_levels(),
            vec!["standard", "important", "critical"]
        );
        assert_eq!(
            filter_with_floor(Some(PromotionLevel::Important)).allowed_levels(),
            vec!["important", "critical"]
        );
        assert_eq!(
            filter_with_floor(Some(PromotionLevel::Critical)).allowed_levels(),
            vec!["critical"]
        );
    }
}
