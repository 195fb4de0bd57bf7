use super::models::{BranchRecord, ChunkRecord, DocTypeRecord, DocumentRecord, RepoPathRecord};
use super::DbPool;
use crate::tenant::TenantFilter;
use anyhow::Result;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

/// Tenant-scoped CRUD over documents, chunks, repo paths, branches and
/// custom doc types. Every query is constrained by the full tenant triple;
/// callers cannot widen the scope from here.
pub struct Repository {
    pool: DbPool,
}

pub struct DocumentUpsert<'a> {
    pub id: Uuid,
    pub file_path: &'a str,
    pub title: &'a str,
    pub doc_type: &'a str,
    pub promotion_level: &'a str,
    pub frontmatter: &'a JsonValue,
    pub body_hash: &'a str,
    pub commit_hash: Option<&'a str>,
    pub embedding: Option<Vector>,
}

pub struct ChunkInsert<'a> {
    pub id: Uuid,
    pub chunk_index: i32,
    pub header_path: &'a [String],
    pub start_line: i32,
    pub end_line: i32,
    pub content: &'a str,
    pub content_hash: &'a str,
}

impl Repository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    // ------------------------------------------------------------------
    // Repo paths & branches
    // ------------------------------------------------------------------

    /// Upsert keyed by (project, path_hash); refreshes `last_accessed_at`
    /// on every call.
    pub async fn get_or_create_repo_path(
        &self,
        filter: &TenantFilter,
        absolute_path: &str,
    ) -> Result<RepoPathRecord> {
        let record = sqlx::query_as::<_, RepoPathRecord>(
            r#"INSERT INTO repo_paths (id, project_name, path_hash, absolute_path, last_accessed_at, created_at)
               VALUES ($1, $2, $3, $4, now(), now())
               ON CONFLICT (project_name, path_hash)
               DO UPDATE SET last_accessed_at = now(), absolute_path = EXCLUDED.absolute_path
               RETURNING id, project_name, path_hash, absolute_path, last_accessed_at, created_at"#,
        )
        .bind(Uuid::new_v4())
        .bind(&filter.project_name)
        .bind(&filter.path_hash)
        .bind(absolute_path)
        .fetch_one(self.pool.get_pool())
        .await?;

        Ok(record)
    }

    pub async fn get_or_create_branch(&self, filter: &TenantFilter) -> Result<BranchRecord> {
        let record = sqlx::query_as::<_, BranchRecord>(
            r#"INSERT INTO branches (id, project_name, path_hash, branch_name, created_at)
               VALUES ($1, $2, $3, $4, now())
               ON CONFLICT (project_name, path_hash, branch_name)
               DO UPDATE SET branch_name = EXCLUDED.branch_name
               RETURNING id, project_name, path_hash, branch_name, created_at"#,
        )
        .bind(Uuid::new_v4())
        .bind(&filter.project_name)
        .bind(&filter.path_hash)
        .bind(&filter.branch_name)
        .fetch_one(self.pool.get_pool())
        .await?;

        Ok(record)
    }

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    pub async fn get_document(
        &self,
        filter: &TenantFilter,
        file_path: &str,
    ) -> Result<Option<DocumentRecord>> {
        let record = sqlx::query_as::<_, DocumentRecord>(
            r#"SELECT id, project_name, branch_name, path_hash, file_path, title, doc_type,
                      promotion_level, frontmatter, body_hash, commit_hash, embedding,
                      created_at, updated_at
               FROM documents
               WHERE project_name = $1 AND branch_name = $2 AND path_hash = $3
                 AND file_path = $4"#,
        )
        .bind(&filter.project_name)
        .bind(&filter.branch_name)
        .bind(&filter.path_hash)
        .bind(file_path)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(record)
    }

    pub async fn get_all_documents(&self, filter: &TenantFilter) -> Result<Vec<DocumentRecord>> {
        let records = sqlx::query_as::<_, DocumentRecord>(
            r#"SELECT id, project_name, branch_name, path_hash, file_path, title, doc_type,
                      promotion_level, frontmatter, body_hash, commit_hash, embedding,
                      created_at, updated_at
               FROM documents
               WHERE project_name = $1 AND branch_name = $2 AND path_hash = $3
               ORDER BY file_path"#,
        )
        .bind(&filter.project_name)
        .bind(&filter.branch_name)
        .bind(&filter.path_hash)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(records)
    }

    pub async fn get_file_paths(&self, filter: &TenantFilter) -> Result<Vec<String>> {
        let paths = sqlx::query_scalar::<_, String>(
            r#"SELECT file_path FROM documents
               WHERE project_name = $1 AND branch_name = $2 AND path_hash = $3
               ORDER BY file_path"#,
        )
        .bind(&filter.project_name)
        .bind(&filter.branch_name)
        .bind(&filter.path_hash)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(paths)
    }

    pub async fn get_stale_documents(
        &self,
        filter: &TenantFilter,
        before: DateTime<Utc>,
    ) -> Result<Vec<DocumentRecord>> {
        let records = sqlx::query_as::<_, DocumentRecord>(
            r#"SELECT id, project_name, branch_name, path_hash, file_path, title, doc_type,
                      promotion_level, frontmatter, body_hash, commit_hash, embedding,
                      created_at, updated_at
               FROM documents
               WHERE project_name = $1 AND branch_name = $2 AND path_hash = $3
                 AND updated_at < $4
               ORDER BY updated_at"#,
        )
        .bind(&filter.project_name)
        .bind(&filter.branch_name)
        .bind(&filter.path_hash)
        .bind(before)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(records)
    }

    /// Transactional boundary for "upsert document + replace chunks".
    /// The upsert is a compare-and-set on `(tenant, file_path)` so two
    /// racing indexers converge on a single row.
    pub async fn store_document_with_chunks(
        &self,
        filter: &TenantFilter,
        document: DocumentUpsert<'_>,
        chunks: &[ChunkInsert<'_>],
    ) -> Result<Uuid> {
        let mut transaction = self.pool.get_pool().begin().await?;

        let document_id = sqlx::query_scalar::<_, Uuid>(
            r#"INSERT INTO documents
                   (id, project_name, branch_name, path_hash, file_path, title, doc_type,
                    promotion_level, frontmatter, body_hash, commit_hash, embedding,
                    created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, now(), now())
               ON CONFLICT (project_name, branch_name, path_hash, file_path)
               DO UPDATE SET
                   title = EXCLUDED.title,
                   doc_type = EXCLUDED.doc_type,
                   promotion_level = EXCLUDED.promotion_level,
                   frontmatter = EXCLUDED.frontmatter,
                   body_hash = EXCLUDED.body_hash,
                   commit_hash = EXCLUDED.commit_hash,
                   embedding = EXCLUDED.embedding,
                   updated_at = now()
               RETURNING id"#,
        )
        .bind(document.id)
        .bind(&filter.project_name)
        .bind(&filter.branch_name)
        .bind(&filter.path_hash)
        .bind(document.file_path)
        .bind(document.title)
        .bind(document.doc_type)
        .bind(document.promotion_level)
        .bind(document.frontmatter)
        .bind(document.body_hash)
        .bind(document.commit_hash)
        .bind(document.embedding)
        .fetch_one(&mut *transaction)
        .await?;

        sqlx::query("DELETE FROM document_chunks WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *transaction)
            .await?;

        for chunk in chunks {
            sqlx::query(
                r#"INSERT INTO document_chunks
                       (id, document_id, chunk_index, header_path, start_line, end_line,
                        content, content_hash)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
            )
            .bind(chunk.id)
            .bind(document_id)
            .bind(chunk.chunk_index)
            .bind(chunk.header_path)
            .bind(chunk.start_line)
            .bind(chunk.end_line)
            .bind(chunk.content)
            .bind(chunk.content_hash)
            .execute(&mut *transaction)
            .await?;
        }

        transaction.commit().await?;
        debug!(
            document_id = %document_id,
            chunks = chunks.len(),
            "Stored document with chunks"
        );

        Ok(document_id)
    }

    /// Metadata-only update for the unchanged-body fast path; chunks and
    /// embeddings are left untouched.
    pub async fn update_document_metadata(
        &self,
        filter: &TenantFilter,
        file_path: &str,
        title: &str,
        doc_type: &str,
        promotion_level: &str,
        frontmatter: &JsonValue,
        commit_hash: Option<&str>,
    ) -> Result<Option<Uuid>> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"UPDATE documents
               SET title = $5, doc_type = $6, promotion_level = $7, frontmatter = $8,
                   commit_hash = COALESCE($9, commit_hash), updated_at = now()
               WHERE project_name = $1 AND branch_name = $2 AND path_hash = $3
                 AND file_path = $4
               RETURNING id"#,
        )
        .bind(&filter.project_name)
        .bind(&filter.branch_name)
        .bind(&filter.path_hash)
        .bind(file_path)
        .bind(title)
        .bind(doc_type)
        .bind(promotion_level)
        .bind(frontmatter)
        .bind(commit_hash)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(id)
    }

    /// Returns (previous, new) promotion level when the document exists.
    pub async fn update_promotion_level(
        &self,
        filter: &TenantFilter,
        file_path: &str,
        level: &str,
    ) -> Result<Option<(String, String)>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            previous: String,
        }

        let row = sqlx::query_as::<_, Row>(
            r#"UPDATE documents d
               SET promotion_level = $5, updated_at = now()
               FROM (SELECT id, promotion_level AS previous FROM documents
                     WHERE project_name = $1 AND branch_name = $2 AND path_hash = $3
                       AND file_path = $4) old
               WHERE d.id = old.id
               RETURNING old.previous"#,
        )
        .bind(&filter.project_name)
        .bind(&filter.branch_name)
        .bind(&filter.path_hash)
        .bind(file_path)
        .bind(level)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(row.map(|r| (r.previous, level.to_string())))
    }

    /// Deletes the document row and its chunks; returns the id when a row
    /// existed. Chunk rows go via ON DELETE CASCADE.
    pub async fn delete_document(
        &self,
        filter: &TenantFilter,
        file_path: &str,
    ) -> Result<Option<Uuid>> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"DELETE FROM documents
               WHERE project_name = $1 AND branch_name = $2 AND path_hash = $3
                 AND file_path = $4
               RETURNING id"#,
        )
        .bind(&filter.project_name)
        .bind(&filter.branch_name)
        .bind(&filter.path_hash)
        .bind(file_path)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(id)
    }

    pub async fn delete_all_documents(&self, filter: &TenantFilter) -> Result<u64> {
        let result = sqlx::query(
            r#"DELETE FROM documents
               WHERE project_name = $1 AND branch_name = $2 AND path_hash = $3"#,
        )
        .bind(&filter.project_name)
        .bind(&filter.branch_name)
        .bind(&filter.path_hash)
        .execute(self.pool.get_pool())
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn count_documents(&self, filter: &TenantFilter) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"SELECT count(*) FROM documents
               WHERE project_name = $1 AND branch_name = $2 AND path_hash = $3"#,
        )
        .bind(&filter.project_name)
        .bind(&filter.branch_name)
        .bind(&filter.path_hash)
        .fetch_one(self.pool.get_pool())
        .await?;

        Ok(count)
    }

    pub async fn count_chunks(&self, filter: &TenantFilter) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"SELECT count(*) FROM document_chunks c
               JOIN documents d ON d.id = c.document_id
               WHERE d.project_name = $1 AND d.branch_name = $2 AND d.path_hash = $3"#,
        )
        .bind(&filter.project_name)
        .bind(&filter.branch_name)
        .bind(&filter.path_hash)
        .fetch_one(self.pool.get_pool())
        .await?;

        Ok(count)
    }

    // ------------------------------------------------------------------
    // Chunks
    // ------------------------------------------------------------------

    pub async fn get_chunks(&self, document_id: Uuid) -> Result<Vec<ChunkRecord>> {
        let chunks = sqlx::query_as::<_, ChunkRecord>(
            r#"SELECT id, document_id, chunk_index, header_path, start_line, end_line,
                      content, content_hash
               FROM document_chunks
               WHERE document_id = $1
               ORDER BY chunk_index"#,
        )
        .bind(document_id)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(chunks)
    }

    pub async fn get_chunk(&self, chunk_id: Uuid) -> Result<Option<ChunkRecord>> {
        let chunk = sqlx::query_as::<_, ChunkRecord>(
            r#"SELECT id, document_id, chunk_index, header_path, start_line, end_line,
                      content, content_hash
               FROM document_chunks
               WHERE id = $1"#,
        )
        .bind(chunk_id)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(chunk)
    }

    pub async fn get_document_by_id(&self, document_id: Uuid) -> Result<Option<DocumentRecord>> {
        let record = sqlx::query_as::<_, DocumentRecord>(
            r#"SELECT id, project_name, branch_name, path_hash, file_path, title, doc_type,
                      promotion_level, frontmatter, body_hash, commit_hash, embedding,
                      created_at, updated_at
               FROM documents
               WHERE id = $1"#,
        )
        .bind(document_id)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(record)
    }

    // ------------------------------------------------------------------
    // Custom doc types
    // ------------------------------------------------------------------

    pub async fn insert_doc_type(&self, id: &str, definition: &JsonValue) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO doc_types (id, definition, created_at)
               VALUES ($1, $2, now())
               ON CONFLICT (id) DO UPDATE SET definition = EXCLUDED.definition"#,
        )
        .bind(id)
        .bind(definition)
        .execute(self.pool.get_pool())
        .await?;

        Ok(())
    }

    pub async fn list_doc_types(&self) -> Result<Vec<DocTypeRecord>> {
        let records = sqlx::query_as::<_, DocTypeRecord>(
            "SELECT id, definition, created_at FROM doc_types ORDER BY id",
        )
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(records)
    }
}
