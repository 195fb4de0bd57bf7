use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct DocumentRecord {
    pub id: Uuid,
    pub project_name: String,
    pub branch_name: String,
    pub path_hash: String,
    /// Repo-relative, POSIX-normalised path; unique per tenant.
    pub file_path: String,
    pub title: String,
    pub doc_type: String,
    pub promotion_level: String,
    pub frontmatter: JsonValue,
    pub body_hash: String,
    pub commit_hash: Option<String>,
    /// Set on the single-chunk path, where the document carries its own
    /// embedding instead of per-chunk vectors.
    pub embedding: Option<Vector>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ChunkRecord {
    pub id: Uuid,
    pub document_id: Uuid,
    pub chunk_index: i32,
    pub header_path: Vec<String>,
    pub start_line: i32,
    pub end_line: i32,
    pub content: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RepoPathRecord {
    pub id: Uuid,
    pub project_name: String,
    pub path_hash: String,
    pub absolute_path: String,
    pub last_accessed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BranchRecord {
    pub id: Uuid,
    pub project_name: String,
    pub path_hash: String,
    pub branch_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct DocTypeRecord {
    pub id: String,
    pub definition: JsonValue,
    pub created_at: DateTime<Utc>,
}
