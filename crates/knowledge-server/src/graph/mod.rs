pub mod memory;

pub use memory::MemoryGraphStore;

use crate::utils::error::ApiError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentNode {
    pub id: String,
    pub file_path: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionNode {
    pub id: String,
    pub document_id: String,
    pub title: String,
    pub level: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkNode {
    pub id: String,
    pub document_id: String,
    pub chunk_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptNode {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub aliases: Vec<String>,
}

impl ConceptNode {
    /// Concept ids are slugs of the name so repeated extraction of the
    /// same concept converges on one node.
    pub fn id_for(name: &str) -> String {
        name.trim()
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '-' })
            .collect::<String>()
            .split('-')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("-")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    HasSection,
    HasChunk,
    Mentions,
    RelatesTo,
    LinksTo,
    Supersedes,
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelationshipType::HasSection => "HAS_SECTION",
            RelationshipType::HasChunk => "HAS_CHUNK",
            RelationshipType::Mentions => "MENTIONS",
            RelationshipType::RelatesTo => "RELATES_TO",
            RelationshipType::LinksTo => "LINKS_TO",
            RelationshipType::Supersedes => "SUPERSEDES",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphRelationship {
    pub rel_type: RelationshipType,
    pub source_id: String,
    pub target_id: String,
    pub properties: JsonValue,
}

impl GraphRelationship {
    pub fn new(rel_type: RelationshipType, source_id: &str, target_id: &str) -> Self {
        Self {
            rel_type,
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            properties: JsonValue::Null,
        }
    }
}

/// A concept reached by graph expansion, annotated with its BFS distance.
#[derive(Debug, Clone, Serialize)]
pub struct RelatedConcept {
    pub concept: ConceptNode,
    pub hops: usize,
}

/// Contract the core consumes from the graph backend. Upserts are
/// idempotent by id; cascade delete of a document removes its sections,
/// chunks and their edges but leaves concept nodes in place.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert_document_node(&self, node: DocumentNode) -> Result<(), ApiError>;

    async fn upsert_section(&self, node: SectionNode) -> Result<(), ApiError>;

    async fn upsert_chunk_node(&self, node: ChunkNode) -> Result<(), ApiError>;

    async fn upsert_concept(&self, node: ConceptNode) -> Result<(), ApiError>;

    async fn create_relationship(&self, relationship: GraphRelationship) -> Result<(), ApiError>;

    /// Breadth-first expansion over RELATES_TO edges up to `hops`,
    /// deduplicated, order-stable by edge insertion.
    async fn get_related_concepts(
        &self,
        concept_id: &str,
        hops: usize,
    ) -> Result<Vec<RelatedConcept>, ApiError>;

    /// Chunks connected to a concept via MENTIONS, one hop.
    async fn get_chunks_by_concept(&self, concept_id: &str) -> Result<Vec<ChunkNode>, ApiError>;

    /// Concepts a given chunk mentions.
    async fn get_concepts_for_chunk(&self, chunk_id: &str) -> Result<Vec<ConceptNode>, ApiError>;

    async fn delete_document_cascade(&self, document_id: &str) -> Result<(), ApiError>;

    async fn get_sync_state(&self, repo: &str) -> Result<Option<String>, ApiError>;

    async fn set_sync_state(&self, repo: &str, head: &str) -> Result<(), ApiError>;
}
