use super::{
    ChunkNode, ConceptNode, DocumentNode, GraphRelationship, GraphStore, RelatedConcept,
    RelationshipType, SectionNode,
};
use crate::utils::error::ApiError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashSet, VecDeque};
use tracing::debug;

/// In-process graph backend. The production deployment can substitute a
/// dedicated graph database behind the same trait; this implementation
/// keeps node tables in concurrent maps and edges in one guarded list.
#[derive(Default)]
pub struct MemoryGraphStore {
    documents: DashMap<String, DocumentNode>,
    sections: DashMap<String, SectionNode>,
    chunks: DashMap<String, ChunkNode>,
    concepts: DashMap<String, ConceptNode>,
    edges: RwLock<Vec<GraphRelationship>>,
    sync_state: DashMap<String, String>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.read().len()
    }

    pub fn concept_count(&self) -> usize {
        self.concepts.len()
    }

    fn add_edge(&self, relationship: GraphRelationship) {
        let mut edges = self.edges.write();
        let exists = edges.iter().any(|e| {
            e.rel_type == relationship.rel_type
                && e.source_id == relationship.source_id
                && e.target_id == relationship.target_id
        });
        if !exists {
            edges.push(relationship);
        }
    }

    /// RELATES_TO relatedness is symmetric for traversal purposes even
    /// though edges are stored directed.
    fn related_neighbours(&self, concept_id: &str) -> Vec<String> {
        let edges = self.edges.read();
        let mut neighbours = Vec::new();
        for edge in edges.iter().filter(|e| e.rel_type == RelationshipType::RelatesTo) {
            if edge.source_id == concept_id {
                neighbours.push(edge.target_id.clone());
            } else if edge.target_id == concept_id {
                neighbours.push(edge.source_id.clone());
            }
        }
        neighbours
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn upsert_document_node(&self, node: DocumentNode) -> Result<(), ApiError> {
        self.documents.insert(node.id.clone(), node);
        Ok(())
    }

    async fn upsert_section(&self, node: SectionNode) -> Result<(), ApiError> {
        self.sections.insert(node.id.clone(), node);
        Ok(())
    }

    async fn upsert_chunk_node(&self, node: ChunkNode) -> Result<(), ApiError> {
        self.chunks.insert(node.id.clone(), node);
        Ok(())
    }

    async fn upsert_concept(&self, node: ConceptNode) -> Result<(), ApiError> {
        self.concepts.insert(node.id.clone(), node);
        Ok(())
    }

    async fn create_relationship(&self, relationship: GraphRelationship) -> Result<(), ApiError> {
        self.add_edge(relationship);
        Ok(())
    }

    async fn get_related_concepts(
        &self,
        concept_id: &str,
        hops: usize,
    ) -> Result<Vec<RelatedConcept>, ApiError> {
        let mut visited: HashSet<String> = HashSet::from([concept_id.to_string()]);
        let mut queue: VecDeque<(String, usize)> = VecDeque::from([(concept_id.to_string(), 0)]);
        let mut result: Vec<RelatedConcept> = Vec::new();

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= hops {
                continue;
            }
            for neighbour in self.related_neighbours(&current) {
                if visited.insert(neighbour.clone()) {
                    if let Some(concept) = self.concepts.get(&neighbour) {
                        result.push(RelatedConcept {
                            concept: concept.value().clone(),
                            hops: depth + 1,
                        });
                    }
                    queue.push_back((neighbour, depth + 1));
                }
            }
        }

        Ok(result)
    }

    async fn get_chunks_by_concept(&self, concept_id: &str) -> Result<Vec<ChunkNode>, ApiError> {
        let edges = self.edges.read();
        let chunk_ids: Vec<String> = edges
            .iter()
            .filter(|e| e.rel_type == RelationshipType::Mentions && e.target_id == concept_id)
            .map(|e| e.source_id.clone())
            .collect();
        drop(edges);

        Ok(chunk_ids
            .iter()
            .filter_map(|id| self.chunks.get(id).map(|c| c.value().clone()))
            .collect())
    }

    async fn get_concepts_for_chunk(&self, chunk_id: &str) -> Result<Vec<ConceptNode>, ApiError> {
        let edges = self.edges.read();
        let concept_ids: Vec<String> = edges
            .iter()
            .filter(|e| e.rel_type == RelationshipType::Mentions && e.source_id == chunk_id)
            .map(|e| e.target_id.clone())
            .collect();
        drop(edges);

        Ok(concept_ids
            .iter()
            .filter_map(|id| self.concepts.get(id).map(|c| c.value().clone()))
            .collect())
    }

    async fn delete_document_cascade(&self, document_id: &str) -> Result<(), ApiError> {
        self.documents.remove(document_id);

        let mut removed: HashSet<String> = HashSet::from([document_id.to_string()]);
        let section_ids: Vec<String> = self
            .sections
            .iter()
            .filter(|e| e.value().document_id == document_id)
            .map(|e| e.key().clone())
            .collect();
        for id in section_ids {
            self.sections.remove(&id);
            removed.insert(id);
        }
        let chunk_ids: Vec<String> = self
            .chunks
            .iter()
            .filter(|e| e.value().document_id == document_id)
            .map(|e| e.key().clone())
            .collect();
        for id in chunk_ids {
            self.chunks.remove(&id);
            removed.insert(id);
        }

        // Concept nodes survive the cascade; only edges touching removed
        // nodes go.
        let mut edges = self.edges.write();
        let before = edges.len();
        edges.retain(|e| !removed.contains(&e.source_id) && !removed.contains(&e.target_id));
        debug!(
            document_id,
            removed_edges = before - edges.len(),
            "Cascade-deleted document from graph"
        );

        Ok(())
    }

    async fn get_sync_state(&self, repo: &str) -> Result<Option<String>, ApiError> {
        Ok(self.sync_state.get(repo).map(|e| e.value().clone()))
    }

    async fn set_sync_state(&self, repo: &str, head: &str) -> Result<(), ApiError> {
        self.sync_state.insert(repo.to_string(), head.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concept(id: &str) -> ConceptNode {
        ConceptNode {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            category: None,
            aliases: vec![],
        }
    }

    fn relates(a: &str, b: &str) -> GraphRelationship {
        GraphRelationship::new(RelationshipType::RelatesTo, a, b)
    }

    #[tokio::test]
    async fn upserts_are_idempotent() {
        let store = MemoryGraphStore::new();
        store.upsert_concept(concept("cache")).await.unwrap();
        store.upsert_concept(concept("cache")).await.unwrap();
        assert_eq!(store.concept_count(), 1);

        store.create_relationship(relates("cache", "ttl")).await.unwrap();
        store.create_relationship(relates("cache", "ttl")).await.unwrap();
        assert_eq!(store.edge_count(), 1);
    }

    #[tokio::test]
    async fn bfs_respects_hop_budget_and_survives_cycles() {
        let store = MemoryGraphStore::new();
        for id in ["a", "b", "c", "d"] {
            store.upsert_concept(concept(id)).await.unwrap();
        }
        store.create_relationship(relates("a", "b")).await.unwrap();
        store.create_relationship(relates("b", "c")).await.unwrap();
        store.create_relationship(relates("c", "d")).await.unwrap();
        // Cycle back to the start.
        store.create_relationship(relates("d", "a")).await.unwrap();

        let one_hop = store.get_related_concepts("a", 1).await.unwrap();
        let ids: Vec<&str> = one_hop.iter().map(|r| r.concept.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d"]);
        assert!(one_hop.iter().all(|r| r.hops == 1));

        let two_hops = store.get_related_concepts("a", 2).await.unwrap();
        assert_eq!(two_hops.len(), 3, "dedup keeps each concept once");

        let many = store.get_related_concepts("a", 10).await.unwrap();
        assert_eq!(many.len(), 3, "cycle must not loop forever");
    }

    #[tokio::test]
    async fn chunks_by_concept_is_one_hop_mentions() {
        let store = MemoryGraphStore::new();
        store.upsert_concept(concept("retry")).await.unwrap();
        store
            .upsert_chunk_node(ChunkNode {
                id: "chunk-1".into(),
                document_id: "doc-1".into(),
                chunk_index: 0,
            })
            .await
            .unwrap();
        store
            .create_relationship(GraphRelationship::new(
                RelationshipType::Mentions,
                "chunk-1",
                "retry",
            ))
            .await
            .unwrap();

        let chunks = store.get_chunks_by_concept("retry").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "chunk-1");

        let concepts = store.get_concepts_for_chunk("chunk-1").await.unwrap();
        assert_eq!(concepts.len(), 1);
        assert_eq!(concepts[0].id, "retry");
    }

    #[tokio::test]
    async fn cascade_delete_spares_concepts() {
        let store = MemoryGraphStore::new();
        store
            .upsert_document_node(DocumentNode {
                id: "doc-1".into(),
                file_path: "a.md".into(),
                title: "A".into(),
            })
            .await
            .unwrap();
        store
            .upsert_section(SectionNode {
                id: "sec-1".into(),
                document_id: "doc-1".into(),
                title: "Intro".into(),
                level: 1,
            })
            .await
            .unwrap();
        store
            .upsert_chunk_node(ChunkNode {
                id: "chunk-1".into(),
                document_id: "doc-1".into(),
                chunk_index: 0,
            })
            .await
            .unwrap();
        store.upsert_concept(concept("kept")).await.unwrap();

        store
            .create_relationship(GraphRelationship::new(
                RelationshipType::HasSection,
                "doc-1",
                "sec-1",
            ))
            .await
            .unwrap();
        store
            .create_relationship(GraphRelationship::new(
                RelationshipType::HasChunk,
                "doc-1",
                "chunk-1",
            ))
            .await
            .unwrap();
        store
            .create_relationship(GraphRelationship::new(
                RelationshipType::Mentions,
                "chunk-1",
                "kept",
            ))
            .await
            .unwrap();

        store.delete_document_cascade("doc-1").await.unwrap();

        assert_eq!(store.edge_count(), 0);
        assert_eq!(store.concept_count(), 1, "concepts survive the cascade");
        assert!(store.get_chunks_by_concept("kept").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_state_round_trips() {
        let store = MemoryGraphStore::new();
        assert_eq!(store.get_sync_state("docs-repo").await.unwrap(), None);
        store.set_sync_state("docs-repo", "abc123").await.unwrap();
        assert_eq!(
            store.get_sync_state("docs-repo").await.unwrap(),
            Some("abc123".to_string())
        );
        store.set_sync_state("docs-repo", "def456").await.unwrap();
        assert_eq!(
            store.get_sync_state("docs-repo").await.unwrap(),
            Some("def456".to_string())
        );
    }
}
