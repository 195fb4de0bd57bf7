use crate::config::ChunkingConfig;
use crate::database::repository::{ChunkInsert, DocumentUpsert};
use crate::database::{DocumentRecord, Repository};
use crate::document::chunker::TextChunker;
use crate::document::doc_type::{DocTypeRegistry, ValidationMode};
use crate::document::link_graph::LinkGraph;
use crate::document::parser::{DocumentParser, ParsedDocument};
use crate::document::PromotionLevel;
use crate::graph::{
    ChunkNode, ConceptNode, DocumentNode, GraphRelationship, GraphStore, RelationshipType,
    SectionNode,
};
use crate::services::embedding_service::EmbeddingService;
use crate::services::entity_extractor::EntityExtractor;
use crate::services::event_bus::{DocumentEvent, DocumentEventType, EventBus};
use crate::tenant::{TenantFilter, TenantKey};
use crate::utils::error::ApiError;
use crate::utils::hashing::{posix_path, sha256_hex};
use crate::vector::{VectorEntry, VectorStore};
use dashmap::DashMap;
use pgvector::Vector;
use serde::Serialize;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Default)]
pub struct IndexResult {
    pub success: bool,
    pub document_id: Option<Uuid>,
    pub file_path: String,
    pub chunk_count: usize,
    pub content_changed: bool,
    pub processing_ms: u64,
    pub embedding_ms: u64,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub doc_type: Option<String>,
    pub title: Option<String>,
}

impl IndexResult {
    fn failure(file_path: &str, errors: Vec<String>, started: Instant) -> Self {
        Self {
            success: false,
            file_path: file_path.to_string(),
            errors,
            processing_ms: started.elapsed().as_millis() as u64,
            ..Default::default()
        }
    }
}

/// Central ingestion orchestrator: parse -> validate -> chunk -> embed ->
/// store -> graph -> events. Writes for a given (tenant, file_path) are
/// serialised here; everything else only reads.
pub struct DocumentIndexer {
    repository: Arc<Repository>,
    vector_store: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
    doc_types: Arc<DocTypeRegistry>,
    embedder: Arc<EmbeddingService>,
    extractor: Arc<EntityExtractor>,
    link_graph: Arc<LinkGraph>,
    event_bus: Arc<EventBus>,
    chunker: TextChunker,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DocumentIndexer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<Repository>,
        vector_store: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        doc_types: Arc<DocTypeRegistry>,
        embedder: Arc<EmbeddingService>,
        extractor: Arc<EntityExtractor>,
        link_graph: Arc<LinkGraph>,
        event_bus: Arc<EventBus>,
        chunking: &ChunkingConfig,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            repository,
            vector_store,
            graph,
            doc_types,
            embedder,
            extractor,
            link_graph,
            event_bus,
            chunker: TextChunker::new(chunking)?,
            key_locks: DashMap::new(),
        })
    }

    fn lock_for(&self, tenant: &TenantKey, file_path: &str) -> Arc<Mutex<()>> {
        let key = format!(
            "{}:{}:{}:{}",
            tenant.project_name, tenant.branch_name, tenant.path_hash, file_path
        );
        self.key_locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn index(
        &self,
        file_path: &str,
        content: &str,
        tenant: &TenantKey,
        commit_hash: Option<&str>,
    ) -> Result<IndexResult, ApiError> {
        self.index_with_title_hint(file_path, content, tenant, commit_hash, None)
            .await
    }

    /// The sync runner derives a friendlier default title from the file
    /// stem; an explicit frontmatter/H1 title always wins over the hint.
    pub async fn index_with_title_hint(
        &self,
        file_path: &str,
        content: &str,
        tenant: &TenantKey,
        commit_hash: Option<&str>,
        title_hint: Option<&str>,
    ) -> Result<IndexResult, ApiError> {
        let started = Instant::now();
        let file_path = posix_path(file_path);
        let filter = tenant.filter();
        let correlation_id = Some(Uuid::new_v4());

        let lock = self.lock_for(tenant, &file_path);
        let _guard = lock.lock().await;

        let parsed = match DocumentParser::parse(content) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(file_path = %file_path, error = %err, "Parse failed");
                return Ok(IndexResult::failure(
                    &file_path,
                    vec![err.to_string()],
                    started,
                ));
            }
        };

        let title = parsed
            .explicit_title()
            .or_else(|| title_hint.map(str::to_string))
            .unwrap_or_else(|| parsed.resolve_title(&file_path));
        let mut warnings: Vec<String> = Vec::new();

        let doc_type = match parsed.doc_type() {
            Some(doc_type) => doc_type,
            None => {
                warnings.push("no doc_type declared, defaulting to 'doc'".to_string());
                "doc".to_string()
            }
        };

        // Validation runs against the effective frontmatter: resolved title
        // and doc type are filled in so body-only documents stay indexable.
        let mut frontmatter = parsed.frontmatter.clone().unwrap_or_default();
        frontmatter
            .entry("title".to_string())
            .or_insert_with(|| json!(title.clone()));
        frontmatter
            .entry("doc_type".to_string())
            .or_insert_with(|| json!(doc_type.clone()));

        let report = self
            .doc_types
            .validate(&doc_type, &frontmatter, ValidationMode::Lenient)?;
        warnings.extend(report.warnings.clone());
        if !report.is_valid() {
            let errors = report.errors.iter().map(|i| i.message.clone()).collect();
            return Ok(IndexResult {
                success: false,
                file_path,
                warnings,
                errors,
                doc_type: Some(doc_type),
                title: Some(title),
                processing_ms: started.elapsed().as_millis() as u64,
                ..Default::default()
            });
        }
        self.event_bus.publish(DocumentEvent::new(
            DocumentEventType::Validated,
            &file_path,
            tenant,
            correlation_id,
            json!({"warnings": warnings.len()}),
        ));

        let body_hash = sha256_hex(&parsed.body);
        let existing = self
            .repository
            .get_document(&filter, &file_path)
            .await
            .map_err(|e| ApiError::StorageFailed(e.to_string()))?;

        let promotion = resolve_promotion(
            &frontmatter,
            existing.as_ref(),
            self.doc_types
                .get(&doc_type)
                .map(|d| d.default_promotion_level)
                .unwrap_or_default(),
            &mut warnings,
        );

        // Unchanged body: metadata-only update, no re-chunk, no re-embed.
        if let Some(existing_doc) = existing
            .as_ref()
            .filter(|doc| doc.body_hash == body_hash)
        {
            return self
                .update_metadata_only(
                    existing_doc,
                    &filter,
                    tenant,
                    &file_path,
                    &title,
                    &doc_type,
                    promotion,
                    &frontmatter,
                    commit_hash,
                    warnings,
                    correlation_id,
                    started,
                )
                .await;
        }

        let chunks = self.chunker.chunk(&parsed.body, &parsed.body_headers());
        if chunks.is_empty() {
            return Ok(IndexResult::failure(
                &file_path,
                vec!["document body is empty".to_string()],
                started,
            ));
        }

        let embed_started = Instant::now();
        let (doc_embedding, chunk_embeddings) = if chunks.len() == 1 {
            let embedding = self.embedder.embed(&chunks[0].content).await?;
            (Some(embedding.clone()), vec![embedding])
        } else {
            let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
            let embeddings = self.embedder.embed_batch(&texts).await?;
            (None, embeddings)
        };
        let embedding_ms = embed_started.elapsed().as_millis() as u64;

        let document_id = existing.as_ref().map(|d| d.id).unwrap_or_else(Uuid::new_v4);
        let frontmatter_value = JsonValue::Object(frontmatter.clone());

        struct ChunkData {
            id: Uuid,
            index: i32,
            header_path: Vec<String>,
            start_line: i32,
            end_line: i32,
            content: String,
            content_hash: String,
        }
        let chunk_data: Vec<ChunkData> = chunks
            .iter()
            .map(|chunk| ChunkData {
                id: Uuid::new_v4(),
                index: chunk.index as i32,
                header_path: chunk.header_path.clone(),
                start_line: chunk.start_line as i32,
                end_line: chunk.end_line as i32,
                content: chunk.content.clone(),
                content_hash: sha256_hex(&chunk.content),
            })
            .collect();

        let inserts: Vec<ChunkInsert<'_>> = chunk_data
            .iter()
            .map(|c| ChunkInsert {
                id: c.id,
                chunk_index: c.index,
                header_path: &c.header_path,
                start_line: c.start_line,
                end_line: c.end_line,
                content: &c.content,
                content_hash: &c.content_hash,
            })
            .collect();

        let stored_id = self
            .repository
            .store_document_with_chunks(
                &filter,
                DocumentUpsert {
                    id: document_id,
                    file_path: &file_path,
                    title: &title,
                    doc_type: &doc_type,
                    promotion_level: promotion.as_str(),
                    frontmatter: &frontmatter_value,
                    body_hash: &body_hash,
                    commit_hash,
                    embedding: doc_embedding.map(Vector::from),
                },
                &inserts,
            )
            .await
            .map_err(|e| ApiError::StorageFailed(e.to_string()))?;

        // Replace the vector set atomically per document: stale vectors go
        // first so a failed re-embed never leaves a mixed chunk set.
        self.vector_store
            .delete_by_document(stored_id, &filter)
            .await?;
        let entries: Vec<VectorEntry> = chunk_data
            .iter()
            .zip(chunk_embeddings.into_iter())
            .map(|(chunk, embedding)| VectorEntry {
                chunk_id: chunk.id,
                document_id: stored_id,
                file_path: file_path.clone(),
                chunk_index: chunk.index,
                promotion_level: promotion,
                tenant: filter.clone(),
                embedding,
            })
            .collect();
        self.vector_store.bulk_index(entries).await?;

        let chunk_refs: Vec<(Uuid, i32)> = chunk_data.iter().map(|c| (c.id, c.index)).collect();
        self.mirror_to_graph(stored_id, &file_path, &title, &parsed, &chunk_refs)
            .await?;
        self.update_links(&file_path, &parsed, tenant, correlation_id)
            .await;
        self.apply_supersedes(&frontmatter, stored_id, &filter, tenant, correlation_id)
            .await;

        for chunk in &chunk_data {
            self.extract_entities_for_chunk(&chunk.id.to_string(), &chunk.content)
                .await;
        }

        let event_type = if existing.is_some() {
            DocumentEventType::Updated
        } else {
            DocumentEventType::Created
        };
        self.event_bus.publish(DocumentEvent::new(
            event_type,
            &file_path,
            tenant,
            correlation_id,
            json!({"content_changed": true, "chunk_count": chunk_data.len()}),
        ));

        info!(
            file_path = %file_path,
            tenant = %tenant,
            chunks = chunk_data.len(),
            "Indexed document"
        );

        Ok(IndexResult {
            success: true,
            document_id: Some(stored_id),
            file_path,
            chunk_count: chunk_data.len(),
            content_changed: true,
            processing_ms: started.elapsed().as_millis() as u64,
            embedding_ms,
            warnings,
            errors: Vec::new(),
            doc_type: Some(doc_type),
            title: Some(title),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn update_metadata_only(
        &self,
        existing: &DocumentRecord,
        filter: &TenantFilter,
        tenant: &TenantKey,
        file_path: &str,
        title: &str,
        doc_type: &str,
        promotion: PromotionLevel,
        frontmatter: &JsonMap<String, JsonValue>,
        commit_hash: Option<&str>,
        warnings: Vec<String>,
        correlation_id: Option<Uuid>,
        started: Instant,
    ) -> Result<IndexResult, ApiError> {
        debug!(file_path, "Body unchanged, metadata-only update");

        let frontmatter_value = JsonValue::Object(frontmatter.clone());
        self.repository
            .update_document_metadata(
                filter,
                file_path,
                title,
                doc_type,
                promotion.as_str(),
                &frontmatter_value,
                commit_hash,
            )
            .await
            .map_err(|e| ApiError::StorageFailed(e.to_string()))?;

        if existing.promotion_level != promotion.as_str() {
            self.vector_store
                .update_promotion(existing.id, filter, promotion)
                .await?;
        }

        self.apply_supersedes(frontmatter, existing.id, filter, tenant, correlation_id)
            .await;

        let chunk_count = self
            .repository
            .get_chunks(existing.id)
            .await
            .map_err(|e| ApiError::StorageFailed(e.to_string()))?
            .len();

        self.event_bus.publish(DocumentEvent::new(
            DocumentEventType::Updated,
            file_path,
            tenant,
            correlation_id,
            json!({"content_changed": false, "chunk_count": chunk_count}),
        ));

        Ok(IndexResult {
            success: true,
            document_id: Some(existing.id),
            file_path: file_path.to_string(),
            chunk_count,
            content_changed: false,
            processing_ms: started.elapsed().as_millis() as u64,
            embedding_ms: 0,
            warnings,
            errors: Vec::new(),
            doc_type: Some(doc_type.to_string()),
            title: Some(title.to_string()),
        })
    }

    async fn mirror_to_graph(
        &self,
        document_id: Uuid,
        file_path: &str,
        title: &str,
        parsed: &ParsedDocument,
        chunks: &[(Uuid, i32)],
    ) -> Result<(), ApiError> {
        let doc_node_id = document_id.to_string();

        // Re-index starts from a clean slate so removed sections and chunks
        // do not linger in the graph.
        self.graph.delete_document_cascade(&doc_node_id).await?;
        self.graph
            .upsert_document_node(DocumentNode {
                id: doc_node_id.clone(),
                file_path: file_path.to_string(),
                title: title.to_string(),
            })
            .await?;

        for header in &parsed.headers {
            let section_id = format!("{doc_node_id}:s{}", header.line);
            self.graph
                .upsert_section(SectionNode {
                    id: section_id.clone(),
                    document_id: doc_node_id.clone(),
                    title: header.text.clone(),
                    level: header.level,
                })
                .await?;
            self.graph
                .create_relationship(GraphRelationship::new(
                    RelationshipType::HasSection,
                    &doc_node_id,
                    &section_id,
                ))
                .await?;
        }

        for (chunk_id, chunk_index) in chunks {
            let chunk_node_id = chunk_id.to_string();
            self.graph
                .upsert_chunk_node(ChunkNode {
                    id: chunk_node_id.clone(),
                    document_id: doc_node_id.clone(),
                    chunk_index: *chunk_index as usize,
                })
                .await?;
            self.graph
                .create_relationship(GraphRelationship::new(
                    RelationshipType::HasChunk,
                    &doc_node_id,
                    &chunk_node_id,
                ))
                .await?;
        }

        Ok(())
    }

    async fn update_links(
        &self,
        file_path: &str,
        parsed: &ParsedDocument,
        tenant: &TenantKey,
        correlation_id: Option<Uuid>,
    ) {
        self.link_graph.add_document(file_path);

        let targets: Vec<String> = parsed
            .links
            .iter()
            .filter_map(|link| LinkGraph::resolve(file_path, &link.url))
            .collect();
        self.link_graph.set_links(file_path, &targets);

        if !parsed.links.is_empty() {
            let broken = self
                .link_graph
                .broken_links()
                .iter()
                .filter(|(source, _)| source == file_path)
                .count();
            self.event_bus.publish(DocumentEvent::new(
                DocumentEventType::ReferencesResolved,
                file_path,
                tenant,
                correlation_id,
                json!({"resolved": targets.len(), "broken": broken}),
            ));
        }
    }

    /// `supersedes: <path>` in frontmatter records the SUPERSEDES edge and
    /// announces the superseded document; content is untouched.
    async fn apply_supersedes(
        &self,
        frontmatter: &JsonMap<String, JsonValue>,
        document_id: Uuid,
        filter: &TenantFilter,
        tenant: &TenantKey,
        correlation_id: Option<Uuid>,
    ) {
        let Some(target_path) = frontmatter.get("supersedes").and_then(JsonValue::as_str)
        else {
            return;
        };
        let target_path = posix_path(target_path);

        match self.repository.get_document(filter, &target_path).await {
            Ok(Some(target)) => {
                if let Err(err) = self
                    .graph
                    .create_relationship(GraphRelationship::new(
                        RelationshipType::Supersedes,
                        &document_id.to_string(),
                        &target.id.to_string(),
                    ))
                    .await
                {
                    warn!(error = %err, "Failed to record SUPERSEDES edge");
                    return;
                }
                self.event_bus.publish(DocumentEvent::new(
                    DocumentEventType::Superseded,
                    &target_path,
                    tenant,
                    correlation_id,
                    json!({"superseded_by": document_id}),
                ));
            }
            Ok(None) => {
                debug!(target = %target_path, "Supersedes target not indexed yet");
            }
            Err(err) => {
                warn!(error = %err, "Supersedes target lookup failed");
            }
        }
    }

    async fn extract_entities_for_chunk(&self, chunk_node_id: &str, content: &str) {
        let entities = self.extractor.extract(content).await;
        if entities.concepts.is_empty() {
            return;
        }

        for concept in &entities.concepts {
            let concept_id = ConceptNode::id_for(&concept.name);
            if concept_id.is_empty() {
                continue;
            }
            let upsert = self
                .graph
                .upsert_concept(ConceptNode {
                    id: concept_id.clone(),
                    name: concept.name.clone(),
                    description: concept.description.clone(),
                    category: concept.category.clone(),
                    aliases: concept.aliases.clone(),
                })
                .await;
            if let Err(err) = upsert {
                warn!(error = %err, "Concept upsert failed");
                continue;
            }
            let _ = self
                .graph
                .create_relationship(GraphRelationship::new(
                    RelationshipType::Mentions,
                    chunk_node_id,
                    &concept_id,
                ))
                .await;
        }

        for relationship in &entities.relationships {
            let source = ConceptNode::id_for(&relationship.source);
            let target = ConceptNode::id_for(&relationship.target);
            if source.is_empty() || target.is_empty() || source == target {
                continue;
            }
            let _ = self
                .graph
                .create_relationship(GraphRelationship::new(
                    RelationshipType::RelatesTo,
                    &source,
                    &target,
                ))
                .await;
        }
    }

    /// Idempotent: deleting an unknown document returns `false`, no error.
    pub async fn delete(&self, tenant: &TenantKey, file_path: &str) -> Result<bool, ApiError> {
        let file_path = posix_path(file_path);
        let filter = tenant.filter();

        let lock = self.lock_for(tenant, &file_path);
        let _guard = lock.lock().await;

        let Some(document_id) = self
            .repository
            .delete_document(&filter, &file_path)
            .await
            .map_err(|e| ApiError::StorageFailed(e.to_string()))?
        else {
            debug!(file_path = %file_path, "Delete of unknown document, no-op");
            return Ok(false);
        };

        self.vector_store
            .delete_by_document(document_id, &filter)
            .await?;
        self.graph
            .delete_document_cascade(&document_id.to_string())
            .await?;
        self.link_graph.remove_document(&file_path);

        self.event_bus.publish(DocumentEvent::new(
            DocumentEventType::Deleted,
            &file_path,
            tenant,
            None,
            json!({"document_id": document_id}),
        ));

        info!(file_path = %file_path, tenant = %tenant, "Deleted document");
        Ok(true)
    }

    /// Batch indexing with per-file isolation: one failing file never
    /// aborts the rest.
    pub async fn index_batch(
        &self,
        files: Vec<(String, String)>,
        tenant: &TenantKey,
        commit_hash: Option<&str>,
    ) -> Vec<IndexResult> {
        let mut results = Vec::with_capacity(files.len());
        for (file_path, content) in files {
            match self.index(&file_path, &content, tenant, commit_hash).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    warn!(file_path = %file_path, error = %err, "Index failed");
                    results.push(IndexResult {
                        success: false,
                        file_path,
                        errors: vec![err.to_string()],
                        ..Default::default()
                    });
                }
            }
        }
        results
    }

    /// Promotion and supersession are metadata-only and never re-embed.
    pub async fn set_promotion_level(
        &self,
        tenant: &TenantKey,
        file_path: &str,
        level: PromotionLevel,
    ) -> Result<(String, String), ApiError> {
        let file_path = posix_path(file_path);
        let filter = tenant.filter();

        let lock = self.lock_for(tenant, &file_path);
        let _guard = lock.lock().await;

        let Some((previous, new)) = self
            .repository
            .update_promotion_level(&filter, &file_path, level.as_str())
            .await
            .map_err(|e| ApiError::StorageFailed(e.to_string()))?
        else {
            return Err(ApiError::NotFound(format!(
                "document '{file_path}' not found for tenant {tenant}"
            )));
        };

        let document = self
            .repository
            .get_document(&filter, &file_path)
            .await
            .map_err(|e| ApiError::StorageFailed(e.to_string()))?;
        if let Some(document) = document {
            self.vector_store
                .update_promotion(document.id, &filter, level)
                .await?;
        }

        self.event_bus.publish(DocumentEvent::new(
            DocumentEventType::Promoted,
            &file_path,
            tenant,
            None,
            json!({"previous": previous, "new": new}),
        ));

        Ok((previous, new))
    }
}

/// Declared level wins, then the stored level, then the doc-type default.
fn resolve_promotion(
    frontmatter: &JsonMap<String, JsonValue>,
    existing: Option<&DocumentRecord>,
    type_default: PromotionLevel,
    warnings: &mut Vec<String>,
) -> PromotionLevel {
    if let Some(declared) = frontmatter.get("promotion_level").and_then(JsonValue::as_str) {
        match declared.parse::<PromotionLevel>() {
            Ok(level) => return level,
            Err(err) => warnings.push(err),
        }
    }
    existing
        .and_then(|doc| doc.promotion_level.parse::<PromotionLevel>().ok())
        .unwrap_or(type_default)
}
