use crate::config::RagConfig;
use crate::database::{ChunkRecord, DocumentRecord, Repository};
use crate::document::PromotionLevel;
use crate::graph::GraphStore;
use crate::resilience::ResiliencePipeline;
use crate::services::embedding_service::EmbeddingService;
use crate::services::llm_service::{ChatMessage, GenerationProvider};
use crate::tenant::TenantKey;
use crate::utils::error::ApiError;
use crate::vector::{VectorSearchFilter, VectorStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SYNTHESIS_SYSTEM_PROMPT: &str = "\
You answer questions about a project's documentation. Use only the numbered \
context fragments below. Cite fragments with their [n] marker after each \
claim they support. If the context does not answer the question, say so \
plainly instead of guessing.";

const INSUFFICIENT_EVIDENCE_ANSWER: &str =
    "I don't have enough indexed documentation to answer that question.";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryOptions {
    pub max_chunks: Option<usize>,
    pub graph_hops: Option<usize>,
    pub min_score: Option<f32>,
    pub promotion_floor: Option<PromotionLevel>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RagSource {
    pub document_id: Uuid,
    pub chunk_id: Uuid,
    pub file_path: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RagAnswer {
    pub answer: String,
    pub sources: Vec<RagSource>,
    pub related_concepts: Vec<String>,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub file_path: String,
    pub chunk_index: i32,
    pub score: f32,
    pub content: String,
}

/// Read access the query engine needs from the relational store; split out
/// so the pipeline is testable without a database.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChunkReader: Send + Sync {
    async fn chunk_by_id(&self, chunk_id: Uuid) -> Result<Option<ChunkRecord>, ApiError>;
    async fn document_by_id(&self, document_id: Uuid)
        -> Result<Option<DocumentRecord>, ApiError>;
}

#[async_trait]
impl ChunkReader for Repository {
    async fn chunk_by_id(&self, chunk_id: Uuid) -> Result<Option<ChunkRecord>, ApiError> {
        self.get_chunk(chunk_id)
            .await
            .map_err(|e| ApiError::StorageFailed(e.to_string()))
    }

    async fn document_by_id(
        &self,
        document_id: Uuid,
    ) -> Result<Option<DocumentRecord>, ApiError> {
        self.get_document_by_id(document_id)
            .await
            .map_err(|e| ApiError::StorageFailed(e.to_string()))
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    chunk_id: Uuid,
    document_id: Uuid,
    file_path: String,
    vector_score: f32,
    /// Graph distance: 0 for direct vector hits, concept depth + 1 for
    /// chunks reached through MENTIONS.
    hops: usize,
}

/// GraphRAG: vector retrieval fused with knowledge-graph expansion before
/// synthesis with source attribution.
pub struct RagService {
    reader: Arc<dyn ChunkReader>,
    embedder: Arc<EmbeddingService>,
    generator: Arc<dyn GenerationProvider>,
    vector_store: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
    storage_pipeline: Arc<ResiliencePipeline>,
    config: RagConfig,
}

impl RagService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reader: Arc<dyn ChunkReader>,
        embedder: Arc<EmbeddingService>,
        generator: Arc<dyn GenerationProvider>,
        vector_store: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        storage_pipeline: Arc<ResiliencePipeline>,
        config: RagConfig,
    ) -> Self {
        Self {
            reader,
            embedder,
            generator,
            vector_store,
            graph,
            storage_pipeline,
            config,
        }
    }

    /// External documentation lives in its own fixed scope, outside every
    /// project tenant.
    pub fn external_tenant() -> TenantKey {
        TenantKey::derive("external", "external", &PathBuf::from("/external-docs"))
    }

    pub async fn semantic_search(
        &self,
        query: &str,
        top_k: usize,
        tenant: &TenantKey,
        promotion_floor: Option<PromotionLevel>,
    ) -> Result<Vec<SearchHit>, ApiError> {
        if query.trim().is_empty() {
            return Err(ApiError::InvalidArgument("query must not be blank".into()));
        }

        let embedding = self.embedder.embed(query).await?;
        let hits = self
            .vector_store
            .search(
                &embedding,
                top_k.clamp(1, 50),
                &VectorSearchFilter {
                    tenant: tenant.filter(),
                    promotion_floor,
                    min_score: Some(self.config.min_score),
                },
            )
            .await?;

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let content = self
                .reader
                .chunk_by_id(hit.chunk_id)
                .await?
                .map(|c| c.content)
                .unwrap_or_default();
            results.push(SearchHit {
                chunk_id: hit.chunk_id,
                document_id: hit.document_id,
                file_path: hit.file_path,
                chunk_index: hit.chunk_index,
                score: hit.score,
                content,
            });
        }

        debug!(hits = results.len(), "Semantic search completed");
        Ok(results)
    }

    pub async fn query(
        &self,
        text: &str,
        options: QueryOptions,
        tenant: &TenantKey,
    ) -> Result<RagAnswer, ApiError> {
        if text.trim().is_empty() {
            return Err(ApiError::InvalidArgument("query must not be blank".into()));
        }

        let max_chunks = options.max_chunks.unwrap_or(self.config.max_chunks).max(1);
        let graph_hops = options.graph_hops.unwrap_or(self.config.graph_hops);
        let min_score = options.min_score.unwrap_or(self.config.min_score);

        let embedding = self.embedder.embed(text).await?;
        let hits = self
            .vector_store
            .search(
                &embedding,
                max_chunks,
                &VectorSearchFilter {
                    tenant: tenant.filter(),
                    promotion_floor: options.promotion_floor,
                    min_score: Some(min_score),
                },
            )
            .await?;

        let mut candidates: HashMap<Uuid, Candidate> = HashMap::new();
        for hit in &hits {
            candidates.insert(
                hit.chunk_id,
                Candidate {
                    chunk_id: hit.chunk_id,
                    document_id: hit.document_id,
                    file_path: hit.file_path.clone(),
                    vector_score: hit.score,
                    hops: 0,
                },
            );
        }

        let related_concepts = self
            .enrich_from_graph(&hits, graph_hops, max_chunks * 2, tenant, &mut candidates)
            .await;

        let mut selected: Vec<(Candidate, f32)> = candidates
            .into_values()
            .map(|c| {
                let blended = self.blend_score(c.vector_score, c.hops);
                (c, blended)
            })
            .collect();
        selected.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.chunk_id.cmp(&b.0.chunk_id))
        });
        selected.truncate(max_chunks);

        // Empty retrieval is an answer, not an error.
        if selected.is_empty() {
            info!(tenant = %tenant, "RAG query found no evidence");
            return Ok(RagAnswer {
                answer: INSUFFICIENT_EVIDENCE_ANSWER.to_string(),
                sources: Vec::new(),
                related_concepts,
                confidence: 0.0,
            });
        }

        let mut fragments: Vec<String> = Vec::with_capacity(selected.len());
        let mut sources: Vec<RagSource> = Vec::with_capacity(selected.len());
        for (candidate, blended) in &selected {
            let Some(chunk) = self.reader.chunk_by_id(candidate.chunk_id).await? else {
                continue;
            };
            sources.push(RagSource {
                document_id: candidate.document_id,
                chunk_id: candidate.chunk_id,
                file_path: candidate.file_path.clone(),
                score: *blended,
            });
            fragments.push(chunk.content);
        }

        if sources.is_empty() {
            return Ok(RagAnswer {
                answer: INSUFFICIENT_EVIDENCE_ANSWER.to_string(),
                sources: Vec::new(),
                related_concepts,
                confidence: 0.0,
            });
        }

        let prompt = build_synthesis_prompt(
            text,
            &fragments
                .iter()
                .zip(sources.iter())
                .map(|(content, source)| (source.file_path.as_str(), content.as_str()))
                .collect::<Vec<_>>(),
            self.config.max_context_tokens,
        );

        let messages = vec![
            ChatMessage::system(SYNTHESIS_SYSTEM_PROMPT),
            ChatMessage::user(&prompt),
        ];
        let answer = self
            .storage_pipeline
            .execute("rag_synthesis", || self.generator.generate(messages.clone()))
            .await?;

        let confidence = estimate_confidence(
            &selected
                .iter()
                .map(|(c, _)| c.vector_score)
                .collect::<Vec<_>>(),
        );

        info!(
            tenant = %tenant,
            sources = sources.len(),
            related = related_concepts.len(),
            confidence,
            "RAG query answered"
        );

        Ok(RagAnswer {
            answer,
            sources,
            related_concepts,
            confidence,
        })
    }

    /// Collect concepts mentioned by the vector hits, expand RELATES_TO by
    /// the hop budget, and pull extra chunks mentioned by those concepts.
    /// Graph-sourced chunks are admitted only after their owning document
    /// proves to belong to the querying tenant.
    async fn enrich_from_graph(
        &self,
        hits: &[crate::vector::VectorHit],
        graph_hops: usize,
        extra_budget: usize,
        tenant: &TenantKey,
        candidates: &mut HashMap<Uuid, Candidate>,
    ) -> Vec<String> {
        let mut related_names: Vec<String> = Vec::new();
        // concept id -> depth (0 for directly mentioned concepts)
        let mut concepts: Vec<(String, usize)> = Vec::new();
        let mut seen_concepts = std::collections::HashSet::new();

        for hit in hits {
            let mentioned = match self
                .graph
                .get_concepts_for_chunk(&hit.chunk_id.to_string())
                .await
            {
                Ok(mentioned) => mentioned,
                Err(err) => {
                    warn!(error = %err, "Concept lookup failed, skipping enrichment");
                    continue;
                }
            };
            for concept in mentioned {
                if seen_concepts.insert(concept.id.clone()) {
                    concepts.push((concept.id.clone(), 0));
                }
            }
        }

        let seeds = concepts.clone();
        for (concept_id, _) in seeds {
            match self.graph.get_related_concepts(&concept_id, graph_hops).await {
                Ok(related) => {
                    for item in related {
                        if seen_concepts.insert(item.concept.id.clone()) {
                            related_names.push(item.concept.name.clone());
                            concepts.push((item.concept.id, item.hops));
                        }
                    }
                }
                Err(err) => warn!(error = %err, "Concept expansion failed"),
            }
        }

        let mut added = 0usize;
        for (concept_id, depth) in &concepts {
            if added >= extra_budget {
                debug!(extra_budget, "Graph enrichment budget exhausted");
                break;
            }
            let chunks = match self.graph.get_chunks_by_concept(concept_id).await {
                Ok(chunks) => chunks,
                Err(err) => {
                    warn!(error = %err, "Chunk-by-concept lookup failed");
                    continue;
                }
            };

            for chunk_node in chunks {
                if added >= extra_budget {
                    break;
                }
                let Ok(chunk_id) = Uuid::parse_str(&chunk_node.id) else {
                    continue;
                };
                if candidates.contains_key(&chunk_id) {
                    continue;
                }

                let Ok(Some(chunk)) = self.reader.chunk_by_id(chunk_id).await else {
                    continue;
                };
                let Ok(Some(document)) = self.reader.document_by_id(chunk.document_id).await
                else {
                    continue;
                };
                // The graph is shared; the tenant boundary is enforced here.
                if document.project_name != tenant.project_name
                    || document.branch_name != tenant.branch_name
                    || document.path_hash != tenant.path_hash
                {
                    continue;
                }

                candidates.insert(
                    chunk_id,
                    Candidate {
                        chunk_id,
                        document_id: chunk.document_id,
                        file_path: document.file_path.clone(),
                        vector_score: 0.0,
                        hops: depth + 1,
                    },
                );
                added += 1;
            }
        }

        related_names
    }

    /// `vector_weight * score + graph_weight * 1/(1+hops)`; weights come
    /// from configuration.
    fn blend_score(&self, vector_score: f32, hops: usize) -> f32 {
        let proximity = 1.0 / (1.0 + hops as f32);
        self.config.vector_weight * vector_score + self.config.graph_weight * proximity
    }
}

fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4 + 1
}

/// Numbered context fragments with their origin path, capped by a token
/// budget so oversized corpora cannot blow the generation window.
fn build_synthesis_prompt(
    question: &str,
    fragments: &[(&str, &str)],
    max_context_tokens: usize,
) -> String {
    let mut context = String::new();
    let mut used_tokens = 0usize;

    for (idx, (file_path, content)) in fragments.iter().enumerate() {
        let fragment = format!("[{}] ({})\n{}\n\n", idx + 1, file_path, content.trim());
        let fragment_tokens = estimate_tokens(&fragment);
        if used_tokens + fragment_tokens > max_context_tokens && !context.is_empty() {
            debug!(
                included = idx,
                total = fragments.len(),
                "Context truncated by token budget"
            );
            break;
        }
        used_tokens += fragment_tokens;
        context.push_str(&fragment);
    }

    format!("Context fragments:\n\n{context}Question: {question}")
}

/// Confidence from the top of the score distribution: the best hit anchors
/// it, the spread of the top three tempers it.
fn estimate_confidence(vector_scores: &[f32]) -> f32 {
    if vector_scores.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f32> = vector_scores.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let top = sorted[0];
    let top3 = &sorted[..sorted.len().min(3)];
    let mean_top3: f32 = top3.iter().sum::<f32>() / top3.len() as f32;
    (0.5 * top + 0.5 * mean_top3).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BreakerConfig, CacheConfig, EmbeddingConfig, ResilienceConfig, RetryConfig,
        TimeoutConfig,
    };
    use crate::graph::{ChunkNode, ConceptNode, MockGraphStore, RelatedConcept};
    use crate::resilience::Pipelines;
    use crate::services::embedding_cache::EmbeddingCache;
    use crate::services::embedding_service::MockEmbeddingProvider;
    use crate::services::llm_service::MockGenerationProvider;
    use crate::vector::{MockVectorStore, VectorHit};
    use chrono::Utc;
    use tokio::sync::watch;

    fn pipelines() -> Pipelines {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        Pipelines::new(
            &ResilienceConfig {
                retry: RetryConfig {
                    attempts: 1,
                    initial_delay_ms: 1,
                    max_delay_ms: 2,
                    jitter: false,
                },
                breaker: BreakerConfig {
                    failure_ratio: 0.9,
                    min_throughput: 100,
                    sampling_s: 60,
                    break_s: 1,
                },
                timeout: TimeoutConfig {
                    default_s: 5,
                    embedding_s: 5,
                    storage_s: 5,
                },
            },
            rx,
        )
    }

    fn embedder(provider: MockEmbeddingProvider) -> Arc<EmbeddingService> {
        Arc::new(EmbeddingService::new(
            Arc::new(provider),
            Arc::new(EmbeddingCache::new(&CacheConfig {
                enabled: false,
                max_items: 10,
                ttl_hours: 1,
                sweep_interval_seconds: 300,
            })),
            pipelines().embedding,
            &EmbeddingConfig {
                base_url: String::new(),
                model: "m".into(),
                dimension: 3,
                api_key: None,
                batch_size: 4,
            },
        ))
    }

    fn rag_config() -> RagConfig {
        RagConfig {
            max_chunks: 5,
            graph_hops: 1,
            min_score: 0.0,
            vector_weight: 0.7,
            graph_weight: 0.3,
            max_context_tokens: 4000,
        }
    }

    fn tenant() -> TenantKey {
        TenantKey::derive("proj", "main", &PathBuf::from("/srv/repo"))
    }

    fn chunk_record(chunk_id: Uuid, document_id: Uuid, content: &str) -> ChunkRecord {
        ChunkRecord {
            id: chunk_id,
            document_id,
            chunk_index: 0,
            header_path: vec![],
            start_line: 1,
            end_line: 5,
            content: content.to_string(),
            content_hash: "h".into(),
        }
    }

    fn document_record(document_id: Uuid, tenant: &TenantKey, file_path: &str) -> DocumentRecord {
        DocumentRecord {
            id: document_id,
            project_name: tenant.project_name.clone(),
            branch_name: tenant.branch_name.clone(),
            path_hash: tenant.path_hash.clone(),
            file_path: file_path.to_string(),
            title: "T".into(),
            doc_type: "doc".into(),
            promotion_level: "standard".into(),
            frontmatter: serde_json::json!({}),
            body_hash: "b".into(),
            commit_hash: None,
            embedding: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn empty_corpus_returns_insufficient_evidence() {
        let mut provider = MockEmbeddingProvider::new();
        provider.expect_embed().returning(|_| Ok(vec![0.1, 0.2, 0.3]));

        let mut vectors = MockVectorStore::new();
        vectors.expect_search().returning(|_, _, _| Ok(vec![]));

        let mut generator = MockGenerationProvider::new();
        generator.expect_generate().times(0);

        let graph = MockGraphStore::new();
        let reader = MockChunkReader::new();

        let service = RagService::new(
            Arc::new(reader),
            embedder(provider),
            Arc::new(generator),
            Arc::new(vectors),
            Arc::new(graph),
            pipelines().storage,
            rag_config(),
        );

        let answer = service
            .query("anything", QueryOptions::default(), &tenant())
            .await
            .expect("success, not error");
        assert!(answer.answer.contains("don't have enough"));
        assert!(answer.sources.is_empty());
        assert_eq!(answer.confidence, 0.0);
    }

    #[tokio::test]
    async fn vector_hits_flow_into_answer_with_sources() {
        let tenant_key = tenant();
        let chunk_id = Uuid::new_v4();
        let doc_id = Uuid::new_v4();

        let mut provider = MockEmbeddingProvider::new();
        provider.expect_embed().returning(|_| Ok(vec![0.1, 0.2, 0.3]));

        let mut vectors = MockVectorStore::new();
        vectors.expect_search().returning(move |_, _, _| {
            Ok(vec![VectorHit {
                chunk_id,
                document_id: doc_id,
                file_path: "docs/a.md".into(),
                chunk_index: 0,
                promotion_level: "standard".into(),
                score: 0.9,
            }])
        });

        let mut graph = MockGraphStore::new();
        graph
            .expect_get_concepts_for_chunk()
            .returning(|_| Ok(vec![]));

        let mut reader = MockChunkReader::new();
        reader
            .expect_chunk_by_id()
            .returning(move |id| Ok(Some(chunk_record(id, doc_id, "retry uses backoff"))));

        let mut generator = MockGenerationProvider::new();
        generator
            .expect_generate()
            .times(1)
            .returning(|_| Ok("Retries use exponential backoff [1].".to_string()));

        let service = RagService::new(
            Arc::new(reader),
            embedder(provider),
            Arc::new(generator),
            Arc::new(vectors),
            Arc::new(graph),
            pipelines().storage,
            rag_config(),
        );

        let answer = service
            .query("how do retries work?", QueryOptions::default(), &tenant_key)
            .await
            .unwrap();

        assert!(answer.answer.contains("[1]"));
        assert_eq!(answer.sources.len(), 1);
        assert_eq!(answer.sources[0].chunk_id, chunk_id);
        assert_eq!(answer.sources[0].file_path, "docs/a.md");
        assert!(answer.confidence > 0.5);
    }

    #[tokio::test]
    async fn graph_enrichment_excludes_other_tenants() {
        let tenant_key = tenant();
        let hit_chunk = Uuid::new_v4();
        let hit_doc = Uuid::new_v4();
        let foreign_chunk = Uuid::new_v4();
        let foreign_doc = Uuid::new_v4();

        let mut provider = MockEmbeddingProvider::new();
        provider.expect_embed().returning(|_| Ok(vec![0.1, 0.2, 0.3]));

        let mut vectors = MockVectorStore::new();
        vectors.expect_search().returning(move |_, _, _| {
            Ok(vec![VectorHit {
                chunk_id: hit_chunk,
                document_id: hit_doc,
                file_path: "docs/a.md".into(),
                chunk_index: 0,
                promotion_level: "standard".into(),
                score: 0.8,
            }])
        });

        let mut graph = MockGraphStore::new();
        let hit_chunk_str = hit_chunk.to_string();
        graph.expect_get_concepts_for_chunk().returning(move |id| {
            if id == hit_chunk_str {
                Ok(vec![ConceptNode {
                    id: "retry".into(),
                    name: "Retry".into(),
                    description: None,
                    category: None,
                    aliases: vec![],
                }])
            } else {
                Ok(vec![])
            }
        });
        graph.expect_get_related_concepts().returning(|_, _| {
            Ok(vec![RelatedConcept {
                concept: ConceptNode {
                    id: "backoff".into(),
                    name: "Backoff".into(),
                    description: None,
                    category: None,
                    aliases: vec![],
                },
                hops: 1,
            }])
        });
        let foreign_chunk_str = foreign_chunk.to_string();
        graph.expect_get_chunks_by_concept().returning(move |_| {
            Ok(vec![ChunkNode {
                id: foreign_chunk_str.clone(),
                document_id: foreign_doc.to_string(),
                chunk_index: 0,
            }])
        });

        let mut reader = MockChunkReader::new();
        let tenant_clone = tenant_key.clone();
        reader.expect_chunk_by_id().returning(move |id| {
            if id == foreign_chunk {
                Ok(Some(chunk_record(id, foreign_doc, "foreign content")))
            } else {
                Ok(Some(chunk_record(id, hit_doc, "our content")))
            }
        });
        reader.expect_document_by_id().returning(move |id| {
            if id == foreign_doc {
                // Same project name, different branch: still another tenant.
                let other = TenantKey::derive(
                    &tenant_clone.project_name,
                    "other-branch",
                    &PathBuf::from("/srv/repo"),
                );
                Ok(Some(document_record(id, &other, "docs/foreign.md")))
            } else {
                Ok(Some(document_record(id, &tenant_clone, "docs/a.md")))
            }
        });

        let mut generator = MockGenerationProvider::new();
        generator
            .expect_generate()
            .returning(|_| Ok("answer [1]".to_string()));

        let service = RagService::new(
            Arc::new(reader),
            embedder(provider),
            Arc::new(generator),
            Arc::new(vectors),
            Arc::new(graph),
            pipelines().storage,
            rag_config(),
        );

        let answer = service
            .query("question", QueryOptions::default(), &tenant_key)
            .await
            .unwrap();

        assert!(
            answer.sources.iter().all(|s| s.chunk_id != foreign_chunk),
            "foreign tenant's chunk must not leak into the sources"
        );
        assert_eq!(answer.related_concepts, vec!["Backoff"]);
    }

    #[test]
    fn blended_score_prefers_vector_hits_over_distant_graph_chunks() {
        let config = rag_config();
        let vector = config.vector_weight * 0.9 + config.graph_weight * 1.0;
        let graph_only = config.vector_weight * 0.0 + config.graph_weight * (1.0 / 3.0);
        assert!(vector > graph_only);
    }

    #[test]
    fn confidence_tracks_top_scores() {
        assert_eq!(estimate_confidence(&[]), 0.0);
        let high = estimate_confidence(&[0.95, 0.9, 0.85]);
        let low = estimate_confidence(&[0.3, 0.1]);
        assert!(high > 0.8);
        assert!(low < 0.4);
        assert!(estimate_confidence(&[2.0]) <= 1.0);
    }

    #[test]
    fn synthesis_prompt_numbers_fragments_and_caps_tokens() {
        let prompt = build_synthesis_prompt(
            "what is the retry policy?",
            &[
                ("docs/a.md", "retries use exponential backoff"),
                ("docs/b.md", "the breaker opens after failures"),
            ],
            4000,
        );
        assert!(prompt.contains("[1] (docs/a.md)"));
        assert!(prompt.contains("[2] (docs/b.md)"));
        assert!(prompt.ends_with("Question: what is the retry policy?"));

        let long_fragment = "x".repeat(4000);
        let capped = build_synthesis_prompt(
            "q",
            &[("a.md", long_fragment.as_str()), ("b.md", "short")],
            500,
        );
        assert!(capped.contains("[1]"));
        assert!(!capped.contains("[2]"), "budget must drop later fragments");
    }
}
