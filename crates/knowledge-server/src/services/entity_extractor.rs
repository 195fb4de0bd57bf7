use crate::resilience::ResiliencePipeline;
use crate::services::llm_service::{ChatMessage, GenerationProvider};
use std::sync::Arc;
use serde::Deserialize;
use tracing::{debug, warn};

const EXTRACTION_SYSTEM_PROMPT: &str = "\
You extract knowledge-graph entities from technical documentation.\n\
Given a text fragment, respond with JSON only, no prose, in this shape:\n\
{\"concepts\": [{\"name\": \"...\", \"description\": \"...\", \"category\": \"...\", \"aliases\": [\"...\"]}],\n \
\"relationships\": [{\"source\": \"...\", \"target\": \"...\"}]}\n\
Concepts are the named technologies, components and ideas the text is about.\n\
Relationships connect concept names that the text explicitly relates.\n\
Return {\"concepts\": [], \"relationships\": []} when nothing is worth extracting.";

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct ExtractedEntities {
    #[serde(default)]
    pub concepts: Vec<ExtractedConcept>,
    #[serde(default)]
    pub relationships: Vec<ExtractedRelationship>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ExtractedConcept {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ExtractedRelationship {
    pub source: String,
    pub target: String,
}

/// LLM-backed concept/relationship extraction. Best-effort by contract:
/// failures log a warning and yield zero entities, never failing the
/// indexing pass that triggered them.
pub struct EntityExtractor {
    generator: Arc<dyn GenerationProvider>,
    pipeline: Arc<ResiliencePipeline>,
}

impl EntityExtractor {
    pub fn new(generator: Arc<dyn GenerationProvider>, pipeline: Arc<ResiliencePipeline>) -> Self {
        Self {
            generator,
            pipeline,
        }
    }

    pub async fn extract(&self, chunk_text: &str) -> ExtractedEntities {
        if chunk_text.trim().is_empty() {
            return ExtractedEntities::default();
        }

        let messages = vec![
            ChatMessage::system(EXTRACTION_SYSTEM_PROMPT),
            ChatMessage::user(chunk_text),
        ];

        let response = match self
            .pipeline
            .execute("extract_entities", || {
                self.generator.generate(messages.clone())
            })
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "Entity extraction failed, continuing without entities");
                return ExtractedEntities::default();
            }
        };

        match parse_extraction(&response) {
            Some(entities) => {
                debug!(
                    concepts = entities.concepts.len(),
                    relationships = entities.relationships.len(),
                    "Extracted entities"
                );
                entities
            }
            None => {
                warn!("Entity extraction returned unparseable output, ignoring");
                ExtractedEntities::default()
            }
        }
    }
}

/// Models wrap JSON in markdown fences often enough that stripping them is
/// part of the contract.
fn parse_extraction(response: &str) -> Option<ExtractedEntities> {
    let trimmed = response.trim();
    let stripped = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(stripped).ok()
}
