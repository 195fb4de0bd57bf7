use crate::document::PromotionLevel;
use crate::utils::error::ApiError;
use dashmap::DashMap;
use jsonschema::{Draft, Validator};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::sync::Arc;
use tracing::{debug, warn};

static KEBAB_CASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("static regex"));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocTypeDefinition {
    /// Kebab-case identifier, unique case-insensitively.
    pub id: String,
    pub name: String,
    pub description: String,
    pub is_built_in: bool,
    pub trigger_phrases: Vec<String>,
    pub required_fields: Vec<String>,
    pub optional_fields: Vec<String>,
    pub json_schema: Option<JsonValue>,
    pub default_promotion_level: PromotionLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Unknown doc types fail the validation.
    Strict,
    /// Unknown doc types produce a warning only.
    Lenient,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ValidationIssue {
    pub property_path: String,
    pub message: String,
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Registry of built-in and user-registered document types with a compiled
/// JSON-Schema cache keyed by type id.
pub struct DocTypeRegistry {
    types: DashMap<String, DocTypeDefinition>,
    compiled: DashMap<String, Arc<Validator>>,
}

impl DocTypeRegistry {
    pub fn new() -> Self {
        let registry = Self {
            types: DashMap::new(),
            compiled: DashMap::new(),
        };
        for definition in built_in_types() {
            // Built-in ids are static and unique; a failure here is a bug.
            registry
                .insert(definition)
                .expect("built-in doc types must register");
        }
        registry
    }

    /// Register a custom type. Fails on a duplicate id (case-insensitive)
    /// or a malformed id / schema.
    pub fn register(&self, mut definition: DocTypeDefinition) -> Result<String, ApiError> {
        definition.id = definition.id.trim().to_lowercase();
        if !KEBAB_CASE.is_match(&definition.id) {
            return Err(ApiError::InvalidArgument(format!(
                "doc type id '{}' must be kebab-case",
                definition.id
            )));
        }
        definition.is_built_in = false;
        for field in ["title", "doc_type"] {
            if !definition.required_fields.iter().any(|f| f == field) {
                definition.required_fields.push(field.to_string());
            }
        }
        self.insert(definition)
    }

    fn insert(&self, definition: DocTypeDefinition) -> Result<String, ApiError> {
        let id = definition.id.to_lowercase();
        if self.types.contains_key(&id) {
            return Err(ApiError::DuplicateDocType(id));
        }

        if let Some(schema) = &definition.json_schema {
            let validator = compile_schema(schema).map_err(|e| {
                ApiError::InvalidArgument(format!("invalid JSON schema for '{id}': {e}"))
            })?;
            self.compiled.insert(id.clone(), Arc::new(validator));
        }

        debug!(doc_type = %id, built_in = definition.is_built_in, "Registered doc type");
        self.types.insert(id.clone(), definition);
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<DocTypeDefinition> {
        self.types.get(&id.to_lowercase()).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.types.contains_key(&id.to_lowercase())
    }

    pub fn list(&self) -> Vec<DocTypeDefinition> {
        let mut all: Vec<DocTypeDefinition> =
            self.types.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Best trigger-phrase match for free text, used to suggest a type when
    /// the author declared none.
    pub fn suggest(&self, text: &str) -> Option<DocTypeDefinition> {
        let lowered = text.to_lowercase();
        let mut best: Option<(usize, DocTypeDefinition)> = None;
        for entry in self.types.iter() {
            let hits = entry
                .value()
                .trigger_phrases
                .iter()
                .filter(|phrase| lowered.contains(&phrase.to_lowercase()))
                .count();
            if hits > 0 && best.as_ref().map(|(h, _)| hits > *h).unwrap_or(true) {
                best = Some((hits, entry.value().clone()));
            }
        }
        best.map(|(_, def)| def)
    }

    /// Two-layer validation: cheap required-field presence first, then the
    /// type's full JSON schema against the frontmatter.
    pub fn validate(
        &self,
        doc_type: &str,
        frontmatter: &JsonMap<String, JsonValue>,
        mode: ValidationMode,
    ) -> Result<ValidationReport, ApiError> {
        let mut report = ValidationReport::default();

        let Some(definition) = self.get(doc_type) else {
            return match mode {
                ValidationMode::Strict => Err(ApiError::InvalidDocType(format!(
                    "unknown doc type '{doc_type}'"
                ))),
                ValidationMode::Lenient => {
                    warn!(doc_type, "Unknown doc type, validating leniently");
                    report
                        .warnings
                        .push(format!("unknown doc type '{doc_type}'"));
                    Ok(report)
                }
            };
        };

        for field in &definition.required_fields {
            let value = frontmatter.get(field);
            let blank = match value {
                None => true,
                Some(JsonValue::Null) => true,
                Some(JsonValue::String(s)) => s.trim().is_empty(),
                Some(_) => false,
            };
            if blank {
                report.errors.push(ValidationIssue {
                    property_path: field.clone(),
                    message: format!("required field '{field}' is missing or blank"),
                    error_type: "RequiredField".to_string(),
                    expected: Some("non-blank value".to_string()),
                    actual: Some(
                        value
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "missing".to_string()),
                    ),
                });
            }
        }

        if definition.json_schema.is_some() {
            let validator = self.compiled_for(&definition)?;
            let instance = JsonValue::Object(frontmatter.clone());
            for error in validator.iter_errors(&instance) {
                report.errors.push(ValidationIssue {
                    property_path: error.instance_path.to_string(),
                    message: error.to_string(),
                    error_type: "SchemaViolation".to_string(),
                    expected: None,
                    actual: Some(error.instance.to_string()),
                });
            }
        }

        Ok(report)
    }

    fn compiled_for(&self, definition: &DocTypeDefinition) -> Result<Arc<Validator>, ApiError> {
        let id = definition.id.to_lowercase();
        if let Some(validator) = self.compiled.get(&id) {
            return Ok(validator.value().clone());
        }
        // Persisted custom types loaded after startup land here once.
        let schema = definition
            .json_schema
            .as_ref()
            .ok_or_else(|| ApiError::Internal(format!("doc type '{id}' has no schema")))?;
        let validator = Arc::new(compile_schema(schema).map_err(|e| {
            ApiError::Internal(format!("stored schema for '{id}' no longer compiles: {e}"))
        })?);
        self.compiled.insert(id, validator.clone());
        Ok(validator)
    }
}

impl Default for DocTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn compile_schema(schema: &JsonValue) -> Result<Validator, String> {
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .map_err(|e| e.to_string())
}

fn built_in(
    id: &str,
    name: &str,
    description: &str,
    triggers: &[&str],
    extra_required: &[&str],
    optional: &[&str],
    promotion: PromotionLevel,
) -> DocTypeDefinition {
    let mut required = vec!["title".to_string(), "doc_type".to_string()];
    required.extend(extra_required.iter().map(|s| s.to_string()));
    DocTypeDefinition {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        is_built_in: true,
        trigger_phrases: triggers.iter().map(|s| s.to_string()).collect(),
        required_fields: required,
        optional_fields: optional.iter().map(|s| s.to_string()).collect(),
        json_schema: None,
        default_promotion_level: promotion,
    }
}

fn built_in_types() -> Vec<DocTypeDefinition> {
    vec![
        built_in(
            "problem",
            "Problem Report",
            "A problem encountered during development and how it was resolved",
            &["we hit a problem", "ran into an issue", "debugging"],
            &["symptoms"],
            &["resolution", "affected_areas"],
            PromotionLevel::Standard,
        ),
        built_in(
            "insight",
            "Insight",
            "A non-obvious learning worth keeping",
            &["learned that", "turns out", "insight"],
            &[],
            &["context"],
            PromotionLevel::Standard,
        ),
        built_in(
            "codebase",
            "Codebase Note",
            "How a part of the codebase works",
            &["architecture", "module overview", "how it works"],
            &["component"],
            &["entry_points"],
            PromotionLevel::Important,
        ),
        built_in(
            "tool",
            "Tool Guide",
            "Usage notes for an internal or external tool",
            &["how to use", "tool", "cli"],
            &[],
            &["command"],
            PromotionLevel::Standard,
        ),
        built_in(
            "style",
            "Style Rule",
            "A convention the team follows",
            &["convention", "style", "always", "never"],
            &[],
            &["applies_to"],
            PromotionLevel::Standard,
        ),
        built_in(
            "spec",
            "Specification",
            "A feature or system specification",
            &["specification", "requirements", "shall"],
            &["status"],
            &["owner"],
            PromotionLevel::Important,
        ),
        built_in(
            "adr",
            "Architecture Decision Record",
            "A recorded architecture decision with its context",
            &["we decided", "decision", "adr"],
            &["status", "decision"],
            &["consequences", "alternatives"],
            PromotionLevel::Important,
        ),
        built_in(
            "research",
            "Research Note",
            "Findings from investigating an approach or technology",
            &["investigated", "research", "compared"],
            &[],
            &["sources"],
            PromotionLevel::Standard,
        ),
        built_in(
            "doc",
            "General Documentation",
            "General-purpose documentation page",
            &[],
            &[],
            &[],
            PromotionLevel::Standard,
        ),
    ]
}
