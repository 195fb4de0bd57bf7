use crate::database::Repository;
use crate::document::doc_type::{DocTypeDefinition, DocTypeRegistry};
use crate::document::PromotionLevel;
use crate::tenant::{ActiveSession, SessionContext, TenantKey};
use crate::utils::error::ApiError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const CONTEXT_SECTION_START: &str = "<!-- knowledge-server:doc-types:start -->";
const CONTEXT_SECTION_END: &str = "<!-- knowledge-server:doc-types:end -->";

#[derive(Debug, Deserialize)]
struct ProjectFile {
    name: String,
    #[serde(default)]
    #[allow(dead_code)]
    description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocTypeSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub is_built_in: bool,
    pub trigger_phrases: Vec<String>,
    pub required_fields: Vec<String>,
    pub default_promotion_level: PromotionLevel,
}

impl From<DocTypeDefinition> for DocTypeSummary {
    fn from(def: DocTypeDefinition) -> Self {
        Self {
            id: def.id,
            name: def.name,
            description: def.description,
            is_built_in: def.is_built_in,
            trigger_phrases: def.trigger_phrases,
            required_fields: def.required_fields,
            default_promotion_level: def.default_promotion_level,
        }
    }
}

/// Binds tool invocations to a tenant: project activation, doc-type
/// listing/registration, and the CLAUDE.md context section refresh.
pub struct SessionService {
    repository: Arc<Repository>,
    doc_types: Arc<DocTypeRegistry>,
    session: ActiveSession,
}

impl SessionService {
    pub fn new(
        repository: Arc<Repository>,
        doc_types: Arc<DocTypeRegistry>,
        session: ActiveSession,
    ) -> Self {
        Self {
            repository,
            doc_types,
            session,
        }
    }

    /// Read the project file, derive the tenant triple, register the repo
    /// path and branch, and record the activation.
    pub async fn activate_project(
        &self,
        config_path: &str,
        branch: &str,
    ) -> Result<SessionContext, ApiError> {
        if branch.trim().is_empty() {
            return Err(ApiError::InvalidArgument("branch must not be blank".into()));
        }

        let config_path = Path::new(config_path);
        let raw = tokio::fs::read_to_string(config_path).await.map_err(|e| {
            ApiError::InvalidArgument(format!(
                "cannot read project file {}: {e}",
                config_path.display()
            ))
        })?;
        let project: ProjectFile = toml::from_str(&raw).map_err(|e| {
            ApiError::InvalidArgument(format!("invalid project file: {e}"))
        })?;

        let repo_path = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config_path.to_path_buf());
        let tenant = TenantKey::derive(&project.name, branch, &repo_path);
        let filter = tenant.filter();

        self.repository
            .get_or_create_repo_path(&filter, &repo_path.to_string_lossy())
            .await
            .map_err(|e| ApiError::StorageFailed(e.to_string()))?;
        self.repository
            .get_or_create_branch(&filter)
            .await
            .map_err(|e| ApiError::StorageFailed(e.to_string()))?;

        let context = SessionContext {
            project_name: project.name,
            active_branch: branch.to_string(),
            path_hash: tenant.path_hash.clone(),
            repo_path: repo_path.to_string_lossy().to_string(),
            is_active: true,
        };
        self.session.activate(context.clone()).await;

        if let Err(err) = update_claude_md(&repo_path, &self.list_doc_types()).await {
            // The context file is a convenience; activation still succeeds.
            warn!(error = %err, "Failed to refresh CLAUDE.md doc-type section");
        }

        info!(tenant = %tenant, "Project activated");
        Ok(context)
    }

    /// Built-ins plus custom types persisted by earlier runs.
    pub async fn load_persisted_doc_types(&self) -> Result<usize, ApiError> {
        let records = self
            .repository
            .list_doc_types()
            .await
            .map_err(|e| ApiError::StorageFailed(e.to_string()))?;

        let mut loaded = 0usize;
        for record in records {
            let definition: DocTypeDefinition =
                match serde_json::from_value(record.definition.clone()) {
                    Ok(definition) => definition,
                    Err(err) => {
                        warn!(id = %record.id, error = %err, "Skipping unreadable doc type");
                        continue;
                    }
                };
            match self.doc_types.register(definition) {
                Ok(_) => loaded += 1,
                Err(ApiError::DuplicateDocType(_)) => {
                    debug!(id = %record.id, "Doc type already registered");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(loaded)
    }

    pub fn list_doc_types(&self) -> Vec<DocTypeSummary> {
        self.doc_types
            .list()
            .into_iter()
            .map(DocTypeSummary::from)
            .collect()
    }

    /// Registers and persists a custom doc type; the new id is returned.
    pub async fn register_doc_type(
        &self,
        definition: DocTypeDefinition,
    ) -> Result<String, ApiError> {
        let id = self.doc_types.register(definition)?;
        let stored = self
            .doc_types
            .get(&id)
            .ok_or_else(|| ApiError::Internal(format!("doc type '{id}' vanished")))?;
        let value = serde_json::to_value(&stored)
            .map_err(|e| ApiError::Internal(format!("doc type serialisation: {e}")))?;
        self.repository
            .insert_doc_type(&id, &value)
            .await
            .map_err(|e| ApiError::StorageFailed(e.to_string()))?;

        if let Some(context) = self.session.try_current().await {
            let repo_path = Path::new(&context.repo_path).to_path_buf();
            if let Err(err) = update_claude_md(&repo_path, &self.list_doc_types()).await {
                warn!(error = %err, "Failed to refresh CLAUDE.md after doc-type registration");
            }
        }

        Ok(id)
    }
}

fn render_context_section(doc_types: &[DocTypeSummary]) -> String {
    let mut section = String::from(CONTEXT_SECTION_START);
    section.push_str("\n## Knowledge document types\n\n");
    for doc_type in doc_types {
        section.push_str(&format!(
            "- `{}` — {}{}\n",
            doc_type.id,
            doc_type.description,
            if doc_type.is_built_in {
                ""
            } else {
                " (custom)"
            }
        ));
    }
    section.push_str(CONTEXT_SECTION_END);
    section
}

fn splice_context_section(existing: &str, section: &str) -> String {
    match (
        existing.find(CONTEXT_SECTION_START),
        existing.find(CONTEXT_SECTION_END),
    ) {
        (Some(start), Some(end)) if end >= start => {
            let after = &existing[end + CONTEXT_SECTION_END.len()..];
            format!("{}{}{}", &existing[..start], section, after)
        }
        _ => {
            if existing.is_empty() {
                format!("{section}\n")
            } else {
                format!("{}\n\n{section}\n", existing.trim_end())
            }
        }
    }
}

/// Rewrite the marked doc-type section of the repo's CLAUDE.md, creating
/// the file when absent.
async fn update_claude_md(
    repo_path: &Path,
    doc_types: &[DocTypeSummary],
) -> Result<(), std::io::Error> {
    let claude_md = repo_path.join("CLAUDE.md");
    let existing = match tokio::fs::read_to_string(&claude_md).await {
        Ok(existing) => existing,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let updated = splice_context_section(&existing, &render_context_section(doc_types));
    tokio::fs::write(&claude_md, updated).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: &str, built_in: bool) -> DocTypeSummary {
        DocTypeSummary {
            id: id.to_string(),
            name: id.to_string(),
            description: format!("{id} docs"),
            is_built_in: built_in,
            trigger_phrases: vec![],
            required_fields: vec![],
            default_promotion_level: PromotionLevel::Standard,
        }
    }

    #[test]
    fn splice_appends_when_markers_absent() {
        let section = render_context_section(&[summary("adr", true)]);
        let result = splice_context_section("# My Project\n\nNotes here.", &section);
        assert!(result.starts_with("# My Project"));
        assert!(result.contains(CONTEXT_SECTION_START));
        assert!(result.contains("- `adr` — adr docs"));
    }

    #[test]
    fn splice_replaces_existing_section_in_place() {
        let old = format!(
            "intro\n\n{CONTEXT_SECTION_START}\nstale content\n{CONTEXT_SECTION_END}\n\noutro"
        );
        let section = render_context_section(&[summary("runbook", false)]);
        let result = splice_context_section(&old, &section);

        assert!(result.contains("- `runbook` — runbook docs (custom)"));
        assert!(!result.contains("stale content"));
        assert!(result.starts_with("intro"));
        assert!(result.trim_end().ends_with("outro"));
        assert_eq!(result.matches(CONTEXT_SECTION_START).count(), 1);
    }

    #[tokio::test]
    async fn update_claude_md_creates_and_rewrites() {
        let dir = tempfile::tempdir().expect("tempdir");
        let types = vec![summary("adr", true)];

        update_claude_md(dir.path(), &types).await.expect("create");
        let first = tokio::fs::read_to_string(dir.path().join("CLAUDE.md"))
            .await
            .unwrap();
        assert!(first.contains("- `adr`"));

        let types = vec![summary("adr", true), summary("runbook", false)];
        update_claude_md(dir.path(), &types).await.expect("rewrite");
        let second = tokio::fs::read_to_string(dir.path().join("CLAUDE.md"))
            .await
            .unwrap();
        assert!(second.contains("- `runbook`"));
        assert_eq!(second.matches(CONTEXT_SECTION_START).count(), 1);
    }
}
