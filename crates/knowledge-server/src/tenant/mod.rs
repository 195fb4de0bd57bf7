use crate::utils::error::ApiError;
use crate::utils::hashing::sha256_hex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Identity of a tenant: every persisted row and vector carries this triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantKey {
    pub project_name: String,
    pub branch_name: String,
    pub path_hash: String,
}

impl TenantKey {
    /// Derive the key from a project name, branch and absolute repo path.
    /// The path is canonicalised when it exists on disk so that symlinked
    /// checkouts of the same repo map to the same tenant.
    pub fn derive(project_name: &str, branch_name: &str, repo_path: &Path) -> Self {
        let canonical = repo_path
            .canonicalize()
            .unwrap_or_else(|_| repo_path.to_path_buf());
        let normalised = canonical.to_string_lossy().replace('\\', "/");

        Self {
            project_name: project_name.to_string(),
            branch_name: branch_name.to_string(),
            path_hash: sha256_hex(&normalised),
        }
    }

    pub fn filter(&self) -> TenantFilter {
        TenantFilter {
            project_name: self.project_name.clone(),
            branch_name: self.branch_name.clone(),
            path_hash: self.path_hash.clone(),
        }
    }

    /// Short display form for logs; consumers truncate the hash only here.
    pub fn short(&self) -> String {
        let hash = if self.path_hash.len() >= 8 {
            &self.path_hash[..8]
        } else {
            &self.path_hash
        };
        format!("{}:{}:{}", self.project_name, self.branch_name, hash)
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// Storage-level predicate. Every repository, vector and graph operation is
/// constrained by the full triple; partial filters are rejected at the
/// boundary rather than silently widening the scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantFilter {
    pub project_name: String,
    pub branch_name: String,
    pub path_hash: String,
}

impl TenantFilter {
    pub fn new(
        project_name: &str,
        branch_name: &str,
        path_hash: &str,
    ) -> Result<Self, ApiError> {
        if project_name.trim().is_empty()
            || branch_name.trim().is_empty()
            || path_hash.trim().is_empty()
        {
            return Err(ApiError::InvalidArgument(
                "tenant filter requires project_name, branch_name and path_hash".to_string(),
            ));
        }
        Ok(Self {
            project_name: project_name.to_string(),
            branch_name: branch_name.to_string(),
            path_hash: path_hash.to_string(),
        })
    }

    /// Metadata map attached to every indexed vector.
    pub fn as_metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            ("project_name".to_string(), self.project_name.clone()),
            ("branch_name".to_string(), self.branch_name.clone()),
            ("path_hash".to_string(), self.path_hash.clone()),
        ])
    }
}

impl From<&TenantKey> for TenantFilter {
    fn from(key: &TenantKey) -> Self {
        key.filter()
    }
}

/// Request-visible session state: which project is currently activated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub project_name: String,
    pub active_branch: String,
    pub path_hash: String,
    pub repo_path: String,
    pub is_active: bool,
}

impl SessionContext {
    pub fn tenant_key(&self) -> TenantKey {
        TenantKey {
            project_name: self.project_name.clone(),
            branch_name: self.active_branch.clone(),
            path_hash: self.path_hash.clone(),
        }
    }
}

/// Process-wide active session. Tool invocations resolve the tenant filter
/// through this before touching any repository.
#[derive(Clone, Default)]
pub struct ActiveSession {
    inner: Arc<RwLock<Option<SessionContext>>>,
}

impl ActiveSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn activate(&self, context: SessionContext) {
        info!("Session activated for tenant {}", context.tenant_key());
        let mut guard = self.inner.write().await;
        *guard = Some(context);
    }

    pub async fn clear(&self) {
        let mut guard = self.inner.write().await;
        *guard = None;
    }

    /// Absent value when no project is active; callers that can proceed
    /// without a tenant use this.
    pub async fn try_current(&self) -> Option<SessionContext> {
        self.inner.read().await.clone()
    }

    /// Unconditional access fails with an invalid-argument error carrying
    /// the no-active-project reason.
    pub async fn require_current(&self) -> Result<SessionContext, ApiError> {
        self.try_current().await.ok_or_else(|| {
            ApiError::InvalidArgument(
                "no active project; call activate_project first".to_string(),
            )
        })
    }

    pub async fn require_tenant(&self) -> Result<TenantKey, ApiError> {
        Ok(self.require_current().await?.tenant_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn derive_is_stable_for_equal_paths() {
        let a = TenantKey::derive("proj", "main", &PathBuf::from("/srv/does-not-exist/repo"));
        let b = TenantKey::derive("proj", "main", &PathBuf::from("/srv/does-not-exist/repo"));
        assert_eq!(a, b);
        assert_eq!(a.path_hash.len(), 64);
        assert_eq!(a.path_hash, a.path_hash.to_lowercase());
    }

    #[test]
    fn different_branches_are_different_tenants() {
        let path = PathBuf::from("/srv/repo");
        let main = TenantKey::derive("proj", "main", &path);
        let dev = TenantKey::derive("proj", "dev", &path);
        assert_ne!(main.filter(), dev.filter());
    }

    #[test]
    fn short_form_truncates_hash_for_display_only() {
        let key = TenantKey::derive("proj", "main", &PathBuf::from("/srv/repo"));
        let short = key.short();
        assert!(short.starts_with("proj:main:"));
        assert_eq!(short.split(':').next_back().map(str::len), Some(8));
        // The filter still carries the full hash.
        assert_eq!(key.filter().path_hash.len(), 64);
    }

    #[test]
    fn partial_filter_is_rejected() {
        assert!(TenantFilter::new("proj", "", "abc").is_err());
        assert!(TenantFilter::new("", "main", "abc").is_err());
        assert!(TenantFilter::new("proj", "main", "  ").is_err());
        assert!(TenantFilter::new("proj", "main", "abc").is_ok());
    }

    #[test]
    fn metadata_carries_full_triple() {
        let key = TenantKey::derive("proj", "main", &PathBuf::from("/srv/repo"));
        let meta = key.filter().as_metadata();
        assert_eq!(meta.get("project_name").map(String::as_str), Some("proj"));
        assert_eq!(meta.get("branch_name").map(String::as_str), Some("main"));
        assert_eq!(meta.get("path_hash"), Some(&key.path_hash));
    }

    #[tokio::test]
    async fn session_requires_activation() {
        let session = ActiveSession::new();
        assert!(session.try_current().await.is_none());
        assert!(session.require_current().await.is_err());

        session
            .activate(SessionContext {
                project_name: "proj".into(),
                active_branch: "main".into(),
                path_hash: "a".repeat(64),
                repo_path: "/srv/repo".into(),
                is_active: true,
            })
            .await;

        let tenant = session.require_tenant().await.expect("active");
        assert_eq!(tenant.project_name, "proj");
    }
}
