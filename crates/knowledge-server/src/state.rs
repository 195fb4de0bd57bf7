use crate::config::Settings;
use crate::database::Repository;
use crate::services::{
    DocumentIndexer, EmbeddingCache, EventBus, RagService, SessionService,
};
use crate::sync::{FileWatcher, SyncScheduler};
use crate::tenant::ActiveSession;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

/// Everything the tool surface needs, assembled once at startup.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub repository: Arc<Repository>,
    pub session: ActiveSession,
    pub session_service: Arc<SessionService>,
    pub indexer: Arc<DocumentIndexer>,
    pub rag: Arc<RagService>,
    pub event_bus: Arc<EventBus>,
    pub embedding_cache: Arc<EmbeddingCache>,
    pub rate_limiter: Arc<crate::resilience::RateLimiterRegistry>,
    pub scheduler: Option<Arc<SyncScheduler>>,
    pub watcher: Option<Arc<FileWatcher>>,
    /// Watch task for the currently activated project tree, replaced on
    /// re-activation.
    pub watcher_task: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    /// Per-tool rate-limit gate; rejections carry retry-after.
    pub fn check_rate_limit(&self, tool: &str) -> Result<(), crate::utils::error::ApiError> {
        match self.rate_limiter.try_acquire(tool, None).into_error(tool) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}
