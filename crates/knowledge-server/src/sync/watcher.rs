use crate::config::WatcherConfig;
use crate::database::Repository;
use crate::services::indexer::DocumentIndexer;
use crate::tenant::TenantKey;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Debounced filesystem watcher for tenants backed by a local working
/// tree. Bursts of events are coalesced within the debounce window and
/// drained by a single consumer so no two tasks write the same document.
/// A periodic reconciliation pass catches events the watcher missed.
pub struct FileWatcher {
    indexer: Arc<DocumentIndexer>,
    repository: Arc<Repository>,
    debounce: Duration,
    reconcile_interval: Duration,
}

impl FileWatcher {
    pub fn new(
        indexer: Arc<DocumentIndexer>,
        repository: Arc<Repository>,
        config: &WatcherConfig,
    ) -> Self {
        Self {
            indexer,
            repository,
            debounce: Duration::from_millis(config.debounce_ms),
            reconcile_interval: Duration::from_secs(config.reconcile_interval_seconds),
        }
    }

    pub fn spawn(
        self: Arc<Self>,
        root: PathBuf,
        tenant: TenantKey,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let (tx, rx) = flume::unbounded::<PathBuf>();

            let mut watcher: RecommendedWatcher = match notify::recommended_watcher(
                move |result: Result<Event, notify::Error>| match result {
                    Ok(event) => {
                        for path in event.paths {
                            tx.send(path).ok();
                        }
                    }
                    Err(err) => warn!(error = %err, "Watcher error"),
                },
            ) {
                Ok(watcher) => watcher,
                Err(err) => {
                    warn!(error = %err, "Failed to create file watcher");
                    return;
                }
            };

            if let Err(err) = watcher.watch(&root, RecursiveMode::Recursive) {
                warn!(root = %root.display(), error = %err, "Failed to watch tree");
                return;
            }
            info!(root = %root.display(), tenant = %tenant, "File watcher started");

            let mut reconcile_tick = tokio::time::interval(self.reconcile_interval);
            reconcile_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip the immediate first tick.
            reconcile_tick.tick().await;

            loop {
                tokio::select! {
                    received = rx.recv_async() => {
                        let Ok(first) = received else { break };
                        let batch = self.debounce_batch(&rx, first).await;
                        self.process_batch(&root, &tenant, batch).await;
                    }
                    _ = reconcile_tick.tick() => {
                        self.reconcile(&root, &tenant).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(root = %root.display(), "File watcher stopped");
        })
    }

    /// Coalesce a burst: keep collecting until the channel stays quiet for
    /// the debounce window.
    async fn debounce_batch(
        &self,
        rx: &flume::Receiver<PathBuf>,
        first: PathBuf,
    ) -> BTreeSet<PathBuf> {
        let mut batch = BTreeSet::from([first]);
        loop {
            match tokio::time::timeout(self.debounce, rx.recv_async()).await {
                Ok(Ok(path)) => {
                    batch.insert(path);
                }
                _ => break,
            }
        }
        batch
    }

    async fn process_batch(&self, root: &Path, tenant: &TenantKey, batch: BTreeSet<PathBuf>) {
        debug!(changes = batch.len(), "Processing watcher batch");
        for path in batch {
            let Some(rel) = relative_markdown_path(root, &path) else {
                continue;
            };
            if path.exists() {
                match tokio::fs::read_to_string(&path).await {
                    Ok(content) => {
                        if let Err(err) = self.indexer.index(&rel, &content, tenant, None).await {
                            warn!(path = %rel, error = %err, "Watcher index failed");
                        }
                    }
                    Err(err) => warn!(path = %rel, error = %err, "Watcher read failed"),
                }
            } else {
                if let Err(err) = self.indexer.delete(tenant, &rel).await {
                    warn!(path = %rel, error = %err, "Watcher delete failed");
                }
            }
        }
    }

    /// On-disk vs indexed state: missing on disk means delete, present but
    /// unknown means index.
    pub async fn reconcile(&self, root: &Path, tenant: &TenantKey) {
        let on_disk = walk_markdown_files(root);
        let indexed = match self.repository.get_file_paths(&tenant.filter()).await {
            Ok(paths) => paths,
            Err(err) => {
                warn!(error = %err, "Reconcile skipped, could not list indexed paths");
                return;
            }
        };

        let disk_set: BTreeSet<&str> = on_disk.iter().map(String::as_str).collect();
        let indexed_set: BTreeSet<&str> = indexed.iter().map(String::as_str).collect();

        let mut deleted = 0usize;
        for path in indexed_set.difference(&disk_set) {
            match self.indexer.delete(tenant, path).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(err) => warn!(path = %path, error = %err, "Reconcile delete failed"),
            }
        }

        let mut added = 0usize;
        for path in disk_set.difference(&indexed_set) {
            let absolute = root.join(path);
            match tokio::fs::read_to_string(&absolute).await {
                Ok(content) => match self.indexer.index(path, &content, tenant, None).await {
                    Ok(result) if result.success => added += 1,
                    Ok(_) | Err(_) => {
                        warn!(path = %path, "Reconcile index failed");
                    }
                },
                Err(err) => warn!(path = %path, error = %err, "Reconcile read failed"),
            }
        }

        if deleted > 0 || added > 0 {
            info!(added, deleted, "Reconciliation pass applied changes");
        }
    }
}

/// Repo-relative POSIX path for markdown files under the root; `None` for
/// anything else (directories, non-markdown, paths outside the root).
pub fn relative_markdown_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let rel = rel.to_string_lossy().replace('\\', "/");
    if rel.is_empty() || rel.starts_with(".git/") {
        return None;
    }
    let lowered = rel.to_ascii_lowercase();
    if lowered.ends_with(".md") || lowered.ends_with(".markdown") {
        Some(rel)
    } else {
        None
    }
}

/// Recursive enumeration of markdown files, skipping VCS internals.
pub fn walk_markdown_files(root: &Path) -> Vec<String> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if path.file_name().map(|n| n == ".git").unwrap_or(false) {
                    continue;
                }
                walk(root, &path, out);
            } else if let Some(rel) = relative_markdown_path(root, &path) {
                out.push(rel);
            }
        }
    }

    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn relative_paths_filter_markdown_and_git() {
        let root = Path::new("/srv/repo");
        assert_eq!(
            relative_markdown_path(root, Path::new("/srv/repo/docs/a.md")),
            Some("docs/a.md".to_string())
        );
        assert_eq!(
            relative_markdown_path(root, Path::new("/srv/repo/docs/a.MD")),
            Some("docs/a.MD".to_string())
        );
        assert_eq!(
            relative_markdown_path(root, Path::new("/srv/repo/src/main.rs")),
            None
        );
        assert_eq!(
            relative_markdown_path(root, Path::new("/srv/repo/.git/config.md")),
            None
        );
        assert_eq!(
            relative_markdown_path(root, Path::new("/elsewhere/a.md")),
            None
        );
    }

    #[test]
    fn walk_finds_nested_markdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("docs/deep")).unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join("readme.md"), "r").unwrap();
        fs::write(dir.path().join("docs/a.md"), "a").unwrap();
        fs::write(dir.path().join("docs/deep/b.markdown"), "b").unwrap();
        fs::write(dir.path().join("docs/code.rs"), "no").unwrap();
        fs::write(dir.path().join(".git/internal.md"), "no").unwrap();

        let found = walk_markdown_files(dir.path());
        assert_eq!(
            found,
            vec!["docs/a.md", "docs/deep/b.markdown", "readme.md"]
        );
    }
}
