use super::git_sync::{GitSyncRunner, SyncExit};
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Periodic sync driver: every tick runs all configured repositories
/// concurrently, with per-repo mutual exclusion and per-repo failure
/// isolation aggregated into `last_run_failed`.
pub struct SyncScheduler {
    runner: Arc<GitSyncRunner>,
    interval: Duration,
    repo_locks: DashMap<String, Arc<Mutex<()>>>,
    last_run_failed: AtomicBool,
}

impl SyncScheduler {
    pub fn new(runner: Arc<GitSyncRunner>, interval: Duration) -> Self {
        Self {
            runner,
            interval,
            repo_locks: DashMap::new(),
            last_run_failed: AtomicBool::new(false),
        }
    }

    pub fn last_run_failed(&self) -> bool {
        self.last_run_failed.load(Ordering::SeqCst)
    }

    fn lock_for(&self, repo: &str) -> Arc<Mutex<()>> {
        self.repo_locks
            .entry(repo.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// One cycle over every configured repository. A repo already being
    /// synced is skipped rather than queued behind itself.
    pub async fn run_cycle(self: &Arc<Self>) {
        let names = self.runner.repository_names();
        if names.is_empty() {
            return;
        }

        let tasks = names.into_iter().map(|name| {
            let scheduler = self.clone();
            async move {
                let lock = scheduler.lock_for(&name);
                let Ok(_guard) = lock.try_lock() else {
                    debug!(repo = %name, "Sync already in progress, skipping");
                    return SyncExit::Success;
                };
                scheduler.runner.run(&name).await
            }
        });

        let outcomes = join_all(tasks).await;
        let failed = outcomes.iter().any(|exit| *exit != SyncExit::Success);
        self.last_run_failed.store(failed, Ordering::SeqCst);
        if failed {
            warn!("Sync cycle finished with failures");
        }
    }

    pub fn spawn(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_s = self.interval.as_secs(),
                "Sync scheduler started"
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {
                        self.run_cycle().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Sync scheduler stopped");
        })
    }
}
