use crate::config::RepositoryConfig;
use crate::graph::GraphStore;
use crate::services::indexer::DocumentIndexer;
use crate::tenant::TenantKey;
use anyhow::{Context, Result};
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{Oid, Repository as GitRepository, TreeWalkMode, TreeWalkResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncExit {
    Success,
    ConfigError,
    TransientFailure,
}

impl SyncExit {
    pub fn code(&self) -> i32 {
        match self {
            SyncExit::Success => 0,
            SyncExit::ConfigError => 1,
            SyncExit::TransientFailure => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Upserted,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedFile {
    /// Repo-relative POSIX path as it appears in the tree.
    pub path: String,
    pub kind: ChangeKind,
}

/// Clone-or-pull a configured repository, diff against the last processed
/// HEAD and fan each changed file into the indexer. The new HEAD is
/// persisted only after every file processed cleanly.
pub struct GitSyncRunner {
    repositories: Vec<RepositoryConfig>,
    workdir: PathBuf,
    indexer: Arc<DocumentIndexer>,
    graph: Arc<dyn GraphStore>,
}

impl GitSyncRunner {
    pub fn new(
        repositories: Vec<RepositoryConfig>,
        workdir: PathBuf,
        indexer: Arc<DocumentIndexer>,
        graph: Arc<dyn GraphStore>,
    ) -> Self {
        Self {
            repositories,
            workdir,
            indexer,
            graph,
        }
    }

    pub fn repository_names(&self) -> Vec<String> {
        self.repositories.iter().map(|r| r.name.clone()).collect()
    }

    pub async fn run(&self, repo_name: &str) -> SyncExit {
        let Some(config) = self
            .repositories
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(repo_name))
            .cloned()
        else {
            warn!(repo = repo_name, "Unknown repository, skipping sync");
            return SyncExit::ConfigError;
        };

        let branch = config.branch.clone().unwrap_or_else(|| "main".to_string());
        let local_path = self.workdir.join(&config.name);

        let last_head = match self.graph.get_sync_state(&config.name).await {
            Ok(last) => last,
            Err(err) => {
                warn!(repo = %config.name, error = %err, "Sync state lookup failed");
                return SyncExit::TransientFailure;
            }
        };

        let url = config.url.clone();
        let branch_for_git = branch.clone();
        let path_for_git = local_path.clone();
        let last_for_git = last_head.clone();
        let git_result = tokio::task::spawn_blocking(move || {
            update_and_diff(&path_for_git, &url, &branch_for_git, last_for_git.as_deref())
        })
        .await;

        let (head, changes) = match git_result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                warn!(repo = %config.name, error = %err, "Git sync failed");
                return SyncExit::TransientFailure;
            }
            Err(err) => {
                warn!(repo = %config.name, error = %err, "Git sync task panicked");
                return SyncExit::TransientFailure;
            }
        };

        if Some(head.clone()) == last_head {
            debug!(repo = %config.name, head = %head, "Already up to date");
            return SyncExit::Success;
        }

        let tenant = TenantKey::derive(&config.name, &branch, &local_path);
        let mut failed = false;
        let mut processed = 0usize;

        for change in changes {
            if !is_markdown(&change.path) {
                continue;
            }
            if !matches_monitored(&change.path, &config.monitored_paths) {
                continue;
            }

            let doc_key = document_key(&change.path);
            match change.kind {
                ChangeKind::Deleted => {
                    if let Err(err) = self.indexer.delete(&tenant, &doc_key).await {
                        warn!(repo = %config.name, path = %change.path, error = %err, "Delete failed");
                        failed = true;
                    }
                }
                ChangeKind::Upserted => {
                    let on_disk = local_path.join(&change.path);
                    let content = match tokio::fs::read_to_string(&on_disk).await {
                        Ok(content) => content,
                        Err(err) => {
                            warn!(repo = %config.name, path = %change.path, error = %err, "Read failed");
                            failed = true;
                            continue;
                        }
                    };
                    let title_hint = title_from_stem(&change.path);
                    match self
                        .indexer
                        .index_with_title_hint(
                            &doc_key,
                            &content,
                            &tenant,
                            Some(&head),
                            Some(&title_hint),
                        )
                        .await
                    {
                        Ok(result) if result.success => processed += 1,
                        Ok(result) => {
                            warn!(
                                repo = %config.name,
                                path = %change.path,
                                errors = ?result.errors,
                                "Index rejected file"
                            );
                            failed = true;
                        }
                        Err(err) => {
                            warn!(repo = %config.name, path = %change.path, error = %err, "Index failed");
                            failed = true;
                        }
                    }
                }
            }
        }

        if failed {
            warn!(repo = %config.name, "Sync cycle had failures, keeping previous HEAD");
            return SyncExit::TransientFailure;
        }

        if let Err(err) = self.graph.set_sync_state(&config.name, &head).await {
            warn!(repo = %config.name, error = %err, "Failed to persist sync state");
            return SyncExit::TransientFailure;
        }

        info!(
            repo = %config.name,
            head = %head,
            processed,
            "Sync cycle completed"
        );
        SyncExit::Success
    }
}

/// Clone when missing, otherwise fetch + fast-forward the tracked branch,
/// then report the files changed since `last_head` (the full tree when
/// there is no previous state).
pub fn update_and_diff(
    local_path: &Path,
    url: &str,
    branch: &str,
    last_head: Option<&str>,
) -> Result<(String, Vec<ChangedFile>)> {
    let repo = if local_path.join(".git").exists() {
        let repo = GitRepository::open(local_path).context("open repository")?;
        fetch_and_fast_forward(&repo, branch)?;
        repo
    } else {
        info!(url, path = %local_path.display(), "Cloning repository");
        RepoBuilder::new()
            .branch(branch)
            .clone(url, local_path)
            .context("clone repository")?
    };

    let head_commit = repo
        .head()
        .and_then(|h| h.peel_to_commit())
        .context("resolve HEAD")?;
    let head = head_commit.id().to_string();

    let changes = match last_head {
        Some(last) if last == head => Vec::new(),
        Some(last) => match Oid::from_str(last)
            .ok()
            .and_then(|oid| repo.find_commit(oid).ok())
        {
            Some(old_commit) => diff_commits(&repo, &old_commit, &head_commit)?,
            None => {
                // The recorded commit is gone (history rewrite); fall back
                // to a full pass.
                warn!(last, "Previous sync commit not found, reindexing tree");
                full_tree(&head_commit)?
            }
        },
        None => full_tree(&head_commit)?,
    };

    Ok((head, changes))
}

fn fetch_and_fast_forward(repo: &GitRepository, branch: &str) -> Result<()> {
    let mut remote = repo.find_remote("origin").context("find origin")?;
    remote
        .fetch(&[branch], None, None)
        .context("fetch branch")?;

    let fetch_head = repo.find_reference("FETCH_HEAD").context("FETCH_HEAD")?;
    let fetch_commit = repo
        .reference_to_annotated_commit(&fetch_head)
        .context("annotate FETCH_HEAD")?;

    let (analysis, _) = repo
        .merge_analysis(&[&fetch_commit])
        .context("merge analysis")?;
    if analysis.is_up_to_date() {
        return Ok(());
    }
    if !analysis.is_fast_forward() {
        anyhow::bail!("non-fast-forward update on branch {branch}");
    }

    let refname = format!("refs/heads/{branch}");
    let mut reference = repo.find_reference(&refname).context("find branch ref")?;
    reference
        .set_target(fetch_commit.id(), "fast-forward")
        .context("advance branch")?;
    repo.set_head(&refname).context("set HEAD")?;
    repo.checkout_head(Some(CheckoutBuilder::default().force()))
        .context("checkout")?;
    Ok(())
}

fn diff_commits(
    repo: &GitRepository,
    old: &git2::Commit<'_>,
    new: &git2::Commit<'_>,
) -> Result<Vec<ChangedFile>> {
    let old_tree = old.tree().context("old tree")?;
    let new_tree = new.tree().context("new tree")?;
    let diff = repo
        .diff_tree_to_tree(Some(&old_tree), Some(&new_tree), None)
        .context("diff trees")?;

    let mut changes = Vec::new();
    for delta in diff.deltas() {
        match delta.status() {
            git2::Delta::Deleted => {
                if let Some(path) = delta.old_file().path() {
                    changes.push(ChangedFile {
                        path: path.to_string_lossy().replace('\\', "/"),
                        kind: ChangeKind::Deleted,
                    });
                }
            }
            git2::Delta::Renamed => {
                if let Some(path) = delta.old_file().path() {
                    changes.push(ChangedFile {
                        path: path.to_string_lossy().replace('\\', "/"),
                        kind: ChangeKind::Deleted,
                    });
                }
                if let Some(path) = delta.new_file().path() {
                    changes.push(ChangedFile {
                        path: path.to_string_lossy().replace('\\', "/"),
                        kind: ChangeKind::Upserted,
                    });
                }
            }
            _ => {
                if let Some(path) = delta.new_file().path() {
                    changes.push(ChangedFile {
                        path: path.to_string_lossy().replace('\\', "/"),
                        kind: ChangeKind::Upserted,
                    });
                }
            }
        }
    }
    Ok(changes)
}

fn full_tree(commit: &git2::Commit<'_>) -> Result<Vec<ChangedFile>> {
    let tree = commit.tree().context("tree")?;
    let mut changes = Vec::new();
    tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
        if entry.kind() == Some(git2::ObjectType::Blob) {
            if let Some(name) = entry.name() {
                changes.push(ChangedFile {
                    path: format!("{dir}{name}"),
                    kind: ChangeKind::Upserted,
                });
            }
        }
        TreeWalkResult::Ok
    })
    .context("walk tree")?;
    Ok(changes)
}

pub fn is_markdown(path: &str) -> bool {
    let lowered = path.to_ascii_lowercase();
    lowered.ends_with(".md") || lowered.ends_with(".markdown")
}

/// Prefix match against monitored paths; an empty list monitors everything.
pub fn matches_monitored(path: &str, monitored: &[String]) -> bool {
    if monitored.is_empty() {
        return true;
    }
    monitored
        .iter()
        .any(|prefix| path.starts_with(prefix.trim_start_matches("./")))
}

/// Stable per-file key: POSIX-normalised, lower-cased relative path.
pub fn document_key(path: &str) -> String {
    path.replace('\\', "/").to_lowercase()
}

/// Default title for synced files: extension dropped, `-`/`_` become
/// spaces, case preserved.
pub fn title_from_stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().replace(['-', '_'], " "))
        .unwrap_or_else(|| path.to_string())
}
