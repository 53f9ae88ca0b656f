//! Stateless repository operations over bare checkouts.
//!
//! [`RepositoryOps`] is the seam the watcher and the service depend on;
//! [`GitManager`] implements it on top of the `git` CLI.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::checkout::{self, Checkout};
use super::commands;
use super::log::{parse_log, select_window, WALK_CAP};
use super::range_diff::{unique_commits, CommitGraph};
use crate::credentials::Credentials;
use crate::error::{RepoError, RepoResult};
use crate::model::{Commit, DiffResult};

/// History depth used when a caller asks for "no limit".
pub const DEFAULT_HISTORY_DEPTH: usize = 15;

#[async_trait]
pub trait RepositoryOps: Send + Sync {
    /// Recreate the checkout at `location` from `url`.
    async fn materialize(&self, location: &Path, url: &str, credentials: &Credentials)
        -> RepoResult<()>;

    /// Delete the checkout at `location`.
    async fn reclaim(&self, location: &Path) -> RepoResult<()>;

    /// Open the existing checkout at `location` without touching the remote.
    async fn open(&self, location: &Path, url: &str) -> RepoResult<Checkout>;

    /// Fetch into an existing checkout; `true` when anything changed.
    async fn fetch(
        &self,
        credentials: &Credentials,
        url: &str,
        location: &Path,
    ) -> RepoResult<(bool, Checkout)>;

    /// Head-first commits on `branch`; see [`select_window`].
    async fn changes_since(
        &self,
        checkout: &Checkout,
        branch: &str,
        from: &str,
        to: &str,
        limit: usize,
    ) -> RepoResult<Vec<Commit>>;

    async fn commit_metadata(&self, location: &Path, hash: &str) -> RepoResult<Commit>;

    async fn commit_for_tag(&self, location: &Path, tag: &str) -> RepoResult<Commit>;

    /// Commits reachable from `new` but not `old`, plus tree-level stats.
    /// An empty `new` means the fetched tip of branch `ref_value`.
    async fn range_diff(
        &self,
        location: &Path,
        ref_value: &str,
        old: &str,
        new: &str,
    ) -> RepoResult<DiffResult>;
}

/// [`RepositoryOps`] backed by the `git` binary.
#[derive(Debug, Clone)]
pub struct GitManager {
    fetch_timeout: Duration,
}

impl GitManager {
    pub fn new(fetch_timeout: Duration) -> Self {
        Self { fetch_timeout }
    }
}

/// Adapts a checkout to the graph primitives the range walk consumes.
struct CheckoutGraph<'a> {
    path: &'a Path,
}

#[async_trait]
impl CommitGraph for CheckoutGraph<'_> {
    async fn parents(&self, hash: &str) -> RepoResult<Vec<String>> {
        commands::parents(self.path, hash).await
    }

    async fn merge_bases(&self, a: &str, b: &str) -> RepoResult<Vec<String>> {
        commands::merge_bases(self.path, a, b).await
    }
}

async fn resolve_or_missing(path: &Path, rev: &str) -> RepoResult<String> {
    commands::resolve_commit(path, rev)
        .await?
        .ok_or_else(|| RepoError::CommitNotFound {
            rev: rev.to_string(),
        })
}

async fn load_commits(path: &Path, hashes: &[String]) -> RepoResult<Vec<Commit>> {
    let raw = commands::log_records(path, hashes).await?;
    parse_log(&raw)
}

async fn single_commit(path: &Path, hash: &str) -> RepoResult<Commit> {
    load_commits(path, &[hash.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| RepoError::CommitNotFound {
            rev: hash.to_string(),
        })
}

#[async_trait]
impl RepositoryOps for GitManager {
    async fn materialize(
        &self,
        location: &Path,
        url: &str,
        credentials: &Credentials,
    ) -> RepoResult<()> {
        checkout::materialize(location, url, credentials, self.fetch_timeout).await
    }

    async fn reclaim(&self, location: &Path) -> RepoResult<()> {
        checkout::reclaim(location).await
    }

    async fn open(&self, location: &Path, url: &str) -> RepoResult<Checkout> {
        Checkout::open(location, url).await
    }

    #[instrument(skip(self, credentials), fields(location = %location.display()))]
    async fn fetch(
        &self,
        credentials: &Credentials,
        url: &str,
        location: &Path,
    ) -> RepoResult<(bool, Checkout)> {
        let checkout = Checkout::open(location, url).await?;
        let outcome = commands::fetch(location, url, credentials, self.fetch_timeout)
            .await
            .map_err(|reason| RepoError::Fetch {
                url: url.to_string(),
                reason,
            })?;
        debug!(updated = outcome.updated(), "fetched");
        Ok((outcome.updated(), checkout))
    }

    #[instrument(skip(self, checkout), fields(location = %checkout.path().display()))]
    async fn changes_since(
        &self,
        checkout: &Checkout,
        branch: &str,
        from: &str,
        to: &str,
        limit: usize,
    ) -> RepoResult<Vec<Commit>> {
        let limit = if limit == 0 { DEFAULT_HISTORY_DEPTH } else { limit };
        let remote_ref = Checkout::remote_ref(branch);
        if commands::resolve_commit(checkout.path(), &remote_ref)
            .await?
            .is_none()
        {
            debug!(branch, "remote-tracking ref not found");
            return Err(RepoError::RefNotFound {
                branch: branch.to_string(),
            });
        }

        let walk = commands::rev_list(checkout.path(), &remote_ref, WALK_CAP).await?;
        let window = select_window(&walk, from, to, limit);
        load_commits(checkout.path(), window).await
    }

    async fn commit_metadata(&self, location: &Path, hash: &str) -> RepoResult<Commit> {
        let resolved = resolve_or_missing(location, hash).await?;
        single_commit(location, &resolved).await
    }

    async fn commit_for_tag(&self, location: &Path, tag: &str) -> RepoResult<Commit> {
        let resolved = resolve_or_missing(location, &format!("refs/tags/{tag}")).await?;
        let mut commit = single_commit(location, &resolved).await?;
        commit.tag = Some(tag.to_string());
        Ok(commit)
    }

    #[instrument(skip(self), fields(location = %location.display()))]
    async fn range_diff(
        &self,
        location: &Path,
        ref_value: &str,
        old: &str,
        new: &str,
    ) -> RepoResult<DiffResult> {
        let old = resolve_or_missing(location, old).await?;
        let new = if new.is_empty() {
            resolve_or_missing(location, &Checkout::remote_ref(ref_value)).await?
        } else {
            resolve_or_missing(location, new).await?
        };

        let graph = CheckoutGraph { path: location };
        let hashes = unique_commits(&graph, &old, &new).await?;
        let mut commits = load_commits(location, &hashes).await?;

        match commands::tags_by_commit(location).await {
            Ok(tags) => {
                for commit in &mut commits {
                    commit.tag = tags.get(&commit.hash).cloned();
                }
            }
            Err(e) => warn!(error = %e, "tag lookup failed; commits reported untagged"),
        }

        let file_stats = commands::numstat(location, &old, &new).await?;
        debug!(
            commits = commits.len(),
            files = file_stats.len(),
            "range diff computed"
        );
        Ok(DiffResult { commits, file_stats })
    }
}

// ---------------------------------------------------------------------------
// Tests against a real git binary
// ---------------------------------------------------------------------------
