//! Change detection: the per-repository poll, the periodic scheduler that
//! fans polls out across a bounded worker pool, and the inbound webhook
//! loop.

mod poll;
pub mod scheduler;
pub mod webhook;

use std::sync::Arc;

use crate::bus::MessageBus;
use crate::coordination::RepositoryLocker;
use crate::credentials::AuthProvider;
use crate::git::RepositoryOps;
use crate::metrics::Metrics;
use crate::store::Store;

pub use scheduler::{IntervalTicker, Scheduler};

/// Tunables for the poll path.
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    /// Topic receiving one change event per moved reference.
    pub change_topic: String,
    /// Commits recorded per reference on every detected change.
    pub history_depth: usize,
}

/// Polls one repository at a time under its lock.  Shared by the scheduler
/// and by on-demand refreshes.
pub struct Watcher {
    store: Arc<dyn Store>,
    bus: Arc<dyn MessageBus>,
    pub(crate) auth: Arc<dyn AuthProvider>,
    pub(crate) git: Arc<dyn RepositoryOps>,
    pub(crate) locker: Arc<RepositoryLocker>,
    metrics: Arc<Metrics>,
    pub(crate) settings: WatcherSettings,
}

impl Watcher {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn MessageBus>,
        auth: Arc<dyn AuthProvider>,
        git: Arc<dyn RepositoryOps>,
        locker: Arc<RepositoryLocker>,
        metrics: Arc<Metrics>,
        settings: WatcherSettings,
    ) -> Self {
        Self {
            store,
            bus,
            auth,
            git,
            locker,
            metrics,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

/// Doubles for the watcher's collaborators.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashMap, VecDeque};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use prometheus_client::registry::Registry;
    use tokio::sync::Semaphore;
    use tokio::time::Instant;

    use super::*;
    use crate::bus::memory::MemoryBus;
    use crate::credentials::Credentials;
    use crate::error::{RepoError, RepoResult};
    use crate::git::Checkout;
    use crate::model::{Commit, DiffResult, Repository};
    use crate::store::MemoryStore;

    /// Scripted git backend.  Fetch outcomes are consumed in order; once the
    /// script runs out every fetch reports "no update".
    #[derive(Default)]
    pub struct ScriptedGit {
        pub fetch_script: Mutex<VecDeque<RepoResult<bool>>>,
        pub branches: Mutex<HashMap<String, Vec<Commit>>>,
        pub fetch_calls: AtomicUsize,
        pub fetch_delay: Option<Duration>,
        /// When set, each fetch takes one permit before proceeding.
        pub gate: Option<Semaphore>,
        pub fetch_spans: Mutex<Vec<(Instant, Instant)>>,
        pub started: tokio::sync::Notify,
        /// When set, every materialization fails with this reason.
        pub materialize_failure: Option<String>,
        pub materialized: Mutex<Vec<PathBuf>>,
        pub reclaimed: Mutex<Vec<PathBuf>>,
        pub tags: Mutex<HashMap<String, Commit>>,
        /// When set, every history walk fails as if the checkout vanished.
        pub broken_checkout: bool,
    }

    impl ScriptedGit {
        pub fn script_fetch(&self, outcomes: impl IntoIterator<Item = RepoResult<bool>>) {
            self.fetch_script.lock().unwrap().extend(outcomes);
        }

        pub fn set_branch(&self, branch: &str, commits: Vec<Commit>) {
            self.branches
                .lock()
                .unwrap()
                .insert(branch.to_string(), commits);
        }

        pub fn set_tag(&self, tag: &str, commit: Commit) {
            self.tags.lock().unwrap().insert(tag.to_string(), commit);
        }
    }

    pub fn fetch_failure(reason: &str) -> RepoError {
        RepoError::Fetch {
            url: "git@git.example.com:team/app.git".to_string(),
            reason: reason.to_string(),
        }
    }

    #[async_trait]
    impl RepositoryOps for ScriptedGit {
        async fn materialize(&self, location: &Path, url: &str, _: &Credentials) -> RepoResult<()> {
            if let Some(reason) = &self.materialize_failure {
                return Err(RepoError::Checkout {
                    url: url.to_string(),
                    path: location.to_path_buf(),
                    reason: reason.clone(),
                });
            }
            self.materialized.lock().unwrap().push(location.to_path_buf());
            Ok(())
        }

        async fn reclaim(&self, location: &Path) -> RepoResult<()> {
            self.reclaimed.lock().unwrap().push(location.to_path_buf());
            Ok(())
        }

        async fn open(&self, location: &Path, _: &str) -> RepoResult<Checkout> {
            Ok(Checkout::assume(location))
        }

        async fn fetch(
            &self,
            _: &Credentials,
            _: &str,
            location: &Path,
        ) -> RepoResult<(bool, Checkout)> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            let start = Instant::now();
            self.started.notify_one();
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            if let Some(delay) = self.fetch_delay {
                tokio::time::sleep(delay).await;
            }
            self.fetch_spans.lock().unwrap().push((start, Instant::now()));
            let next = self.fetch_script.lock().unwrap().pop_front();
            let updated = next.unwrap_or(Ok(false))?;
            Ok((updated, Checkout::assume(location)))
        }

        async fn changes_since(
            &self,
            checkout: &Checkout,
            branch: &str,
            _: &str,
            _: &str,
            limit: usize,
        ) -> RepoResult<Vec<Commit>> {
            if self.broken_checkout {
                return Err(RepoError::io(
                    checkout.path(),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "checkout vanished"),
                ));
            }
            let branches = self.branches.lock().unwrap();
            let commits = branches.get(branch).ok_or_else(|| RepoError::RefNotFound {
                branch: branch.to_string(),
            })?;
            Ok(commits.iter().take(limit).cloned().collect())
        }

        async fn commit_metadata(&self, _: &Path, hash: &str) -> RepoResult<Commit> {
            self.branches
                .lock()
                .unwrap()
                .values()
                .flatten()
                .find(|c| c.hash == hash)
                .cloned()
                .ok_or_else(|| RepoError::CommitNotFound {
                    rev: hash.to_string(),
                })
        }

        async fn commit_for_tag(&self, _: &Path, tag: &str) -> RepoResult<Commit> {
            self.tags
                .lock()
                .unwrap()
                .get(tag)
                .cloned()
                .ok_or_else(|| RepoError::CommitNotFound {
                    rev: tag.to_string(),
                })
        }

        /// Commits of `ref_value` strictly newer than `old`, up to `new`.
        async fn range_diff(
            &self,
            _: &Path,
            ref_value: &str,
            old: &str,
            new: &str,
        ) -> RepoResult<DiffResult> {
            let branches = self.branches.lock().unwrap();
            let commits = branches.get(ref_value).cloned().unwrap_or_default();
            let commits = commits
                .into_iter()
                .skip_while(|c| c.hash != new)
                .take_while(|c| c.hash != old)
                .collect();
            Ok(DiffResult {
                commits,
                file_stats: Vec::new(),
            })
        }
    }

    /// Hands out fixed credentials and counts key materializations.
    pub struct StaticAuth {
        pub credentials: Credentials,
        pub materialized: AtomicUsize,
    }

    impl StaticAuth {
        pub fn new(credentials: Credentials) -> Self {
            Self {
                credentials,
                materialized: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AuthProvider for StaticAuth {
        async fn credentials(&self, _: &Repository) -> RepoResult<Credentials> {
            Ok(self.credentials.clone())
        }

        async fn materialize_key(&self, _: &Repository) -> RepoResult<()> {
            self.materialized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub struct Harness {
        pub store: Arc<MemoryStore>,
        pub bus: Arc<MemoryBus>,
        pub auth: Arc<StaticAuth>,
        pub git: Arc<ScriptedGit>,
        pub watcher: Arc<Watcher>,
    }

    pub fn harness(git: ScriptedGit, credentials: Credentials) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        let auth = Arc::new(StaticAuth::new(credentials));
        let git = Arc::new(git);
        let metrics = Arc::new(Metrics::new(&mut Registry::default()));
        let watcher = Arc::new(Watcher::new(
            store.clone(),
            bus.clone(),
            auth.clone(),
            git.clone(),
            Arc::new(RepositoryLocker::new()),
            metrics,
            WatcherSettings {
                change_topic: "forgewatch.reference.changed".to_string(),
                history_depth: 15,
            },
        ));
        Harness {
            store,
            bus,
            auth,
            git,
            watcher,
        }
    }

    pub fn checked_out(id: i64, references: Vec<crate::model::TrackedReference>) -> Repository {
        Repository {
            id,
            name: format!("repo-{id}"),
            url: format!("git@git.example.com:team/repo-{id}.git"),
            provider_id: "internal".to_string(),
            checkout_location: Some(format!("/var/lib/forgewatch/{id}.git").into()),
            checkout_status: true,
            references,
            ..Default::default()
        }
    }
}
