//! Query and management path over watched repositories.
//!
//! Every operation that reads or rewrites a checkout runs under the
//! repository's lock, shared with the watcher, so it never interleaves with a
//! poll of the same repository.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::coordination::{RepositoryGuard, RepositoryLocker};
use crate::credentials::AuthProvider;
use crate::error::RepoError;
use crate::git::{Checkout, RepositoryOps};
use crate::model::{
    Commit, DiffResult, ReferenceId, ReferenceKind, Repository, RepositoryId, TrackedReference,
};
use crate::store::Store;
use crate::watcher::Watcher;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("repository {0} not found")]
    RepositoryNotFound(RepositoryId),

    #[error("reference {0} not found")]
    ReferenceNotFound(ReferenceId),

    /// The repository's checkout has never been materialized.
    #[error("repository {id} has no checkout: {message}")]
    CheckoutUnavailable { id: RepositoryId, message: String },

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error("stored history is unreadable: {0}")]
    History(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Why a reference's history may be stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "level", content = "message", rename_all = "lowercase")]
pub enum ReferenceFault {
    /// The repository checkout never succeeded.
    Repository(String),
    /// The checkout is fine but the latest diff of this reference failed.
    Reference(String),
}

/// Last-known-good history of a reference, with the fault if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceChanges {
    pub commits: Vec<Commit>,
    pub fault: Option<ReferenceFault>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceHead {
    pub reference_id: ReferenceId,
    pub commit: Option<Commit>,
}

/// Outcome of an on-demand refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshReport {
    pub message: String,
    pub last_fetch_time: Option<DateTime<Utc>>,
    pub error_message: String,
}

pub struct RepoService {
    store: Arc<dyn Store>,
    locker: Arc<RepositoryLocker>,
    git: Arc<dyn RepositoryOps>,
    auth: Arc<dyn AuthProvider>,
    watcher: Arc<Watcher>,
    checkout_root: PathBuf,
    history_depth: usize,
}

impl RepoService {
    /// Build the service over the watcher's collaborators and lock registry.
    pub fn new(watcher: Arc<Watcher>, checkout_root: PathBuf) -> Self {
        Self {
            store: Arc::clone(watcher.store()),
            locker: Arc::clone(&watcher.locker),
            git: Arc::clone(&watcher.git),
            auth: Arc::clone(&watcher.auth),
            history_depth: watcher.settings.history_depth,
            watcher,
            checkout_root,
        }
    }

    /// Where the checkout of repository `id` lives.
    pub fn checkout_location(&self, id: RepositoryId) -> PathBuf {
        self.checkout_root.join(format!("{id}.git"))
    }

    async fn repository(&self, id: RepositoryId) -> ServiceResult<Repository> {
        self.store
            .find_repository(id)
            .await?
            .ok_or(ServiceError::RepositoryNotFound(id))
    }

    async fn reference(&self, id: ReferenceId) -> ServiceResult<TrackedReference> {
        self.store
            .find_reference(id)
            .await?
            .ok_or(ServiceError::ReferenceNotFound(id))
    }

    /// The repository behind `reference_id`, provided its checkout exists.
    async fn checked_out(&self, reference_id: ReferenceId) -> ServiceResult<(TrackedReference, Repository)> {
        let reference = self.reference(reference_id).await?;
        let repository = self.repository(reference.repository_id).await?;
        checkout_of(&repository)?;
        Ok((reference, repository))
    }

    /// Like [`checked_out`](Self::checked_out), but the repository row is
    /// read only once its lock is held.
    async fn lock_checked_out(
        &self,
        reference_id: ReferenceId,
    ) -> ServiceResult<(RepositoryGuard, TrackedReference, Repository)> {
        let reference = self.reference(reference_id).await?;
        let guard = self.locker.acquire(reference.repository_id).await;
        let repository = self.repository(reference.repository_id).await?;
        checkout_of(&repository)?;
        Ok((guard, reference, repository))
    }

    // -----------------------------------------------------------------------
    // Checkout management
    // -----------------------------------------------------------------------

    /// Materialize the checkout of repository `id`, then seed the history of
    /// every active reference.
    #[instrument(skip(self))]
    pub async fn checkout_repository(&self, id: RepositoryId) -> ServiceResult<Repository> {
        let _guard = self.locker.acquire(id).await;
        let mut repository = self.repository(id).await?;

        let location = self.checkout_location(id);
        let outcome = match self.auth.credentials(&repository).await {
            Ok(credentials) => {
                self.git
                    .materialize(&location, &repository.url, &credentials)
                    .await
            }
            Err(e) => Err(e),
        };
        repository.checkout_location = Some(location);
        match outcome {
            Ok(()) => {
                repository.checkout_status = true;
                repository.checkout_message = "checkout complete".to_string();
                info!(repository = id, "checkout complete");
            }
            Err(e) => {
                repository.checkout_status = false;
                repository.checkout_message = e.to_string();
                warn!(repository = id, error = %e, "checkout failed");
            }
        }
        self.store.update_repository(&repository).await?;

        if repository.checkout_status {
            let active: Vec<TrackedReference> = repository
                .references
                .iter()
                .filter(|r| r.active)
                .cloned()
                .collect();
            let seeded = self.seed_history(&repository, active).await?;
            self.store.update_references(&seeded).await?;
            repository = self.repository(id).await?;
        }
        Ok(repository)
    }

    /// Upsert `batch` and seed history for its active references.
    pub async fn register_references(
        &self,
        batch: Vec<TrackedReference>,
    ) -> ServiceResult<Vec<TrackedReference>> {
        self.store.save_references(&batch).await?;
        let (active, inactive): (Vec<_>, Vec<_>) = batch.into_iter().partition(|r| r.active);
        let mut registered = self.refresh_reference_history(active).await?;
        registered.extend(inactive);
        Ok(registered)
    }

    /// Recompute and persist the recent history of each reference in `batch`.
    pub async fn refresh_reference_history(
        &self,
        batch: Vec<TrackedReference>,
    ) -> ServiceResult<Vec<TrackedReference>> {
        let mut by_repository: BTreeMap<RepositoryId, Vec<TrackedReference>> = BTreeMap::new();
        for reference in batch {
            by_repository
                .entry(reference.repository_id)
                .or_default()
                .push(reference);
        }

        let mut refreshed = Vec::new();
        for (id, references) in by_repository {
            let _guard = self.locker.acquire(id).await;
            let repository = self.repository(id).await?;
            let seeded = self.seed_history(&repository, references).await?;
            self.store.update_references(&seeded).await?;
            refreshed.extend(seeded);
        }
        Ok(refreshed)
    }

    /// Caller holds the repository lock.
    async fn seed_history(
        &self,
        repository: &Repository,
        mut references: Vec<TrackedReference>,
    ) -> ServiceResult<Vec<TrackedReference>> {
        let checkout = match checkout_of(repository) {
            Ok(location) => self.git.open(location, &repository.url).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        for reference in references
            .iter_mut()
            .filter(|r| r.kind == ReferenceKind::BranchFixed)
        {
            let checkout = match &checkout {
                Ok(checkout) => checkout,
                Err(message) => {
                    fail_reference(reference, message.clone());
                    continue;
                }
            };
            match self.history_of(checkout, &reference.value).await {
                Ok(commits) => reference.record_history(&commits)?,
                Err(e) => fail_reference(reference, e.to_string()),
            }
        }
        Ok(references)
    }

    async fn history_of(&self, checkout: &Checkout, branch: &str) -> Result<Vec<Commit>, RepoError> {
        self.git
            .changes_since(checkout, branch, "", "", self.history_depth)
            .await
    }

    /// Apply a changed URL, provider or deletion flag; the checkout is
    /// reclaimed and, unless the repository is now deleted, rebuilt.
    #[instrument(skip_all, fields(repository = update.id))]
    pub async fn update_repository(&self, update: Repository) -> ServiceResult<Repository> {
        let id = update.id;
        {
            let _guard = self.locker.acquire(id).await;
            let mut repository = self.repository(id).await?;
            repository.name = update.name;
            repository.url = update.url;
            repository.provider_id = update.provider_id;
            repository.deleted = update.deleted;
            repository.checkout_status = false;
            self.store.update_repository(&repository).await?;

            if let Some(location) = repository.checkout_location.as_deref() {
                self.git.reclaim(location).await?;
            }
            if repository.deleted {
                info!("repository deleted; checkout reclaimed");
                return Ok(repository);
            }
        }
        self.checkout_repository(id).await
    }

    /// Rebuild the checkout of every live repository.  Per-repository
    /// failures are recorded on the repository and do not stop the sweep.
    pub async fn reload_all(&self) -> ServiceResult<Vec<Repository>> {
        let repositories = self.store.find_all_repositories().await?;
        let mut reloaded = Vec::with_capacity(repositories.len());
        for repository in repositories {
            match self.checkout_repository(repository.id).await {
                Ok(repository) => reloaded.push(repository),
                Err(e) => warn!(repository = repository.id, error = %e, "reload failed"),
            }
        }
        Ok(reloaded)
    }

    /// Throw away and rebuild one repository's checkout.
    pub async fn reset_repository(&self, id: RepositoryId) -> ServiceResult<Repository> {
        info!(repository = id, "resetting checkout");
        self.checkout_repository(id).await
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// The stored history of a reference and, when it may be stale, why.
    pub async fn fetch_changes(&self, reference_id: ReferenceId) -> ServiceResult<ReferenceChanges> {
        let reference = self.reference(reference_id).await?;
        if reference.kind == ReferenceKind::WebhookSourced {
            return Ok(ReferenceChanges {
                commits: Vec::new(),
                fault: None,
            });
        }

        let repository = self.repository(reference.repository_id).await?;
        let fault = if !repository.checkout_status {
            Some(ReferenceFault::Repository(repository.checkout_message))
        } else if reference.errored {
            Some(ReferenceFault::Reference(reference.error_message.clone()))
        } else {
            None
        };
        Ok(ReferenceChanges {
            commits: reference.history()?,
            fault,
        })
    }

    /// Last-seen commit of each reference.
    pub async fn head_for_references(&self, ids: &[ReferenceId]) -> ServiceResult<Vec<ReferenceHead>> {
        let mut heads = Vec::with_capacity(ids.len());
        for &id in ids {
            let reference = self.reference(id).await?;
            let commit = reference
                .history()?
                .into_iter()
                .find(|c| c.hash == reference.last_seen_hash);
            heads.push(ReferenceHead {
                reference_id: id,
                commit,
            });
        }
        Ok(heads)
    }

    pub async fn commit_metadata(&self, reference_id: ReferenceId, hash: &str) -> ServiceResult<Commit> {
        let (_guard, _, repository) = self.lock_checked_out(reference_id).await?;
        let location = checkout_of(&repository)?;
        Ok(self.git.commit_metadata(location, hash).await?)
    }

    /// Commit a tag points at, after refreshing the repository so recently
    /// pushed tags are visible.
    pub async fn commit_for_tag(&self, reference_id: ReferenceId, tag: &str) -> ServiceResult<Commit> {
        let (_, repository) = self.checked_out(reference_id).await?;
        self.watcher.refresh_one(repository.id).await?;

        let (_guard, _, repository) = self.lock_checked_out(reference_id).await?;
        let location = checkout_of(&repository)?;
        Ok(self.git.commit_for_tag(location, tag).await?)
    }

    /// Fetch, then return the newest commit on `branch`.
    pub async fn latest_commit_for_branch(
        &self,
        reference_id: ReferenceId,
        branch: &str,
    ) -> ServiceResult<Commit> {
        let (_guard, _, repository) = self.lock_checked_out(reference_id).await?;
        let location = checkout_of(&repository)?;

        let credentials = self.auth.credentials(&repository).await?;
        let (_, checkout) = self
            .git
            .fetch(&credentials, &repository.url, location)
            .await?;
        self.git
            .changes_since(&checkout, branch, "", "", 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ServiceError::Repo(RepoError::RefNotFound {
                    branch: branch.to_string(),
                })
            })
    }

    /// Commits between two releases of the reference's branch.
    pub async fn release_changes(
        &self,
        reference_id: ReferenceId,
        old: &str,
        new: &str,
    ) -> ServiceResult<DiffResult> {
        let (_guard, reference, repository) = self.lock_checked_out(reference_id).await?;
        let location = checkout_of(&repository)?;
        Ok(self
            .git
            .range_diff(location, &reference.value, old, new)
            .await?)
    }

    /// Poll one repository now.
    pub async fn refresh(&self, id: RepositoryId) -> ServiceResult<RefreshReport> {
        if self.store.find_repository(id).await?.is_none() {
            return Err(ServiceError::RepositoryNotFound(id));
        }
        let repository = self.watcher.refresh_one(id).await?;
        let message = if repository.deleted || !repository.checkout_status {
            "repository has no checkout to refresh"
        } else if repository.fetch_error_count == 0 {
            "repository refreshed"
        } else {
            "repository refresh failed"
        };
        Ok(RefreshReport {
            message: message.to_string(),
            last_fetch_time: repository.last_fetch_time,
            error_message: repository.fetch_error_message,
        })
    }
}

fn checkout_of(repository: &Repository) -> ServiceResult<&std::path::Path> {
    match repository.checkout_location.as_deref() {
        Some(location) if repository.checkout_status => Ok(location),
        _ => Err(ServiceError::CheckoutUnavailable {
            id: repository.id,
            message: repository.checkout_message.clone(),
        }),
    }
}

fn fail_reference(reference: &mut TrackedReference, message: String) {
    reference.record_error(message);
    reference.last_seen_hash.clear();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::credentials::Credentials;
    use crate::model::fixtures::{branch_reference, commit};
    use crate::watcher::testing::{checked_out, harness, Harness, ScriptedGit};

    fn service(h: &Harness) -> RepoService {
        RepoService::new(h.watcher.clone(), PathBuf::from("/var/lib/forgewatch"))
    }

    fn fresh(id: RepositoryId, references: Vec<TrackedReference>) -> Repository {
        let mut repository = checked_out(id, references);
        repository.checkout_location = None;
        repository.checkout_status = false;
        repository
    }

    #[tokio::test]
    async fn checkout_seeds_active_reference_history() {
        let git = ScriptedGit::default();
        git.set_branch("main", vec![commit("C"), commit("B")]);
        let h = harness(git, Credentials::Anonymous);
        let mut inactive = branch_reference(11, 1, "main");
        inactive.active = false;
        h.store
            .insert(fresh(1, vec![branch_reference(10, 1, "main"), inactive]));

        let repository = service(&h).checkout_repository(1).await.unwrap();

        assert!(repository.checkout_status);
        assert_eq!(
            repository.checkout_location.as_deref(),
            Some(std::path::Path::new("/var/lib/forgewatch/1.git"))
        );
        let seeded = h.store.find_reference(10).await.unwrap().unwrap();
        assert_eq!(seeded.last_seen_hash, "C");
        assert_eq!(seeded.history().unwrap().len(), 2);
        let untouched = h.store.find_reference(11).await.unwrap().unwrap();
        assert!(untouched.last_seen_hash.is_empty());
    }

    #[tokio::test]
    async fn failed_checkout_is_a_repository_level_fault() {
        let git = ScriptedGit {
            materialize_failure: Some("connection refused".into()),
            ..Default::default()
        };
        let h = harness(git, Credentials::Anonymous);
        h.store.insert(fresh(1, vec![branch_reference(10, 1, "main")]));
        let service = service(&h);

        let repository = service.checkout_repository(1).await.unwrap();
        assert!(!repository.checkout_status);
        assert!(repository.checkout_message.contains("connection refused"));

        let changes = service.fetch_changes(10).await.unwrap();
        assert!(matches!(changes.fault, Some(ReferenceFault::Repository(m)) if m.contains("connection refused")));

        let err = service.commit_metadata(10, "C").await.unwrap_err();
        assert!(matches!(err, ServiceError::CheckoutUnavailable { id: 1, .. }));
    }

    #[tokio::test]
    async fn errored_reference_keeps_serving_last_good_history() {
        let h = harness(ScriptedGit::default(), Credentials::Anonymous);
        let mut reference = branch_reference(10, 1, "main");
        reference.record_history(&[commit("B"), commit("A")]).unwrap();
        reference.record_error("branch main not found in the repository");
        h.store.insert(checked_out(1, vec![reference]));

        let changes = service(&h).fetch_changes(10).await.unwrap();

        assert_eq!(changes.commits.len(), 2);
        assert_eq!(
            changes.fault,
            Some(ReferenceFault::Reference(
                "branch main not found in the repository".into()
            ))
        );
    }

    #[tokio::test]
    async fn history_refresh_failure_clears_last_seen_hash() {
        let h = harness(ScriptedGit::default(), Credentials::Anonymous);
        let mut reference = branch_reference(10, 1, "gone");
        reference.last_seen_hash = "B".into();
        h.store.insert(checked_out(1, vec![reference.clone()]));

        let refreshed = service(&h)
            .refresh_reference_history(vec![reference])
            .await
            .unwrap();

        assert!(refreshed[0].errored);
        assert!(refreshed[0].last_seen_hash.is_empty());
        let stored = h.store.find_reference(10).await.unwrap().unwrap();
        assert!(stored.errored);
    }

    #[tokio::test]
    async fn register_references_seeds_only_active_ones() {
        let git = ScriptedGit::default();
        git.set_branch("main", vec![commit("C")]);
        let h = harness(git, Credentials::Anonymous);
        h.store.insert(checked_out(1, Vec::new()));
        let mut inactive = branch_reference(11, 1, "main");
        inactive.active = false;

        let registered = service(&h)
            .register_references(vec![branch_reference(10, 1, "main"), inactive])
            .await
            .unwrap();

        assert_eq!(registered.len(), 2);
        assert_eq!(h.store.find_reference(10).await.unwrap().unwrap().last_seen_hash, "C");
        assert!(h.store.find_reference(11).await.unwrap().unwrap().last_seen_hash.is_empty());
    }

    #[tokio::test]
    async fn webhook_references_have_no_stored_changes() {
        let h = harness(ScriptedGit::default(), Credentials::Anonymous);
        let mut reference = branch_reference(10, 1, "{\"source\":\"pr\"}");
        reference.kind = ReferenceKind::WebhookSourced;
        h.store.insert(checked_out(1, vec![reference]));

        let changes = service(&h).fetch_changes(10).await.unwrap();
        assert!(changes.commits.is_empty());
        assert!(changes.fault.is_none());
    }

    #[tokio::test]
    async fn deleting_a_repository_reclaims_without_rebuilding() {
        let h = harness(ScriptedGit::default(), Credentials::Anonymous);
        let repository = checked_out(1, vec![branch_reference(10, 1, "main")]);
        h.store.insert(repository.clone());

        let updated = service(&h)
            .update_repository(Repository {
                deleted: true,
                ..repository
            })
            .await
            .unwrap();

        assert!(updated.deleted);
        assert!(!updated.checkout_status);
        assert_eq!(h.git.reclaimed.lock().unwrap().len(), 1);
        assert!(h.git.materialized.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn url_change_rebuilds_checkout() {
        let git = ScriptedGit::default();
        git.set_branch("main", vec![commit("C")]);
        let h = harness(git, Credentials::Anonymous);
        let repository = checked_out(1, vec![branch_reference(10, 1, "main")]);
        h.store.insert(repository.clone());

        let updated = service(&h)
            .update_repository(Repository {
                url: "https://git.example.com/team/moved.git".into(),
                ..repository
            })
            .await
            .unwrap();

        assert!(updated.checkout_status);
        assert_eq!(updated.url, "https://git.example.com/team/moved.git");
        assert_eq!(h.git.reclaimed.lock().unwrap().len(), 1);
        assert_eq!(h.git.materialized.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heads_follow_last_seen_hash() {
        let h = harness(ScriptedGit::default(), Credentials::Anonymous);
        let mut seen = branch_reference(10, 1, "main");
        seen.record_history(&[commit("C"), commit("B")]).unwrap();
        h.store
            .insert(checked_out(1, vec![seen, branch_reference(11, 1, "dev")]));

        let heads = service(&h).head_for_references(&[10, 11]).await.unwrap();

        assert_eq!(heads[0].commit.as_ref().map(|c| c.hash.as_str()), Some("C"));
        assert!(heads[1].commit.is_none());
        assert!(matches!(
            service(&h).head_for_references(&[99]).await,
            Err(ServiceError::ReferenceNotFound(99))
        ));
    }

    #[tokio::test]
    async fn tag_lookup_refreshes_first() {
        let git = ScriptedGit::default();
        git.set_tag("v1.2.0", commit("C"));
        let h = harness(git, Credentials::Anonymous);
        h.store.insert(checked_out(1, vec![branch_reference(10, 1, "main")]));

        let found = service(&h).commit_for_tag(10, "v1.2.0").await.unwrap();

        assert_eq!(found.hash, "C");
        assert_eq!(h.git.fetch_calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            service(&h).commit_for_tag(10, "v9").await,
            Err(ServiceError::Repo(RepoError::CommitNotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn latest_commit_fetches_and_takes_head() {
        let git = ScriptedGit::default();
        git.set_branch("release", vec![commit("R2"), commit("R1")]);
        let h = harness(git, Credentials::Anonymous);
        h.store.insert(checked_out(1, vec![branch_reference(10, 1, "main")]));

        let latest = service(&h)
            .latest_commit_for_branch(10, "release")
            .await
            .unwrap();

        assert_eq!(latest.hash, "R2");
        assert_eq!(h.git.fetch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_changes_uses_reference_branch() {
        let git = ScriptedGit::default();
        git.set_branch("main", vec![commit("D"), commit("C"), commit("B"), commit("A")]);
        let h = harness(git, Credentials::Anonymous);
        h.store.insert(checked_out(1, vec![branch_reference(10, 1, "main")]));

        let diff = service(&h).release_changes(10, "B", "D").await.unwrap();

        let hashes: Vec<_> = diff.commits.iter().map(|c| c.hash.as_str()).collect();
        assert_eq!(hashes, ["D", "C"]);
    }

    #[tokio::test]
    async fn refresh_reports_outcome() {
        let h = harness(ScriptedGit::default(), Credentials::Anonymous);
        h.store.insert(checked_out(1, vec![branch_reference(10, 1, "main")]));
        let service = service(&h);

        let report = service.refresh(1).await.unwrap();
        assert_eq!(report.message, "repository refreshed");
        assert!(report.last_fetch_time.is_some());
        assert!(report.error_message.is_empty());

        assert!(matches!(
            service.refresh(42).await,
            Err(ServiceError::RepositoryNotFound(42))
        ));
    }

    #[tokio::test]
    async fn refresh_of_unchecked_repository_polls_nothing() {
        let h = harness(ScriptedGit::default(), Credentials::Anonymous);
        h.store.insert(fresh(1, vec![branch_reference(10, 1, "main")]));

        let report = service(&h).refresh(1).await.unwrap();

        assert_eq!(report.message, "repository has no checkout to refresh");
        assert!(report.last_fetch_time.is_none());
        assert_eq!(h.git.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn lookup_reads_repository_after_taking_the_lock() {
        let git = ScriptedGit::default();
        git.set_branch("main", vec![commit("C")]);
        let h = harness(git, Credentials::Anonymous);
        h.store.insert(checked_out(1, vec![branch_reference(10, 1, "main")]));
        let service = Arc::new(service(&h));

        let held = h.watcher.locker.acquire(1).await;
        let lookup = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.commit_metadata(10, "C").await }
        });
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert!(!lookup.is_finished());

        // A reset that lost its checkout lands while the lookup waits.
        let mut reset = h.store.find_repository(1).await.unwrap().unwrap();
        reset.checkout_status = false;
        reset.checkout_message = "checkout of team/repo-1 failed".to_string();
        h.store.update_repository(&reset).await.unwrap();
        drop(held);

        let err = lookup.await.unwrap().unwrap_err();
        assert!(matches!(err, ServiceError::CheckoutUnavailable { id: 1, .. }));
    }
}
