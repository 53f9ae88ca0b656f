//! One repository poll: lock, fetch, diff every polled reference, notify,
//! persist, unlock.

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use super::Watcher;
use crate::bus::new_dedup_key;
use crate::error::RepoError;
use crate::git::Checkout;
use crate::metrics::FetchLabels;
use crate::model::{ChangeEvent, Repository, RepositoryId, TrackedReference};

/// References touched by one poll, split by outcome.
#[derive(Debug, Default)]
struct PollBatch {
    changed: Vec<(TrackedReference, ChangeEvent)>,
    errored: Vec<TrackedReference>,
}

impl Watcher {
    /// Poll one repository under its lock and return the record as
    /// persisted afterwards.
    ///
    /// Poll failures land in the repository's fetch error fields; the
    /// returned error covers only a missing record or a failed final write.
    #[instrument(skip(self))]
    pub async fn refresh_one(&self, id: RepositoryId) -> Result<Repository> {
        let _guard = self.locker.acquire(id).await;

        // The scheduler's snapshot may be stale by the time the lock is ours.
        let mut repository = self
            .store
            .find_repository(id)
            .await?
            .ok_or_else(|| anyhow!("repository {id} not found"))?;
        if repository.deleted || !repository.checkout_status {
            debug!(repository = id, deleted = repository.deleted, "repository not pollable; skipping");
            return Ok(repository);
        }

        self.metrics.poll_total.inc();
        let outcome = self.poll(&repository).await;
        let failure = match outcome {
            Ok(()) => None,
            Err(e) => {
                warn!(repository = id, error = %format!("{e:#}"), "poll failed");
                Some(format!("{e:#}"))
            }
        };
        repository.record_fetch_outcome(Utc::now(), failure);
        self.store
            .update_repository(&repository)
            .await
            .with_context(|| format!("persist fetch outcome of repository {id}"))?;
        Ok(repository)
    }

    async fn poll(&self, repository: &Repository) -> Result<()> {
        let Some(checkout) = self.fetch(repository).await? else {
            debug!(repository = repository.id, "no remote changes");
            return Ok(());
        };

        let batch = self.diff_references(repository, &checkout).await?;
        self.notify(&batch).await;
        self.persist(batch).await
    }

    /// Fetch with a single key-remediation retry.  `None` when nothing
    /// changed on the remote.
    async fn fetch(&self, repository: &Repository) -> Result<Option<Checkout>> {
        let location = repository
            .checkout_location
            .as_deref()
            .ok_or_else(|| RepoError::Fetch {
                url: repository.url.clone(),
                reason: "repository has no checkout".to_string(),
            })?;
        let credentials = self.auth.credentials(repository).await?;

        let start = Instant::now();
        let result = match self.git.fetch(&credentials, &repository.url, location).await {
            Err(e) if credentials.uses_key() => {
                warn!(repository = repository.id, error = %e, "fetch failed; rewriting key and retrying");
                self.auth.materialize_key(repository).await?;
                self.git.fetch(&credentials, &repository.url, location).await
            }
            first => first,
        };

        let labels = match &result {
            Ok((updated, _)) => FetchLabels::new(true, *updated),
            Err(_) => FetchLabels::new(false, false),
        };
        self.metrics
            .fetch_duration_seconds
            .get_or_create(&labels)
            .observe(start.elapsed().as_secs_f64());

        let (updated, checkout) = result?;
        Ok(updated.then_some(checkout))
    }

    /// Per-reference failures land in the errored batch.  A failure that
    /// means the checkout itself is unusable aborts the whole poll.
    async fn diff_references(
        &self,
        repository: &Repository,
        checkout: &Checkout,
    ) -> Result<PollBatch, RepoError> {
        let mut batch = PollBatch::default();
        for reference in repository.references.iter().filter(|r| r.is_polled()) {
            let commits = self
                .git
                .changes_since(checkout, &reference.value, "", "", self.settings.history_depth)
                .await;

            let mut reference = reference.clone();
            match commits {
                Ok(commits) => {
                    let Some(head) = commits.first() else {
                        continue;
                    };
                    if head.hash == reference.last_seen_hash {
                        continue;
                    }
                    let event = ChangeEvent::new(&reference, head.clone());
                    if let Err(e) = reference.record_history(&commits) {
                        error!(reference = reference.id, error = %e, "cannot serialize history");
                        continue;
                    }
                    info!(
                        reference = reference.id,
                        branch = %reference.value,
                        head = %event.commit.hash,
                        "reference moved"
                    );
                    batch.changed.push((reference, event));
                }
                Err(e) if e.is_repository_level() => return Err(e),
                Err(e) => {
                    warn!(reference = reference.id, branch = %reference.value, error = %e, "diff failed");
                    reference.record_error(e.to_string());
                    batch.errored.push(reference);
                }
            }
        }
        Ok(batch)
    }

    /// One event per moved reference, each under a fresh dedup key.
    async fn notify(&self, batch: &PollBatch) {
        for (_, event) in &batch.changed {
            let payload = match serde_json::to_value(event) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(reference = event.id, error = %e, "cannot serialize change event");
                    continue;
                }
            };
            match self
                .bus
                .publish(&self.settings.change_topic, payload, &new_dedup_key())
                .await
            {
                Ok(()) => {
                    self.metrics.events_published_total.inc();
                }
                Err(e) => {
                    error!(reference = event.id, error = %format!("{e:#}"), "publish failed")
                }
            }
        }
    }

    async fn persist(&self, batch: PollBatch) -> Result<()> {
        let PollBatch { changed, errored } = batch;
        if !changed.is_empty() {
            let references: Vec<TrackedReference> =
                changed.into_iter().map(|(reference, _)| reference).collect();
            self.metrics
                .reference_updates_total
                .inc_by(references.len() as u64);
            self.store
                .update_references(&references)
                .await
                .context("persist changed references")?;
        }
        if !errored.is_empty() {
            self.store
                .update_references(&errored)
                .await
                .context("persist errored references")?;
        }
        Ok(())
    }
}
