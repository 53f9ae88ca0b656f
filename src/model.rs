//! Records read and written by the poller, and the values it hands out.

use std::path::PathBuf;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

pub type RepositoryId = i64;
pub type ReferenceId = i64;

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// A watched remote and the state of its on-disk checkout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepositoryId,
    pub name: String,
    pub url: String,
    /// Key into the configured authentication providers.
    pub provider_id: String,
    pub checkout_location: Option<PathBuf>,
    /// Set once a checkout has been materialised successfully.
    pub checkout_status: bool,
    pub checkout_message: String,
    /// Logical deletion; suppresses polling and checkout maintenance.
    pub deleted: bool,
    pub last_fetch_time: Option<DateTime<Utc>>,
    pub fetch_error_count: u32,
    pub fetch_error_message: String,
    /// Tracked references attached to this repository, loaded by the store.
    #[serde(default)]
    pub references: Vec<TrackedReference>,
}

impl Repository {
    /// Eligible for scheduled polling: live, checked out, and tracked by at
    /// least one active reference.
    pub fn is_pollable(&self) -> bool {
        !self.deleted && self.checkout_status && self.references.iter().any(|r| r.active)
    }

    /// Record the outcome of one poll attempt.
    pub fn record_fetch_outcome(&mut self, now: DateTime<Utc>, error: Option<String>) {
        self.last_fetch_time = Some(now);
        match error {
            Some(message) => {
                self.fetch_error_count = self.fetch_error_count.saturating_add(1);
                self.fetch_error_message = message;
            }
            None => {
                self.fetch_error_count = 0;
                self.fetch_error_message.clear();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tracked reference
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReferenceKind {
    /// Change detection by polling the head of a named branch.
    #[default]
    BranchFixed,
    /// Change detection driven by externally delivered webhook events.
    WebhookSourced,
}

impl ReferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BranchFixed => "branch-fixed",
            Self::WebhookSourced => "webhook-sourced",
        }
    }
}

impl std::str::FromStr for ReferenceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "branch-fixed" => Ok(Self::BranchFixed),
            "webhook-sourced" => Ok(Self::WebhookSourced),
            other => Err(format!("unknown reference kind: {other}")),
        }
    }
}

/// A pipeline's pointer into a repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackedReference {
    pub id: ReferenceId,
    pub repository_id: RepositoryId,
    pub kind: ReferenceKind,
    /// Branch name, or a serialized webhook-source descriptor.
    pub value: String,
    pub last_seen_hash: String,
    pub commit_author: String,
    pub commit_date: Option<DateTime<FixedOffset>>,
    /// JSON array of the most recent [`Commit`]s, newest first.
    pub commit_history: String,
    pub errored: bool,
    pub error_message: String,
    pub active: bool,
}

impl TrackedReference {
    /// Adopt `commits` (newest first) as the reference's latest view.
    pub fn record_history(&mut self, commits: &[Commit]) -> serde_json::Result<()> {
        self.commit_history = serde_json::to_string(commits)?;
        if let Some(latest) = commits.first() {
            self.last_seen_hash = latest.hash.clone();
            self.commit_author = latest.author.clone();
            self.commit_date = Some(latest.date);
        }
        self.errored = false;
        self.error_message.clear();
        Ok(())
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errored = true;
        self.error_message = message.into();
    }

    /// Decode the stored history. An empty column decodes as no commits.
    pub fn history(&self) -> serde_json::Result<Vec<Commit>> {
        if self.commit_history.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&self.commit_history)
    }

    /// Whether the poller drives this reference.
    pub fn is_polled(&self) -> bool {
        self.active && self.kind == ReferenceKind::BranchFixed
    }
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    #[serde(rename = "commit")]
    pub hash: String,
    /// `Name <email>`.
    pub author: String,
    pub date: DateTime<FixedOffset>,
    pub message: String,
    #[serde(default)]
    pub changes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

// ---------------------------------------------------------------------------
// Range diff
// ---------------------------------------------------------------------------

/// Additions and deletions for one path between two trees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub path: String,
    pub additions: u64,
    pub deletions: u64,
}

/// Commits unique to `new` relative to `old`, plus tree-level file stats.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResult {
    pub commits: Vec<Commit>,
    pub file_stats: Vec<FileStat>,
}

// ---------------------------------------------------------------------------
// Change event
// ---------------------------------------------------------------------------

/// Payload published once per reference whose head moved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub id: ReferenceId,
    pub value: String,
    pub repository_id: RepositoryId,
    pub kind: ReferenceKind,
    pub active: bool,
    pub commit: Commit,
}

impl ChangeEvent {
    pub fn new(reference: &TrackedReference, commit: Commit) -> Self {
        Self {
            id: reference.id,
            value: reference.value.clone(),
            repository_id: reference.repository_id,
            kind: reference.kind,
            active: reference.active,
            commit,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn record_history_takes_newest_commit() {
        let mut reference = branch_reference(1, 7, "main");
        reference.record_error("stale");
        let commits = vec![commit("c3"), commit("c2")];

        reference.record_history(&commits).unwrap();

        assert_eq!(reference.last_seen_hash, "c3");
        assert_eq!(reference.commit_author, "Ada Lovelace <ada@example.com>");
        assert!(!reference.errored);
        assert!(reference.error_message.is_empty());
        assert_eq!(reference.history().unwrap(), commits);
    }

    #[test]
    fn empty_history_column_decodes_to_no_commits() {
        let reference = branch_reference(1, 7, "main");
        assert!(reference.history().unwrap().is_empty());
    }

    #[test]
    fn fetch_outcome_counts_consecutive_failures() {
        let mut repo = Repository::default();
        let now = Utc::now();
        repo.record_fetch_outcome(now, Some("boom".into()));
        repo.record_fetch_outcome(now, Some("boom again".into()));
        assert_eq!(repo.fetch_error_count, 2);
        assert_eq!(repo.fetch_error_message, "boom again");

        repo.record_fetch_outcome(now, None);
        assert_eq!(repo.fetch_error_count, 0);
        assert!(repo.fetch_error_message.is_empty());
        assert_eq!(repo.last_fetch_time, Some(now));
    }

    #[test]
    fn pollable_requires_checkout_and_active_reference() {
        let mut repo = Repository {
            checkout_status: true,
            references: vec![branch_reference(1, 7, "main")],
            ..Default::default()
        };
        assert!(repo.is_pollable());

        repo.references[0].active = false;
        assert!(!repo.is_pollable());

        repo.references[0].active = true;
        repo.deleted = true;
        assert!(!repo.is_pollable());
    }

    #[test]
    fn change_event_uses_camel_case_and_commit_field() {
        let reference = branch_reference(3, 9, "main");
        let event = ChangeEvent::new(&reference, commit("abc"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["repositoryId"], 9);
        assert_eq!(json["kind"], "branch-fixed");
        assert_eq!(json["commit"]["commit"], "abc");
    }

    #[test]
    fn reference_kind_round_trips_through_str() {
        for kind in [ReferenceKind::BranchFixed, ReferenceKind::WebhookSourced] {
            assert_eq!(kind.as_str().parse::<ReferenceKind>().unwrap(), kind);
        }
        assert!("tag".parse::<ReferenceKind>().is_err());
    }
}
