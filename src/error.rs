//! Error taxonomy for checkout, fetch and commit-graph operations.
//!
//! Poll-path callers stringify these into the persisted error fields; the
//! query path hands them back to the caller unchanged so the specific kind
//! stays visible.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    /// The init / configure / initial fetch sequence of a checkout failed.
    #[error("checkout of {url} into {path} failed: {reason}")]
    Checkout {
        url: String,
        path: PathBuf,
        reason: String,
    },

    /// The checkout could not be opened or the remote could not be reached.
    #[error("fetch from {url} failed: {reason}")]
    Fetch { url: String, reason: String },

    #[error("branch {branch} not found in the repository")]
    RefNotFound { branch: String },

    #[error("commit {rev} not found in the repository")]
    CommitNotFound { rev: String },

    #[error("filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Credential resolution or key materialisation failed.
    #[error("authentication setup failed: {0}")]
    Auth(String),

    /// A local git plumbing command failed for a reason not covered above.
    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },
}

impl RepoError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// `true` for the failure kinds that the poll loop counts against a
    /// repository's consecutive-failure counter rather than a reference.
    pub fn is_repository_level(&self) -> bool {
        matches!(
            self,
            Self::Checkout { .. } | Self::Fetch { .. } | Self::Auth(_) | Self::Io { .. }
        )
    }
}

pub type RepoResult<T> = std::result::Result<T, RepoError>;
