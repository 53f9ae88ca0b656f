//! Bare checkout lifecycle: materialize, open, reclaim.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, instrument};

use super::commands;
use crate::credentials::Credentials;
use crate::error::{RepoError, RepoResult};

/// An opened bare checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkout {
    path: PathBuf,
}

impl Checkout {
    /// Open the checkout at `path`, failing if it is not a bare repository.
    pub async fn open(path: &Path, url: &str) -> RepoResult<Self> {
        if !commands::is_bare_repo(path).await {
            return Err(RepoError::Fetch {
                url: url.to_string(),
                reason: format!("no checkout at {}", path.display()),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Handle for a checkout known to exist, without touching the disk.
    #[cfg(test)]
    pub(crate) fn assume(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remote-tracking ref for `branch`.
    pub fn remote_ref(branch: &str) -> String {
        format!("refs/remotes/origin/{branch}")
    }
}

/// Recreate the checkout at `location` and fetch everything from `url`.
///
/// Any previous directory is removed first, and a failed attempt leaves no
/// checkout behind.
#[instrument(skip(credentials, timeout), fields(location = %location.display(), %url))]
pub async fn materialize(
    location: &Path,
    url: &str,
    credentials: &Credentials,
    timeout: Duration,
) -> RepoResult<()> {
    let checkout_failure = |reason: String| RepoError::Checkout {
        url: url.to_string(),
        path: location.to_path_buf(),
        reason,
    };

    reclaim(location).await.map_err(|e| checkout_failure(e.to_string()))?;

    let attempt = async {
        if let Some(parent) = location.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("cannot create {}: {e}", parent.display()))?;
        }
        commands::init_bare(location).await.map_err(|e| e.to_string())?;
        commands::set_origin(location, url).await.map_err(|e| e.to_string())?;
        if let Credentials::SshKey { key_path } = credentials {
            commands::config_set(
                location,
                "core.sshCommand",
                &crate::credentials::ssh_command(key_path),
            )
            .await
            .map_err(|e| e.to_string())?;
        }
        commands::fetch(location, url, credentials, timeout).await
    };

    match attempt.await {
        Ok(outcome) => {
            info!(refs = outcome.refs_updated, "checkout materialized");
            Ok(())
        }
        Err(reason) => {
            // Best effort: the checkout error is what the caller needs.
            if let Err(e) = reclaim(location).await {
                debug!(error = %e, "cleanup after failed checkout also failed");
            }
            Err(checkout_failure(reason))
        }
    }
}

/// Remove the checkout directory.  A missing directory is not an error.
#[instrument(fields(location = %location.display()))]
pub async fn reclaim(location: &Path) -> RepoResult<()> {
    match tokio::fs::remove_dir_all(location).await {
        Ok(()) => {
            debug!("checkout removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RepoError::io(location, e)),
    }
}
