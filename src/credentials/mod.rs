//! Repository credentials.
//!
//! Secrets are read from the environment or the Linux session keyring by the
//! [`ConfigAuthProvider`].  Basic credentials are only spliced into a remote
//! URL at the moment a git command is spawned; SSH keys live on disk next to
//! the checkouts and are handed to `ssh` through `GIT_SSH_COMMAND` and
//! `core.sshCommand`.

pub mod keyring;
pub mod provider;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use url::Url;

use crate::error::{RepoError, RepoResult};
use crate::model::Repository;

pub use provider::ConfigAuthProvider;

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    Basic { username: String, password: String },
    /// Key material lives at `key_path`; see [`AuthProvider::materialize_key`].
    SshKey { key_path: PathBuf },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::SshKey { key_path } => f
                .debug_struct("SshKey")
                .field("key_path", key_path)
                .finish(),
        }
    }
}

impl Credentials {
    pub fn uses_key(&self) -> bool {
        matches!(self, Self::SshKey { .. })
    }

    /// The URL git should talk to.  Basic credentials are embedded into
    /// `http(s)` URLs; every other combination passes `url` through.
    pub fn remote_url(&self, url: &str) -> RepoResult<String> {
        let Self::Basic { username, password } = self else {
            return Ok(url.to_string());
        };
        let mut parsed = match Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => parsed,
            _ => return Ok(url.to_string()),
        };
        parsed
            .set_username(username)
            .map_err(|()| RepoError::Auth(format!("cannot set username on {url}")))?;
        parsed
            .set_password(Some(password))
            .map_err(|()| RepoError::Auth(format!("cannot set password on {url}")))?;
        Ok(parsed.into())
    }

    /// Extra environment for network git commands.
    pub fn git_env(&self) -> Vec<(String, String)> {
        match self {
            Self::SshKey { key_path } => {
                vec![("GIT_SSH_COMMAND".to_string(), ssh_command(key_path))]
            }
            _ => Vec::new(),
        }
    }

    /// Remove any secret from `text` (typically git's stderr), both as
    /// typed and as percent-encoded by [`remote_url`](Self::remote_url).
    pub fn redact(&self, text: &str) -> String {
        match self {
            Self::Basic { password, .. } if !password.is_empty() => {
                let mut redacted = text.replace(password.as_str(), "***");
                if let Some(encoded) = encoded_password(password) {
                    if encoded != *password {
                        redacted = redacted.replace(encoded.as_str(), "***");
                    }
                }
                redacted
            }
            _ => text.to_string(),
        }
    }
}

/// `password` as it appears in the userinfo of a URL built by `url`.
fn encoded_password(password: &str) -> Option<String> {
    let mut scratch = Url::parse("https://forgewatch.invalid/").ok()?;
    scratch.set_password(Some(password)).ok()?;
    scratch.password().map(str::to_string)
}

pub(crate) fn ssh_command(key_path: &Path) -> String {
    format!(
        "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
        key_path.display()
    )
}

/// Resolves and materializes credentials for a repository.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn credentials(&self, repository: &Repository) -> RepoResult<Credentials>;

    /// Rewrite the repository's private key on disk, pointing its checkout
    /// at it when one exists.
    async fn materialize_key(&self, repository: &Repository) -> RepoResult<()>;
}
