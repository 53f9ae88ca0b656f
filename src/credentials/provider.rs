//! Config-backed [`AuthProvider`].

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::{keyring, ssh_command, AuthProvider, Credentials};
use crate::config::{AuthMode, ProviderConfig, SecretSource};
use crate::error::{RepoError, RepoResult};
use crate::git::commands;
use crate::model::Repository;

pub struct ConfigAuthProvider {
    providers: HashMap<String, ProviderConfig>,
    /// Directory holding one private key file per SSH provider.
    key_dir: PathBuf,
}

impl ConfigAuthProvider {
    pub fn new(providers: HashMap<String, ProviderConfig>, checkout_root: &std::path::Path) -> Self {
        Self {
            providers,
            key_dir: checkout_root.join(".ssh"),
        }
    }

    fn provider(&self, repository: &Repository) -> RepoResult<&ProviderConfig> {
        self.providers.get(&repository.provider_id).ok_or_else(|| {
            RepoError::Auth(format!(
                "repository {} references unknown provider '{}'",
                repository.id, repository.provider_id
            ))
        })
    }

    fn key_path(&self, provider_id: &str) -> PathBuf {
        self.key_dir.join(provider_id)
    }

    async fn write_key(&self, provider_id: &str, key_data: &str) -> RepoResult<PathBuf> {
        tokio::fs::create_dir_all(&self.key_dir)
            .await
            .map_err(|e| RepoError::io(&self.key_dir, e))?;

        let path = self.key_path(provider_id);
        let mut contents = key_data.to_string();
        // ssh refuses keys without a trailing newline.
        if !contents.ends_with('\n') {
            contents.push('\n');
        }
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| RepoError::io(&path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| RepoError::io(&path, e))?;
        }

        debug!(provider_id, path = %path.display(), "ssh key written");
        Ok(path)
    }
}

async fn read_secret(source: &SecretSource) -> RepoResult<String> {
    match source {
        SecretSource::Env(name) => std::env::var(name)
            .map_err(|_| RepoError::Auth(format!("environment variable {name} is not set"))),
        SecretSource::Keyring(name) => keyring::read_key(name)
            .await
            .map_err(|e| RepoError::Auth(format!("{e:#}"))),
    }
}

fn required_secret<'a>(provider_id: &str, config: &'a ProviderConfig) -> RepoResult<&'a SecretSource> {
    config
        .secret
        .as_ref()
        .ok_or_else(|| RepoError::Auth(format!("provider '{provider_id}' has no secret")))
}

#[async_trait]
impl AuthProvider for ConfigAuthProvider {
    async fn credentials(&self, repository: &Repository) -> RepoResult<Credentials> {
        let provider = self.provider(repository)?;
        let provider_id = repository.provider_id.as_str();
        match provider.mode {
            AuthMode::Anonymous => Ok(Credentials::Anonymous),
            AuthMode::Basic => {
                let password = read_secret(required_secret(provider_id, provider)?).await?;
                Ok(Credentials::Basic {
                    username: provider.username.clone().unwrap_or_default(),
                    password: password.trim_end().to_string(),
                })
            }
            AuthMode::Ssh => {
                let key_path = self.key_path(provider_id);
                if !tokio::fs::try_exists(&key_path).await.unwrap_or(false) {
                    let key_data = read_secret(required_secret(provider_id, provider)?).await?;
                    self.write_key(provider_id, &key_data).await?;
                }
                Ok(Credentials::SshKey { key_path })
            }
        }
    }

    #[instrument(skip_all, fields(repository_id = repository.id))]
    async fn materialize_key(&self, repository: &Repository) -> RepoResult<()> {
        let provider = self.provider(repository)?;
        if provider.mode != AuthMode::Ssh {
            return Ok(());
        }
        let provider_id = repository.provider_id.as_str();
        let key_data = read_secret(required_secret(provider_id, provider)?).await?;
        let key_path = self.write_key(provider_id, &key_data).await?;

        if let Some(location) = repository.checkout_location.as_deref() {
            if commands::is_bare_repo(location).await {
                commands::config_set(location, "core.sshCommand", &ssh_command(&key_path))
                    .await?;
            }
        }
        info!(provider_id, "ssh key materialized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(mode: AuthMode, secret: Option<SecretSource>) -> ProviderConfig {
        ProviderConfig {
            mode,
            username: Some("ci-bot".to_string()),
            secret,
        }
    }

    fn repository(provider_id: &str) -> Repository {
        Repository {
            id: 11,
            provider_id: provider_id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unknown_provider_is_an_auth_error() {
        let tmp = tempfile::tempdir().unwrap();
        let auth = ConfigAuthProvider::new(HashMap::new(), tmp.path());
        let err = auth.credentials(&repository("nope")).await.unwrap_err();
        assert!(matches!(err, RepoError::Auth(_)));
    }

    #[tokio::test]
    async fn anonymous_provider_needs_no_secret() {
        let tmp = tempfile::tempdir().unwrap();
        let providers = HashMap::from([("public".to_string(), provider(AuthMode::Anonymous, None))]);
        let auth = ConfigAuthProvider::new(providers, tmp.path());
        let creds = auth.credentials(&repository("public")).await.unwrap();
        assert_eq!(creds, Credentials::Anonymous);
    }

    #[tokio::test]
    async fn ssh_key_is_written_with_owner_only_mode() {
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("FORGEWATCH_TEST_SSH_KEY", "-----BEGIN KEY-----\nabc\n-----END KEY-----");
        let providers = HashMap::from([(
            "internal".to_string(),
            provider(
                AuthMode::Ssh,
                Some(SecretSource::Env("FORGEWATCH_TEST_SSH_KEY".to_string())),
            ),
        )]);
        let auth = ConfigAuthProvider::new(providers, tmp.path());

        let creds = auth.credentials(&repository("internal")).await.unwrap();
        let expected = tmp.path().join(".ssh").join("internal");
        assert_eq!(creds, Credentials::SshKey { key_path: expected.clone() });

        let written = std::fs::read_to_string(&expected).unwrap();
        assert!(written.ends_with("-----END KEY-----\n"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&expected).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        auth.materialize_key(&repository("internal")).await.unwrap();
        assert!(expected.exists());
    }

    #[tokio::test]
    async fn missing_env_secret_fails_basic_resolution() {
        let tmp = tempfile::tempdir().unwrap();
        let providers = HashMap::from([(
            "github".to_string(),
            provider(
                AuthMode::Basic,
                Some(SecretSource::Env("FORGEWATCH_TEST_UNSET_TOKEN".to_string())),
            ),
        )]);
        let auth = ConfigAuthProvider::new(providers, tmp.path());
        let err = auth.credentials(&repository("github")).await.unwrap_err();
        assert!(err.to_string().contains("FORGEWATCH_TEST_UNSET_TOKEN"));
    }
}
