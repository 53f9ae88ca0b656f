use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::bus::ConsumerIdentity;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub checkout: CheckoutConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub git: GitConfig,
    pub keydb: KeyDbConfig,
    #[serde(default)]
    pub bus: BusConfig,
    /// Authentication providers keyed by the id repositories refer to.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ---------------------------------------------------------------------------
// Checkouts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutConfig {
    /// Directory holding one bare checkout per repository.
    pub root: PathBuf,
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    /// Seconds between scheduler ticks.
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    /// Width of the per-tick worker pool.
    #[serde(default = "default_poll_workers")]
    pub workers: usize,
    /// Number of recent commits kept in a tracked reference's history.
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            workers: default_poll_workers(),
            history_depth: default_history_depth(),
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_poll_interval() -> u64 {
    120
}

fn default_poll_workers() -> usize {
    5
}

fn default_history_depth() -> usize {
    15
}

// ---------------------------------------------------------------------------
// Git backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GitConfig {
    /// Upper bound (seconds) on a single network fetch.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

impl GitConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

fn default_fetch_timeout() -> u64 {
    120
}

// ---------------------------------------------------------------------------
// KeyDB / Redis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct KeyDbConfig {
    /// Connection string (e.g. `rediss://keydb.local:6380`).
    pub endpoint: String,
    /// Enable TLS for the KeyDB connection.
    #[serde(default = "bool_true")]
    pub tls: bool,
    /// Name of the environment variable that holds the KeyDB auth token.
    #[serde(default = "default_keydb_auth_env")]
    pub auth_token_env: String,
}

fn bool_true() -> bool {
    true
}

fn default_keydb_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

// ---------------------------------------------------------------------------
// Message bus topics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Topic that receives one event per tracked reference whose head moved.
    #[serde(default = "default_change_topic")]
    pub change_topic: String,
    /// Topic carrying externally parsed webhook events.
    #[serde(default = "default_webhook_topic")]
    pub webhook_topic: String,
    /// Consumer group shared by every forgewatch instance.
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Name of this instance within the group.  Defaults to `$HOSTNAME`.
    #[serde(default)]
    pub consumer_name: Option<String>,
    /// Seconds a delivered webhook event may stay unacknowledged before
    /// another instance claims it.
    #[serde(default = "default_claim_idle")]
    pub claim_idle_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            change_topic: default_change_topic(),
            webhook_topic: default_webhook_topic(),
            consumer_group: default_consumer_group(),
            consumer_name: None,
            claim_idle_secs: default_claim_idle(),
        }
    }
}

impl BusConfig {
    pub fn consumer_identity(&self) -> ConsumerIdentity {
        let consumer = self
            .consumer_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| format!("forgewatch-{}", uuid::Uuid::new_v4().simple()));
        ConsumerIdentity {
            group: self.consumer_group.clone(),
            consumer,
            claim_idle: Duration::from_secs(self.claim_idle_secs),
        }
    }
}

fn default_change_topic() -> String {
    "forgewatch.reference.changed".to_string()
}

fn default_webhook_topic() -> String {
    "forgewatch.webhook.event".to_string()
}

fn default_consumer_group() -> String {
    "forgewatch".to_string()
}

fn default_claim_idle() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// Authentication providers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Anonymous,
    /// Username and password (or token) embedded in HTTPS URLs.
    Basic,
    /// Private key handed to `ssh` through `core.sshCommand`.
    Ssh,
}

/// Where a provider's secret lives.  Written as a one-key map in YAML,
/// `{env: NAME}` or `{keyring: NAME}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "SecretSourceMap")]
pub enum SecretSource {
    /// Read the secret from this environment variable.
    Env(String),
    /// Read the secret from the Linux session keyring under this key name.
    Keyring(String),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SecretSourceMap {
    #[serde(default)]
    env: Option<String>,
    #[serde(default)]
    keyring: Option<String>,
}

impl TryFrom<SecretSourceMap> for SecretSource {
    type Error = String;

    fn try_from(map: SecretSourceMap) -> Result<Self, Self::Error> {
        match (map.env, map.keyring) {
            (Some(name), None) => Ok(Self::Env(name)),
            (None, Some(name)) => Ok(Self::Keyring(name)),
            (None, None) => Err("secret needs one of `env` or `keyring`".to_string()),
            (Some(_), Some(_)) => Err("secret takes only one of `env` or `keyring`".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub mode: AuthMode,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub secret: Option<SecretSource>,
}

// ---------------------------------------------------------------------------
// Observability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Socket address serving `/healthz` and `/metrics`.
    #[serde(default = "default_observability_listen")]
    pub listen: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            listen: default_observability_listen(),
        }
    }
}

fn default_observability_listen() -> String {
    "0.0.0.0:9090".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to load config file: {}", path.display()))
}

fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("invalid config YAML")?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(config.poll.workers >= 1, "poll.workers must be at least 1");
    anyhow::ensure!(
        config.poll.interval_secs >= 1,
        "poll.interval_secs must be at least 1"
    );
    anyhow::ensure!(
        (1..=1000).contains(&config.poll.history_depth),
        "poll.history_depth must be 1-1000"
    );
    anyhow::ensure!(
        config.git.fetch_timeout_secs >= 1,
        "git.fetch_timeout_secs must be at least 1"
    );
    for (id, provider) in &config.providers {
        if provider.mode != AuthMode::Anonymous {
            anyhow::ensure!(
                provider.secret.is_some(),
                "provider '{id}' uses {:?} auth but declares no secret",
                provider.mode
            );
        }
    }
    Ok(())
}
