use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Read a secret from the session keyring, falling back to the `keyctl` CLI
/// when direct keyutils access is unavailable.
pub async fn read_key(key_name: &str) -> Result<String> {
    match read_key_native(key_name) {
        Ok(value) => {
            debug!(key_name, "read secret via keyutils");
            Ok(value)
        }
        Err(e) => {
            warn!(key_name, error = %e, "keyutils read failed, trying keyctl");
            read_key_cli(key_name).await
        }
    }
}

#[cfg(target_os = "linux")]
fn read_key_native(key_name: &str) -> Result<String> {
    use linux_keyutils::{KeyRing, KeyRingIdentifier};

    let ring = KeyRing::from_special_id(KeyRingIdentifier::Session, false)
        .map_err(|e| anyhow::anyhow!("failed to open session keyring: {e:?}"))?;
    let key = ring
        .search(key_name)
        .map_err(|e| anyhow::anyhow!("key '{key_name}' not in session keyring: {e:?}"))?;
    let data = key
        .read_to_vec()
        .map_err(|e| anyhow::anyhow!("failed to read key '{key_name}': {e:?}"))?;
    String::from_utf8(data).context("keyring payload is not valid UTF-8")
}

#[cfg(not(target_os = "linux"))]
fn read_key_native(key_name: &str) -> Result<String> {
    anyhow::bail!("session keyring unavailable on this platform (key '{key_name}')")
}

async fn read_key_cli(key_name: &str) -> Result<String> {
    let search = tokio::process::Command::new("keyctl")
        .args(["search", "@s", "user", key_name])
        .output()
        .await
        .context("failed to run keyctl search")?;
    if !search.status.success() {
        anyhow::bail!(
            "keyctl search for '{key_name}' failed: {}",
            String::from_utf8_lossy(&search.stderr).trim()
        );
    }

    let key_id = String::from_utf8_lossy(&search.stdout).trim().to_string();
    anyhow::ensure!(!key_id.is_empty(), "keyctl found no key named '{key_name}'");

    let pipe = tokio::process::Command::new("keyctl")
        .args(["pipe", &key_id])
        .output()
        .await
        .context("failed to run keyctl pipe")?;
    if !pipe.status.success() {
        anyhow::bail!(
            "keyctl pipe for key id {key_id} failed: {}",
            String::from_utf8_lossy(&pipe.stderr).trim()
        );
    }
    String::from_utf8(pipe.stdout).context("keyctl payload is not valid UTF-8")
}
