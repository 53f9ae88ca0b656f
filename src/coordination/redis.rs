//! KeyDB connection setup shared by the store and the message bus.

use anyhow::{Context, Result};
use fred::clients::Pool;
use fred::interfaces::ClientLike;
use fred::types::config::{Config as FredConfig, ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::Builder;

use crate::config::KeyDbConfig;

const POOL_SIZE: usize = 4;

/// Connect a pool to the configured KeyDB and verify it answers PING.
pub async fn connect_pool(config: &KeyDbConfig) -> Result<Pool> {
    let endpoint = strip_scheme(&config.endpoint);
    let (host, port) = parse_host_port(endpoint)?;

    let mut fred_config = FredConfig {
        server: ServerConfig::new_centralized(host, port),
        password: std::env::var(&config.auth_token_env).ok(),
        ..FredConfig::default()
    };
    if config.tls {
        fred_config.tls = Some(
            TlsConnector::default_rustls()
                .context("failed to build rustls connector")?
                .into(),
        );
    }

    let mut builder = Builder::from_config(fred_config);
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));
    let pool = builder
        .build_pool(POOL_SIZE)
        .context("failed to build KeyDB connection pool")?;

    pool.init().await.context("failed to connect to KeyDB")?;
    ping(&pool).await?;

    tracing::info!(host, port, tls = config.tls, "connected to KeyDB");
    Ok(pool)
}

/// Round-trip a PING through the pool.
pub async fn ping(pool: &Pool) -> Result<()> {
    let _: String = pool.ping(None).await.context("KeyDB PING failed")?;
    Ok(())
}

fn strip_scheme(endpoint: &str) -> &str {
    endpoint
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://")
}

/// Split `host[:port]`, defaulting the port to 6379.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);
    match endpoint.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .with_context(|| format!("invalid port in KeyDB endpoint: {endpoint}"))?;
            Ok((host, port))
        }
        None => Ok((endpoint, 6379)),
    }
}
