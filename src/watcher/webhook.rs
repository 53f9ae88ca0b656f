//! Inbound webhook events.
//!
//! Events arrive already parsed by an upstream service.  The receive loop
//! acknowledges each delivery before dispatching it.  Duplicates are
//! possible when the transport redelivers.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::Watcher;
use crate::bus::{Delivery, Envelope};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub git_host_id: i64,
    pub event_type: String,
    #[serde(default)]
    pub payload_id: i64,
    /// Clone URL of the repository the event concerns, when the host sent one.
    #[serde(default)]
    pub repository_url: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, event: WebhookEvent) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    /// The message did not decode as a webhook event.
    Malformed,
    Failed,
}

/// Decode one message body.  Bodies may be bare events or wrapped in the
/// bus [`Envelope`].
pub fn parse_event(data: &str) -> Result<WebhookEvent> {
    if let Ok(envelope) = serde_json::from_str::<Envelope>(data) {
        return serde_json::from_value(envelope.payload).context("decode enveloped webhook event");
    }
    serde_json::from_str(data).context("decode webhook event")
}

/// Acknowledge, decode and hand one delivery to `handler`.
pub async fn dispatch(mut delivery: Delivery, handler: &dyn WebhookHandler) -> Dispatch {
    delivery.ack();

    let event = match parse_event(&delivery.data) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "dropping malformed webhook message");
            return Dispatch::Malformed;
        }
    };
    debug!(host = event.git_host_id, kind = %event.event_type, "webhook event received");

    match handler.handle(event).await {
        Ok(()) => Dispatch::Handled,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "webhook handler failed");
            Dispatch::Failed
        }
    }
}

/// Drain `deliveries` until the channel closes or `cancel` fires.
pub async fn run(
    mut deliveries: mpsc::Receiver<Delivery>,
    handler: Arc<dyn WebhookHandler>,
    cancel: CancellationToken,
) {
    info!("webhook loop started");
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            delivery = deliveries.recv() => delivery,
        };
        let Some(delivery) = delivery else {
            info!("webhook subscription closed");
            break;
        };
        dispatch(delivery, handler.as_ref()).await;
    }
    info!("webhook loop stopped");
}

/// Compare clone URLs ignoring case, a trailing slash and a `.git` suffix.
fn same_remote(a: &str, b: &str) -> bool {
    fn normalize(url: &str) -> String {
        let url = url.trim().trim_end_matches('/');
        url.strip_suffix(".git").unwrap_or(url).to_ascii_lowercase()
    }
    normalize(a) == normalize(b)
}

/// Refreshes every repository whose remote matches the event's repository URL.
pub struct RefreshOnPush {
    watcher: Arc<Watcher>,
}

impl RefreshOnPush {
    pub fn new(watcher: Arc<Watcher>) -> Self {
        Self { watcher }
    }
}

#[async_trait]
impl WebhookHandler for RefreshOnPush {
    #[instrument(skip_all, fields(host = event.git_host_id, kind = %event.event_type))]
    async fn handle(&self, event: WebhookEvent) -> Result<()> {
        let Some(url) = event.repository_url.as_deref() else {
            debug!("event names no repository; ignoring");
            return Ok(());
        };

        let repositories = self.watcher.store().find_active_repositories().await?;
        let matching: Vec<_> = repositories
            .iter()
            .filter(|r| same_remote(&r.url, url))
            .map(|r| r.id)
            .collect();
        if matching.is_empty() {
            debug!(%url, "no watched repository matches");
        }
        for id in matching {
            let repository = self.watcher.refresh_one(id).await?;
            info!(
                repository = id,
                errors = repository.fetch_error_count,
                "refreshed from webhook"
            );
        }
        Ok(())
    }
}
