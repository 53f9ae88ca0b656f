//! KeyDB stream transport for the message bus.
//!
//! Every topic is a stream.  A publish appends one entry holding the
//! envelope's `msgId` and `payload` fields.  Subscribers read through a
//! consumer group on a dedicated client, so entries written while nobody
//! listens wait in the stream, and entries delivered but never acknowledged
//! are handed out again when the subscriber next starts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fred::clients::{Client, Pool};
use fred::interfaces::{ClientLike, StreamsInterface};
use fred::types::streams::XReadResponse;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Delivery, MessageBus, Subscriber};

const INBOUND_BUFFER: usize = 64;
const READ_COUNT: u64 = 32;
const BLOCK_MS: u64 = 5_000;
const RETRY_DELAY: Duration = Duration::from_secs(1);

const MSG_ID_FIELD: &str = "msgId";
const PAYLOAD_FIELD: &str = "payload";

type StreamEntry = (String, HashMap<String, String>);

/// Consumer-group membership of this process.
#[derive(Debug, Clone)]
pub struct ConsumerIdentity {
    pub group: String,
    pub consumer: String,
    /// Pending entries idle for longer than this are claimed from other
    /// consumers at startup.
    pub claim_idle: Duration,
}

pub struct KeyDbBus {
    pool: Pool,
    identity: ConsumerIdentity,
}

impl KeyDbBus {
    pub fn new(pool: Pool, identity: ConsumerIdentity) -> Self {
        Self { pool, identity }
    }
}

#[async_trait]
impl MessageBus for KeyDbBus {
    async fn publish(&self, topic: &str, payload: serde_json::Value, dedup_key: &str) -> Result<()> {
        let payload = serde_json::to_string(&payload).context("serialize payload")?;
        let id: String = self
            .pool
            .xadd(
                topic,
                false,
                None,
                "*",
                vec![(MSG_ID_FIELD, dedup_key), (PAYLOAD_FIELD, payload.as_str())],
            )
            .await
            .with_context(|| format!("append to stream {topic}"))?;
        debug!(%topic, %dedup_key, %id, "published");
        Ok(())
    }
}

#[async_trait]
impl Subscriber for KeyDbBus {
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Delivery>> {
        // XREADGROUP blocks its connection, so it gets a client of its own.
        let template = self.pool.next();
        let reader = Client::new(
            template.client_config(),
            None,
            None,
            template.client_reconnect_policy(),
        );
        let _connection = reader.connect();
        reader
            .wait_for_connect()
            .await
            .context("stream reader connect")?;

        let stream = Arc::new(StreamGroup {
            topic: topic.to_string(),
            identity: self.identity.clone(),
        });
        stream.ensure_group(&reader).await?;
        info!(
            %topic,
            group = %stream.identity.group,
            consumer = %stream.identity.consumer,
            "subscribed"
        );

        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        tokio::spawn(acknowledge(self.pool.clone(), Arc::clone(&stream), acks_rx));
        tokio::spawn(consume(reader, stream, tx, acks_tx));
        Ok(rx)
    }
}

struct StreamGroup {
    topic: String,
    identity: ConsumerIdentity,
}

impl StreamGroup {
    async fn ensure_group(&self, client: &Client) -> Result<()> {
        let created: Result<(), fred::error::Error> = client
            .xgroup_create(self.topic.as_str(), self.identity.group.as_str(), "0", true)
            .await;
        match created {
            Ok(()) => {
                info!(topic = %self.topic, group = %self.identity.group, "consumer group created");
                Ok(())
            }
            Err(e) if e.details().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e).with_context(|| format!("create consumer group on {}", self.topic)),
        }
    }

    /// Entries idle past `claim_idle` in other consumers' pending lists.
    async fn claim_abandoned(&self, client: &Client) -> Result<Vec<StreamEntry>> {
        let min_idle = u64::try_from(self.identity.claim_idle.as_millis()).unwrap_or(u64::MAX);
        let mut claimed = Vec::new();
        let mut cursor = "0-0".to_string();
        loop {
            let (next, entries): (String, Vec<StreamEntry>) = client
                .xautoclaim_values(
                    self.topic.as_str(),
                    self.identity.group.as_str(),
                    self.identity.consumer.as_str(),
                    min_idle,
                    cursor.as_str(),
                    Some(READ_COUNT),
                    false,
                )
                .await
                .with_context(|| format!("claim pending entries on {}", self.topic))?;
            claimed.extend(entries);
            if next == "0-0" || next == cursor {
                return Ok(claimed);
            }
            cursor = next;
        }
    }

    /// `from = "0"` re-reads this consumer's own pending entries; `">"`
    /// waits for new ones.
    async fn read(&self, client: &Client, from: &str, block: Option<u64>) -> Result<Vec<StreamEntry>> {
        let response: XReadResponse<String, String, String, String> = client
            .xreadgroup_map(
                self.identity.group.as_str(),
                self.identity.consumer.as_str(),
                Some(READ_COUNT),
                block,
                false,
                self.topic.as_str(),
                from,
            )
            .await
            .with_context(|| format!("read stream {}", self.topic))?;
        Ok(response.into_values().flatten().collect())
    }
}

/// Turn one stream entry into a delivery.  Entries without a payload are
/// acknowledged on the spot.
fn entry_delivery(
    (id, mut fields): StreamEntry,
    acks: &mpsc::UnboundedSender<String>,
) -> Option<Delivery> {
    match fields.remove(PAYLOAD_FIELD) {
        Some(payload) => Some(Delivery::pending(payload, id, acks.clone())),
        None => {
            warn!(%id, "dropping stream entry without payload");
            let _ = acks.send(id);
            None
        }
    }
}

async fn forward(
    entries: Vec<StreamEntry>,
    tx: &mpsc::Sender<Delivery>,
    acks: &mpsc::UnboundedSender<String>,
) -> bool {
    for entry in entries {
        if let Some(delivery) = entry_delivery(entry, acks) {
            if tx.send(delivery).await.is_err() {
                return false;
            }
        }
    }
    true
}

async fn consume(
    reader: Client,
    stream: Arc<StreamGroup>,
    tx: mpsc::Sender<Delivery>,
    acks: mpsc::UnboundedSender<String>,
) {
    let mut backlog = Vec::new();
    match stream.claim_abandoned(&reader).await {
        Ok(entries) => backlog.extend(entries),
        Err(e) => warn!(topic = %stream.topic, error = %format!("{e:#}"), "could not claim pending entries"),
    }
    match stream.read(&reader, "0", None).await {
        Ok(entries) => backlog.extend(entries),
        Err(e) => warn!(topic = %stream.topic, error = %format!("{e:#}"), "could not read pending entries"),
    }
    if !backlog.is_empty() {
        info!(topic = %stream.topic, count = backlog.len(), "redelivering pending entries");
    }

    let mut open = forward(backlog, &tx, &acks).await;
    while open {
        match stream.read(&reader, ">", Some(BLOCK_MS)).await {
            Ok(entries) => open = forward(entries, &tx, &acks).await,
            Err(e) => {
                warn!(topic = %stream.topic, error = %format!("{e:#}"), "stream read failed; retrying");
                tokio::time::sleep(RETRY_DELAY).await;
                open = !tx.is_closed();
            }
        }
    }
    let _ = reader.quit().await;
    debug!(topic = %stream.topic, "subscription closed");
}

async fn acknowledge(pool: Pool, stream: Arc<StreamGroup>, mut acks: mpsc::UnboundedReceiver<String>) {
    while let Some(id) = acks.recv().await {
        let acked: Result<i64, _> = pool
            .xack(stream.topic.as_str(), stream.identity.group.as_str(), id.as_str())
            .await;
        if let Err(e) = acked {
            warn!(topic = %stream.topic, %id, error = %e, "XACK failed; entry stays pending");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, fields: &[(&str, &str)]) -> StreamEntry {
        let fields = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        (id.to_string(), fields)
    }

    #[test]
    fn entry_payload_becomes_delivery_acked_by_id() {
        let (acks, mut acked) = mpsc::unbounded_channel();
        let mut delivery = entry_delivery(
            entry("1700000000000-0", &[("msgId", "MsgHeaderId-1"), ("payload", "{}")]),
            &acks,
        )
        .unwrap();

        assert_eq!(delivery.data, "{}");
        assert!(acked.try_recv().is_err());
        delivery.ack();
        assert_eq!(acked.try_recv().unwrap(), "1700000000000-0");
    }

    #[test]
    fn entry_without_payload_is_acked_and_skipped() {
        let (acks, mut acked) = mpsc::unbounded_channel();
        assert!(entry_delivery(entry("5-0", &[("msgId", "MsgHeaderId-1")]), &acks).is_none());
        assert_eq!(acked.try_recv().unwrap(), "5-0");
    }

    #[tokio::test]
    async fn forward_stops_once_the_receiver_is_gone() {
        let (tx, rx) = mpsc::channel(4);
        let (acks, _acked) = mpsc::unbounded_channel();
        drop(rx);
        let open = forward(vec![entry("1-0", &[("payload", "{}")])], &tx, &acks).await;
        assert!(!open);
    }
}
