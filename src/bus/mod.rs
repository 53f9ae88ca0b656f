//! Message bus: outbound change events and inbound webhook events.
//!
//! Delivery is at-least-once in both directions.  Every publish carries a
//! fresh deduplication key; consumers are expected to drop repeats.  An
//! inbound message stays pending on the transport until its [`Delivery`] is
//! acknowledged.

pub mod keydb;
#[cfg(test)]
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use keydb::{ConsumerIdentity, KeyDbBus};

/// Prefix of every generated deduplication key.
pub const DEDUP_KEY_PREFIX: &str = "MsgHeaderId-";

/// A fresh deduplication key for one publish call.
pub fn new_dedup_key() -> String {
    format!("{DEDUP_KEY_PREFIX}{}", uuid::Uuid::new_v4())
}

/// Wire form of a published message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub msg_id: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: serde_json::Value, dedup_key: &str) -> Result<()>;
}

/// One message taken off an inbound topic.
#[derive(Debug)]
pub struct Delivery {
    pub data: String,
    acker: Option<Acker>,
}

/// Reports the transport id of a delivery once it is acknowledged.
#[derive(Debug)]
struct Acker {
    id: String,
    acks: mpsc::UnboundedSender<String>,
}

impl Delivery {
    /// A delivery with nothing to acknowledge.
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            acker: None,
        }
    }

    /// A delivery whose acknowledgement sends `id` on `acks`.
    pub fn pending(
        data: impl Into<String>,
        id: impl Into<String>,
        acks: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            data: data.into(),
            acker: Some(Acker {
                id: id.into(),
                acks,
            }),
        }
    }

    /// A delivery whose acknowledgement is reported on the returned channel.
    #[cfg(test)]
    pub fn with_ack(data: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::pending(data, "1-0", tx), rx)
    }

    /// Acknowledge receipt.  Idempotent.
    pub fn ack(&mut self) {
        if let Some(acker) = self.acker.take() {
            let _ = acker.acks.send(acker.id);
        }
    }
}

/// Source of inbound deliveries for one topic.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Delivery>>;
}
