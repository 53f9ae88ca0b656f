//! Recording [`MessageBus`] for tests.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use super::MessageBus;

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: serde_json::Value,
    pub dedup_key: String,
}

#[derive(Default)]
pub struct MemoryBus {
    published: Mutex<Vec<Published>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().expect("bus poisoned").clone()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: serde_json::Value, dedup_key: &str) -> Result<()> {
        self.published.lock().expect("bus poisoned").push(Published {
            topic: topic.to_string(),
            payload,
            dedup_key: dedup_key.to_string(),
        });
        Ok(())
    }
}
