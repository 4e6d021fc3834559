//! Commit/abort notifications
//!
//! Every applied or aborted batch publishes one bincode `Notification` on
//! the `notify.{kbid}` channel.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::Result;
use crate::model::MessageSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationAction {
    Commit,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteType {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub partition: String,
    pub seqid: i64,
    pub multi: String,
    pub uuid: String,
    pub kbid: String,
    pub action: NotificationAction,
    pub write_type: Option<WriteType>,
    pub source: MessageSource,
}

impl Notification {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

pub fn notification_channel(kbid: &str) -> String {
    format!("notify.{}", kbid)
}

/// Fire-and-forget publisher
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct Published {
    pub channel: String,
    pub payload: Bytes,
}

/// In-process pub/sub over a tokio broadcast channel
pub struct LocalPubSub {
    sender: broadcast::Sender<Published>,
}

impl LocalPubSub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive everything published from now on, on every channel
    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl PubSub for LocalPubSub {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        // No subscribers is not an error
        let receivers = self
            .sender
            .send(Published { channel: channel.to_string(), payload })
            .unwrap_or(0);
        trace!(channel, receivers, "Published");
        Ok(())
    }
}
