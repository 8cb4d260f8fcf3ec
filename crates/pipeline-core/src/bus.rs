//! Publish/subscribe bus contract and an in-process implementation
//!
//! Real deployments put a broker behind [`MessageBus`]; the pipeline assumes
//! at-least-once delivery with ordering per key and nothing across keys.

use crate::error::BusError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use video_pipeline_common::DataKind;

/// One message as seen by a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub key: String,
    pub bytes: Vec<u8>,
}

/// Stream of messages from one or more channels, ordered per key
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    /// Create a subscription fed by the returned sender
    #[must_use]
    pub fn channel() -> (mpsc::UnboundedSender<BusMessage>, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (sender, Self { receiver })
    }

    /// Next message, or `None` once the bus side has gone away
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }
}

/// Message bus contract
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Largest message the bus accepts, in bytes
    fn max_message_bytes(&self) -> usize;

    /// Publish `bytes` on `channel`, partitioned by `key`
    async fn publish(&self, channel: &str, key: &str, bytes: Vec<u8>) -> Result<(), BusError>;

    /// Subscribe to the union of `channels`
    async fn subscribe(&self, channels: &[&str]) -> Result<Subscription, BusError>;
}

fn check_channel(channel: &str) -> Result<(), BusError> {
    DataKind::from_channel(channel)
        .map(|_| ())
        .map_err(|_| BusError::UnknownChannel(channel.to_string()))
}

/// In-process bus backed by tokio channels.
///
/// Every subscription to a channel sees every message on it, in publish
/// order. Accepted messages are also kept in a log for inspection.
pub struct InMemoryBus {
    max_message_bytes: usize,
    subscribers: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>>,
    published: Mutex<Vec<BusMessage>>,
    rejected: AtomicUsize,
    injected_failures: AtomicUsize,
}

impl InMemoryBus {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            max_message_bytes,
            subscribers: RwLock::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
            rejected: AtomicUsize::new(0),
            injected_failures: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` publishes fail with a transient error
    pub fn inject_transient_failures(&self, count: usize) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Every accepted message, in publish order
    #[must_use]
    pub fn published(&self) -> Vec<BusMessage> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Accepted messages on one channel
    #[must_use]
    pub fn published_on(&self, channel: &str) -> Vec<BusMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.channel == channel)
            .collect()
    }

    /// Number of publishes refused for exceeding the size limit
    #[must_use]
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    async fn publish(&self, channel: &str, key: &str, bytes: Vec<u8>) -> Result<(), BusError> {
        check_channel(channel)?;

        if bytes.len() > self.max_message_bytes {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(BusError::SizeLimitExceeded {
                size: bytes.len(),
                limit: self.max_message_bytes,
            });
        }
        if self.take_injected_failure() {
            return Err(BusError::Transient(format!("injected failure on {channel}")));
        }

        let message = BusMessage {
            channel: channel.to_string(),
            key: key.to_string(),
            bytes,
        };
        trace!(channel, key, bytes = message.bytes.len(), "Publishing message");

        {
            let mut subscribers = self
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(senders) = subscribers.get_mut(channel) {
                senders.retain(|sender| sender.send(message.clone()).is_ok());
            }
        }

        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<Subscription, BusError> {
        for channel in channels {
            check_channel(channel)?;
        }

        let (sender, subscription) = Subscription::channel();
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for channel in channels {
            subscribers
                .entry((*channel).to_string())
                .or_default()
                .push(sender.clone());
        }

        debug!(?channels, "New subscription");
        Ok(subscription)
    }
}
