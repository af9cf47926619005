//! In-process broker.
//!
//! Every subscriber gets its own unbounded mpsc channel. Publishing fans a
//! message out to the live subscribers of a channel and reports how many
//! received it, like a Redis `PUBLISH`. A channel disappears with its last
//! subscription.

use std::sync::Arc;
use std::sync::Weak;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::transport::Result;
use crate::transport::channel::Broker;
use crate::transport::channel::Publisher;
use crate::transport::channel::Subscription;

type Subscribers = DashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>;

/// A pub/sub broker living in this process. Clones share the same channels.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    channels: Arc<Subscribers>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscribers of `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Forcibly closes `channel`: every subscriber sees end of stream.
    pub fn close_channel(&self, channel: &str) -> usize {
        self.channels.remove(channel).map(|(_, subs)| subs.len()).unwrap_or(0)
    }

    /// Channels that currently have subscribers.
    pub fn channels(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }
}

struct MemorySubscription {
    channel: String,
    channels: Weak<Subscribers>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.rx.close();
        let Some(channels) = self.channels.upgrade() else {
            return;
        };
        if let Some(mut subs) = channels.get_mut(&self.channel) {
            subs.retain(|tx| !tx.is_closed());
        }
        channels.remove_if(&self.channel, |_, subs| subs.is_empty());
    }
}

#[async_trait::async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }
}

struct MemoryPublisher {
    channels: Arc<Subscribers>,
}

#[async_trait::async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize> {
        let Some(mut subs) = self.channels.get_mut(channel) else {
            return Ok(0);
        };
        subs.retain(|tx| !tx.is_closed());
        let delivered = subs.iter().filter(|tx| tx.send(payload.clone()).is_ok()).count();
        Ok(delivered)
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.entry(channel.to_string()).or_default().push(tx);
        Ok(Box::new(MemorySubscription {
            channel: channel.to_string(),
            channels: Arc::downgrade(&self.channels),
            rx,
        }))
    }

    async fn publisher(&self) -> Result<Arc<dyn Publisher>> {
        Ok(Arc::new(MemoryPublisher {
            channels: self.channels.clone(),
        }))
    }
}
