//! The message broker used to carry cross-node bridge requests (spec §6,
//! topics `bridge.request` / `bridge.response`).
//!
//! Like the KV store, the broker's real implementation is an external
//! collaborator assumed reliable at-least-once (per the Non-goals — no
//! clustering consensus is modeled here). This crate defines the `Broker`
//! seam and an in-memory implementation for tests and single-process
//! multi-node simulation.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker is closed")]
    Closed,
    #[error("backend error: {0}")]
    Backend(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> BrokerResult<()>;
    async fn subscribe(&self, topic: &str) -> BrokerResult<BrokerSubscription>;
}

/// A live subscription to a topic. Drop to unsubscribe.
pub struct BrokerSubscription {
    topic: String,
    rx: broadcast::Receiver<Vec<u8>>,
}

impl BrokerSubscription {
    /// Await the next message on this topic, transparently skipping past
    /// any messages dropped due to slow-consumer lag (the broker is only
    /// assumed reliable at-least-once, not lossless to a lagging reader).
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "broker subscriber lagged, messages dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

const CHANNEL_CAPACITY: usize = 1024;

/// In-memory broker backed by one `tokio::sync::broadcast` channel per
/// topic. Suitable for tests and for simulating a multi-node deployment
/// within a single process.
#[derive(Default)]
pub struct MemoryBroker {
    topics: DashMap<String, broadcast::Sender<Vec<u8>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> BrokerResult<()> {
        // A send with no subscribers is not an error — at-least-once
        // delivery only applies to subscribers that exist at publish time.
        let _ = self.sender_for(topic).send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> BrokerResult<BrokerSubscription> {
        let rx = self.sender_for(topic).subscribe();
        Ok(BrokerSubscription {
            topic: topic.to_string(),
            rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_message() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("bridge.request").await.unwrap();

        broker
            .publish("bridge.request", b"hello".to_vec())
            .await
            .unwrap();

        assert_eq!(sub.recv().await, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn distinct_topics_are_isolated() {
        let broker = MemoryBroker::new();
        let mut req_sub = broker.subscribe("bridge.request").await.unwrap();
        let mut resp_sub = broker.subscribe("bridge.response").await.unwrap();

        broker.publish("bridge.response", b"ok".to_vec()).await.unwrap();

        assert_eq!(resp_sub.recv().await, Some(b"ok".to_vec()));
        assert!(tokio::time::timeout(std::time::Duration::from_millis(50), req_sub.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_a_copy() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("topic").await.unwrap();
        let mut b = broker.subscribe("topic").await.unwrap();

        broker.publish("topic", b"fanout".to_vec()).await.unwrap();

        assert_eq!(a.recv().await, Some(b"fanout".to_vec()));
        assert_eq!(b.recv().await, Some(b"fanout".to_vec()));
    }
}
