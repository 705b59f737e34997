use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

use crate::channel::prepend_org_id;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("publish to `{channel}` failed: {reason}")]
pub struct PublishError {
    pub channel: String,
    pub reason: String,
}

/// Delivers payloads to connections subscribed to an org's channel on this
/// node. Cluster transports implement this to fan out further.
#[async_trait]
pub trait LocalPublisher: Send + Sync + Debug {
    async fn publish(&self, org_id: i64, channel: &str, data: Vec<u8>) -> Result<(), PublishError>;
}

pub type SharedPublisher = Arc<dyn LocalPublisher>;

const CHANNEL_CAPACITY: usize = 1024;

/// In-process fan-out on `tokio::sync::broadcast`, keyed by the
/// org-qualified channel.
#[derive(Debug, Default)]
pub struct BroadcastHub {
    senders: DashMap<String, broadcast::Sender<Vec<u8>>>,
}

impl BroadcastHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self, org_id: i64, channel: &str) -> broadcast::Receiver<Vec<u8>> {
        self.senders
            .entry(prepend_org_id(org_id, channel))
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, org_id: i64, channel: &str) -> usize {
        self.senders
            .get(&prepend_org_id(org_id, channel))
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.senders.len()
    }
}

#[async_trait]
impl LocalPublisher for BroadcastHub {
    async fn publish(&self, org_id: i64, channel: &str, data: Vec<u8>) -> Result<(), PublishError> {
        let key = prepend_org_id(org_id, channel);
        let delivered = match self.senders.get(&key) {
            // a send error only means nobody is listening right now
            Some(sender) => sender.send(data).unwrap_or(0),
            None => {
                trace!(channel = %key, "no subscribers");
                return Ok(());
            }
        };
        if delivered == 0 {
            // re-checked under the shard lock so a concurrent subscribe keeps its sender
            self.senders.remove_if(&key, |_, s| s.receiver_count() == 0);
        }
        trace!(channel = %key, delivered, "published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_subscribers_of_the_same_org_only() {
        let hub = BroadcastHub::new();
        let mut org1 = hub.subscribe(1, "stream/a/b");
        let mut org2 = hub.subscribe(2, "stream/a/b");

        hub.publish(1, "stream/a/b", b"hello".to_vec()).await.unwrap();

        assert_eq!(org1.recv().await.unwrap(), b"hello".to_vec());
        assert!(org2.try_recv().is_err());
        assert_eq!(hub.subscriber_count(1, "stream/a/b"), 1);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_not_an_error() {
        let hub = BroadcastHub::new();
        hub.publish(1, "stream/none", vec![1]).await.unwrap();
        let rx = hub.subscribe(1, "stream/none");
        drop(rx);
        hub.publish(1, "stream/none", vec![2]).await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_channels_are_pruned_on_publish() {
        let hub = BroadcastHub::new();
        let kept = hub.subscribe(1, "stream/a/kept");
        drop(hub.subscribe(1, "stream/a/gone"));
        assert_eq!(hub.channel_count(), 2);

        hub.publish(1, "stream/a/gone", vec![1]).await.unwrap();
        hub.publish(1, "stream/a/kept", vec![1]).await.unwrap();

        assert_eq!(hub.channel_count(), 1);
        assert_eq!(hub.subscriber_count(1, "stream/a/kept"), 1);
        drop(kept);
    }
}
