// Publish/subscribe notification transport
//
// At-least-once, unordered across publishers. Heartbeats, generation changes and
// size updates all travel over a `Notifier` as JSON payloads.

pub mod memory;
pub mod nats;

pub use memory::InMemoryNotifier;
pub use nats::{NatsClient, NatsConfig, NatsNotifier};

use crate::errors::TransportError;
use crate::models::{FeedId, Generation, GenerationChange};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Topic names for per-feed notifications
pub mod topics {
    use crate::models::FeedId;

    /// Writer heartbeats for a feed
    pub fn heartbeats(feed: &FeedId) -> String {
        format!("feeds.{}.heartbeats", feed)
    }

    /// Aggregated size updates for a feed
    pub fn size_updates(feed: &FeedId) -> String {
        format!("feeds.{}.size", feed)
    }

    /// Truncation announcements for a feed
    pub fn generations(feed: &FeedId) -> String {
        format!("feeds.{}.generation", feed)
    }
}

/// Live subscription to a topic; unsubscribes when dropped
pub struct Subscription {
    topic: String,
    messages: BoxStream<'static, Vec<u8>>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, messages: BoxStream<'static, Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            messages,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Stream for Subscription {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.messages.as_mut().poll_next(cx)
    }
}

/// Generic publish/subscribe capability
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publish a raw payload to a topic
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Subscribe to a topic
    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError>;
}

/// Serialize `message` as JSON and publish it
pub async fn publish_json<T>(
    notifier: &dyn Notifier,
    topic: &str,
    message: &T,
) -> Result<(), TransportError>
where
    T: Serialize + Sync,
{
    let payload = serde_json::to_vec(message).map_err(|e| {
        TransportError::SerializationFailed(format!("Failed to serialize message: {}", e))
    })?;
    notifier.publish(topic, payload).await
}

/// Decode a JSON payload received from a subscription
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, TransportError> {
    serde_json::from_slice(payload).map_err(TransportError::from)
}

/// Announce that `feed` was truncated and is now at `generation`
pub async fn announce_generation(
    notifier: &dyn Notifier,
    feed: &FeedId,
    generation: Generation,
) -> Result<(), TransportError> {
    let change = GenerationChange {
        feed: feed.clone(),
        generation,
        timestamp: Utc::now(),
    };
    publish_json(notifier, &topics::generations(feed), &change).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Heartbeat, HeartbeatKind};

    #[test]
    fn test_topic_names() {
        let feed = FeedId::new("purchases").unwrap();
        assert_eq!(topics::heartbeats(&feed), "feeds.purchases.heartbeats");
        assert_eq!(topics::size_updates(&feed), "feeds.purchases.size");
        assert_eq!(topics::generations(&feed), "feeds.purchases.generation");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result: Result<Heartbeat, _> = decode(b"not json");
        assert!(matches!(
            result,
            Err(TransportError::DeserializationFailed(_))
        ));
    }

    #[test]
    fn test_decode_heartbeat() {
        let feed = FeedId::new("purchases").unwrap();
        let payload = serde_json::to_vec(&Heartbeat::init(7, feed, 2048)).unwrap();
        let heartbeat: Heartbeat = decode(&payload).unwrap();
        assert_eq!(heartbeat.kind, HeartbeatKind::Init);
        assert_eq!(heartbeat.absolute_size, 2048);
    }
}
