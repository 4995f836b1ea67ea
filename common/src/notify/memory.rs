// In-process notifier backed by tokio broadcast channels

use crate::errors::TransportError;
use crate::notify::{Notifier, Subscription};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

/// Notifier for single-process deployments and tests
///
/// Messages published while a topic has no subscriber are dropped.
pub struct InMemoryNotifier {
    topics: RwLock<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    capacity: usize,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Number of live subscribers on a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .map_or(0, |sender| sender.receiver_count())
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemoryNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let sender = self
            .topics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .cloned();

        match sender {
            Some(sender) => {
                if sender.send(payload).is_err() {
                    debug!(topic = %topic, "No subscribers, message dropped");
                }
            }
            None => debug!(topic = %topic, "Unknown topic, message dropped"),
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        let receiver = self.sender(topic).subscribe();
        let name = topic.to_string();
        let messages = BroadcastStream::new(receiver)
            .filter_map(move |message| {
                let name = name.clone();
                async move {
                    match message {
                        Ok(payload) => Some(payload),
                        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                            warn!(topic = %name, skipped, "Subscriber lagged, messages skipped");
                            None
                        }
                    }
                }
            })
            .boxed();

        Ok(Subscription::new(topic, messages))
    }
}
