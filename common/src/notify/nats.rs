// NATS transport: core pub/sub for notifications, JetStream for launch requests

use crate::errors::TransportError;
use crate::notify::{Notifier, Subscription};
use async_nats::jetstream::{
    stream::{Config as StreamConfig, RetentionPolicy, Stream},
    Context as JetStreamContext,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// NATS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL (e.g., "nats://localhost:4222")
    pub url: String,
    /// JetStream stream holding launch requests
    pub launch_stream: String,
    /// Subject filter of the launch stream
    pub launch_subject: String,
    /// Maximum age for launch requests in the stream (in seconds)
    pub max_age_seconds: u64,
    /// Maximum number of launch requests to retain
    pub max_messages: i64,
    /// Deduplication window for repeated launch requests (in seconds)
    pub duplicate_window_seconds: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            launch_stream: "PROGRAM_LAUNCHES".to_string(),
            launch_subject: "launch.>".to_string(),
            max_age_seconds: 86400, // 24 hours
            max_messages: 1_000_000,
            duplicate_window_seconds: 120,
        }
    }
}

/// NATS client with its JetStream context
#[derive(Clone)]
pub struct NatsClient {
    client: async_nats::Client,
    jetstream: JetStreamContext,
    config: NatsConfig,
}

impl NatsClient {
    /// Create a NatsClient from an existing async_nats::Client
    pub fn from_client(client: async_nats::Client, config: NatsConfig) -> Self {
        let jetstream = async_nats::jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            config,
        }
    }

    /// Create a new NATS client and connect to the server
    #[instrument(skip(config), fields(url = %config.url))]
    pub async fn new(config: NatsConfig) -> Result<Self, TransportError> {
        info!("Connecting to NATS server");

        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to connect to NATS: {}", e)))?;

        info!("Connected to NATS server successfully");

        Ok(Self::from_client(client, config))
    }

    /// Initialize the launch request stream
    #[instrument(skip(self))]
    pub async fn initialize_stream(&self) -> Result<Stream, TransportError> {
        info!(
            stream_name = %self.config.launch_stream,
            "Initializing JetStream stream"
        );

        let stream_config = StreamConfig {
            name: self.config.launch_stream.clone(),
            subjects: vec![self.config.launch_subject.clone()],
            retention: RetentionPolicy::WorkQueue,
            max_age: Duration::from_secs(self.config.max_age_seconds),
            max_messages: self.config.max_messages,
            duplicate_window: Duration::from_secs(self.config.duplicate_window_seconds),
            ..Default::default()
        };

        let stream = self
            .jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| {
                TransportError::StreamCreation(format!("Failed to create stream: {}", e))
            })?;

        info!(
            stream_name = %self.config.launch_stream,
            "Stream initialized successfully"
        );

        Ok(stream)
    }

    /// Get the JetStream context for publishing
    pub fn jetstream(&self) -> &JetStreamContext {
        &self.jetstream
    }

    /// Get the NATS client
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    /// Get the configuration
    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

/// Notifier over core NATS subjects
pub struct NatsNotifier {
    client: async_nats::Client,
}

impl NatsNotifier {
    pub fn new(client: &NatsClient) -> Self {
        Self {
            client: client.client().clone(),
        }
    }
}

#[async_trait]
impl Notifier for NatsNotifier {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(topic.to_string(), payload.into())
            .await
            .map_err(|e| TransportError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        debug!(topic = %topic, "Notification published");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        let subscriber = self
            .client
            .subscribe(topic.to_string())
            .await
            .map_err(|e| TransportError::SubscribeFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        info!(topic = %topic, "Subscribed to NATS subject");

        let messages = subscriber
            .map(|message| message.payload.to_vec())
            .boxed();
        Ok(Subscription::new(topic, messages))
    }
}
