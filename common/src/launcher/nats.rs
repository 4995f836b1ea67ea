// Launch requests published to NATS JetStream

use crate::errors::{LaunchError, TransportError};
use crate::launcher::{
    ProgramLauncher, OPTION_FEED_GENERATION, OPTION_FEED_TOTAL_SIZE, OPTION_SCHEDULE_NAME,
};
use crate::models::{LaunchOptions, ProgramId, ProgramType};
use crate::notify::NatsClient;
use async_nats::jetstream::context::PublishAckFuture;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Message consumed by the program execution engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub launch_id: Uuid,
    pub program: ProgramId,
    pub program_type: ProgramType,
    pub options: LaunchOptions,
    pub requested_at: DateTime<Utc>,
}

impl LaunchRequest {
    pub fn new(program: &ProgramId, program_type: ProgramType, options: &LaunchOptions) -> Self {
        Self {
            launch_id: Uuid::new_v4(),
            program: program.clone(),
            program_type,
            options: options.clone(),
            requested_at: Utc::now(),
        }
    }

    /// Deduplication key: one launch per schedule, generation and total size
    ///
    /// Falls back to the launch id for requests that did not come from a
    /// data-volume trigger.
    pub fn idempotency_key(&self) -> String {
        match (
            self.options.get(OPTION_SCHEDULE_NAME),
            self.options.get(OPTION_FEED_GENERATION),
            self.options.get(OPTION_FEED_TOTAL_SIZE),
        ) {
            (Some(name), Some(generation), Some(total)) => format!(
                "{}.{}:{}:{}:{}",
                self.program, self.program_type, name, generation, total
            ),
            _ => self.launch_id.to_string(),
        }
    }
}

/// Launcher that enqueues `LaunchRequest`s on the launch stream
pub struct NatsProgramLauncher {
    client: NatsClient,
    subject_prefix: String,
    publish_timeout: Duration,
}

impl NatsProgramLauncher {
    pub fn new(client: NatsClient) -> Self {
        let subject_prefix = client
            .config()
            .launch_subject
            .trim_end_matches(".>")
            .trim_end_matches(".*")
            .to_string();
        Self {
            client,
            subject_prefix,
            publish_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    fn subject(&self, program: &ProgramId, program_type: ProgramType) -> String {
        format!(
            "{}.{}.{}.{}",
            self.subject_prefix, program.application, program.program, program_type
        )
    }
}

#[async_trait]
impl ProgramLauncher for NatsProgramLauncher {
    #[instrument(skip(self, options), fields(program = %program, program_type = %program_type))]
    async fn launch(
        &self,
        program: &ProgramId,
        program_type: ProgramType,
        options: &LaunchOptions,
    ) -> Result<(), LaunchError> {
        let request = LaunchRequest::new(program, program_type, options);
        let payload = serde_json::to_vec(&request)
            .map_err(|e| TransportError::SerializationFailed(e.to_string()))?;
        let subject = self.subject(program, program_type);
        let idempotency_key = request.idempotency_key();

        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", idempotency_key.as_str());
        headers.insert("Launch-Id", request.launch_id.to_string().as_str());

        let ack: PublishAckFuture = self
            .client
            .jetstream()
            .publish_with_headers(subject.clone(), headers, payload.into())
            .await
            .map_err(|e| TransportError::PublishFailed {
                topic: subject.clone(),
                reason: e.to_string(),
            })?;

        match tokio::time::timeout(self.publish_timeout, ack).await {
            Ok(Ok(ack)) => {
                if ack.duplicate {
                    info!(idempotency_key = %idempotency_key, "Duplicate launch request ignored by stream");
                } else {
                    info!(subject = %subject, launch_id = %request.launch_id, "Launch request published");
                }
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::PublishFailed {
                topic: subject,
                reason: format!("no acknowledgment: {}", e),
            }
            .into()),
            Err(_) => Err(TransportError::Timeout(format!(
                "launch acknowledgment after {:?}",
                self.publish_timeout
            ))
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::OPTION_FEED;
    use crate::notify::NatsConfig;

    fn trigger_options() -> LaunchOptions {
        let mut options = LaunchOptions::new();
        options.insert(OPTION_SCHEDULE_NAME.to_string(), "every_mb".to_string());
        options.insert(OPTION_FEED.to_string(), "events".to_string());
        options.insert(OPTION_FEED_GENERATION.to_string(), "2".to_string());
        options.insert(OPTION_FEED_TOTAL_SIZE.to_string(), "2048".to_string());
        options
    }

    #[test]
    fn test_idempotency_key_is_stable_per_trigger() {
        let program = ProgramId::new("app", "flow");
        let first = LaunchRequest::new(&program, ProgramType::Workflow, &trigger_options());
        let second = LaunchRequest::new(&program, ProgramType::Workflow, &trigger_options());

        assert_ne!(first.launch_id, second.launch_id);
        assert_eq!(first.idempotency_key(), second.idempotency_key());
        assert_eq!(first.idempotency_key(), "app.flow.workflow:every_mb:2:2048");
    }

    #[test]
    fn test_idempotency_key_falls_back_to_launch_id() {
        let request = LaunchRequest::new(
            &ProgramId::new("app", "flow"),
            ProgramType::Spark,
            &LaunchOptions::new(),
        );
        assert_eq!(request.idempotency_key(), request.launch_id.to_string());
    }

    #[test]
    fn test_launch_request_serialization() {
        let request = LaunchRequest::new(
            &ProgramId::new("app", "flow"),
            ProgramType::MapReduce,
            &trigger_options(),
        );
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"program_type\":\"map_reduce\""));
        let back: LaunchRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
    }

    #[tokio::test]
    #[ignore] // Requires NATS with JetStream
    async fn test_launch_publishes_to_stream() {
        let client = NatsClient::new(NatsConfig::default()).await.unwrap();
        client.initialize_stream().await.unwrap();
        let launcher = NatsProgramLauncher::new(client);

        let result = launcher
            .launch(
                &ProgramId::new("it", "flow"),
                ProgramType::Workflow,
                &trigger_options(),
            )
            .await;
        assert!(result.is_ok());
    }
}
