// Error handling framework
// Lifecycle operations fail fast with typed errors; the data path logs and recovers.

use thiserror::Error;

/// Errors surfaced by schedule lifecycle operations
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Schedule not found: {0}")]
    NotFound(String),

    #[error("Schedule already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid schedule configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("No scheduler registered for {0} schedules")]
    UnsupportedKind(String),

    #[error("Schedule store failure: {0}")]
    Store(#[from] StorageError),

    #[error("Failed to lock schedule {resource}: {reason}")]
    Lock { resource: String, reason: String },
}

/// Publish/subscribe transport errors
///
/// These never reach the ingestion or polling path; they are logged where
/// heartbeats and size updates are published.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect to transport: {0}")]
    Connection(String),

    #[error("Failed to create stream: {0}")]
    StreamCreation(String),

    #[error("Failed to publish message on {topic}: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("Failed to subscribe to {topic}: {reason}")]
    SubscribeFailed { topic: String, reason: String },

    #[error("Message serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Message deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Transport operation timeout: {0}")]
    Timeout(String),
}

/// Program launch errors
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Program {program} could not be started: {reason}")]
    Rejected { program: String, reason: String },

    #[error("Launch request could not be delivered: {0}")]
    Transport(#[from] TransportError),
}

/// Storage errors for feed storage, the schedule store and Redis
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Redis error: {0}")]
    RedisError(String),

    #[error("Filesystem error: {0}")]
    FileSystemError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate key violation: {0}")]
    DuplicateKey(String),

    #[error("Schema setup failed: {0}")]
    SchemaFailed(String),
}

/// Validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid feed id '{0}': expected 1-128 characters of [A-Za-z0-9_-]")]
    InvalidFeedId(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },
}

impl From<ValidationError> for ScheduleError {
    fn from(err: ValidationError) -> Self {
        ScheduleError::InvalidConfiguration(err.to_string())
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    match code.as_ref() {
                        "23505" => DatabaseError::DuplicateKey(db_err.message().to_string()),
                        _ => DatabaseError::QueryFailed(db_err.message().to_string()),
                    }
                } else {
                    DatabaseError::QueryFailed(db_err.message().to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::DatabaseError(err.to_string())
    }
}

impl From<DatabaseError> for StorageError {
    fn from(err: DatabaseError) -> Self {
        StorageError::DatabaseError(err.to_string())
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        StorageError::RedisError(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::FileSystemError(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::DeserializationFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = ScheduleError::NotFound("app.flow.workflow.nightly".to_string());
        assert!(err.to_string().contains("app.flow.workflow.nightly"));
    }

    #[test]
    fn test_store_error_converts_to_schedule_error() {
        let err: ScheduleError = StorageError::QueryFailed("boom".to_string()).into();
        assert!(matches!(err, ScheduleError::Store(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_validation_error_is_invalid_configuration() {
        let err: ScheduleError = ValidationError::InvalidFeedId("a b".to_string()).into();
        assert!(matches!(err, ScheduleError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_launch_error_from_transport() {
        let err: LaunchError = TransportError::Timeout("5s".to_string()).into();
        assert!(err.to_string().contains("5s"));
    }
}
