//! Error taxonomy for the usage engine.

use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UsageError {
    /// Malformed caller input. Nothing was read or written.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A properties blob could not be encoded or decoded.
    #[error("Serialization error for event {event_id}: {source}")]
    Serialization {
        event_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Connection or query execution failure, wrapped with query context.
    #[error("Database error: {0:#}")]
    Database(anyhow::Error),

    #[error("Configuration error: {0}")]
    Config(anyhow::Error),
}

impl UsageError {
    pub fn validation(message: impl Into<String>) -> Self {
        UsageError::Validation(message.into())
    }

    pub fn serialization(event_id: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        UsageError::Serialization {
            event_id: event_id.into(),
            source: source.into(),
        }
    }

    /// Wrap a storage failure with a description of the operation that failed.
    pub fn database(context: impl std::fmt::Display, err: impl Into<anyhow::Error>) -> Self {
        UsageError::Database(err.into().context(context.to_string()))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, UsageError::Validation(_))
    }

    /// Storage failures may be retried by the caller; reads tolerate retry and
    /// writes are corrected via sign rather than mutated in place.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UsageError::Database(_))
    }

    /// Label used by the error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            UsageError::Validation(_) => "validation",
            UsageError::Serialization { .. } => "serialization",
            UsageError::Database(_) => "database",
            UsageError::Config(_) => "config",
        }
    }
}

impl From<UsageError> for AppError {
    fn from(err: UsageError) -> Self {
        match err {
            UsageError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            UsageError::Serialization { event_id, source } => AppError::SerializationError(
                source.context(format!("properties of event {}", event_id)),
            ),
            UsageError::Database(err) => AppError::DatabaseError(err),
            UsageError::Config(err) => AppError::ConfigError(err),
        }
    }
}

impl From<AppError> for UsageError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::ConfigError(err) => UsageError::Config(err),
            AppError::DatabaseError(err) => UsageError::Database(err),
            AppError::BadRequest(err) => UsageError::Validation(err.to_string()),
            other => UsageError::Config(anyhow::anyhow!(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_errors_keep_context() {
        let err = UsageError::database(
            "aggregate feature_usage for feature feat_1",
            anyhow::anyhow!("connection refused"),
        );
        let message = err.to_string();
        assert!(message.contains("feat_1"), "{}", message);
        assert!(message.contains("connection refused"), "{}", message);
        assert!(err.is_retryable());
        assert!(!err.is_validation());
    }

    #[test]
    fn validation_maps_to_bad_request() {
        let app: AppError = UsageError::validation("invalid group_by value").into();
        assert!(matches!(app, AppError::BadRequest(_)));
    }
}
