//! Error types returned by the configuration model, the position codec and the source.

use std::fmt;

/// Boxed error coming from the broker client.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A configuration value was missing or could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration key {key:?}")]
    Missing { key: &'static str },

    #[error("invalid value {value:?} for configuration key {key:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// A position could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum PositionError {
    #[error("position is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message id is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("position does not carry a message id")]
    MissingMessageId,

    #[error("message id could not be deserialized: {0}")]
    MessageId(String),
}

/// Errors surfaced by [`Source`](crate::Source) and [`DeliveryTracker`](crate::DeliveryTracker).
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to parse config: {0}")]
    Config(#[from] ConfigError),

    #[error("source has not been configured")]
    NotConfigured,

    #[error("source is not open")]
    NotOpen,

    #[error("failed to create client: {0}")]
    Connect(#[source] BoxError),

    #[error("failed to create consumer: {0}")]
    Subscribe(#[source] BoxError),

    #[error("malformed position: {0}")]
    MalformedPosition(#[from] PositionError),

    #[error(
        "the old position contains a different subscription name than the connector configuration \
         ({position:?} vs {configured:?}), please check if the configured subscription name changed \
         since the last run"
    )]
    SubscriptionMismatch { position: String, configured: String },

    #[error("failed to receive message: {0}")]
    Receive(#[source] BoxError),

    #[error("failed to acknowledge message {message_id}: {source}")]
    Ack {
        message_id: String,
        #[source]
        source: BoxError,
    },

    #[error("message not found for position: {message_id}")]
    NotFound { message_id: String },

    #[error(transparent)]
    AckBatch(#[from] AckBatchError),
}

impl SourceError {
    /// Returns `true` when the error reports an acknowledgment for a message that is not pending.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SourceError::NotFound { .. })
    }
}

/// One failed acknowledgment inside a batch.
#[derive(Debug)]
pub struct AckFailure {
    /// Index of the position in the batch (or in drain order for `acknowledge_all`).
    pub index: usize,
    pub error: SourceError,
}

/// Every acknowledgment that failed while flushing a batch.
#[derive(Debug)]
pub struct AckBatchError {
    pub failures: Vec<AckFailure>,
}

impl fmt::Display for AckBatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} acknowledgment(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; [{}] {}", failure.index, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for AckBatchError {}
