//! Position token attached to every record.
//!
//! A position is a small JSON document. `subscriptionName` lets a restarted source resume the
//! same broker cursor; `messageId` lets an acknowledgment find the exact message to confirm.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

use crate::{broker::MessageId, error::PositionError};

/// Decoded form of the opaque position bytes handed to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub subscription_name: String,
    /// Base64 of the broker message id bytes. Absent in positions that only carry a cursor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl Position {
    /// A position that only names the subscription.
    pub fn new(subscription_name: impl Into<String>) -> Self {
        Self {
            subscription_name: subscription_name.into(),
            message_id: None,
        }
    }

    /// A position for a specific message delivered under `subscription_name`.
    pub fn for_message<I: MessageId>(subscription_name: impl Into<String>, id: &I) -> Self {
        Self {
            subscription_name: subscription_name.into(),
            message_id: Some(STANDARD.encode(id.to_bytes())),
        }
    }

    /// Serialize to the JSON bytes carried by a record.
    ///
    /// # Panics
    ///
    /// Never in practice: both fields are plain strings, which JSON always represents.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("a position of plain strings always serializes to JSON")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PositionError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Rebuild the broker message id embedded in this position.
    pub fn message_id<I: MessageId>(&self) -> Result<I, PositionError> {
        let encoded = self
            .message_id
            .as_deref()
            .ok_or(PositionError::MissingMessageId)?;
        let bytes = STANDARD.decode(encoded)?;
        I::from_bytes(&bytes).map_err(PositionError::MessageId)
    }
}
