//! Records handed to the pipeline.

use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::broker::Message;

/// Metadata key holding the topic the message was read from.
pub const METADATA_PULSAR_TOPIC: &str = "pulsar.topic";
/// Metadata key holding the creation time as Unix nanoseconds.
pub const METADATA_CREATED_AT: &str = "opencdc.createdAt";

/// Kind of change a record describes. This source only ever creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
}

/// String metadata attached to a record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn set_created_at(&mut self, at: SystemTime) {
        let nanos = at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        self.insert(METADATA_CREATED_AT, nanos.to_string());
    }

    /// Creation time, if present and well-formed.
    pub fn created_at(&self) -> Option<SystemTime> {
        let nanos: u64 = self.get(METADATA_CREATED_AT)?.parse().ok()?;
        Some(UNIX_EPOCH + std::time::Duration::from_nanos(nanos))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A single unit of data delivered to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Opaque position; hand it back to [`Source::ack`](crate::Source::ack) once processed.
    pub position: Vec<u8>,
    pub operation: Operation,
    pub metadata: Metadata,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Record {
    /// Build a create record from a broker message.
    ///
    /// The creation time is the producer's event time, or the publish time when the producer
    /// did not set one.
    pub fn from_message<M: Message>(message: &M, position: Vec<u8>) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert(METADATA_PULSAR_TOPIC, message.topic());
        metadata.set_created_at(message.event_time().unwrap_or_else(|| message.publish_time()));

        Self {
            position,
            operation: Operation::Create,
            metadata,
            key: message.key().to_vec(),
            payload: message.payload().to_vec(),
        }
    }
}
