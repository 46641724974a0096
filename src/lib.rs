//! # Pulsar Source
//!
//! The core of a source connector that moves messages from an Apache Pulsar subscription into
//! a record pipeline that acknowledges records asynchronously and out of order.
//!
//! ## Features
//!
//! - **Generic Design**: Works with any broker client by implementing the [`Connector`], [`Client`] and [`Consumer`] traits
//! - **Precise Acknowledgment**: Every record carries a position naming its exact broker message, so acks can never be misapplied under reordering
//! - **Resumable**: Positions embed the subscription name; reopening with a position resumes the same broker cursor
//! - **Cancellable Reads**: A blocking read ends cleanly with [`Read::Cancelled`] when the pipeline shuts down
//! - **Batch Acknowledgment**: Flush many positions at once and get every failure back together
//! - **Structured Logging**: `tracing` events with subscription names and message ids
//!
//! ## Quick Start
//!
//! ```rust
//! use std::collections::HashMap;
//!
//! use pulsar_source::{Read, Source, memory::InMemoryBroker};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // 1. Plug in a broker client (here the in-memory one)
//! let broker = InMemoryBroker::new();
//! broker.publish("t1", "k1", "hello");
//!
//! // 2. Configure and open the source
//! let mut source = Source::new(broker.clone());
//! source.configure(&HashMap::from([
//!     ("url".to_string(), "pulsar://localhost:6650".to_string()),
//!     ("topic".to_string(), "t1".to_string()),
//!     ("subscriptionName".to_string(), "s1".to_string()),
//! ]))?;
//! source.open(None).await?;
//!
//! // 3. Read a record and acknowledge it once the pipeline is done with it
//! let cancel = CancellationToken::new();
//! if let Read::Record(record) = source.read(&cancel).await? {
//!     assert_eq!(record.payload, b"hello");
//!     source.ack(&record.position).await?;
//! }
//! assert_eq!(source.pending_count(), 0);
//!
//! source.teardown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **[`SourceConfig`]**: Typed configuration parsed from the pipeline's string pairs
//! - **[`Source`]**: Owns the client and subscription for one run and settles the subscription name
//! - **[`DeliveryTracker`]**: Holds the pending set and reconciles acknowledgments with broker messages
//!
//! ### How it Works
//!
//! 1. `open` decodes the resume position, checks it against the configured subscription, then connects and subscribes
//! 2. `read` waits for the next message, records it as pending and returns it as a [`Record`]
//! 3. `ack` decodes the record's position, removes the message from the pending set and acknowledges it on the broker
//! 4. `teardown` closes the consumer and the client; unacknowledged messages are redelivered on the next run
//!
//! The pending set lock is only held while the map changes, never across a broker call, so a
//! slow acknowledgment does not stall reads.

pub mod broker;
pub mod config;
pub mod error;
pub mod memory;
mod pending;
pub mod position;
pub mod record;
mod source;
mod tracker;

pub use broker::{
    Client, ClientOptions, Connector, Consumer, Message, MessageId, SubscribeOptions,
    SubscriptionType,
};
pub use config::{Parameter, ParameterType, SourceConfig, parameters};
pub use error::{AckBatchError, AckFailure, BoxError, ConfigError, PositionError, SourceError};
pub use pending::PendingSet;
pub use position::Position;
pub use record::{METADATA_CREATED_AT, METADATA_PULSAR_TOPIC, Metadata, Operation, Record};
pub use source::{Source, TrackerOf};
pub use tracker::{DeliveryTracker, MessageIdOf, Read};
