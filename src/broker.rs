//! This module provides the traits the source uses to talk to a Pulsar broker client.
//!
//! The source never owns a wire protocol. It connects through a [`Connector`], subscribes
//! through the resulting [`Client`] and pulls from the [`Consumer`] it gets back.

use std::{fmt, future::Future, path::PathBuf, str::FromStr, time::Duration, time::SystemTime};

use crate::error::ConfigError;

/// How the broker distributes messages between consumers of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SubscriptionType {
    /// Only one consumer may attach to the subscription.
    #[default]
    Exclusive,
    /// Messages are distributed round-robin across consumers.
    Shared,
    /// One active consumer, the others take over on failure.
    Failover,
    /// Messages with the same key always go to the same consumer.
    KeyShared,
}

impl SubscriptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionType::Exclusive => "exclusive",
            SubscriptionType::Shared => "shared",
            SubscriptionType::Failover => "failover",
            SubscriptionType::KeyShared => "key_shared",
        }
    }
}

impl fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exclusive" => Ok(SubscriptionType::Exclusive),
            "shared" => Ok(SubscriptionType::Shared),
            "failover" => Ok(SubscriptionType::Failover),
            "key_shared" | "keyshared" | "key-shared" => Ok(SubscriptionType::KeyShared),
            _ => Err(ConfigError::Invalid {
                key: "subscriptionType",
                value: s.to_string(),
                reason: "expected one of exclusive, shared, failover, key_shared".to_string(),
            }),
        }
    }
}

/// Options used to create a broker client.
///
/// Values are forwarded verbatim from [`SourceConfig`](crate::SourceConfig); `None` means the
/// client keeps its own default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientOptions {
    pub url: String,
    pub connection_timeout: Option<Duration>,
    pub operation_timeout: Option<Duration>,
    pub max_connections_per_broker: Option<u32>,
    pub memory_limit_bytes: Option<u64>,
    pub enable_transaction: bool,
    pub tls_certificate_file: Option<PathBuf>,
    pub tls_key_file_path: Option<PathBuf>,
    pub tls_trust_certs_file_path: Option<PathBuf>,
    pub tls_allow_insecure_connection: bool,
    pub tls_validate_hostname: bool,
    /// Silence the client's own logging for this client only.
    pub disable_logging: bool,
}

/// Options used to subscribe to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub topic: String,
    pub subscription_name: String,
    pub subscription_type: SubscriptionType,
}

/// Broker-assigned identifier of a message.
///
/// The [`Display`](fmt::Display) form is used as the key of the pending set, so two ids must
/// render the same string if and only if they name the same message.
pub trait MessageId: fmt::Display + Clone + Send + Sync + 'static {
    /// Serialize the id so it can be embedded in a position.
    fn to_bytes(&self) -> Vec<u8>;

    /// Rebuild an id from the bytes produced by [`MessageId::to_bytes`].
    fn from_bytes(bytes: &[u8]) -> Result<Self, String>;
}

/// A message received from the broker.
pub trait Message: Send + Sync + 'static {
    type Id: MessageId;

    fn id(&self) -> Self::Id;

    fn topic(&self) -> &str;

    /// Event time set by the producer, if any.
    fn event_time(&self) -> Option<SystemTime>;

    /// Time the broker accepted the message.
    fn publish_time(&self) -> SystemTime;

    fn key(&self) -> &[u8];

    fn payload(&self) -> &[u8];
}

/// A subscription handle that yields messages and accepts acknowledgments.
///
/// Implement this trait to plug a broker client into the source. Retries on network faults,
/// if any, belong in the implementation; the source surfaces every error it gets.
pub trait Consumer: Send + Sync + 'static {
    /// The error that can be returned by the Consumer
    type Error: std::error::Error + Send + Sync + 'static;
    /// The message type yielded by [`Consumer::receive`]
    type Message: Message;

    /// Receive the next message, waiting until one is available.
    ///
    /// The source drops this future when the read is cancelled, so implementations must not
    /// lose a message they have not yet returned.
    fn receive(&self) -> impl Future<Output = Result<Self::Message, Self::Error>> + Send;

    /// Acknowledge a message by its id.
    ///
    /// # Parameters
    ///
    /// * `id` - The broker-assigned id of the message to confirm
    ///
    /// # Returns
    ///
    /// * `Ok(())` - The broker accepted the acknowledgment
    /// * `Err(Self::Error)` - The broker rejected it or could not be reached
    fn acknowledge(
        &self,
        id: &<Self::Message as Message>::Id,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Detach from the subscription.
    fn close(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// A connected broker client.
pub trait Client: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;
    type Consumer: Consumer;

    /// Subscribe to a topic under the given subscription.
    fn subscribe(
        &self,
        options: SubscribeOptions,
    ) -> impl Future<Output = Result<Self::Consumer, Self::Error>> + Send;

    /// Release the connection. Best effort.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Factory for broker clients.
pub trait Connector: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;
    type Client: Client;

    /// Create a client connected to the broker described by `options`.
    fn connect(
        &self,
        options: &ClientOptions,
    ) -> impl Future<Output = Result<Self::Client, Self::Error>> + Send;
}
