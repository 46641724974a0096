//! In-memory broker for testing and single-process scenarios.
//!
//! [`InMemoryBroker`] implements [`Connector`], [`Client`] and [`Consumer`] over per-topic
//! append-only logs. Each subscription is a named cursor with its own unacknowledged set;
//! reopening a subscription redelivers whatever was received but never acknowledged, the way a
//! real broker does after a consumer restarts.
//!
//! ## Example
//!
//! ```
//! use pulsar_source::memory::InMemoryBroker;
//!
//! let broker = InMemoryBroker::new();
//! broker.publish("t1", "k1", "hello");
//! assert_eq!(broker.topic_len("t1"), 1);
//! ```

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::SystemTime,
};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::broker::{
    Client, ClientOptions, Connector, Consumer, Message, MessageId, SubscribeOptions,
    SubscriptionType,
};

/// Id of a message in the in-memory broker: the topic's ledger and the entry in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemoryMessageId {
    pub ledger_id: u64,
    pub entry_id: u64,
}

impl MemoryMessageId {
    pub fn new(ledger_id: u64, entry_id: u64) -> Self {
        Self {
            ledger_id,
            entry_id,
        }
    }
}

impl fmt::Display for MemoryMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ledger_id, self.entry_id)
    }
}

impl MessageId for MemoryMessageId {
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&self.ledger_id.to_be_bytes());
        bytes.extend_from_slice(&self.entry_id.to_be_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        let (ledger, entry) = bytes
            .split_first_chunk::<8>()
            .ok_or_else(|| format!("expected 16 bytes, got {}", bytes.len()))?;
        let entry: [u8; 8] = entry
            .try_into()
            .map_err(|_| format!("expected 16 bytes, got {}", bytes.len()))?;
        Ok(Self::new(u64::from_be_bytes(*ledger), u64::from_be_bytes(entry)))
    }
}

/// A message stored in, and received from, the in-memory broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMessage {
    pub id: MemoryMessageId,
    pub topic: String,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
    pub event_time: Option<SystemTime>,
    pub publish_time: SystemTime,
}

impl Message for MemoryMessage {
    type Id = MemoryMessageId;

    fn id(&self) -> Self::Id {
        self.id
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn event_time(&self) -> Option<SystemTime> {
        self.event_time
    }

    fn publish_time(&self) -> SystemTime {
        self.publish_time
    }

    fn key(&self) -> &[u8] {
        &self.key
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Errors returned by the in-memory broker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("subscribe rejected: {0}")]
    SubscribeRejected(String),

    #[error("exclusive subscription {0:?} already has an active consumer")]
    ConsumerBusy(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("acknowledgment rejected: {0}")]
    AckRejected(String),

    #[error("consumer is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct Subscription {
    cursor: usize,
    unacked: BTreeSet<u64>,
    redeliver: VecDeque<u64>,
    acked: Vec<MemoryMessageId>,
    active_consumers: usize,
}

#[derive(Debug, Default)]
struct Topic {
    ledger_id: u64,
    log: Vec<MemoryMessage>,
    subscriptions: HashMap<String, Subscription>,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Topic>,
    connects: usize,
    subscribes: usize,
    closed_clients: usize,
    last_client_options: Option<ClientOptions>,
    fail_connect: Option<String>,
    fail_subscribe: Option<String>,
    fail_receives: VecDeque<String>,
    fail_acks: VecDeque<String>,
}

impl State {
    fn topic_mut(&mut self, name: &str) -> &mut Topic {
        let next_ledger = self.topics.len() as u64;
        self.topics.entry(name.to_string()).or_insert_with(|| Topic {
            ledger_id: next_ledger,
            ..Topic::default()
        })
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    published: Notify,
}

/// Thread-safe in-memory broker; clones share the same topics.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to `topic`, creating the topic if needed.
    pub fn publish(
        &self,
        topic: &str,
        key: impl Into<Vec<u8>>,
        payload: impl Into<Vec<u8>>,
    ) -> MemoryMessageId {
        self.publish_with_event_time(topic, key, payload, None)
    }

    /// Append a message carrying a producer event time.
    pub fn publish_with_event_time(
        &self,
        topic: &str,
        key: impl Into<Vec<u8>>,
        payload: impl Into<Vec<u8>>,
        event_time: Option<SystemTime>,
    ) -> MemoryMessageId {
        let id = {
            let mut state = self.shared.state.lock();
            let topic_state = state.topic_mut(topic);
            let id = MemoryMessageId::new(topic_state.ledger_id, topic_state.log.len() as u64);
            topic_state.log.push(MemoryMessage {
                id,
                topic: topic.to_string(),
                key: key.into(),
                payload: payload.into(),
                event_time,
                publish_time: SystemTime::now(),
            });
            id
        };
        self.shared.published.notify_waiters();
        id
    }

    /// Number of messages ever published to `topic`.
    pub fn topic_len(&self, topic: &str) -> usize {
        self.shared
            .state
            .lock()
            .topics
            .get(topic)
            .map_or(0, |t| t.log.len())
    }

    /// Subscription names that exist on `topic`, sorted.
    pub fn subscriptions(&self, topic: &str) -> Vec<String> {
        let state = self.shared.state.lock();
        let mut names: Vec<_> = state
            .topics
            .get(topic)
            .map(|t| t.subscriptions.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Ids acknowledged on a subscription, in acknowledgment order.
    pub fn acknowledged(&self, topic: &str, subscription: &str) -> Vec<MemoryMessageId> {
        self.with_subscription(topic, subscription, |_, s| s.acked.clone())
            .unwrap_or_default()
    }

    /// Ids received on a subscription and not yet acknowledged.
    pub fn unacknowledged(&self, topic: &str, subscription: &str) -> Vec<MemoryMessageId> {
        self.with_subscription(topic, subscription, |t, s| {
            s.unacked
                .iter()
                .map(|entry| MemoryMessageId::new(t.ledger_id, *entry))
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn connect_count(&self) -> usize {
        self.shared.state.lock().connects
    }

    pub fn subscribe_count(&self) -> usize {
        self.shared.state.lock().subscribes
    }

    pub fn closed_clients(&self) -> usize {
        self.shared.state.lock().closed_clients
    }

    /// Options passed to the most recent `connect`.
    pub fn last_client_options(&self) -> Option<ClientOptions> {
        self.shared.state.lock().last_client_options.clone()
    }

    /// Make every following `connect` fail with `reason`.
    pub fn fail_connect(&self, reason: impl Into<String>) {
        self.shared.state.lock().fail_connect = Some(reason.into());
    }

    /// Make every following `subscribe` fail with `reason`.
    pub fn fail_subscribe(&self, reason: impl Into<String>) {
        self.shared.state.lock().fail_subscribe = Some(reason.into());
    }

    /// Make the next `receive` on any consumer fail with `reason`.
    pub fn fail_next_receive(&self, reason: impl Into<String>) {
        self.shared
            .state
            .lock()
            .fail_receives
            .push_back(reason.into());
        self.shared.published.notify_waiters();
    }

    /// Make the next `acknowledge` on any consumer fail with `reason`.
    pub fn fail_next_ack(&self, reason: impl Into<String>) {
        self.shared.state.lock().fail_acks.push_back(reason.into());
    }

    fn with_subscription<T>(
        &self,
        topic: &str,
        subscription: &str,
        f: impl FnOnce(&Topic, &Subscription) -> T,
    ) -> Option<T> {
        let state = self.shared.state.lock();
        let topic = state.topics.get(topic)?;
        let sub = topic.subscriptions.get(subscription)?;
        Some(f(topic, sub))
    }
}

impl Connector for InMemoryBroker {
    type Error = MemoryError;
    type Client = MemoryClient;

    async fn connect(&self, options: &ClientOptions) -> Result<Self::Client, Self::Error> {
        let mut state = self.shared.state.lock();
        state.connects += 1;
        state.last_client_options = Some(options.clone());
        if let Some(reason) = &state.fail_connect {
            return Err(MemoryError::ConnectionRefused(reason.clone()));
        }
        Ok(MemoryClient {
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        })
    }
}

/// Client handle returned by [`InMemoryBroker`].
#[derive(Debug)]
pub struct MemoryClient {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl Client for MemoryClient {
    type Error = MemoryError;
    type Consumer = MemoryConsumer;

    async fn subscribe(&self, options: SubscribeOptions) -> Result<Self::Consumer, Self::Error> {
        let mut state = self.shared.state.lock();
        state.subscribes += 1;
        if let Some(reason) = &state.fail_subscribe {
            return Err(MemoryError::SubscribeRejected(reason.clone()));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(MemoryError::Closed);
        }

        let topic = state.topic_mut(&options.topic);
        let sub = topic
            .subscriptions
            .entry(options.subscription_name.clone())
            .or_default();
        if options.subscription_type == SubscriptionType::Exclusive && sub.active_consumers > 0 {
            return Err(MemoryError::ConsumerBusy(options.subscription_name));
        }
        if sub.active_consumers == 0 {
            // Nobody holds the unacked messages any more; hand them out again.
            sub.redeliver = sub.unacked.iter().copied().collect();
        }
        sub.active_consumers += 1;

        Ok(MemoryConsumer {
            shared: Arc::clone(&self.shared),
            topic: options.topic,
            subscription: options.subscription_name,
            closed: AtomicBool::new(false),
        })
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.state.lock().closed_clients += 1;
        }
    }
}

/// Consumer handle attached to one subscription of the [`InMemoryBroker`].
#[derive(Debug)]
pub struct MemoryConsumer {
    shared: Arc<Shared>,
    topic: String,
    subscription: String,
    closed: AtomicBool,
}

impl MemoryConsumer {
    fn try_receive(&self) -> Option<Result<MemoryMessage, MemoryError>> {
        if self.closed.load(Ordering::SeqCst) {
            return Some(Err(MemoryError::Closed));
        }
        let mut state = self.shared.state.lock();
        if let Some(reason) = state.fail_receives.pop_front() {
            return Some(Err(MemoryError::ReceiveFailed(reason)));
        }

        let topic = state.topics.get_mut(&self.topic)?;
        let sub = topic.subscriptions.get_mut(&self.subscription)?;
        let entry = match sub.redeliver.pop_front() {
            Some(entry) => entry,
            None if sub.cursor < topic.log.len() => {
                sub.cursor += 1;
                (sub.cursor - 1) as u64
            }
            None => return None,
        };
        sub.unacked.insert(entry);
        Some(Ok(topic.log[entry as usize].clone()))
    }

    fn release(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.shared.state.lock();
        if let Some(sub) = state
            .topics
            .get_mut(&self.topic)
            .and_then(|t| t.subscriptions.get_mut(&self.subscription))
        {
            sub.active_consumers = sub.active_consumers.saturating_sub(1);
        }
    }
}

impl Consumer for MemoryConsumer {
    type Error = MemoryError;
    type Message = MemoryMessage;

    async fn receive(&self) -> Result<Self::Message, Self::Error> {
        loop {
            let notified = self.shared.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_receive() {
                return result;
            }
            notified.await;
        }
    }

    async fn acknowledge(&self, id: &MemoryMessageId) -> Result<(), Self::Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MemoryError::Closed);
        }
        let mut state = self.shared.state.lock();
        if let Some(reason) = state.fail_acks.pop_front() {
            return Err(MemoryError::AckRejected(reason));
        }
        if let Some(sub) = state
            .topics
            .get_mut(&self.topic)
            .and_then(|t| t.subscriptions.get_mut(&self.subscription))
        {
            sub.unacked.remove(&id.entry_id);
            sub.redeliver.retain(|entry| *entry != id.entry_id);
            sub.acked.push(*id);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.release();
        self.shared.published.notify_waiters();
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscribe_options(subscription: &str) -> SubscribeOptions {
        SubscribeOptions {
            topic: "t1".to_string(),
            subscription_name: subscription.to_string(),
            subscription_type: SubscriptionType::Exclusive,
        }
    }

    #[test]
    fn message_id_bytes_round_trip() {
        let id = MemoryMessageId::new(3, 99);
        assert_eq!(MemoryMessageId::from_bytes(&id.to_bytes()).unwrap(), id);
        assert_eq!(id.to_string(), "3:99");
        assert!(MemoryMessageId::from_bytes(&[0; 15]).is_err());
        assert!(MemoryMessageId::from_bytes(&[0; 17]).is_err());
    }

    #[tokio::test]
    async fn receives_in_publish_order() {
        let broker = InMemoryBroker::new();
        broker.publish("t1", "k1", "one");
        broker.publish("t1", "k2", "two");

        let client = broker.connect(&ClientOptions::default()).await.unwrap();
        let consumer = client.subscribe(subscribe_options("s1")).await.unwrap();

        assert_eq!(consumer.receive().await.unwrap().payload, b"one");
        assert_eq!(consumer.receive().await.unwrap().payload, b"two");
        assert_eq!(broker.unacknowledged("t1", "s1").len(), 2);
    }

    #[tokio::test]
    async fn receive_waits_for_publish() {
        let broker = InMemoryBroker::new();
        let client = broker.connect(&ClientOptions::default()).await.unwrap();
        let consumer = client.subscribe(subscribe_options("s1")).await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            publisher.publish("t1", "k", "late");
        });

        let message = consumer.receive().await.unwrap();
        assert_eq!(message.payload, b"late");
    }

    #[tokio::test]
    async fn reopened_subscription_redelivers_unacked() {
        let broker = InMemoryBroker::new();
        let first = broker.publish("t1", "k", "one");
        let second = broker.publish("t1", "k", "two");

        let client = broker.connect(&ClientOptions::default()).await.unwrap();
        let consumer = client.subscribe(subscribe_options("s1")).await.unwrap();
        consumer.receive().await.unwrap();
        consumer.receive().await.unwrap();
        consumer.acknowledge(&first).await.unwrap();
        consumer.close().await.unwrap();

        let consumer = client.subscribe(subscribe_options("s1")).await.unwrap();
        let again = consumer.receive().await.unwrap();
        assert_eq!(again.id, second);
        assert_eq!(broker.acknowledged("t1", "s1"), vec![first]);
    }

    #[tokio::test]
    async fn exclusive_subscription_rejects_second_consumer() {
        let broker = InMemoryBroker::new();
        let client = broker.connect(&ClientOptions::default()).await.unwrap();
        let _consumer = client.subscribe(subscribe_options("s1")).await.unwrap();

        let err = client.subscribe(subscribe_options("s1")).await.unwrap_err();
        assert_eq!(err, MemoryError::ConsumerBusy("s1".to_string()));
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let broker = InMemoryBroker::new();
        let id = broker.publish("t1", "k", "v");
        let client = broker.connect(&ClientOptions::default()).await.unwrap();
        let consumer = client.subscribe(subscribe_options("s1")).await.unwrap();

        broker.fail_next_receive("boom");
        assert!(matches!(
            consumer.receive().await,
            Err(MemoryError::ReceiveFailed(_))
        ));
        consumer.receive().await.unwrap();

        broker.fail_next_ack("nope");
        assert!(matches!(
            consumer.acknowledge(&id).await,
            Err(MemoryError::AckRejected(_))
        ));
        consumer.acknowledge(&id).await.unwrap();
    }

    #[tokio::test]
    async fn records_connect_and_subscribe_calls() {
        let broker = InMemoryBroker::new();
        broker.fail_connect("down");
        assert!(broker.connect(&ClientOptions::default()).await.is_err());
        assert_eq!(broker.connect_count(), 1);
        assert_eq!(broker.subscribe_count(), 0);
    }
}
