//! This module contains the delivery tracker, which pairs pipeline acknowledgments with the
//! broker messages they confirm.

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::{
    broker::{Consumer, Message},
    error::{AckBatchError, AckFailure, SourceError},
    pending::PendingSet,
    position::Position,
    record::Record,
};

/// Message id type yielded by consumer `C`.
pub type MessageIdOf<C> = <<C as Consumer>::Message as Message>::Id;

/// Outcome of a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Read {
    /// A message was received and is now pending.
    Record(Record),
    /// The read was cancelled before a message arrived.
    Cancelled,
}

impl Read {
    pub fn into_record(self) -> Option<Record> {
        match self {
            Read::Record(record) => Some(record),
            Read::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Read::Cancelled)
    }
}

/// Tracks messages delivered to the pipeline until the pipeline acknowledges them.
///
/// Each message moves `Unseen -> Pending -> Acknowledged`. [`pull`](Self::pull) adds it to the
/// pending set, [`acknowledge`](Self::acknowledge) removes it and confirms it with the broker.
/// Both take `&self`, so the read loop and the ack path can share one tracker through an
/// [`Arc`](std::sync::Arc).
///
/// # Type Parameters
///
/// * `C` - The broker consumer that implements [`Consumer`]
pub struct DeliveryTracker<C: Consumer> {
    consumer: C,
    subscription_name: String,
    pending: PendingSet<C::Message>,
}

impl<C: Consumer> DeliveryTracker<C> {
    /// Create a tracker that owns `consumer` for the lifetime of one session.
    pub fn new(consumer: C, subscription_name: impl Into<String>) -> Self {
        Self {
            consumer,
            subscription_name: subscription_name.into(),
            pending: PendingSet::new(),
        }
    }

    pub fn subscription_name(&self) -> &str {
        &self.subscription_name
    }

    /// Number of delivered messages still waiting for an acknowledgment.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &MessageIdOf<C>) -> bool {
        self.pending.contains(&id.to_string())
    }

    /// Receive the next message and hand it out as a record.
    ///
    /// Waits until the consumer yields a message or `cancel` fires. A message that is already
    /// available wins over cancellation, so nothing the consumer returned is ever dropped.
    ///
    /// # Returns
    ///
    /// * `Ok(Read::Record(_))` - The message is pending and its record carries its position
    /// * `Ok(Read::Cancelled)` - `cancel` fired first
    /// * `Err(SourceError::Receive(_))` - The consumer failed; nothing was recorded
    pub async fn pull(&self, cancel: &CancellationToken) -> Result<Read, SourceError> {
        tracing::debug!(subscription = %self.subscription_name, "reading message");

        let message = tokio::select! {
            biased;
            received = self.consumer.receive() => {
                received.map_err(|e| SourceError::Receive(Box::new(e)))?
            }
            _ = cancel.cancelled() => {
                tracing::debug!("read cancelled");
                return Ok(Read::Cancelled);
            }
        };

        let id = message.id();
        let key = id.to_string();
        let position = Position::for_message(self.subscription_name.as_str(), &id).encode();
        let record = Record::from_message(&message, position);

        if !self.pending.insert_if_absent(key.clone(), message) {
            tracing::warn!(message_id = %key, "message redelivered while still pending");
        }
        tracing::trace!(message_id = %key, "message pending");

        Ok(Read::Record(record))
    }

    /// Acknowledge the message a record's position points to.
    ///
    /// The entry leaves the pending set before the broker is contacted and stays removed even
    /// when the broker rejects the acknowledgment.
    ///
    /// # Errors
    ///
    /// * [`SourceError::MalformedPosition`] - The position does not decode, or its message id is
    ///   missing or invalid under this subscription
    /// * [`SourceError::NotFound`] - The position names another subscription, or the message
    ///   is not pending
    /// * [`SourceError::Ack`] - The broker rejected the acknowledgment
    pub async fn acknowledge(&self, position: &[u8]) -> Result<(), SourceError> {
        let position = Position::decode(position)?;
        if position.subscription_name != self.subscription_name {
            return Err(SourceError::NotFound {
                message_id: position.message_id.unwrap_or_default(),
            });
        }

        let id: MessageIdOf<C> = position.message_id()?;
        let key = id.to_string();
        tracing::debug!(message_id = %key, "attempting to ack message");

        let Some(message) = self.pending.remove_if_present(&key) else {
            return Err(SourceError::NotFound { message_id: key });
        };

        self.consumer
            .acknowledge(&message.id())
            .await
            .map_err(|e| SourceError::Ack {
                message_id: key,
                source: Box::new(e),
            })
    }

    /// Acknowledge several positions at once.
    ///
    /// Every position is attempted; failures are collected into one
    /// [`SourceError::AckBatch`] indexed by their place in `positions`.
    pub async fn acknowledge_batch<P>(&self, positions: &[P]) -> Result<(), SourceError>
    where
        P: AsRef<[u8]>,
    {
        let results = join_all(positions.iter().map(|p| self.acknowledge(p.as_ref()))).await;
        collect_failures(results)
    }

    /// Acknowledge everything received so far, whether or not the pipeline confirmed it.
    ///
    /// Legacy mode only: it can confirm messages the pipeline never processed. Returns the
    /// number of messages drained from the pending set.
    pub async fn acknowledge_all(&self) -> Result<usize, SourceError> {
        let drained = self.pending.drain();
        let count = drained.len();
        tracing::debug!(count, "acknowledging all pending messages");

        let results = join_all(drained.iter().map(|(key, message)| async move {
            self.consumer
                .acknowledge(&message.id())
                .await
                .map_err(|e| SourceError::Ack {
                    message_id: key.clone(),
                    source: Box::new(e),
                })
        }))
        .await;

        collect_failures(results).map(|()| count)
    }

    /// Close the consumer. The pending set is left as is; the broker redelivers it later.
    pub async fn close(&self) -> Result<(), C::Error> {
        self.consumer.close().await
    }
}

fn collect_failures(results: Vec<Result<(), SourceError>>) -> Result<(), SourceError> {
    let failures: Vec<AckFailure> = results
        .into_iter()
        .enumerate()
        .filter_map(|(index, result)| result.err().map(|error| AckFailure { index, error }))
        .collect();

    if failures.is_empty() {
        Ok(())
    } else {
        Err(AckBatchError { failures }.into())
    }
}
