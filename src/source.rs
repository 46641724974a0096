//! This module contains the source session: configuration, open and teardown around one
//! [`DeliveryTracker`].

use std::{collections::HashMap, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::{
    broker::{Client, Connector},
    config::SourceConfig,
    error::SourceError,
    position::Position,
    tracker::{DeliveryTracker, Read},
};

/// Tracker type of the consumer produced by connector `C`.
pub type TrackerOf<C> = DeliveryTracker<<<C as Connector>::Client as Client>::Consumer>;

struct Session<C: Connector> {
    client: C::Client,
    tracker: Arc<TrackerOf<C>>,
}

/// A Pulsar source bound to one broker connector.
///
/// The pipeline drives it through `configure`, `open`, then `read` and `ack` (which may run
/// concurrently), and finally `teardown`.
///
/// # Type Parameters
///
/// * `C` - The broker connector that implements [`Connector`]
pub struct Source<C: Connector> {
    connector: C,
    config: Option<SourceConfig>,
    session: Option<Session<C>>,
}

impl<C: Connector> Source<C> {
    /// Create an unconfigured source
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            config: None,
            session: None,
        }
    }

    /// Create a source from an already parsed configuration
    pub fn with_config(connector: C, config: SourceConfig) -> Self {
        Self {
            connector,
            config: Some(config),
            session: None,
        }
    }

    /// Parse and store the configuration supplied by the pipeline.
    pub fn configure(&mut self, config: &HashMap<String, String>) -> Result<(), SourceError> {
        tracing::info!("configuring source");
        self.config = Some(SourceConfig::from_map(config)?);
        Ok(())
    }

    pub fn config(&self) -> Option<&SourceConfig> {
        self.config.as_ref()
    }

    /// Connect to the broker and subscribe, resuming from `position` if one is given.
    ///
    /// The subscription name is settled before the broker is contacted: a name embedded in
    /// `position` must match the configured one (when set), and with neither a position nor
    /// a configured name a fresh name is generated. Opening an open source reopens it; when the
    /// name cannot be settled the current session stays open.
    ///
    /// # Errors
    ///
    /// * [`SourceError::NotConfigured`] - `configure` was never called
    /// * [`SourceError::MalformedPosition`] - `position` does not decode
    /// * [`SourceError::SubscriptionMismatch`] - `position` names another subscription
    /// * [`SourceError::Connect`] / [`SourceError::Subscribe`] - The broker refused
    #[tracing::instrument(skip_all)]
    pub async fn open(&mut self, position: Option<&[u8]>) -> Result<(), SourceError> {
        let config = self.config.as_ref().ok_or(SourceError::NotConfigured)?;
        let subscription_name = resolve_subscription_name(config, position)?;

        self.teardown().await;
        let config = self.config.as_ref().ok_or(SourceError::NotConfigured)?;

        let client = self
            .connector
            .connect(&config.client_options())
            .await
            .map_err(|e| SourceError::Connect(Box::new(e)))?;

        let consumer = match client
            .subscribe(config.subscribe_options(&subscription_name))
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                client.close().await;
                return Err(SourceError::Subscribe(Box::new(e)));
            }
        };

        tracing::info!(
            topic = %config.topic,
            subscription = %subscription_name,
            subscription_type = %config.subscription_type,
            "source opened"
        );

        self.session = Some(Session {
            client,
            tracker: Arc::new(DeliveryTracker::new(consumer, subscription_name)),
        });
        Ok(())
    }

    /// Subscription the open session consumes under.
    pub fn subscription_name(&self) -> Option<&str> {
        self.session
            .as_ref()
            .map(|session| session.tracker.subscription_name())
    }

    /// Shared handle to the tracker, for acknowledging from another task.
    pub fn tracker(&self) -> Option<Arc<TrackerOf<C>>> {
        self.session
            .as_ref()
            .map(|session| Arc::clone(&session.tracker))
    }

    pub fn pending_count(&self) -> usize {
        self.session
            .as_ref()
            .map_or(0, |session| session.tracker.pending_count())
    }

    /// Read the next record, or [`Read::Cancelled`] once `cancel` fires.
    pub async fn read(&self, cancel: &CancellationToken) -> Result<Read, SourceError> {
        self.active()?.pull(cancel).await
    }

    /// Acknowledge the record that carried `position`.
    pub async fn ack(&self, position: &[u8]) -> Result<(), SourceError> {
        self.active()?.acknowledge(position).await
    }

    /// Acknowledge several records, reporting every failure together.
    pub async fn ack_batch<P: AsRef<[u8]>>(&self, positions: &[P]) -> Result<(), SourceError> {
        self.active()?.acknowledge_batch(positions).await
    }

    /// Release the consumer and the client. Safe to call any number of times.
    ///
    /// Messages still pending are dropped here and redelivered by the broker on the next run.
    pub async fn teardown(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        let pending = session.tracker.pending_count();
        if let Err(e) = session.tracker.close().await {
            tracing::warn!(error = %e, "failed to close consumer");
        }
        session.client.close().await;

        tracing::info!(pending, "source torn down");
    }

    fn active(&self) -> Result<&TrackerOf<C>, SourceError> {
        self.session
            .as_ref()
            .map(|session| session.tracker.as_ref())
            .ok_or(SourceError::NotOpen)
    }
}

/// Settle the subscription name for an open.
pub(crate) fn resolve_subscription_name(
    config: &SourceConfig,
    position: Option<&[u8]>,
) -> Result<String, SourceError> {
    let configured = config.subscription_name.as_deref();

    if let Some(bytes) = position {
        let position = Position::decode(bytes)?;
        if let Some(configured) = configured {
            if configured != position.subscription_name {
                return Err(SourceError::SubscriptionMismatch {
                    position: position.subscription_name,
                    configured: configured.to_string(),
                });
            }
        }
        return Ok(position.subscription_name);
    }

    match configured {
        Some(name) => Ok(name.to_string()),
        None => {
            // First run of this source: start a new cursor.
            let name = uuid::Uuid::new_v4().to_string();
            tracing::info!(subscription = %name, "assigning source to new subscription");
            Ok(name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;

    fn config(subscription: &str) -> SourceConfig {
        SourceConfig::new("pulsar://localhost:6650", "t1").with_subscription_name(subscription)
    }

    #[test]
    fn resolves_configured_name() {
        assert_eq!(resolve_subscription_name(&config("s1"), None).unwrap(), "s1");
    }

    #[test]
    fn resolves_name_from_position() {
        let position = Position::new("s1").encode();
        assert_eq!(
            resolve_subscription_name(&config(""), Some(&position)).unwrap(),
            "s1"
        );
        assert_eq!(
            resolve_subscription_name(&config("s1"), Some(&position)).unwrap(),
            "s1"
        );
    }

    #[test]
    fn rejects_conflicting_names() {
        let position = Position::new("old").encode();
        match resolve_subscription_name(&config("new"), Some(&position)).unwrap_err() {
            SourceError::SubscriptionMismatch {
                position,
                configured,
            } => {
                assert_eq!(position, "old");
                assert_eq!(configured, "new");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_resume_position() {
        let err = resolve_subscription_name(&config("s1"), Some(b"{")).unwrap_err();
        assert!(matches!(err, SourceError::MalformedPosition(_)));
    }

    #[test]
    fn generates_distinct_names() {
        let a = resolve_subscription_name(&config(""), None).unwrap();
        let b = resolve_subscription_name(&config(""), None).unwrap();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(&a).is_ok());
    }

    #[tokio::test]
    async fn open_requires_configuration() {
        let mut source = Source::new(InMemoryBroker::new());
        let err = source.open(None).await.unwrap_err();
        assert!(matches!(err, SourceError::NotConfigured));
    }

    #[tokio::test]
    async fn read_and_ack_require_open() {
        let source = Source::with_config(InMemoryBroker::new(), config("s1"));
        assert!(matches!(
            source.read(&CancellationToken::new()).await,
            Err(SourceError::NotOpen)
        ));
        assert!(matches!(
            source.ack(&Position::new("s1").encode()).await,
            Err(SourceError::NotOpen)
        ));
        assert_eq!(source.pending_count(), 0);
        assert_eq!(source.subscription_name(), None);
    }

    #[tokio::test]
    async fn connect_failure_is_fatal() {
        let broker = InMemoryBroker::new();
        broker.fail_connect("unreachable");
        let mut source = Source::with_config(broker.clone(), config("s1"));

        let err = source.open(None).await.unwrap_err();
        assert!(matches!(err, SourceError::Connect(_)));
        assert_eq!(broker.connect_count(), 1);
        assert_eq!(broker.subscribe_count(), 0);
    }

    #[tokio::test]
    async fn subscribe_failure_closes_client() {
        let broker = InMemoryBroker::new();
        broker.fail_subscribe("topic not found");
        let mut source = Source::with_config(broker.clone(), config("s1"));

        let err = source.open(None).await.unwrap_err();
        assert!(matches!(err, SourceError::Subscribe(_)));
        assert_eq!(broker.closed_clients(), 1);
        assert_eq!(source.subscription_name(), None);
    }

    #[tokio::test]
    async fn rejected_reopen_keeps_session() {
        let broker = InMemoryBroker::new();
        broker.publish("t1", "k", "v");
        let mut source = Source::with_config(broker.clone(), config("s1"));
        source.open(None).await.unwrap();
        let record = source
            .read(&CancellationToken::new())
            .await
            .unwrap()
            .into_record()
            .unwrap();

        let err = source
            .open(Some(&Position::new("s0").encode()))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::SubscriptionMismatch { .. }));
        assert_eq!(source.subscription_name(), Some("s1"));
        assert_eq!(source.pending_count(), 1);
        assert_eq!(broker.closed_clients(), 0);

        source.ack(&record.position).await.unwrap();
        assert_eq!(source.pending_count(), 0);
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let broker = InMemoryBroker::new();
        let mut source = Source::with_config(broker.clone(), config("s1"));

        source.teardown().await;
        source.open(None).await.unwrap();
        source.teardown().await;
        source.teardown().await;

        assert_eq!(broker.closed_clients(), 1);
        assert_eq!(source.subscription_name(), None);
    }
}
