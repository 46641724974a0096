use std::collections::HashMap;

use anyhow::Context;
use pulsar_source::{Read, Source, memory::InMemoryBroker};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn source_config(topic: &str) -> HashMap<String, String> {
    HashMap::from([
        ("url".to_string(), "pulsar://localhost:6650".to_string()),
        ("topic".to_string(), topic.to_string()),
        // Left empty so the first run generates a subscription name.
        ("subscriptionName".to_string(), String::new()),
        ("subscriptionType".to_string(), "shared".to_string()),
    ])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_line_number(true)
        .init();

    let topic = std::env::var("PULSAR_TOPIC").unwrap_or_else(|_| "events".to_string());
    let message_count: usize = std::env::var("MESSAGE_COUNT")
        .unwrap_or_else(|_| "20".to_string())
        .parse()
        .context("MESSAGE_COUNT is not a number")?;

    let broker = InMemoryBroker::new();
    for i in 0..message_count {
        broker.publish(&topic, format!("key-{i}"), format!("payload-{i}"));
    }

    let mut source = Source::new(broker.clone());
    source.configure(&source_config(&topic))?;
    source.open(None).await?;
    let subscription = source
        .subscription_name()
        .context("source is not open")?
        .to_string();
    tracing::info!(%subscription, "source ready");

    let tracker = source.tracker().context("source is not open")?;
    let (ack_tx, mut ack_rx) = mpsc::channel::<Vec<u8>>(16);

    // Acknowledge every other record; the rest stay pending and come back on the next run.
    let acker = tokio::spawn(async move {
        let mut acked = 0usize;
        let mut seen = 0usize;
        while let Some(position) = ack_rx.recv().await {
            seen += 1;
            if seen % 2 == 1 {
                continue;
            }
            match tracker.acknowledge(&position).await {
                Ok(()) => acked += 1,
                Err(e) => tracing::error!(error = %e, "failed to acknowledge record"),
            }
        }
        acked
    });

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    let mut last_position = None;
    for _ in 0..message_count {
        match source.read(&cancel).await? {
            Read::Record(record) => {
                tracing::info!(
                    payload = %String::from_utf8_lossy(&record.payload),
                    "read record"
                );
                last_position = Some(record.position.clone());
                ack_tx.send(record.position).await?;
            }
            Read::Cancelled => break,
        }
    }
    drop(ack_tx);

    let acked = acker.await?;
    tracing::info!(acked, pending = source.pending_count(), "first run finished");
    source.teardown().await;

    let Some(position) = last_position else {
        return Ok(());
    };

    // Resume the same subscription from the last persisted position.
    let mut source = Source::new(broker.clone());
    source.configure(&source_config(&topic))?;
    source.open(Some(&position)).await?;

    let redelivered = broker.unacknowledged(&topic, &subscription).len();
    for _ in 0..redelivered {
        if let Read::Record(record) = source.read(&cancel).await? {
            tracing::info!(
                payload = %String::from_utf8_lossy(&record.payload),
                "redelivered record"
            );
            source.ack(&record.position).await?;
        }
    }

    tracing::info!(
        acknowledged = broker.acknowledged(&topic, &subscription).len(),
        "second run finished"
    );
    source.teardown().await;

    println!("done");

    Ok(())
}
