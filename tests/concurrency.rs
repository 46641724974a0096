use std::{collections::HashSet, sync::Arc};

use pulsar_source::{
    Position, Source, SourceConfig, SubscriptionType,
    memory::{InMemoryBroker, MemoryMessageId},
};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

async fn open_shared(broker: &InMemoryBroker) -> Source<InMemoryBroker> {
    let config = SourceConfig::new("pulsar://localhost:6650", "t1")
        .with_subscription_name("s1")
        .with_subscription_type(SubscriptionType::Shared);
    let mut source = Source::with_config(broker.clone(), config);
    source.open(None).await.unwrap();
    source
}

fn message_id(position: &[u8]) -> MemoryMessageId {
    Position::decode(position).unwrap().message_id().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pulls_and_acks_keep_pending_set_consistent() {
    const PULLERS: usize = 4;
    const PER_PULLER: usize = 250;
    const ACKERS: usize = 3;
    const TOTAL: usize = PULLERS * PER_PULLER;

    let broker = InMemoryBroker::new();
    for i in 0..TOTAL {
        broker.publish("t1", format!("k{i}"), format!("m{i}"));
    }
    let source = open_shared(&broker).await;
    let tracker = source.tracker().unwrap();

    let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let rx = Arc::new(Mutex::new(rx));

    let mut pullers = Vec::new();
    for seed in 0..PULLERS {
        let tracker = Arc::clone(&tracker);
        let tx = tx.clone();
        pullers.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(seed as u64);
            let cancel = CancellationToken::new();
            for _ in 0..PER_PULLER {
                let record = tracker
                    .pull(&cancel)
                    .await
                    .unwrap()
                    .into_record()
                    .unwrap();
                tx.send(record.position).unwrap();
                if rng.gen_bool(0.3) {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    drop(tx);

    let mut ackers = Vec::new();
    for seed in 0..ACKERS {
        let tracker = Arc::clone(&tracker);
        let rx = Arc::clone(&rx);
        ackers.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(1_000 + seed as u64);
            let mut acked = Vec::new();
            let mut skipped = Vec::new();
            loop {
                let next = rx.lock().await.recv().await;
                let Some(position) = next else {
                    break;
                };
                if rng.gen_bool(0.75) {
                    tracker.acknowledge(&position).await.unwrap();
                    acked.push(position);
                } else {
                    skipped.push(position);
                }
                if rng.gen_bool(0.5) {
                    tokio::task::yield_now().await;
                }
            }
            (acked, skipped)
        }));
    }

    for puller in pullers {
        puller.await.unwrap();
    }
    let mut acked = Vec::new();
    let mut skipped = Vec::new();
    for acker in ackers {
        let (a, s) = acker.await.unwrap();
        acked.extend(a);
        skipped.extend(s);
    }

    assert_eq!(acked.len() + skipped.len(), TOTAL);
    assert_eq!(tracker.pending_count(), TOTAL - acked.len());

    let pulled: HashSet<_> = acked
        .iter()
        .chain(skipped.iter())
        .map(|p| message_id(p))
        .collect();
    assert_eq!(pulled.len(), TOTAL, "a message was delivered twice");

    let broker_acked = broker.acknowledged("t1", "s1");
    assert_eq!(broker_acked.len(), acked.len());
    let unique: HashSet<_> = broker_acked.iter().copied().collect();
    assert_eq!(unique.len(), acked.len(), "a message was acknowledged twice");

    for position in &skipped {
        assert!(tracker.is_pending(&message_id(position)));
    }
    tracker.acknowledge_batch(&skipped).await.unwrap();
    assert_eq!(tracker.pending_count(), 0);
    assert!(broker.unacknowledged("t1", "s1").is_empty());
}

#[tokio::test]
async fn acks_in_random_order_drain_pending_set() {
    let broker = InMemoryBroker::new();
    for i in 0..200 {
        broker.publish("t1", "k", format!("m{i}"));
    }
    let source = open_shared(&broker).await;

    let cancel = CancellationToken::new();
    let mut positions = Vec::new();
    for _ in 0..200 {
        positions.push(
            source
                .read(&cancel)
                .await
                .unwrap()
                .into_record()
                .unwrap()
                .position,
        );
    }

    let mut rng = StdRng::seed_from_u64(42);
    positions.shuffle(&mut rng);
    for (acked, position) in positions.iter().enumerate() {
        assert_eq!(source.pending_count(), 200 - acked);
        source.ack(position).await.unwrap();
    }
    assert_eq!(source.pending_count(), 0);

    for position in positions.iter().take(10) {
        assert!(source.ack(position).await.unwrap_err().is_not_found());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ack_path_runs_while_read_is_blocked() {
    let broker = InMemoryBroker::new();
    broker.publish("t1", "k", "first");
    let source = Arc::new(open_shared(&broker).await);

    let first = source
        .read(&CancellationToken::new())
        .await
        .unwrap()
        .into_record()
        .unwrap();

    // The next read blocks on an empty topic; acknowledging must not wait for it.
    let cancel = CancellationToken::new();
    let reader = {
        let source = Arc::clone(&source);
        let cancel = cancel.clone();
        tokio::spawn(async move { source.read(&cancel).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    tokio::time::timeout(
        std::time::Duration::from_secs(1),
        source.ack(&first.position),
    )
    .await
    .expect("ack blocked behind a pending read")
    .unwrap();
    assert_eq!(source.pending_count(), 0);

    broker.publish("t1", "k", "second");
    let second = reader.await.unwrap().unwrap().into_record().unwrap();
    assert_eq!(second.payload, b"second");
    assert_eq!(source.pending_count(), 1);
    cancel.cancel();
}
