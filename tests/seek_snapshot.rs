use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use courier::{
    AckOutcome, Broker, BrokerConfig, Error, InMemoryLog, ManualClock, PublishRequest,
    ReceivedMessage, SeekTarget, Subscription,
};

const START_NS: u64 = 1_700_000_000_000_000_000;

fn setup(subscription: Subscription) -> (Broker, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(START_NS));
    let broker = Broker::with_parts(
        BrokerConfig::default(),
        Arc::new(InMemoryLog::new()),
        clock.clone(),
    )
    .expect("broker");
    broker.create_topic("t").expect("topic");
    broker.create_subscription(subscription).expect("subscription");
    (broker, clock)
}

/// Publishes `n` messages one second apart.
fn publish_spaced(broker: &Broker, clock: &ManualClock, n: usize) {
    for i in 0..n {
        broker
            .publish("t", PublishRequest::new(format!("m{i}").into_bytes()))
            .expect("publish");
        clock.advance(Duration::from_secs(1));
    }
}

fn offsets(batch: &[ReceivedMessage]) -> BTreeSet<u64> {
    batch.iter().map(|m| m.message.offset).collect()
}

fn ack_offsets(broker: &Broker, batch: &[ReceivedMessage], wanted: &[u64]) {
    let ack_ids: Vec<_> = batch
        .iter()
        .filter(|m| wanted.contains(&m.message.offset))
        .map(|m| m.ack_id.clone())
        .collect();
    broker.acknowledge("s", &ack_ids).expect("ack");
}

#[test]
fn seek_to_time_replays_retained_messages() {
    let (broker, clock) = setup(Subscription::new("s", "t").with_retained_acks());
    publish_spaced(&broker, &clock, 3);

    let batch = broker.try_pull("s", 10).expect("pull");
    ack_offsets(&broker, &batch, &[0, 1, 2]);
    broker.run_maintenance();
    assert!(broker.try_pull("s", 10).expect("pull").is_empty());

    let invalidated = broker
        .seek("s", SeekTarget::Time(START_NS + 1_000_000_000))
        .expect("seek");
    assert_eq!(invalidated, 0);
    let replay = broker.try_pull("s", 10).expect("replay");
    assert_eq!(offsets(&replay), BTreeSet::from([1, 2]));
    assert_eq!(replay[0].message.payload, b"m1");
}

#[test]
fn seek_forward_settles_outstanding_leases() {
    let (broker, clock) = setup(Subscription::new("s", "t"));
    publish_spaced(&broker, &clock, 4);
    let batch = broker.try_pull("s", 10).expect("pull");
    assert_eq!(batch.len(), 4);

    let invalidated = broker
        .seek("s", SeekTarget::Time(broker.now()))
        .expect("seek");
    assert_eq!(invalidated, 4);
    assert_eq!(broker.stats("s").expect("stats").outstanding, 0);
    assert!(broker.try_pull("s", 10).expect("pull").is_empty());

    // Ids below the new floor count as already acknowledged.
    assert_eq!(
        broker
            .acknowledge_one("s", &batch[0].ack_id)
            .expect("ack after seek"),
        AckOutcome::AlreadyAcked
    );
}

#[test]
fn snapshot_restores_acknowledgement_state() {
    let (broker, clock) = setup(Subscription::new("s", "t"));
    publish_spaced(&broker, &clock, 4);
    let batch = broker.try_pull("s", 10).expect("pull");

    ack_offsets(&broker, &batch, &[0, 2]);
    let snapshot = broker.create_snapshot("snap", "s").expect("snapshot");
    assert_eq!(snapshot.floor, 1);
    assert_eq!(snapshot.acked, BTreeSet::from([2]));
    assert_eq!(snapshot.topic, "t");

    ack_offsets(&broker, &batch, &[1, 3]);
    assert!(broker.try_pull("s", 10).expect("pull").is_empty());

    broker
        .seek("s", SeekTarget::Snapshot("snap".into()))
        .expect("seek");
    let replay = broker.try_pull("s", 10).expect("replay");
    assert_eq!(offsets(&replay), BTreeSet::from([1, 3]));
}

#[test]
fn snapshot_admin_errors() {
    let (broker, _clock) = setup(Subscription::new("s", "t"));
    broker.create_topic("other").expect("topic");
    broker
        .create_subscription(Subscription::new("o", "other"))
        .expect("subscription");

    broker.create_snapshot("snap", "s").expect("snapshot");
    assert!(matches!(
        broker.create_snapshot("snap", "s"),
        Err(Error::SnapshotExists(_))
    ));
    assert!(matches!(
        broker.create_snapshot("", "s"),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        broker.seek("s", SeekTarget::Snapshot("missing".into())),
        Err(Error::SnapshotNotFound(_))
    ));
    assert!(matches!(
        broker.seek("o", SeekTarget::Snapshot("snap".into())),
        Err(Error::InvalidArgument(_))
    ));

    assert_eq!(broker.list_snapshots().len(), 1);
    broker.delete_snapshot("snap").expect("delete");
    assert!(broker.list_snapshots().is_empty());
    assert!(matches!(
        broker.delete_snapshot("snap"),
        Err(Error::SnapshotNotFound(_))
    ));
}

#[test]
fn snapshots_expire_with_message_retention() {
    let sub = Subscription::new("s", "t").with_message_retention(Duration::from_secs(600));
    let (broker, clock) = setup(sub);
    broker.create_snapshot("snap", "s").expect("snapshot");

    clock.advance(Duration::from_secs(599));
    assert_eq!(broker.run_maintenance().expired_snapshots, 0);
    clock.advance(Duration::from_secs(2));
    assert_eq!(broker.run_maintenance().expired_snapshots, 1);
    assert!(matches!(
        broker.seek("s", SeekTarget::Snapshot("snap".into())),
        Err(Error::SnapshotNotFound(_))
    ));
}
