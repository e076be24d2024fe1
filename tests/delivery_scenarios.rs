use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use courier::{
    AckId, AckOutcome, Broker, BrokerConfig, Error, InMemoryLog, ManualClock, PublishRequest,
    RedeliveryPolicy, Subscription,
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
    broker.create_topic(&subscription.topic).expect("topic");
    broker.create_subscription(subscription).expect("subscription");
    (broker, clock)
}

fn publish(broker: &Broker, payload: &str) {
    broker
        .publish("t", PublishRequest::new(payload.as_bytes().to_vec()))
        .expect("publish");
}

#[test]
fn expired_lease_is_redelivered_with_new_ack_id() {
    let (broker, clock) = setup(Subscription::new("s", "t"));
    publish(&broker, "A");
    publish(&broker, "B");

    let batch = broker.try_pull("s", 2).expect("pull");
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].message.payload, b"A");
    assert_eq!(batch[1].message.payload, b"B");
    let a1 = batch[0].ack_id.clone();
    let b1 = batch[1].ack_id.clone();

    broker.acknowledge("s", &[a1]).expect("ack a1");

    clock.advance(Duration::from_secs(10) + Duration::from_millis(1));
    let report = broker.run_maintenance();
    assert_eq!(report.expired_leases, 1);

    let batch = broker.try_pull("s", 1).expect("second pull");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].message.payload, b"B");
    assert_eq!(batch[0].delivery_attempt, 2);
    let b2 = batch[0].ack_id.clone();
    assert_ne!(b1, b2);

    assert!(matches!(
        broker.acknowledge("s", &[b1]),
        Err(Error::InvalidAckId(_))
    ));
    broker.acknowledge("s", &[b2]).expect("ack b2");
}

#[test]
fn lease_is_not_expired_at_exact_deadline() {
    let (broker, clock) = setup(Subscription::new("s", "t"));
    publish(&broker, "A");
    let batch = broker.try_pull("s", 1).expect("pull");

    clock.advance(Duration::from_secs(10));
    assert_eq!(broker.run_maintenance().expired_leases, 0);
    broker
        .acknowledge("s", &[batch[0].ack_id.clone()])
        .expect("ack at deadline");
}

#[test]
fn overdue_ack_fails_without_a_sweep() {
    let (broker, clock) = setup(Subscription::new("s", "t"));
    publish(&broker, "A");
    let batch = broker.try_pull("s", 1).expect("pull");

    clock.advance(Duration::from_secs(11));
    assert!(matches!(
        broker.acknowledge("s", &[batch[0].ack_id.clone()]),
        Err(Error::InvalidAckId(_))
    ));
    let again = broker.try_pull("s", 1).expect("pull again");
    assert_eq!(again[0].delivery_attempt, 2);
}

#[test]
fn double_ack_is_idempotent() {
    let (broker, _clock) = setup(Subscription::new("s", "t"));
    publish(&broker, "A");
    let ack_id = broker.try_pull("s", 1).expect("pull")[0].ack_id.clone();

    assert_eq!(
        broker.acknowledge_one("s", &ack_id).expect("first ack"),
        AckOutcome::Acked
    );
    assert_eq!(
        broker.acknowledge_one("s", &ack_id).expect("second ack"),
        AckOutcome::AlreadyAcked
    );

    // Still idempotent once the floor has moved past the message.
    broker.run_maintenance();
    broker.acknowledge("s", &[ack_id]).expect("ack after compaction");

    let stats = broker.stats("s").expect("stats");
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.delivered, 1);
    assert!(broker.try_pull("s", 10).expect("pull").is_empty());
}

#[test]
fn nack_makes_message_redeliverable_immediately() {
    let (broker, _clock) = setup(Subscription::new("s", "t"));
    publish(&broker, "A");
    let first = broker.try_pull("s", 1).expect("pull");
    assert!(broker.try_pull("s", 1).expect("leased").is_empty());

    broker
        .modify_ack_deadline("s", &[first[0].ack_id.clone()], 0)
        .expect("nack");
    let second = broker.try_pull("s", 1).expect("redelivery");
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].delivery_attempt, 2);
    assert_eq!(broker.stats("s").expect("stats").nacked, 1);
}

#[test]
fn extension_keeps_lease_alive() {
    let (broker, clock) = setup(Subscription::new("s", "t"));
    publish(&broker, "A");
    let ack_id = broker.try_pull("s", 1).expect("pull")[0].ack_id.clone();

    broker
        .modify_ack_deadline("s", &[ack_id.clone()], 60)
        .expect("extend");
    clock.advance(Duration::from_secs(30));
    assert_eq!(broker.run_maintenance().expired_leases, 0);
    assert!(broker.try_pull("s", 1).expect("pull").is_empty());
    broker.acknowledge("s", &[ack_id]).expect("ack");
}

#[test]
fn modify_ack_deadline_rejects_out_of_range_seconds() {
    let (broker, _clock) = setup(Subscription::new("s", "t"));
    publish(&broker, "A");
    let ack_id = broker.try_pull("s", 1).expect("pull")[0].ack_id.clone();

    for seconds in [-1, 601] {
        assert!(matches!(
            broker.modify_ack_deadline("s", &[ack_id.clone()], seconds),
            Err(Error::InvalidArgument(_))
        ));
    }
    broker
        .modify_ack_deadline("s", &[ack_id], 600)
        .expect("max extension");
}

#[test]
fn garbage_ack_ids_are_invalid() {
    let (broker, _clock) = setup(Subscription::new("s", "t"));
    assert!(matches!(
        broker.acknowledge("s", &[AckId::from("not-an-ack-id")]),
        Err(Error::InvalidAckId(_))
    ));
    let confirmation = broker
        .acknowledge_with_confirmation("s", &[AckId::from("x"), AckId::from("y")])
        .expect("confirmation");
    assert_eq!(confirmation.invalid.len(), 2);
    assert_eq!(broker.stats("s").expect("stats").invalid_acks, 3);
}

#[test]
fn pull_validates_max_messages() {
    let (broker, _clock) = setup(Subscription::new("s", "t"));
    assert!(matches!(
        broker.try_pull("s", 0),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        broker.try_pull("s", 1001),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        broker.try_pull("missing", 1),
        Err(Error::SubscriptionNotFound(_))
    ));
}

#[test]
fn redelivery_backoff_delays_eligibility() {
    let sub = Subscription::new("s", "t").with_redelivery_policy(RedeliveryPolicy::exponential(
        Duration::from_secs(2),
        Duration::from_secs(60),
    ));
    let (broker, clock) = setup(sub);
    publish(&broker, "A");

    let first = broker.try_pull("s", 1).expect("pull");
    broker
        .modify_ack_deadline("s", &[first[0].ack_id.clone()], 0)
        .expect("nack");
    assert!(broker.try_pull("s", 1).expect("backing off").is_empty());

    clock.advance(Duration::from_secs(2));
    let second = broker.try_pull("s", 1).expect("after backoff");
    assert_eq!(second.len(), 1);
    broker
        .modify_ack_deadline("s", &[second[0].ack_id.clone()], 0)
        .expect("nack again");

    clock.advance(Duration::from_secs(3));
    assert!(broker.try_pull("s", 1).expect("second backoff").is_empty());
    clock.advance(Duration::from_secs(1));
    assert_eq!(broker.try_pull("s", 1).expect("eligible")[0].delivery_attempt, 3);
}

#[test]
fn messages_past_retention_are_dropped() {
    let sub = Subscription::new("s", "t").with_message_retention(Duration::from_secs(600));
    let (broker, clock) = setup(sub);
    publish(&broker, "old");
    clock.advance(Duration::from_secs(601));
    publish(&broker, "new");

    let batch = broker.try_pull("s", 10).expect("pull");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].message.payload, b"new");
    assert_eq!(broker.stats("s").expect("stats").retention_dropped, 1);
}

#[test]
fn acked_prefix_lets_the_log_compact() {
    let clock = Arc::new(ManualClock::new(START_NS));
    let log = Arc::new(InMemoryLog::new());
    let broker = Broker::with_parts(BrokerConfig::default(), log.clone(), clock)
        .expect("broker");
    broker.create_topic("t").expect("topic");
    broker
        .create_subscription(Subscription::new("s", "t"))
        .expect("subscription");
    for i in 0..5 {
        publish(&broker, &format!("m{i}"));
    }

    let batch = broker.try_pull("s", 5).expect("pull");
    let ack_ids: Vec<_> = batch[..3].iter().map(|m| m.ack_id.clone()).collect();
    broker.acknowledge("s", &ack_ids).expect("ack");

    let report = broker.run_maintenance();
    assert_eq!(report.compacted_messages, 3);
    assert_eq!(log.retained("t").expect("retained"), 2);
}

#[test]
fn concurrent_pulls_never_share_a_message() {
    let (broker, _clock) = setup(Subscription::new("s", "t"));
    for i in 0..2_000 {
        publish(&broker, &format!("m{i}"));
    }
    let broker = Arc::new(broker);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let broker = Arc::clone(&broker);
            thread::spawn(move || {
                let mut offsets = Vec::new();
                loop {
                    let batch = broker.try_pull("s", 37).expect("pull");
                    if batch.is_empty() {
                        break;
                    }
                    offsets.extend(batch.iter().map(|m| m.message.offset));
                }
                offsets
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for offset in handle.join().expect("puller") {
            assert!(seen.insert(offset), "offset {offset} delivered twice");
        }
    }
    assert_eq!(seen.len(), 2_000);
    assert_eq!(broker.stats("s").expect("stats").outstanding, 2_000);
}

#[test]
fn backlog_drains_while_an_early_lease_is_held() {
    let (broker, _clock) = setup(Subscription::new("s", "t"));
    let total = 5_000;
    for i in 0..total {
        publish(&broker, &format!("m{i}"));
    }
    let held = broker.try_pull("s", 1).expect("pull");
    assert_eq!(held[0].message.offset, 0);

    // Everything after the held head is acked, so the floor cannot move.
    let mut acked = 0;
    loop {
        broker
            .modify_ack_deadline("s", &[held[0].ack_id.clone()], 60)
            .expect("keep head leased");
        let batch = broker.try_pull("s", 1000).expect("pull");
        if batch.is_empty() {
            break;
        }
        let ack_ids: Vec<_> = batch.iter().map(|m| m.ack_id.clone()).collect();
        broker.acknowledge("s", &ack_ids).expect("ack");
        acked += batch.len();
        broker.run_maintenance();
    }
    assert_eq!(acked, total - 1);
    assert_eq!(broker.stats("s").expect("stats").outstanding, 1);

    broker
        .acknowledge("s", &[held[0].ack_id.clone()])
        .expect("ack head");
    assert_eq!(broker.run_maintenance().compacted_messages, total as u64);
    assert!(broker.try_pull("s", 10).expect("pull").is_empty());
}

#[tokio::test]
async fn long_poll_returns_when_a_message_arrives() {
    let (broker, _clock) = setup(Subscription::new("s", "t"));
    let broker = Arc::new(broker);

    let publisher = Arc::clone(&broker);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        publish(&publisher, "late");
    });

    let batch = broker.pull("s", 10, false).await.expect("pull");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].message.payload, b"late");
    assert!(broker.pull("s", 10, true).await.expect("pull").is_empty());
}
