use std::sync::Arc;
use std::time::Duration;

use courier::{
    Broker, BrokerConfig, Error, InMemoryLog, ManualClock, PublishRequest, SubscriptionField,
    Subscription, SubscriptionUpdate,
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
    broker
        .publish("t", PublishRequest::new(b"M".to_vec()))
        .expect("publish");
    (broker, clock)
}

#[test]
fn redelivery_fences_out_the_previous_ack_id() {
    let (broker, clock) = setup(Subscription::new("s", "t").with_exactly_once());

    let first = broker.try_pull("s", 1).expect("pull");
    assert_eq!(first[0].fencing_token, Some(1));
    let x1 = first[0].ack_id.clone();

    clock.advance(Duration::from_secs(11));
    broker.run_maintenance();

    let second = broker.try_pull("s", 1).expect("redelivery");
    assert_eq!(second[0].fencing_token, Some(2));
    let x2 = second[0].ack_id.clone();

    assert!(matches!(
        broker.modify_ack_deadline("s", &[x1.clone()], 30),
        Err(Error::FencingTokenStale {
            presented: 1,
            current: 2,
            ..
        })
    ));
    broker.acknowledge("s", &[x2.clone()]).expect("ack x2");

    let stats = broker.stats("s").expect("stats");
    assert_eq!(stats.stale_acks, 1);
    assert_eq!(stats.acked, 1);

    // The superseded id stays fenced out after the message is acked.
    assert!(matches!(
        broker.acknowledge("s", &[x1]),
        Err(Error::FencingTokenStale { .. })
    ));
}

#[test]
fn nack_fences_before_the_deadline() {
    let (broker, _clock) = setup(Subscription::new("s", "t").with_exactly_once());

    let x1 = broker.try_pull("s", 1).expect("pull")[0].ack_id.clone();
    broker
        .modify_ack_deadline("s", &[x1.clone()], 0)
        .expect("nack");
    let x2 = broker.try_pull("s", 1).expect("redelivery")[0].ack_id.clone();

    let confirmation = broker
        .acknowledge_with_confirmation("s", &[x1.clone(), x2.clone()])
        .expect("confirmation");
    assert_eq!(confirmation.stale, vec![x1]);
    assert_eq!(confirmation.succeeded, vec![x2]);
    assert!(confirmation.invalid.is_empty());
}

#[test]
fn at_most_one_valid_ack_id_per_message() {
    let (broker, clock) = setup(Subscription::new("s", "t").with_exactly_once());

    let mut issued = Vec::new();
    for _ in 0..4 {
        let batch = broker.try_pull("s", 1).expect("pull");
        issued.push(batch[0].ack_id.clone());
        clock.advance(Duration::from_secs(11));
        broker.run_maintenance();
    }
    let current = broker.try_pull("s", 1).expect("pull")[0].ack_id.clone();

    for old in &issued {
        assert!(matches!(
            broker.modify_ack_deadline("s", &[old.clone()], 10),
            Err(Error::FencingTokenStale { .. })
        ));
    }
    broker
        .modify_ack_deadline("s", &[current], 10)
        .expect("current id extends");
}

#[test]
fn without_exactly_once_superseded_ids_are_just_invalid() {
    let (broker, clock) = setup(Subscription::new("s", "t"));

    let first = broker.try_pull("s", 1).expect("pull");
    assert_eq!(first[0].fencing_token, None);
    clock.advance(Duration::from_secs(11));
    broker.run_maintenance();
    broker.try_pull("s", 1).expect("redelivery");

    assert!(matches!(
        broker.acknowledge("s", &[first[0].ack_id.clone()]),
        Err(Error::InvalidAckId(_))
    ));
}

#[test]
fn exactly_once_can_be_enabled_by_update() {
    let (broker, clock) = setup(Subscription::new("s", "t"));
    let update = SubscriptionUpdate::new(
        Subscription::new("s", "t").with_exactly_once(),
        vec![SubscriptionField::ExactlyOnce],
    );
    assert!(broker.update_subscription(update).expect("update").exactly_once_enabled);

    let first = broker.try_pull("s", 1).expect("pull");
    assert!(first[0].fencing_token.is_some());
    clock.advance(Duration::from_secs(11));
    broker.run_maintenance();
    broker.try_pull("s", 1).expect("redelivery");
    assert!(matches!(
        broker.acknowledge("s", &[first[0].ack_id.clone()]),
        Err(Error::FencingTokenStale { .. })
    ));
}

#[test]
fn deadline_confirmation_separates_stale_and_current_ids() {
    let (broker, clock) = setup(Subscription::new("s", "t").with_exactly_once());

    let x1 = broker.try_pull("s", 1).expect("pull")[0].ack_id.clone();
    clock.advance(Duration::from_secs(11));
    broker.run_maintenance();
    let x2 = broker.try_pull("s", 1).expect("redelivery")[0].ack_id.clone();

    let confirmation = broker
        .modify_ack_deadline_with_confirmation("s", &[x1.clone(), x2.clone()], 60)
        .expect("confirmation");
    assert_eq!(confirmation.stale, vec![x1]);
    assert_eq!(confirmation.succeeded, vec![x2.clone()]);

    clock.advance(Duration::from_secs(30));
    assert_eq!(broker.run_maintenance().expired_leases, 0);
    assert_eq!(
        broker.acknowledge_one("s", &x2).expect("ack"),
        courier::AckOutcome::Acked
    );
    assert!(matches!(
        broker.modify_ack_deadline_with_confirmation("missing", &[x2], 10),
        Err(Error::SubscriptionNotFound(_))
    ));
}
