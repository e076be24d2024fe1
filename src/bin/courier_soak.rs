use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use courier::{
    Broker, BrokerConfig, DeadLetterPolicy, FlowControl, InMemoryLog, PublishRequest,
    QuantaClock, ReceivedMessage, RedeliveryPolicy, StreamingPullRequest, Subscription,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Load generator for the courier delivery engine", long_about = None)]
struct Args {
    /// Broker config file (JSON); defaults apply when absent
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Messages to publish
    #[arg(long, default_value_t = 10_000)]
    messages: u64,

    /// Payload size in bytes
    #[arg(long, default_value_t = 128)]
    payload_bytes: usize,

    /// Number of distinct ordering keys (0 = unordered)
    #[arg(long, default_value_t = 0)]
    ordering_keys: u64,

    /// Concurrent streaming-pull consumers
    #[arg(long, default_value_t = 4)]
    consumers: usize,

    /// Percent of deliveries nacked instead of acked
    #[arg(long, default_value_t = 5)]
    nack_percent: u64,

    /// Percent of batches after which the consumer drops its stream
    #[arg(long, default_value_t = 1)]
    drop_percent: u64,

    /// Enable exactly-once delivery on the subscription
    #[arg(long)]
    exactly_once: bool,

    /// Seconds to run before stopping, even if the backlog is not drained
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

/// Deterministic per-delivery dice roll in 0..100.
fn roll(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    (z ^ (z >> 31)) % 100
}

fn seed_of(consumer: usize, message: &ReceivedMessage) -> u64 {
    message.message.offset ^ (u64::from(message.delivery_attempt) << 40) ^ ((consumer as u64) << 56)
}

async fn consume(broker: Arc<Broker>, consumer: usize, args: Arc<Args>) -> Result<u64> {
    let mut acked = 0u64;
    let mut stream_no = 0u64;
    loop {
        let request = StreamingPullRequest::new("soak")
            .with_client_id(format!("consumer-{consumer}-{stream_no}"))
            .with_flow_control(FlowControl::new(500, 16 * 1024 * 1024));
        let mut stream = match broker.streaming_pull(request) {
            Err(courier::Error::SubscriptionNotFound(_)) => return Ok(acked),
            other => other.context("Failed to open streaming pull")?,
        };
        stream_no += 1;

        loop {
            let Some(batch) = stream.next_messages().await else {
                return Ok(acked);
            };
            let mut ack_ids = Vec::new();
            let mut nack_ids = Vec::new();
            let mut seed = 0;
            for message in &batch {
                seed = seed_of(consumer, message);
                if roll(seed) < args.nack_percent {
                    nack_ids.push(message.ack_id.clone());
                } else {
                    ack_ids.push(message.ack_id.clone());
                }
            }
            if roll(seed.rotate_left(17)) < args.drop_percent {
                break;
            }
            acked += ack_ids.len() as u64;
            if !ack_ids.is_empty() && stream.acknowledge(ack_ids).await.is_err() {
                break;
            }
            if !nack_ids.is_empty() && stream.modify_ack_deadline(nack_ids, 0).await.is_err() {
                break;
            }
        }
        info!("consumer {consumer} dropping stream {}", stream.session_id());
        stream.disconnect().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Arc::new(Args::parse());

    let config = match &args.config {
        Some(path) => BrokerConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => BrokerConfig {
            redelivery: RedeliveryPolicy::exponential(
                Duration::from_millis(10),
                Duration::from_secs(1),
            ),
            ..BrokerConfig::default()
        },
    };
    let broker = Arc::new(Broker::with_parts(
        config,
        Arc::new(InMemoryLog::new()),
        Arc::new(QuantaClock::new()),
    )?);
    broker.create_topic("soak-topic")?;
    broker.create_topic("soak-dlq")?;

    let mut subscription = Subscription::new("soak", "soak-topic")
        .with_dead_letter_policy(DeadLetterPolicy::new("soak-dlq", 5));
    if args.ordering_keys > 0 {
        subscription = subscription.with_ordering();
    }
    if args.exactly_once {
        subscription = subscription.with_exactly_once();
    }
    broker.create_subscription(subscription)?;
    let maintenance = broker.spawn_maintenance();

    let mut consumers = Vec::new();
    for consumer in 0..args.consumers {
        consumers.push(tokio::spawn(consume(
            Arc::clone(&broker),
            consumer,
            Arc::clone(&args),
        )));
    }

    let payload = vec![0xAB; args.payload_bytes];
    for i in 0..args.messages {
        let mut request = PublishRequest::new(payload.clone());
        if args.ordering_keys > 0 {
            request = request.with_ordering_key(format!("key-{}", i % args.ordering_keys));
        }
        broker.publish("soak-topic", request)?;
    }
    info!("published {} messages", args.messages);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.timeout_secs);
    loop {
        let stats = broker.stats("soak")?;
        if stats.acked + stats.dead_lettered >= args.messages {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("timed out before the backlog drained");
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let stats = broker.stats("soak")?;
    broker.shutdown();
    broker.delete_subscription("soak")?;
    let mut acked = 0;
    for consumer in consumers {
        match consumer.await {
            Ok(Ok(count)) => acked += count,
            Ok(Err(e)) => warn!("consumer failed: {e:#}"),
            Err(e) => warn!("consumer panicked: {e}"),
        }
    }
    maintenance.abort();

    println!("{}", stats.summary());
    println!(
        "Consumer acks sent: {}, Redelivery ratio: {:.3}",
        acked,
        stats.redelivery_ratio()
    );
    Ok(())
}
