//! Cross-bus scenarios through the hub transport: two independently bound
//! buses talking through one in-process hub server, exactly as two
//! processes would.

use std::time::Duration;

use anyhow::Result;
use crossbeam::channel;
use serde::{Deserialize, Serialize};

use omnibus::transport::{HubConfig, HubServer};
use omnibus::{EventBus, QueueError, RpcError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EchoCommand {
    param: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EchoResponse {
    result: String,
}

struct HubPair {
    server: HubServer,
    publisher: EventBus,
    consumer: EventBus,
}

fn hub_pair() -> Result<HubPair> {
    let server = HubServer::bind("127.0.0.1:0")?;
    let config = HubConfig::new(server.addr().to_string());

    let publisher = EventBus::create(&config)?;
    publisher.start();
    let consumer = EventBus::create(&config)?;
    consumer.start();

    Ok(HubPair {
        server,
        publisher,
        consumer,
    })
}

impl HubPair {
    fn teardown(self) {
        self.publisher.shutdown();
        self.consumer.shutdown();
        self.server.shutdown();
    }
}

/// Verify a typed event published on one bus reaches a typed subscriber
/// on another bus through the hub.
#[test]
fn cross_bus_typed_publish() -> Result<()> {
    let pair = hub_pair()?;

    let (tx, rx) = channel::unbounded();
    pair.consumer.subscribe(move |event: EchoCommand| {
        let _ = tx.send(event);
    })?;

    let recipients = pair.publisher.publish(&EchoCommand {
        param: "across".into(),
    })?;
    assert_eq!(recipients, Some(1));

    let received = rx.recv_timeout(Duration::from_secs(2))?;
    assert_eq!(received.param, "across");

    pair.teardown();
    Ok(())
}

/// Verify the external-subscription invariant: many local subscribers on
/// one channel amount to one hub subscription, and zero after they all
/// leave.
#[test]
fn external_subscription_count_invariant() -> Result<()> {
    let pair = hub_pair()?;

    let mut tokens = Vec::new();
    for _ in 0..3 {
        let (tx, _rx) = channel::unbounded();
        tokens.push(pair.consumer.subscribe_on("fanin", move |n: u32| {
            let _ = tx.send(n);
        })?);
    }

    // Three local callbacks, one hub subscription: count is 1.
    assert_eq!(pair.publisher.publish_on("fanin", &1u32)?, Some(1));

    for token in tokens {
        pair.consumer.unsubscribe(token);
    }
    assert_eq!(pair.publisher.publish_on("fanin", &2u32)?, Some(0));

    pair.teardown();
    Ok(())
}

/// Verify pattern subscriptions match on the hub and deliver with the
/// pattern routing key.
#[test]
fn pattern_subscription_over_hub() -> Result<()> {
    let pair = hub_pair()?;

    let (tx, rx) = channel::unbounded();
    pair.consumer.subscribe_pattern("news.*", move |doc| {
        let _ = tx.send(doc.decode::<String>().unwrap_or_default());
    })?;

    assert_eq!(
        pair.publisher.publish_on("news.sport", &"goal".to_string())?,
        Some(1)
    );
    assert_eq!(rx.recv_timeout(Duration::from_secs(2))?, "goal");

    assert_eq!(
        pair.publisher.publish_on("weather.today", &"rain".to_string())?,
        Some(0)
    );
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    pair.teardown();
    Ok(())
}

/// Verify the full RPC round trip between two buses, including the
/// no-remote probe afterwards.
#[test]
fn cross_bus_rpc_round_trip() -> Result<()> {
    let pair = hub_pair()?;

    pair.consumer.expose_on("echo", |cmd: EchoCommand| EchoResponse {
        result: format!("Hello {}!", cmd.param),
    })?;

    let stub = pair
        .publisher
        .stub::<(EchoCommand,), EchoResponse>("echo", Some(Duration::from_secs(2)));
    let response = stub.call((EchoCommand {
        param: "unittest".into(),
    },))?;
    assert_eq!(
        response,
        Some(EchoResponse {
            result: "Hello unittest!".into()
        })
    );

    pair.consumer.unexpose("echo");
    assert_eq!(stub.call((EchoCommand { param: "gone".into() },))?, None);
    assert!(matches!(
        stub.rpc((EchoCommand { param: "gone".into() },)),
        Err(RpcError::NoSuchRemote(_))
    ));

    pair.teardown();
    Ok(())
}

/// Verify shared queues across buses: FIFO handoff, sizes, and free.
#[test]
fn cross_bus_queue_handoff() -> Result<()> {
    let pair = hub_pair()?;

    let producer = pair.publisher.queue::<EchoCommand>("work.incoming")?;
    let consumer = pair.consumer.queue::<EchoCommand>("work.incoming")?;

    for n in 0..4 {
        producer.put(&EchoCommand {
            param: format!("job-{n}"),
        })?;
    }
    assert_eq!(consumer.qsize()?, 4);

    for n in 0..4 {
        let job = consumer.get(Some(Duration::from_secs(2)))?;
        assert_eq!(job.param, format!("job-{n}"));
    }
    assert!(matches!(consumer.get_nowait(), Err(QueueError::Empty)));

    producer.put(&EchoCommand { param: "junk".into() })?;
    producer.free()?;
    assert_eq!(consumer.qsize()?, 0);

    pair.teardown();
    Ok(())
}

/// Verify a consumer blocked on a hub queue wakes when another bus
/// delivers.
#[test]
fn blocked_hub_get_wakes_on_remote_put() -> Result<()> {
    let pair = hub_pair()?;

    let consumer = pair.consumer.queue::<u32>("handoff")?;
    let producer = pair.publisher.queue::<u32>("handoff")?;

    let feeder = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        producer.put(&99)
    });

    assert_eq!(consumer.get(Some(Duration::from_secs(2)))?, 99);
    feeder.join().expect("producer thread")?;

    pair.teardown();
    Ok(())
}

/// Verify blocking puts are refused by the hub transport.
#[test]
fn hub_blocking_put_not_implemented() -> Result<()> {
    let pair = hub_pair()?;

    let queue = pair.publisher.queue::<u32>("nopush")?;
    assert!(matches!(
        queue.put_blocking(&1, Some(Duration::from_millis(10))),
        Err(QueueError::NotImplemented(_))
    ));

    pair.teardown();
    Ok(())
}
