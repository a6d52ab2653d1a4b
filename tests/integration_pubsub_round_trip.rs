//! End-to-end publish/subscribe scenarios over the in-process transports.

use std::time::Duration;

use anyhow::Result;
use crossbeam::channel;
use serde::{Deserialize, Serialize};

use omnibus::transport::{LocalConfig, SimpleConfig};
use omnibus::EventBus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SimpleEvent {
    source: String,
}

/// Verify a typed subscriber receives a typed publish on the derived
/// channel within the delivery deadline.
#[test]
fn typed_publish_reaches_typed_subscriber() -> Result<()> {
    let bus = EventBus::create(&LocalConfig::default())?;
    bus.start();

    let (tx, rx) = channel::unbounded();
    bus.subscribe(move |event: SimpleEvent| {
        let _ = tx.send(event);
    })?;

    let recipients = bus.publish(&SimpleEvent {
        source: "unittest".into(),
    })?;
    assert_eq!(recipients, Some(1));

    let received = rx.recv_timeout(Duration::from_secs(2))?;
    assert_eq!(received.source, "unittest");

    bus.shutdown();
    Ok(())
}

/// Verify channel routing: subscribers only see their own channel.
#[test]
fn channel_routing_is_exact() -> Result<()> {
    let bus = EventBus::create(&LocalConfig::default())?;
    bus.start();

    let (tx_a, rx_a) = channel::unbounded();
    let (tx_b, rx_b) = channel::unbounded();
    bus.subscribe_on("channel/1", move |event: String| {
        let _ = tx_a.send(event);
    })?;
    bus.subscribe_on("channel/2", move |event: String| {
        let _ = tx_b.send(event);
    })?;

    bus.publish_on("channel/1", &"e1".to_string())?;
    bus.publish_on("channel/2", &"e2".to_string())?;

    assert_eq!(rx_a.recv_timeout(Duration::from_secs(2))?, "e1");
    assert_eq!(rx_b.recv_timeout(Duration::from_secs(2))?, "e2");
    assert!(rx_a.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(rx_b.recv_timeout(Duration::from_millis(100)).is_err());

    bus.shutdown();
    Ok(())
}

/// Verify pattern subscribers receive documents for every matching channel
/// alongside the exact subscribers.
#[test]
fn pattern_subscriber_observes_matching_channels() -> Result<()> {
    let bus = EventBus::create(&LocalConfig::default())?;
    bus.start();

    let (tx, rx) = channel::unbounded();
    bus.subscribe_pattern("news.*", move |doc| {
        let _ = tx.send(doc.decode::<String>().unwrap_or_default());
    })?;

    let (tx_exact, rx_exact) = channel::unbounded();
    bus.subscribe_on("news.sport", move |event: String| {
        let _ = tx_exact.send(event);
    })?;

    let recipients = bus.publish_on("news.sport", &"goal".to_string())?;
    assert_eq!(recipients, Some(2));

    assert_eq!(rx.recv_timeout(Duration::from_secs(2))?, "goal");
    assert_eq!(rx_exact.recv_timeout(Duration::from_secs(2))?, "goal");

    let recipients = bus.publish_on("weather.today", &"rain".to_string())?;
    assert_eq!(recipients, Some(0));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    bus.shutdown();
    Ok(())
}

/// Verify that registering the same callback twice yields one delivery per
/// registration, and removal is per token.
#[test]
fn duplicate_subscription_delivers_per_registration() -> Result<()> {
    let bus = EventBus::create(&SimpleConfig)?;
    bus.start();

    let (tx, rx) = channel::unbounded();
    let make_cb = |tx: channel::Sender<u32>| move |n: u32| {
        let _ = tx.send(n);
    };
    let first = bus.subscribe_on("dup", make_cb(tx.clone()))?;
    let _second = bus.subscribe_on("dup", make_cb(tx.clone()))?;

    assert_eq!(bus.publish_on("dup", &1u32)?, Some(2));
    assert_eq!(rx.try_iter().count(), 2);

    bus.unsubscribe(first);
    assert_eq!(bus.publish_on("dup", &2u32)?, Some(1));
    assert_eq!(rx.try_iter().count(), 1);

    bus.shutdown();
    Ok(())
}

/// Verify that a panicking subscriber does not prevent delivery to the
/// subscribers registered after it.
#[test]
fn failing_subscriber_is_isolated() -> Result<()> {
    let bus = EventBus::create(&LocalConfig::default())?;
    bus.start();

    bus.subscribe_on("fragile", |_n: u32| panic!("listener exploded"))?;
    let (tx, rx) = channel::unbounded();
    bus.subscribe_on("fragile", move |n: u32| {
        let _ = tx.send(n);
    })?;

    bus.publish_on("fragile", &7u32)?;
    assert_eq!(rx.recv_timeout(Duration::from_secs(2))?, 7);

    bus.publish_on("fragile", &8u32)?;
    assert_eq!(rx.recv_timeout(Duration::from_secs(2))?, 8);

    bus.shutdown();
    Ok(())
}

/// Verify per-channel delivery order over the event-loop transport.
#[test]
fn per_channel_order_is_preserved() -> Result<()> {
    let bus = EventBus::create(&LocalConfig::default())?;
    bus.start();

    let (tx, rx) = channel::unbounded();
    bus.subscribe_on("ordered", move |n: u32| {
        let _ = tx.send(n);
    })?;

    for n in 0..32u32 {
        bus.publish_on("ordered", &n)?;
    }
    for expected in 0..32u32 {
        assert_eq!(rx.recv_timeout(Duration::from_secs(2))?, expected);
    }

    bus.shutdown();
    Ok(())
}
