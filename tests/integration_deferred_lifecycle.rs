//! Lifecycle scenarios for the process-wide bus: deferred registration
//! before `init`, the not-set failure modes, and shutdown idempotence.
//!
//! These tests share the process-wide bus, so they serialize on a lock and
//! leave the bus shut down behind them.

use std::time::Duration;

use anyhow::Result;
use crossbeam::channel;
use parking_lot::{Mutex, MutexGuard};

use omnibus::transport::LocalConfig;
use omnibus::BusError;

static BUS_LOCK: Mutex<()> = Mutex::new(());

/// Serialize the tests in this file and guarantee a clean slate.
fn exclusive_bus() -> MutexGuard<'static, ()> {
    let guard = BUS_LOCK.lock();
    omnibus::shutdown();
    guard
}

/// Verify a subscription issued before `init` is buffered and delivered
/// once the bus is bound.
#[test]
fn deferred_subscribe_applies_at_bind() -> Result<()> {
    let _guard = exclusive_bus();

    let (tx, rx) = channel::unbounded();
    omnibus::subscribe_on("early", move |event: String| {
        let _ = tx.send(event);
    })?;

    omnibus::init(LocalConfig::default())?;
    omnibus::publish_on("early", &"hello".to_string())?;

    assert_eq!(rx.recv_timeout(Duration::from_secs(1))?, "hello");

    omnibus::shutdown();
    Ok(())
}

/// Verify an exposure issued before `init` answers stubs once bound.
#[test]
fn deferred_expose_applies_at_bind() -> Result<()> {
    let _guard = exclusive_bus();

    omnibus::expose_on("deferred_fn", |n: i64| n + 1)?;
    omnibus::init(LocalConfig::default())?;

    let stub = omnibus::stub::<(i64,), i64>("deferred_fn", Some(Duration::from_secs(2)))?;
    assert_eq!(stub.call((41,))?, Some(42));

    omnibus::shutdown();
    Ok(())
}

/// Verify the unbound failure modes: publish is a warned no-op, stub and
/// queue refuse, unsubscribe of an unknown token is silent.
#[test]
fn unbound_bus_failure_modes() -> Result<()> {
    let _guard = exclusive_bus();

    assert_eq!(omnibus::publish_on("nowhere", &1u32)?, None);
    assert!(matches!(
        omnibus::stub::<(), i64>("missing", None),
        Err(BusError::NotSet)
    ));
    assert!(matches!(
        omnibus::queue::<u32>("missing"),
        Err(BusError::NotSet)
    ));

    // A deferred registration can be withdrawn before bind; withdrawing it
    // twice (or a token that never existed) is silent.
    let id = omnibus::subscribe_on("early", |_n: u32| {})?;
    omnibus::unsubscribe(id);
    omnibus::unsubscribe(id);

    let bus = omnibus::init(LocalConfig::default())?;
    assert_eq!(bus.publish_on("early", &1u32)?, Some(0));

    omnibus::shutdown();
    Ok(())
}

/// Verify double init is rejected, shutdown is idempotent, and a new bus
/// can be bound after shutdown.
#[test]
fn init_shutdown_cycle() -> Result<()> {
    let _guard = exclusive_bus();

    omnibus::init(LocalConfig::default())?;
    assert!(matches!(
        omnibus::init(LocalConfig::default()),
        Err(BusError::AlreadyInitialized)
    ));

    omnibus::shutdown();
    omnibus::shutdown();

    // Rebinding after shutdown starts from a clean slate.
    let bus = omnibus::init(LocalConfig::default())?;
    assert_eq!(bus.publish_on("fresh", &1u32)?, Some(0));

    omnibus::shutdown();
    Ok(())
}

/// Verify the lazy topic handle: a no-op before bind, delegating after.
#[test]
fn lazy_topic_handle() -> Result<()> {
    let _guard = exclusive_bus();

    let topic = omnibus::topic("announcements");
    assert_eq!(topic.publish(&"ignored".to_string())?, None);

    let (tx, rx) = channel::unbounded();
    topic.subscribe(move |event: String| {
        let _ = tx.send(event);
    })?;

    omnibus::init(LocalConfig::default())?;

    // The same handle now reaches the bound adapter.
    assert_eq!(topic.publish(&"heard".to_string())?, Some(1));
    assert_eq!(rx.recv_timeout(Duration::from_secs(1))?, "heard");

    omnibus::shutdown();
    Ok(())
}

/// Verify start can be decoupled from init.
#[test]
fn init_without_start_then_start() -> Result<()> {
    let _guard = exclusive_bus();

    let (tx, rx) = channel::unbounded();
    omnibus::subscribe_on("later", move |event: String| {
        let _ = tx.send(event);
    })?;

    omnibus::init_without_start(LocalConfig::default())?;
    omnibus::publish_on("later", &"queued".to_string())?;

    // Nothing dispatches until the receive loop runs.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    omnibus::start()?;
    assert_eq!(rx.recv_timeout(Duration::from_secs(1))?, "queued");

    omnibus::shutdown();
    Ok(())
}

/// Verify a deferred double exposure is refused up front.
#[test]
fn deferred_expose_conflict() -> Result<()> {
    let _guard = exclusive_bus();

    omnibus::expose_on("conflicted", |n: i64| n)?;
    assert!(matches!(
        omnibus::expose_on("conflicted", |n: i64| n),
        Err(BusError::AlreadyExposed(_))
    ));

    omnibus::unexpose("conflicted");
    omnibus::expose_on("conflicted", |n: i64| n * 2)?;

    omnibus::init(LocalConfig::default())?;
    let stub = omnibus::stub::<(i64,), i64>("conflicted", Some(Duration::from_secs(2)))?;
    assert_eq!(stub.call((21,))?, Some(42));

    omnibus::shutdown();
    Ok(())
}
