//! Shared work queue semantics over the in-process transports.

use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use omnibus::transport::LocalConfig;
use omnibus::{EventBus, QueueError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Job {
    id: u64,
    payload: String,
}

fn queue_bus() -> Result<EventBus> {
    let bus = EventBus::create(&LocalConfig::default())?;
    bus.start();
    Ok(bus)
}

/// Verify FIFO ordering: gets return exactly the put sequence.
#[test]
fn queue_is_fifo() -> Result<()> {
    let bus = queue_bus()?;
    let queue = bus.queue::<Job>("jobs")?;

    for id in 0..8 {
        queue.put(&Job {
            id,
            payload: format!("job-{id}"),
        })?;
    }
    assert_eq!(queue.qsize()?, 8);

    for id in 0..8 {
        let job = queue.get(Some(Duration::from_secs(1)))?;
        assert_eq!(job.id, id);
    }
    assert!(queue.empty()?);

    bus.shutdown();
    Ok(())
}

/// Verify two handles with equal name address the same FIFO.
#[test]
fn equal_names_share_the_fifo() -> Result<()> {
    let bus = queue_bus()?;
    let producer = bus.queue::<String>("shared")?;
    let consumer = bus.queue::<String>("shared")?;

    producer.put(&"item".to_string())?;
    assert_eq!(consumer.get_nowait()?, "item");

    bus.shutdown();
    Ok(())
}

/// Verify the timed-get boundary behavior: a 1 s timeout returns Empty
/// within tolerance, a non-blocking probe immediately.
#[test]
fn get_timeout_boundaries() -> Result<()> {
    let bus = queue_bus()?;
    let queue = bus.queue::<String>("empty")?;

    let started = Instant::now();
    assert!(matches!(
        queue.get(Some(Duration::from_secs(1))),
        Err(QueueError::Empty)
    ));
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(900), "waited only {waited:?}");
    assert!(waited <= Duration::from_millis(1300), "waited {waited:?}");

    let started = Instant::now();
    assert!(matches!(queue.get_nowait(), Err(QueueError::Empty)));
    assert!(started.elapsed() <= Duration::from_millis(300));

    bus.shutdown();
    Ok(())
}

/// Verify a blocked consumer wakes when a producer thread delivers.
#[test]
fn blocked_get_wakes_on_put() -> Result<()> {
    let bus = queue_bus()?;
    let consumer = bus.queue::<u32>("handoff")?;
    let producer = bus.queue::<u32>("handoff")?;

    let feeder = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        producer.put(&42)
    });

    assert_eq!(consumer.get(Some(Duration::from_secs(2)))?, 42);
    feeder.join().expect("producer thread")?;

    bus.shutdown();
    Ok(())
}

/// Verify free destroys the backing FIFO; a later handle starts fresh.
#[test]
fn free_destroys_backing_fifo() -> Result<()> {
    let bus = queue_bus()?;
    let queue = bus.queue::<u32>("doomed")?;
    queue.put(&1)?;
    queue.free()?;

    let fresh = bus.queue::<u32>("doomed")?;
    assert!(matches!(fresh.get_nowait(), Err(QueueError::Empty)));

    bus.shutdown();
    Ok(())
}
