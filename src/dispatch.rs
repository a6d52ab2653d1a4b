//! # Callback Dispatcher
//!
//! A fixed-size pool of worker threads that invokes subscriber callbacks
//! with decoded payloads. Transports never call user code directly: their
//! receive loops hand `(callback, document)` pairs to the dispatcher and
//! move on, so a slow or panicking subscriber cannot stall message intake.
//!
//! One worker (the default) gives per-channel callback ordering that
//! matches the adapter's delivery order; more workers trade that ordering
//! for throughput.
//!
//! Failures inside a callback are isolated per task: the worker catches the
//! panic, logs it, and keeps serving. Shutdown enqueues one poison task per
//! worker after all pending work, so in-flight deliveries complete before
//! the pool joins.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::codec::Document;
use crate::registry::{ErasedCallback, Registry, SubscriptionKey};

enum Task {
    Deliver {
        callback: Arc<ErasedCallback>,
        payload: Document,
    },
    Shutdown,
}

/// Worker pool executing subscriber callbacks.
pub struct Dispatcher {
    tx: Sender<Task>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn a pool of `workers` threads (at least one).
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = channel::unbounded::<Task>();
        let count = workers.max(1);
        let handles = (0..count)
            .map(|n| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("bus-dispatch-{n}"))
                    .spawn(move || worker_loop(rx))
                    .expect("failed to spawn dispatcher worker")
            })
            .collect();
        Self {
            tx,
            workers: Mutex::new(handles),
        }
    }

    /// Enqueue one delivery.
    pub(crate) fn submit(&self, callback: Arc<ErasedCallback>, payload: Document) {
        let _ = self.tx.send(Task::Deliver { callback, payload });
    }

    /// Drain pending deliveries, then stop and join every worker.
    /// Idempotent: a second call finds no workers left to join.
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock();
        for _ in workers.iter() {
            let _ = self.tx.send(Task::Shutdown);
        }
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: Receiver<Task>) {
    while let Ok(task) = rx.recv() {
        match task {
            Task::Deliver { callback, payload } => {
                let outcome = catch_unwind(AssertUnwindSafe(|| (*callback)(payload)));
                if outcome.is_err() {
                    error!("subscriber callback panicked; dispatch loop continues");
                }
            }
            Task::Shutdown => {
                debug!("dispatcher worker received shutdown");
                break;
            }
        }
    }
}

/// The surface handed to transport adapters for delivering received
/// messages into the subscriber registry.
///
/// Adapters that learn the matched subscription from their broker (e.g. a
/// pattern name on the wire) use [`dispatch_key`](Self::dispatch_key);
/// adapters that only know the exact channel use
/// [`dispatch_channel`](Self::dispatch_channel), which performs local
/// pattern matching. The synchronous variant exists for adapters that
/// dispatch inline on the publisher's thread.
#[derive(Clone)]
pub struct DispatchHandle {
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
}

impl DispatchHandle {
    pub(crate) fn new(registry: Arc<Registry>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            registry,
            dispatcher,
        }
    }

    /// Deliver to exactly one subscription bucket. Returns the number of
    /// callbacks enqueued.
    pub fn dispatch_key(&self, key: &SubscriptionKey, payload: &Document) -> usize {
        let listeners = self.registry.lookup(key);
        if listeners.is_empty() {
            debug!(channel = %key.channel, pattern = key.pattern, "no listeners for received message");
            return 0;
        }
        for listener in &listeners {
            self.dispatcher
                .submit(listener.callback.clone(), payload.clone());
        }
        listeners.len()
    }

    /// Deliver to the exact bucket of `channel` plus every matching pattern
    /// bucket. Returns the number of callbacks enqueued.
    pub fn dispatch_channel(&self, channel: &str, payload: &Document) -> usize {
        let listeners = self.registry.matching(channel);
        for listener in &listeners {
            self.dispatcher
                .submit(listener.callback.clone(), payload.clone());
        }
        listeners.len()
    }

    /// Invoke matching callbacks inline on the calling thread, with the same
    /// per-callback failure isolation as the worker pool.
    pub fn dispatch_channel_sync(&self, channel: &str, payload: &Document) -> usize {
        let listeners = self.registry.matching(channel);
        for listener in &listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| (*listener.callback)(payload.clone())));
            if outcome.is_err() {
                error!(channel, "subscriber callback panicked during synchronous dispatch");
            }
        }
        listeners.len()
    }

    /// Number of deliveries a publish on `channel` would cause right now.
    pub fn match_count(&self, channel: &str) -> usize {
        self.registry.match_count(channel)
    }

    /// Currently subscribed keys, for adapters that replay external
    /// subscriptions when their receive loop starts.
    pub fn subscribed_keys(&self) -> Vec<SubscriptionKey> {
        self.registry.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ListenerId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn wait_for(mut probe: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !probe() {
            assert!(std::time::Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Test that submitted deliveries reach the callback on a worker thread.
    #[test]
    fn test_delivery_reaches_callback() {
        let dispatcher = Dispatcher::new(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let cb: Arc<ErasedCallback> = Arc::new(move |_doc| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.submit(cb, Document::from(serde_json::Value::Null));
        wait_for(|| hits.load(Ordering::SeqCst) == 1);
        dispatcher.shutdown();
    }

    /// Test that a panicking callback does not take the worker down.
    #[test]
    fn test_panic_isolation() {
        let dispatcher = Dispatcher::new(1);
        let hits = Arc::new(AtomicUsize::new(0));

        let panicking: Arc<ErasedCallback> = Arc::new(|_doc| panic!("listener exploded"));
        let hits2 = hits.clone();
        let counting: Arc<ErasedCallback> = Arc::new(move |_doc| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.submit(panicking, Document::from(serde_json::Value::Null));
        dispatcher.submit(counting, Document::from(serde_json::Value::Null));

        wait_for(|| hits.load(Ordering::SeqCst) == 1);
        dispatcher.shutdown();
    }

    /// Test that shutdown lets queued deliveries finish first.
    #[test]
    fn test_shutdown_drains_pending_work() {
        let dispatcher = Dispatcher::new(1);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let hits2 = hits.clone();
            let cb: Arc<ErasedCallback> = Arc::new(move |_doc| {
                hits2.fetch_add(1, Ordering::SeqCst);
            });
            dispatcher.submit(cb, Document::from(serde_json::Value::Null));
        }
        dispatcher.shutdown();
        assert_eq!(hits.load(Ordering::SeqCst), 16);
    }

    /// Test dispatch through the handle: exact and pattern buckets.
    #[test]
    fn test_handle_channel_dispatch() {
        let registry = Arc::new(Registry::new());
        let dispatcher = Arc::new(Dispatcher::new(1));
        let handle = DispatchHandle::new(registry.clone(), dispatcher.clone());

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        registry.add(
            ListenerId::next(),
            SubscriptionKey::exact("demo.Event"),
            Arc::new(move |_doc| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let hits3 = hits.clone();
        registry.add(
            ListenerId::next(),
            SubscriptionKey::pattern("demo.*"),
            Arc::new(move |_doc| {
                hits3.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let enqueued = handle.dispatch_channel("demo.Event", &Document::from(serde_json::Value::Null));
        assert_eq!(enqueued, 2);
        wait_for(|| hits.load(Ordering::SeqCst) == 2);
        dispatcher.shutdown();
    }
}
