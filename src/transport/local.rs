//! # Local In-Process Transport
//!
//! The full-featured in-process adapter: `publish` enqueues onto an internal
//! event loop which the bus's dispatch thread drains, handing deliveries to
//! the callback worker pool. Publishers never run subscriber code, messages
//! on one channel keep their FIFO order, and a poison message interrupts the
//! loop on `close`.
//!
//! Pattern subscriptions are matched locally with the channel glob syntax.
//! Queues are shared in-memory FIFOs, idempotent by name.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::debug;

use crate::codec::Document;
use crate::dispatch::DispatchHandle;
use crate::error::TransportError;
use crate::queue::{QueueBackend, QueueTable};
use crate::transport::{Transport, TransportFactory};

/// Factory for [`LocalTransport`].
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Callback worker threads for the bus dispatcher.
    pub workers: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

impl TransportFactory for LocalConfig {
    fn create(&self, dispatch: DispatchHandle) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(LocalTransport::new(dispatch)))
    }

    fn dispatch_workers(&self) -> usize {
        self.workers
    }
}

enum LoopEvent {
    Publish { channel: String, payload: Document },
    Poison,
}

/// Threaded in-process adapter.
pub struct LocalTransport {
    dispatch: DispatchHandle,
    tx: Sender<LoopEvent>,
    rx: Receiver<LoopEvent>,
    queues: Arc<QueueTable>,
    closed: AtomicBool,
}

impl LocalTransport {
    pub fn new(dispatch: DispatchHandle) -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            dispatch,
            tx,
            rx,
            queues: QueueTable::new(),
            closed: AtomicBool::new(false),
        }
    }
}

impl Transport for LocalTransport {
    fn run(&self) {
        debug!("local transport event loop starting");
        while let Ok(event) = self.rx.recv() {
            match event {
                LoopEvent::Publish { channel, payload } => {
                    self.dispatch.dispatch_channel(&channel, &payload);
                }
                LoopEvent::Poison => {
                    debug!("event loop received poison, breaking loop");
                    break;
                }
            }
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(LoopEvent::Poison);
        }
    }

    fn publish(&self, channel: &str, payload: Document) -> Result<Option<usize>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        // Count at publish time: exactly the subscribers registered before
        // this publish will be reached by the loop.
        let recipients = self.dispatch.match_count(channel);
        self.tx
            .send(LoopEvent::Publish {
                channel: channel.to_string(),
                payload,
            })
            .map_err(|_| TransportError::Closed)?;
        Ok(Some(recipients))
    }

    fn subscribe(&self, _channel: &str, _pattern: bool, _first: bool) -> Result<(), TransportError> {
        // Routing happens off the registry; no external state to keep.
        Ok(())
    }

    fn unsubscribe(&self, _channel: &str, _pattern: bool, _last: bool) -> Result<(), TransportError> {
        Ok(())
    }

    fn queue(&self, name: &str) -> Result<Arc<dyn QueueBackend>, TransportError> {
        Ok(self.queues.open(name))
    }
}
