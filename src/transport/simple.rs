//! # Simple In-Process Transport
//!
//! The minimal illustration of the adapter contract: `publish` invokes the
//! matching subscriber callbacks synchronously on the publisher's thread,
//! and queues are plain in-memory FIFOs. There is no event loop to speak
//! of; `run` just parks until `close`.
//!
//! Useful for unit tests and for single-threaded applications that want
//! bus semantics without background threads. Anything that needs
//! publisher/subscriber decoupling should use
//! [`LocalTransport`](crate::transport::LocalTransport) instead.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::codec::Document;
use crate::dispatch::DispatchHandle;
use crate::error::TransportError;
use crate::queue::{QueueBackend, QueueTable};
use crate::transport::{Transport, TransportFactory};

/// Factory for [`SimpleTransport`].
#[derive(Debug, Clone, Default)]
pub struct SimpleConfig;

impl TransportFactory for SimpleConfig {
    fn create(&self, dispatch: DispatchHandle) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(SimpleTransport::new(dispatch)))
    }
}

/// Synchronous in-process adapter.
pub struct SimpleTransport {
    dispatch: DispatchHandle,
    queues: Arc<QueueTable>,
    closed: Mutex<bool>,
    closing: Condvar,
}

impl SimpleTransport {
    pub fn new(dispatch: DispatchHandle) -> Self {
        Self {
            dispatch,
            queues: QueueTable::new(),
            closed: Mutex::new(false),
            closing: Condvar::new(),
        }
    }
}

impl Transport for SimpleTransport {
    fn run(&self) {
        // Nothing to receive: delivery happens inline in publish. Park the
        // dispatch thread until close so the lifecycle matches the contract.
        let mut closed = self.closed.lock();
        while !*closed {
            self.closing.wait(&mut closed);
        }
        debug!("simple transport run loop released");
    }

    fn close(&self) {
        let mut closed = self.closed.lock();
        if !*closed {
            *closed = true;
            self.closing.notify_all();
        }
    }

    fn publish(&self, channel: &str, payload: Document) -> Result<Option<usize>, TransportError> {
        let delivered = self.dispatch.dispatch_channel_sync(channel, &payload);
        Ok(Some(delivered))
    }

    fn subscribe(&self, _channel: &str, _pattern: bool, _first: bool) -> Result<(), TransportError> {
        // Routing happens directly off the registry.
        Ok(())
    }

    fn unsubscribe(&self, _channel: &str, _pattern: bool, _last: bool) -> Result<(), TransportError> {
        Ok(())
    }

    fn queue(&self, name: &str) -> Result<Arc<dyn QueueBackend>, TransportError> {
        Ok(self.queues.open(name))
    }
}
