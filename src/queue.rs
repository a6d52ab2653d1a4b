//! # Queue Abstraction
//!
//! A queue is a named, multi-reader/multi-writer FIFO provided by the bound
//! transport. The same blocking, non-blocking and timeout semantics apply on
//! every transport:
//!
//! - `get` returns the oldest item; it fails with [`QueueError::Empty`] when
//!   the timeout expires or when a non-blocking probe finds nothing. A
//!   timeout of `None` waits indefinitely.
//! - `put` never blocks on the in-tree transports (their queues are
//!   unbounded); transports that cannot block on put answer a blocking put
//!   with [`QueueError::NotImplemented`].
//! - Two handles with equal name address the same FIFO.
//! - `free` destroys the backing resource on transports where queues are
//!   long-lived; readers blocked at that moment simply run into their
//!   timeout.
//!
//! Applications use the typed [`Queue<T>`] facade, which moves items through
//! the document codec; adapters implement [`QueueBackend`] in terms of raw
//! documents.

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::codec::Document;
use crate::error::QueueError;

/// The transport-side face of a named FIFO.
pub trait QueueBackend: Send + Sync {
    /// Canonical (unencoded) queue name.
    fn name(&self) -> &str;

    /// Append an item. `block`/`timeout` follow the core contract; backends
    /// without blocking puts must return [`QueueError::NotImplemented`] when
    /// `block` is set.
    fn put(&self, item: Document, block: bool, timeout: Option<Duration>) -> Result<(), QueueError>;

    /// Remove and return the oldest item.
    fn get(&self, block: bool, timeout: Option<Duration>) -> Result<Document, QueueError>;

    /// Current number of items; may be approximate on remote transports.
    fn len(&self) -> Result<usize, QueueError>;

    /// Destroy the backing resource.
    fn free(&self) -> Result<(), QueueError>;
}

/// Typed application handle for a named FIFO.
pub struct Queue<T> {
    backend: Arc<dyn QueueBackend>,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Queue<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    pub(crate) fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            backend,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    /// Blocking get. `timeout` of `None` waits indefinitely; an expired
    /// timeout fails with [`QueueError::Empty`].
    pub fn get(&self, timeout: Option<Duration>) -> Result<T, QueueError> {
        let doc = self.backend.get(true, timeout)?;
        Ok(doc.decode()?)
    }

    /// Non-blocking probe; [`QueueError::Empty`] when nothing is queued.
    pub fn get_nowait(&self) -> Result<T, QueueError> {
        let doc = self.backend.get(false, None)?;
        Ok(doc.decode()?)
    }

    /// Append an item without blocking.
    pub fn put(&self, item: &T) -> Result<(), QueueError> {
        self.backend.put(Document::encode(item)?, false, None)
    }

    /// Append an item, waiting for room where the transport supports it.
    /// Transports that cannot block on put fail with
    /// [`QueueError::NotImplemented`].
    pub fn put_blocking(&self, item: &T, timeout: Option<Duration>) -> Result<(), QueueError> {
        self.backend.put(Document::encode(item)?, true, timeout)
    }

    /// Alias for [`put`](Self::put), mirroring the non-blocking get.
    pub fn put_nowait(&self, item: &T) -> Result<(), QueueError> {
        self.put(item)
    }

    /// Current queue length; approximate on remote transports.
    pub fn qsize(&self) -> Result<usize, QueueError> {
        self.backend.len()
    }

    pub fn empty(&self) -> Result<bool, QueueError> {
        Ok(self.qsize()? == 0)
    }

    /// Destroy the backing resource.
    pub fn free(&self) -> Result<(), QueueError> {
        self.backend.free()
    }
}

/// Shared state of all in-memory queues of one in-process transport.
///
/// Handles are idempotent by name: asking twice for `"jobs"` yields two
/// backends over one deque.
#[derive(Default)]
pub(crate) struct QueueTable {
    queues: Mutex<HashMap<String, Arc<MemoryQueueState>>>,
}

impl QueueTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get or create the shared state for `name` and wrap it in a backend.
    pub fn open(self: &Arc<Self>, name: &str) -> Arc<MemoryQueue> {
        let state = self
            .queues
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueueState::default()))
            .clone();
        Arc::new(MemoryQueue {
            name: name.to_string(),
            state,
            table: Arc::downgrade(self),
        })
    }

    fn forget(&self, name: &str) {
        self.queues.lock().remove(name);
    }
}

#[derive(Default)]
pub(crate) struct MemoryQueueState {
    items: Mutex<VecDeque<Document>>,
    available: Condvar,
}

/// Process-local FIFO shared by the in-process transports.
pub(crate) struct MemoryQueue {
    name: String,
    state: Arc<MemoryQueueState>,
    table: Weak<QueueTable>,
}

impl QueueBackend for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(&self, item: Document, _block: bool, _timeout: Option<Duration>) -> Result<(), QueueError> {
        // Unbounded: the blocking and non-blocking forms coincide.
        let mut items = self.state.items.lock();
        items.push_back(item);
        self.state.available.notify_one();
        Ok(())
    }

    fn get(&self, block: bool, timeout: Option<Duration>) -> Result<Document, QueueError> {
        let mut items = self.state.items.lock();
        if let Some(item) = items.pop_front() {
            return Ok(item);
        }
        if !block {
            return Err(QueueError::Empty);
        }
        match timeout {
            None => loop {
                self.state.available.wait(&mut items);
                if let Some(item) = items.pop_front() {
                    return Ok(item);
                }
            },
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    let result = self.state.available.wait_until(&mut items, deadline);
                    if let Some(item) = items.pop_front() {
                        return Ok(item);
                    }
                    if result.timed_out() {
                        return Err(QueueError::Empty);
                    }
                }
            }
        }
    }

    fn len(&self) -> Result<usize, QueueError> {
        Ok(self.state.items.lock().len())
    }

    fn free(&self) -> Result<(), QueueError> {
        debug!(queue = %self.name, "destroying in-memory queue");
        self.state.items.lock().clear();
        if let Some(table) = self.table.upgrade() {
            table.forget(&self.name);
        }
        Ok(())
    }
}
