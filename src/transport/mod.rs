//! # Transport Adapter Contract
//!
//! This module defines the narrow surface a transport must implement for the
//! bus core to run on top of it, and ships the in-tree adapters:
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │   Application   │───▶│    EventBus      │───▶│    Transport    │
//! │  publish / rpc  │    │ registry + codec │    │ (simple/local/  │
//! │   subscribe     │    │   dispatcher     │    │      hub)       │
//! └─────────────────┘    └──────────────────┘    └─────────────────┘
//! ```
//!
//! ## Contract invariants the core relies on
//!
//! - `run` blocks until `close` is called; the core runs it on the dedicated
//!   dispatch thread. `close` must be idempotent.
//! - `publish` serializes via the document codec and returns the best-effort
//!   recipient count. `Some(n)` is required for RPC to work; adapters that
//!   genuinely cannot count return `None` and restrict themselves to
//!   non-RPC use (the stub treats `None` as the no-remote error).
//! - `subscribe`/`unsubscribe` are invoked by the core *after* the registry
//!   update, on every registration, carrying the bucket transition flags.
//!   Adapters that maintain external subscription state (a broker-side
//!   subscription) establish it exactly on the first registration of a key
//!   and tear it down exactly on the last.
//! - `queue` returns a handle for the named FIFO; handles with equal names
//!   address the same FIFO.
//!
//! Received messages enter the core through the [`DispatchHandle`] the
//! adapter was given at construction; the adapter never invokes subscriber
//! callbacks itself.

use std::sync::Arc;
use std::time::Duration;

use crate::codec::Document;
use crate::dispatch::DispatchHandle;
use crate::error::TransportError;
use crate::queue::QueueBackend;

pub mod hub;
pub mod local;
pub mod simple;

pub use hub::{HubConfig, HubServer, HubTransport};
pub use local::{LocalConfig, LocalTransport};
pub use simple::{SimpleConfig, SimpleTransport};

/// A transport adapter carrying documents between peers.
pub trait Transport: Send + Sync + 'static {
    /// Receive and dispatch messages until [`close`](Self::close) is
    /// called. Runs on the bus's dispatch thread; the thread exits when
    /// this returns.
    fn run(&self);

    /// Signal shutdown. Idempotent; unblocks a concurrent
    /// [`run`](Self::run).
    fn close(&self);

    /// Deliver `payload` to all current subscribers of `channel` and
    /// return the best-effort recipient count (see module docs for the
    /// `None` contract).
    fn publish(&self, channel: &str, payload: Document) -> Result<Option<usize>, TransportError>;

    /// A subscription for `(channel, pattern)` was added to the registry;
    /// `first` is set when this created the bucket, the transition at
    /// which an external subscription must be established.
    fn subscribe(&self, channel: &str, pattern: bool, first: bool) -> Result<(), TransportError>;

    /// A subscription for `(channel, pattern)` was removed from the
    /// registry; `last` is set when its bucket emptied, the transition at
    /// which an external subscription must be torn down.
    fn unsubscribe(&self, channel: &str, pattern: bool, last: bool) -> Result<(), TransportError>;

    /// A handle for the named FIFO.
    fn queue(&self, name: &str) -> Result<Arc<dyn QueueBackend>, TransportError>;
}

/// Constructs a bound transport for [`init`](crate::init).
///
/// Configuration types implement this (the in-tree ones are
/// [`SimpleConfig`], [`LocalConfig`] and [`HubConfig`]), so binding a bus
/// reads as `omnibus::init(LocalConfig::default())`.
pub trait TransportFactory {
    /// Build the adapter. `dispatch` is the adapter's door into the
    /// subscriber registry and the callback worker pool.
    fn create(&self, dispatch: DispatchHandle) -> Result<Arc<dyn Transport>, TransportError>;

    /// Number of callback worker threads the bus should run. One worker
    /// preserves delivery order; override for throughput.
    fn dispatch_workers(&self) -> usize {
        1
    }
}

/// Default timeout applied to connect-style operations by adapters that
/// talk to an external process.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
