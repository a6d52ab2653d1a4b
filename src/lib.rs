//! # Omnibus
//!
//! A broker-agnostic, message-oriented middleware library unifying three
//! interaction primitives behind one application-facing API, over pluggable
//! transports:
//!
//! - **Publish/subscribe** on string channels, with channel names derived
//!   from payload types or given explicitly, and glob pattern subscriptions.
//! - **Named work queues**: shared FIFOs with blocking, non-blocking and
//!   timed operations.
//! - **Request/response RPC** built from the other two: requests fan out
//!   over pub/sub, responses return over ephemeral reply queues.
//!
//! Payloads travel as self-describing documents (see [`codec`]), so any
//! serde-serializable type works as an event, queue item, RPC argument or
//! RPC result, on every transport.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::time::Duration;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct TaskDone {
//!     task: String,
//! }
//!
//! fn hello(name: String) -> String {
//!     format!("Hello {name}!")
//! }
//!
//! fn main() -> Result<(), omnibus::BusError> {
//!     // Register interest before or after binding a transport.
//!     omnibus::subscribe(|event: TaskDone| println!("done: {}", event.task))?;
//!     omnibus::expose_on("hello", hello)?;
//!
//!     // Bind the in-process transport and start dispatching.
//!     omnibus::init(omnibus::transport::LocalConfig::default())?;
//!
//!     omnibus::publish(&TaskDone { task: "build".into() })?;
//!
//!     let hello = omnibus::stub::<(String,), String>("hello", Some(Duration::from_secs(2)))?;
//!     assert_eq!(hello.call(("world".into(),)).unwrap().as_deref(), Some("Hello world!"));
//!
//!     omnibus::shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Transports
//!
//! The same API runs over every [`transport::Transport`] implementation:
//!
//! - [`transport::SimpleTransport`]: synchronous in-process dispatch.
//! - [`transport::LocalTransport`]: in-process event loop plus callback
//!   worker pool.
//! - [`transport::HubTransport`]: cross-process pub/sub and shared queues
//!   through a central [`transport::HubServer`].
//!
//! ## Lifecycle
//!
//! The process-wide bus is bound with [`init`] and torn down with
//! [`shutdown`]. `subscribe` and `expose` issued before `init` are buffered
//! and applied at bind time in order; `publish` before `init` is a warned
//! no-op; `queue` and `stub` require a bound bus. Library consumers that
//! want to avoid process-wide state use [`EventBus`] directly.

pub mod bus;
pub mod channel;
pub mod codec;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod queue;
pub mod registry;
pub mod rpc;
pub mod transport;

pub use bus::{
    expose, expose_on, init, init_without_start, publish, publish_on, queue, shutdown, start,
    stub, stub_multi, subscribe, subscribe_on, subscribe_pattern, topic, topic_pattern,
    unexpose, unsubscribe, EventBus, Topic,
};
pub use codec::{decode_any, fullname, register_type, register_type_as, AnyValue, Document};
pub use error::{
    BusError, CodecError, QueueError, RemoteInvocationError, RpcError, TransportError,
};
pub use queue::{Queue, QueueBackend};
pub use registry::{ListenerId, SubscriptionKey};
pub use rpc::{remote_name, RpcRequest, RpcResponse, Stub};
pub use transport::{Transport, TransportFactory};

/// The current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
