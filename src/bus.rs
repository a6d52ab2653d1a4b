//! # Bus Core and Lifecycle
//!
//! The [`EventBus`] ties the pieces together: the subscriber registry, the
//! callback dispatcher, the RPC machinery and a bound transport adapter.
//! Its lifecycle is a one-way street:
//!
//! ```text
//! unbound ──init──▶ running ──shutdown──▶ closed
//! ```
//!
//! - `init(factory)` obtains the adapter from the factory, drains every
//!   deferred registration into it in the order given, and starts the
//!   dedicated dispatch thread that runs the adapter's receive loop. The
//!   caller never blocks.
//! - `shutdown()` closes the adapter, joins the dispatch thread, stops the
//!   worker pool and clears all registrations. It is idempotent.
//!
//! ## Global bus and deferred registration
//!
//! Most applications use the process-wide bus through the free functions
//! re-exported at the crate root. Before `init`, `subscribe` and `expose`
//! are buffered and applied at bind time; `publish` is a warned no-op
//! returning `None`; `queue` and `stub` fail with
//! [`BusError::NotSet`]; [`topic`] hands out a lazy handle that starts
//! delegating once the bus is bound. Libraries that want to avoid the
//! global can construct an explicit [`EventBus`] and use the identical
//! methods on it.
//!
//! ## Locking discipline
//!
//! The global slot and the deferred buffer live under one mutex that is
//! never held across adapter I/O (binding and closing excepted); the
//! registry, the exposed-function map and the dispatch-thread handle each
//! have their own short-lived lock inside the core.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::codec::{fullname, Document};
use crate::dispatch::{DispatchHandle, Dispatcher};
use crate::error::BusError;
use crate::queue::{Queue, QueueBackend};
use crate::registry::{ErasedCallback, ListenerId, Registry, SubscriptionKey};
use crate::rpc::{erase_remote_fn, make_skeleton, RemoteFn, RemoteHandler, RpcArgs, Stub};
use crate::transport::{Transport, TransportFactory};

/// Bound bus internals shared by handles, stubs and skeletons.
pub(crate) struct BusCore {
    transport: Arc<dyn Transport>,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    /// channel -> skeleton subscription of the exposed function.
    remote_fns: Mutex<HashMap<String, ListenerId>>,
    runner: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BusCore {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn publish_document(
        &self,
        channel: &str,
        payload: Document,
    ) -> Result<Option<usize>, BusError> {
        self.ensure_open()?;
        debug!(channel, "publishing document");
        Ok(self.transport.publish(channel, payload)?)
    }

    pub(crate) fn queue_backend(&self, name: &str) -> Result<Arc<dyn QueueBackend>, BusError> {
        self.ensure_open()?;
        Ok(self.transport.queue(name)?)
    }

    fn add_subscription(
        &self,
        id: ListenerId,
        key: SubscriptionKey,
        callback: Arc<ErasedCallback>,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        debug!(channel = %key.channel, pattern = key.pattern, "adding subscription");
        let first = self.registry.add(id, key.clone(), callback);
        if let Err(e) = self.transport.subscribe(&key.channel, key.pattern, first) {
            self.registry.remove(id);
            return Err(e.into());
        }
        Ok(())
    }

    fn remove_subscription(&self, id: ListenerId) {
        let Some((key, last)) = self.registry.remove(id) else {
            return;
        };
        if let Err(e) = self.transport.unsubscribe(&key.channel, key.pattern, last) {
            warn!(channel = %key.channel, "transport failed to drop subscription: {e}");
        }
    }

    fn expose_handler(
        self: &Arc<Self>,
        channel: String,
        handler: RemoteHandler,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        let mut remote_fns = self.remote_fns.lock();
        if remote_fns.contains_key(&channel) {
            return Err(BusError::AlreadyExposed(channel));
        }
        debug!(channel = %channel, "exposing remote function");

        let skeleton = make_skeleton(Arc::downgrade(self), channel.clone(), handler);
        let id = ListenerId::next();
        self.add_subscription(id, SubscriptionKey::exact(channel.clone()), skeleton)?;
        remote_fns.insert(channel, id);
        Ok(())
    }

    fn unexpose(&self, channel: &str) {
        let id = self.remote_fns.lock().remove(channel);
        if let Some(id) = id {
            debug!(channel, "removing exposed function");
            self.remove_subscription(id);
        }
    }

    fn start(&self) {
        let mut runner = self.runner.lock();
        if runner.is_some() || self.closed.load(Ordering::SeqCst) {
            return;
        }
        debug!("starting bus dispatch thread");
        let transport = self.transport.clone();
        let handle = std::thread::Builder::new()
            .name("bus-runner".to_string())
            .spawn(move || transport.run())
            .expect("failed to spawn bus dispatch thread");
        *runner = Some(handle);
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("stopping event bus");
        self.transport.close();
        if let Some(handle) = self.runner.lock().take() {
            let _ = handle.join();
        }
        self.dispatcher.shutdown();
        self.registry.clear();
        self.remote_fns.lock().clear();
        debug!("event bus stopped");
    }
}

/// A bound event bus.
///
/// Cheap to clone; all clones share one core. Obtained from [`init`] (which
/// also installs it as the process-wide bus) or from [`EventBus::create`]
/// for explicit, global-free use.
#[derive(Clone)]
pub struct EventBus {
    core: Arc<BusCore>,
}

impl EventBus {
    /// Bind a transport and assemble a bus around it, without touching the
    /// process-wide slot and without starting the dispatch thread yet.
    pub fn create<F: TransportFactory>(factory: &F) -> Result<EventBus, BusError> {
        let registry = Arc::new(Registry::new());
        let dispatcher = Arc::new(Dispatcher::new(factory.dispatch_workers()));
        let dispatch = DispatchHandle::new(registry.clone(), dispatcher.clone());
        let transport = factory.create(dispatch)?;
        Ok(EventBus {
            core: Arc::new(BusCore {
                transport,
                registry,
                dispatcher,
                remote_fns: Mutex::new(HashMap::new()),
                runner: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Start the dispatch thread running the adapter's receive loop.
    /// Idempotent; a no-op after shutdown.
    pub fn start(&self) {
        self.core.start();
    }

    /// Close the adapter, join the dispatch thread and clear every
    /// registration. Idempotent.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }

    /// Publish an event on the channel derived from its type.
    pub fn publish<T: Serialize + 'static>(&self, event: &T) -> Result<Option<usize>, BusError> {
        self.publish_on(&fullname::<T>(), event)
    }

    /// Publish an event on an explicit channel.
    pub fn publish_on<T: Serialize + 'static>(
        &self,
        channel: &str,
        event: &T,
    ) -> Result<Option<usize>, BusError> {
        let payload = Document::encode(event)?;
        self.core.publish_document(channel, payload)
    }

    /// Subscribe a typed callback on the channel derived from its payload
    /// type.
    pub fn subscribe<T, F>(&self, callback: F) -> Result<ListenerId, BusError>
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.subscribe_on(&fullname::<T>(), callback)
    }

    /// Subscribe a typed callback on an explicit channel.
    pub fn subscribe_on<T, F>(&self, channel: &str, callback: F) -> Result<ListenerId, BusError>
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.subscribe_erased(SubscriptionKey::exact(channel), erase_callback(callback))
    }

    /// Subscribe a raw-document callback on a channel pattern.
    pub fn subscribe_pattern<F>(&self, pattern: &str, callback: F) -> Result<ListenerId, BusError>
    where
        F: Fn(Document) + Send + Sync + 'static,
    {
        self.subscribe_erased(SubscriptionKey::pattern(pattern), Arc::new(callback))
    }

    fn subscribe_erased(
        &self,
        key: SubscriptionKey,
        callback: Arc<ErasedCallback>,
    ) -> Result<ListenerId, BusError> {
        let id = ListenerId::next();
        self.core.add_subscription(id, key, callback)?;
        Ok(id)
    }

    /// Remove one subscription. Unknown tokens are tolerated silently.
    pub fn unsubscribe(&self, id: ListenerId) {
        self.core.remove_subscription(id);
    }

    /// A publish/subscribe handle bound to `name`.
    pub fn topic(&self, name: &str) -> Topic {
        Topic {
            name: name.to_string(),
            pattern: false,
            bus: Some(self.clone()),
        }
    }

    /// A pattern-subscription handle bound to `name`.
    pub fn topic_pattern(&self, name: &str) -> Topic {
        Topic {
            name: name.to_string(),
            pattern: true,
            bus: Some(self.clone()),
        }
    }

    /// A typed handle for the named FIFO provided by the transport.
    pub fn queue<T>(&self, name: &str) -> Result<Queue<T>, BusError>
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        Ok(Queue::new(self.core.queue_backend(name)?))
    }

    /// Expose a function as a remote procedure on the channel derived from
    /// its path. Closures have no usable path; use
    /// [`expose_on`](Self::expose_on) for those.
    pub fn expose<Args, Marker, F>(&self, f: F) -> Result<(), BusError>
    where
        F: RemoteFn<Args, Marker>,
        Args: 'static,
        Marker: 'static,
    {
        let channel = fullname::<F>();
        self.expose_on(&channel, f)
    }

    /// Expose a function as a remote procedure on an explicit channel.
    /// Fails with [`BusError::AlreadyExposed`] if the channel is taken.
    pub fn expose_on<Args, Marker, F>(&self, channel: &str, f: F) -> Result<(), BusError>
    where
        F: RemoteFn<Args, Marker>,
        Args: 'static,
        Marker: 'static,
    {
        self.core
            .expose_handler(channel.to_string(), erase_remote_fn(f))
    }

    /// Remove an exposed function, freeing its channel for re-exposure.
    /// Unknown channels are tolerated silently.
    pub fn unexpose(&self, channel: &str) {
        self.core.unexpose(channel);
    }

    /// A single-result stub for the remote function on `channel`.
    pub fn stub<A, R>(&self, channel: &str, timeout: Option<Duration>) -> Stub<A, R>
    where
        A: RpcArgs,
        R: DeserializeOwned + 'static,
    {
        Stub::new(self.core.clone(), channel.to_string(), timeout, false)
    }

    /// A multi-result stub: collects one response per recipient.
    pub fn stub_multi<A, R>(&self, channel: &str, timeout: Option<Duration>) -> Stub<A, R>
    where
        A: RpcArgs,
        R: DeserializeOwned + 'static,
    {
        Stub::new(self.core.clone(), channel.to_string(), timeout, true)
    }
}

fn erase_callback<T, F>(callback: F) -> Arc<ErasedCallback>
where
    T: DeserializeOwned + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    Arc::new(move |doc: Document| match doc.decode::<T>() {
        Ok(value) => callback(value),
        Err(e) => warn!("dropping payload a subscriber could not decode: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Process-wide bus
// ---------------------------------------------------------------------------

enum DeferredAction {
    Subscribe {
        id: ListenerId,
        key: SubscriptionKey,
        callback: Arc<ErasedCallback>,
    },
    Expose {
        channel: String,
        handler: RemoteHandler,
    },
}

struct GlobalBus {
    bus: Option<EventBus>,
    deferred: Vec<DeferredAction>,
}

static GLOBAL: Mutex<GlobalBus> = Mutex::new(GlobalBus {
    bus: None,
    deferred: Vec::new(),
});

fn current_bus() -> Option<EventBus> {
    GLOBAL.lock().bus.clone()
}

/// Bind the process-wide bus and start its dispatch thread.
///
/// Deferred registrations issued before this call are applied to the
/// adapter in the order they were given. Fails with
/// [`BusError::AlreadyInitialized`] while a bus is bound.
pub fn init<F: TransportFactory>(factory: F) -> Result<EventBus, BusError> {
    init_inner(&factory, true)
}

/// [`init`] without starting the dispatch thread; call [`start`] when
/// ready. Useful for tests that drive the receive loop themselves.
pub fn init_without_start<F: TransportFactory>(factory: F) -> Result<EventBus, BusError> {
    init_inner(&factory, false)
}

fn init_inner(factory: &impl TransportFactory, start_bus: bool) -> Result<EventBus, BusError> {
    let mut global = GLOBAL.lock();
    if global.bus.is_some() {
        return Err(BusError::AlreadyInitialized);
    }

    let bus = EventBus::create(factory)?;
    for action in global.deferred.drain(..) {
        let applied = match action {
            DeferredAction::Subscribe { id, key, callback } => {
                bus.core.add_subscription(id, key, callback)
            }
            DeferredAction::Expose { channel, handler } => {
                bus.core.expose_handler(channel, handler)
            }
        };
        if let Err(e) = applied {
            bus.shutdown();
            return Err(e);
        }
    }

    if start_bus {
        bus.start();
    }
    global.bus = Some(bus.clone());
    Ok(bus)
}

/// Start the process-wide bus's dispatch thread after
/// [`init_without_start`].
pub fn start() -> Result<(), BusError> {
    match current_bus() {
        Some(bus) => {
            bus.start();
            Ok(())
        }
        None => Err(BusError::NotSet),
    }
}

/// Shut the process-wide bus down and clear all deferred registrations.
/// Idempotent, including when the bus was never initialized.
pub fn shutdown() {
    let bus = {
        let mut global = GLOBAL.lock();
        global.deferred.clear();
        global.bus.take()
    };
    // Joining the dispatch thread must happen outside the global lock: a
    // callback still in flight may itself call into the global bus.
    if let Some(bus) = bus {
        bus.shutdown();
    }
}

/// Publish on the process-wide bus, deriving the channel from the event
/// type. Before `init` this is a no-op with a warning, returning
/// `Ok(None)`.
pub fn publish<T: Serialize + 'static>(event: &T) -> Result<Option<usize>, BusError> {
    publish_on(&fullname::<T>(), event)
}

/// Publish on an explicit channel of the process-wide bus.
pub fn publish_on<T: Serialize + 'static>(
    channel: &str,
    event: &T,
) -> Result<Option<usize>, BusError> {
    match current_bus() {
        Some(bus) => bus.publish_on(channel, event),
        None => {
            warn!("event bus was not initialized, cannot publish message; run init()");
            Ok(None)
        }
    }
}

/// Subscribe on the process-wide bus, deriving the channel from the
/// payload type. Buffered until bind when called before `init`.
pub fn subscribe<T, F>(callback: F) -> Result<ListenerId, BusError>
where
    T: DeserializeOwned + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    subscribe_on(&fullname::<T>(), callback)
}

/// Subscribe on an explicit channel of the process-wide bus. Buffered
/// until bind when called before `init`.
pub fn subscribe_on<T, F>(channel: &str, callback: F) -> Result<ListenerId, BusError>
where
    T: DeserializeOwned + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    subscribe_erased_global(SubscriptionKey::exact(channel), erase_callback(callback))
}

/// Pattern-subscribe a raw-document callback on the process-wide bus.
/// Buffered until bind when called before `init`.
pub fn subscribe_pattern<F>(pattern: &str, callback: F) -> Result<ListenerId, BusError>
where
    F: Fn(Document) + Send + Sync + 'static,
{
    subscribe_erased_global(SubscriptionKey::pattern(pattern), Arc::new(callback))
}

fn subscribe_erased_global(
    key: SubscriptionKey,
    callback: Arc<ErasedCallback>,
) -> Result<ListenerId, BusError> {
    let id = ListenerId::next();
    let bus = {
        let mut global = GLOBAL.lock();
        match &global.bus {
            Some(bus) => bus.clone(),
            None => {
                debug!(channel = %key.channel, "buffering subscription until bind");
                global.deferred.push(DeferredAction::Subscribe {
                    id,
                    key,
                    callback,
                });
                return Ok(id);
            }
        }
    };
    bus.core.add_subscription(id, key, callback)?;
    Ok(id)
}

/// Remove a subscription from the process-wide bus, or from the deferred
/// buffer when called before `init`. Unknown tokens are tolerated.
pub fn unsubscribe(id: ListenerId) {
    let bus = {
        let mut global = GLOBAL.lock();
        match &global.bus {
            Some(bus) => bus.clone(),
            None => {
                global.deferred.retain(|action| {
                    !matches!(action, DeferredAction::Subscribe { id: buffered, .. } if *buffered == id)
                });
                return;
            }
        }
    };
    bus.unsubscribe(id);
}

/// Expose a function on the process-wide bus on the channel derived from
/// its path. Buffered until bind when called before `init`.
pub fn expose<Args, Marker, F>(f: F) -> Result<(), BusError>
where
    F: RemoteFn<Args, Marker>,
    Args: 'static,
    Marker: 'static,
{
    let channel = fullname::<F>();
    expose_on(&channel, f)
}

/// Expose a function on an explicit channel of the process-wide bus.
/// Buffered until bind when called before `init`.
pub fn expose_on<Args, Marker, F>(channel: &str, f: F) -> Result<(), BusError>
where
    F: RemoteFn<Args, Marker>,
    Args: 'static,
    Marker: 'static,
{
    let bus = {
        let mut global = GLOBAL.lock();
        match &global.bus {
            Some(bus) => bus.clone(),
            None => {
                let taken = global.deferred.iter().any(|action| {
                    matches!(action, DeferredAction::Expose { channel: buffered, .. } if buffered == channel)
                });
                if taken {
                    return Err(BusError::AlreadyExposed(channel.to_string()));
                }
                debug!(channel, "buffering exposed function until bind");
                global.deferred.push(DeferredAction::Expose {
                    channel: channel.to_string(),
                    handler: erase_remote_fn(f),
                });
                return Ok(());
            }
        }
    };
    bus.expose_on(channel, f)
}

/// Remove an exposed function from the process-wide bus, or from the
/// deferred buffer when called before `init`.
pub fn unexpose(channel: &str) {
    let bus = {
        let mut global = GLOBAL.lock();
        match &global.bus {
            Some(bus) => bus.clone(),
            None => {
                global.deferred.retain(|action| {
                    !matches!(action, DeferredAction::Expose { channel: buffered, .. } if buffered == channel)
                });
                return;
            }
        }
    };
    bus.unexpose(channel);
}

/// A single-result stub for a remote function on the process-wide bus.
/// Fails with [`BusError::NotSet`] before `init`.
pub fn stub<A, R>(channel: &str, timeout: Option<Duration>) -> Result<Stub<A, R>, BusError>
where
    A: RpcArgs,
    R: DeserializeOwned + 'static,
{
    current_bus()
        .map(|bus| bus.stub(channel, timeout))
        .ok_or(BusError::NotSet)
}

/// A multi-result stub for a remote function on the process-wide bus.
/// Fails with [`BusError::NotSet`] before `init`.
pub fn stub_multi<A, R>(channel: &str, timeout: Option<Duration>) -> Result<Stub<A, R>, BusError>
where
    A: RpcArgs,
    R: DeserializeOwned + 'static,
{
    current_bus()
        .map(|bus| bus.stub_multi(channel, timeout))
        .ok_or(BusError::NotSet)
}

/// A typed handle for a named FIFO on the process-wide bus. Fails with
/// [`BusError::NotSet`] before `init`.
pub fn queue<T>(name: &str) -> Result<Queue<T>, BusError>
where
    T: Serialize + DeserializeOwned + 'static,
{
    current_bus().ok_or(BusError::NotSet)?.queue(name)
}

/// A deferred-capable topic handle on the process-wide bus.
///
/// The handle may be obtained before `init`; publishing through it is a
/// no-op returning `Ok(None)` until the bus is bound, after which the same
/// handle delegates to the adapter.
pub fn topic(name: &str) -> Topic {
    Topic {
        name: name.to_string(),
        pattern: false,
        bus: None,
    }
}

/// A deferred-capable pattern topic handle on the process-wide bus.
pub fn topic_pattern(name: &str) -> Topic {
    Topic {
        name: name.to_string(),
        pattern: true,
        bus: None,
    }
}

/// A publish/subscribe handle bound to one channel (plus pattern flag).
///
/// Handles from [`EventBus::topic`] delegate to that bus; handles from the
/// free [`topic`] function resolve the process-wide bus lazily at every
/// call, which is what makes them usable before `init`.
pub struct Topic {
    name: String,
    pattern: bool,
    bus: Option<EventBus>,
}

impl Topic {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_pattern(&self) -> bool {
        self.pattern
    }

    /// Publish an event on this topic's channel. Fails on pattern topics.
    pub fn publish<T: Serialize + 'static>(&self, event: &T) -> Result<Option<usize>, BusError> {
        if self.pattern {
            return Err(BusError::PatternPublish(self.name.clone()));
        }
        match &self.bus {
            Some(bus) => bus.publish_on(&self.name, event),
            None => publish_on(&self.name, event),
        }
    }

    /// Subscribe a typed callback on this topic.
    pub fn subscribe<T, F>(&self, callback: F) -> Result<ListenerId, BusError>
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let key = SubscriptionKey {
            channel: self.name.clone(),
            pattern: self.pattern,
        };
        match &self.bus {
            Some(bus) => bus.subscribe_erased(key, erase_callback(callback)),
            None => subscribe_erased_global(key, erase_callback(callback)),
        }
    }
}
