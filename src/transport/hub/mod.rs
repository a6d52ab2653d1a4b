//! # Hub Transport
//!
//! Cross-process adapter speaking the length-prefixed JSON protocol of
//! [`HubServer`], a central hub offering pub/sub with pattern
//! subscriptions, recipient-counted publish, and named list queues with
//! server-side blocking pop.
//!
//! Each bound bus holds two connections. The events connection identifies
//! itself to the hub with a `Hello` and from then on only receives pushed
//! messages; the command connection carries request/reply traffic,
//! including subscription registrations, which are acknowledged before the
//! registering call returns; a publish issued anywhere after that
//! acknowledgment reaches the subscription.
//!
//! Every queue handle opens its own lazy connection so a blocking pop
//! never stalls command traffic, which is what allows an RPC skeleton to
//! publish its response while a stub on the same bus is blocked waiting
//! for it.
//!
//! Queue names go through the restricted-charset encoding
//! ([`crate::channel::encode_name`]) and validation before they reach the
//! wire; channels travel unrestricted.

pub mod server;
pub mod wire;

pub use server::HubServer;

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::channel::{encode_name, validate_name};
use crate::codec::Document;
use crate::dispatch::DispatchHandle;
use crate::error::{QueueError, TransportError};
use crate::queue::QueueBackend;
use crate::registry::SubscriptionKey;
use crate::transport::{Transport, TransportFactory, DEFAULT_CONNECT_TIMEOUT};
use wire::{read_frame, write_frame, Request, Response};

/// Factory for [`HubTransport`].
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Hub address, e.g. `"127.0.0.1:7640"`.
    pub addr: String,
    /// Connect timeout for the transport's connections.
    pub connect_timeout: Duration,
    /// Callback worker threads for the bus dispatcher.
    pub workers: usize,
}

impl HubConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            workers: 1,
        }
    }
}

impl TransportFactory for HubConfig {
    fn create(&self, dispatch: DispatchHandle) -> Result<Arc<dyn Transport>, TransportError> {
        HubTransport::connect(self, dispatch).map(|t| Arc::new(t) as Arc<dyn Transport>)
    }

    fn dispatch_workers(&self) -> usize {
        self.workers
    }
}

/// Hub client adapter.
pub struct HubTransport {
    dispatch: DispatchHandle,
    addr: SocketAddr,
    connect_timeout: Duration,
    /// This bus's identity on the hub; subscriptions registered under it
    /// are delivered to the events connection that said `Hello` with it.
    client: String,
    /// Request/reply connection; the lock pairs each reply with its command.
    command: Mutex<TcpStream>,
    /// Unlocked clone of the command socket, for shutdown.
    command_ctl: TcpStream,
    /// Events socket: the run loop reads pushed messages off it.
    events: TcpStream,
    closed: AtomicBool,
}

impl HubTransport {
    pub fn connect(config: &HubConfig, dispatch: DispatchHandle) -> Result<Self, TransportError> {
        let addr = resolve(&config.addr)?;
        let client = format!("bus-{}", Uuid::new_v4());

        let command = connect_stream(addr, config.connect_timeout)?;
        let mut events = connect_stream(addr, config.connect_timeout)?;

        // Identify the events connection before anything can be published
        // at us. No subscription exists yet, so the acknowledgment is the
        // only frame that can arrive here.
        write_frame(
            &mut events,
            &Request::Hello {
                client: client.clone(),
            },
        )?;
        match read_frame::<Response>(&mut events)? {
            Response::Ok => {}
            other => {
                return Err(TransportError::Protocol(format!(
                    "hub rejected events handshake: {other:?}"
                )))
            }
        }

        let command_ctl = command.try_clone()?;
        debug!(%addr, client = %client, "hub transport connected");
        Ok(Self {
            dispatch,
            addr,
            connect_timeout: config.connect_timeout,
            client,
            command: Mutex::new(command),
            command_ctl,
            events,
            closed: AtomicBool::new(false),
        })
    }

    fn request(&self, request: &Request) -> Result<Response, TransportError> {
        let mut stream = self.command.lock();
        write_frame(&mut *stream, request)?;
        let response = read_frame(&mut *stream)?;
        if let Response::Error { message } = response {
            return Err(TransportError::Protocol(message));
        }
        Ok(response)
    }

    fn request_ack(&self, request: &Request) -> Result<(), TransportError> {
        match self.request(request)? {
            Response::Ok => Ok(()),
            other => Err(TransportError::Protocol(format!(
                "expected acknowledgment, got {other:?}"
            ))),
        }
    }
}

impl Transport for HubTransport {
    fn run(&self) {
        let mut reader = &self.events;
        loop {
            match read_frame::<Response>(&mut reader) {
                Ok(Response::Message {
                    channel,
                    pattern,
                    payload,
                }) => {
                    let key = match pattern {
                        Some(glob) => SubscriptionKey::pattern(glob),
                        None => SubscriptionKey::exact(channel),
                    };
                    self.dispatch.dispatch_key(&key, &payload);
                }
                Ok(other) => {
                    warn!("unexpected frame on hub events connection: {other:?}");
                }
                Err(e) => {
                    if !self.closed.load(Ordering::SeqCst) {
                        error!("hub events connection lost: {e}");
                    }
                    break;
                }
            }
        }
        debug!("hub transport receive loop exited");
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.events.shutdown(std::net::Shutdown::Both);
        let _ = self.command_ctl.shutdown(std::net::Shutdown::Both);
    }

    fn publish(&self, channel: &str, payload: Document) -> Result<Option<usize>, TransportError> {
        match self.request(&Request::Publish {
            channel: channel.to_string(),
            payload,
        })? {
            Response::Count { n } => Ok(Some(n)),
            other => Err(TransportError::Protocol(format!(
                "expected publish count, got {other:?}"
            ))),
        }
    }

    fn subscribe(&self, channel: &str, pattern: bool, first: bool) -> Result<(), TransportError> {
        if !first {
            return Ok(());
        }
        self.request_ack(&Request::Subscribe {
            client: self.client.clone(),
            channel: channel.to_string(),
            pattern,
        })
    }

    fn unsubscribe(&self, channel: &str, pattern: bool, last: bool) -> Result<(), TransportError> {
        if !last {
            return Ok(());
        }
        debug!(channel, pattern, "no callbacks left, dropping hub subscription");
        self.request_ack(&Request::Unsubscribe {
            client: self.client.clone(),
            channel: channel.to_string(),
            pattern,
        })
    }

    fn queue(&self, name: &str) -> Result<Arc<dyn QueueBackend>, TransportError> {
        let wire_name = encode_name(name);
        validate_name(&wire_name)?;
        Ok(Arc::new(HubQueue {
            name: name.to_string(),
            wire_name,
            addr: self.addr,
            connect_timeout: self.connect_timeout,
            conn: Mutex::new(None),
        }))
    }
}

/// A named list queue on the hub.
///
/// Holds its own lazily opened connection: blocking pops run server-side,
/// so they must not share a socket with anything else.
struct HubQueue {
    name: String,
    wire_name: String,
    addr: SocketAddr,
    connect_timeout: Duration,
    conn: Mutex<Option<TcpStream>>,
}

impl HubQueue {
    fn request(&self, request: &Request) -> Result<Response, QueueError> {
        let mut conn = self.conn.lock();
        if conn.is_none() {
            *conn = Some(
                connect_stream(self.addr, self.connect_timeout).map_err(QueueError::Transport)?,
            );
        }
        let Some(stream) = conn.as_mut() else {
            return Err(QueueError::Transport(TransportError::Closed));
        };

        let outcome = write_frame(stream, request).and_then(|()| read_frame::<Response>(stream));
        match outcome {
            Ok(Response::Error { message }) => {
                Err(QueueError::Transport(TransportError::Protocol(message)))
            }
            Ok(response) => Ok(response),
            Err(e) => {
                // Drop the broken connection; the next operation redials.
                *conn = None;
                Err(QueueError::Transport(e.into()))
            }
        }
    }
}

impl QueueBackend for HubQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(&self, item: Document, block: bool, _timeout: Option<Duration>) -> Result<(), QueueError> {
        if block {
            // Hub lists are push-only on the write side, like the brokers
            // this adapter models.
            return Err(QueueError::NotImplemented("blocking put on a hub queue"));
        }
        match self.request(&Request::Push {
            queue: self.wire_name.clone(),
            item,
        })? {
            Response::Ok => Ok(()),
            other => Err(protocol_err(format!("expected push ack, got {other:?}"))),
        }
    }

    fn get(&self, block: bool, timeout: Option<Duration>) -> Result<Document, QueueError> {
        let response = self.request(&Request::Pop {
            queue: self.wire_name.clone(),
            block,
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
        })?;
        match response {
            Response::Item { item: Some(doc) } => Ok(doc),
            Response::Item { item: None } => Err(QueueError::Empty),
            other => Err(protocol_err(format!("expected pop item, got {other:?}"))),
        }
    }

    fn len(&self) -> Result<usize, QueueError> {
        match self.request(&Request::Len {
            queue: self.wire_name.clone(),
        })? {
            Response::Len { n } => Ok(n),
            other => Err(protocol_err(format!("expected queue length, got {other:?}"))),
        }
    }

    fn free(&self) -> Result<(), QueueError> {
        match self.request(&Request::Delete {
            queue: self.wire_name.clone(),
        })? {
            Response::Ok => Ok(()),
            other => Err(protocol_err(format!("expected delete ack, got {other:?}"))),
        }
    }
}

fn protocol_err(message: String) -> QueueError {
    QueueError::Transport(TransportError::Protocol(message))
}

fn resolve(addr: &str) -> Result<SocketAddr, TransportError> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| TransportError::Protocol(format!("address `{addr}` did not resolve")))
}

fn connect_stream(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, TransportError> {
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    // Command/response latency dominates; never batch small frames.
    stream.set_nodelay(true)?;
    Ok(stream)
}
