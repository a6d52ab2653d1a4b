//! # Hub Server
//!
//! A minimal central hub offering the two primitives the hub transport
//! needs: channel pub/sub with glob pattern subscriptions and recipient
//! counting, and named list queues with server-side blocking pop. One
//! thread accepts connections, one thread per connection reads commands;
//! pushed messages and command replies share a per-connection write lock.
//!
//! Clients identify their events connection with a `Hello`, then register
//! subscriptions over their command connection; registration is
//! acknowledged, so a publish issued after the acknowledgment is
//! guaranteed to see the subscription.
//!
//! This exists so the hub transport is testable and usable without an
//! external broker. It deliberately stops short of broker engineering:
//! no authentication, no persistence, no replication.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::channel::glob_match;
use crate::codec::Document;
use crate::transport::hub::wire::{read_frame, write_frame, Request, Response};

type ConnId = u64;
type ClientId = String;
type Writer = Arc<Mutex<TcpStream>>;

#[derive(Default)]
struct HubInner {
    writers: HashMap<ConnId, Writer>,
    /// Client id to the connection its pushed messages go out on.
    clients: HashMap<ClientId, ConnId>,
    /// `(channel-or-glob, is_pattern)` to subscribed clients.
    subs: HashMap<(String, bool), Vec<ClientId>>,
    queues: HashMap<String, VecDeque<Document>>,
}

struct HubState {
    inner: Mutex<HubInner>,
    /// Signaled on queue pushes and on shutdown.
    queue_ready: Condvar,
    closed: AtomicBool,
}

/// In-process hub instance listening on a TCP address.
pub struct HubServer {
    addr: SocketAddr,
    state: Arc<HubState>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl HubServer {
    /// Bind and start accepting. Use `"127.0.0.1:0"` for an ephemeral port.
    pub fn bind(addr: &str) -> io::Result<HubServer> {
        let listener = TcpListener::bind(addr)?;
        let local = listener.local_addr()?;
        let state = Arc::new(HubState {
            inner: Mutex::new(HubInner::default()),
            queue_ready: Condvar::new(),
            closed: AtomicBool::new(false),
        });

        let accept_state = state.clone();
        let acceptor = std::thread::Builder::new()
            .name("hub-acceptor".to_string())
            .spawn(move || accept_loop(listener, accept_state))?;

        debug!(%local, "hub server listening");
        Ok(HubServer {
            addr: local,
            state,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    /// The bound address, for handing to [`HubConfig`](super::HubConfig).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting, disconnect every client and join the acceptor.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Release blocked poppers and wake the acceptor with a throwaway
        // connection; then drop every client socket.
        self.state.queue_ready.notify_all();
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.acceptor.lock().take() {
            let _ = handle.join();
        }
        let writers: Vec<Writer> = self.state.inner.lock().writers.values().cloned().collect();
        for writer in writers {
            let _ = writer.lock().shutdown(std::net::Shutdown::Both);
        }
    }
}

impl Drop for HubServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, state: Arc<HubState>) {
    let mut next_conn: ConnId = 1;
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                if state.closed.load(Ordering::SeqCst) {
                    break;
                }
                warn!("hub accept failed: {e}");
                continue;
            }
        };
        if state.closed.load(Ordering::SeqCst) {
            break;
        }

        let conn_id = next_conn;
        next_conn += 1;
        debug!(conn_id, %peer, "hub connection accepted");

        let writer: Writer = match stream.try_clone() {
            Ok(clone) => Arc::new(Mutex::new(clone)),
            Err(e) => {
                warn!("failed to clone hub connection: {e}");
                continue;
            }
        };
        state.inner.lock().writers.insert(conn_id, writer.clone());

        let conn_state = state.clone();
        let _ = std::thread::Builder::new()
            .name(format!("hub-conn-{conn_id}"))
            .spawn(move || {
                serve_connection(conn_state.clone(), stream, writer, conn_id);
                disconnect(&conn_state, conn_id);
            });
    }
}

fn serve_connection(state: Arc<HubState>, mut stream: TcpStream, writer: Writer, conn_id: ConnId) {
    loop {
        let request: Request = match read_frame(&mut stream) {
            Ok(request) => request,
            Err(e) => {
                debug!(conn_id, "hub connection closed: {e}");
                return;
            }
        };

        let reply = match request {
            Request::Hello { client } => {
                debug!(conn_id, client = %client, "events connection identified");
                state.inner.lock().clients.insert(client, conn_id);
                Response::Ok
            }
            Request::Subscribe {
                client,
                channel,
                pattern,
            } => {
                subscribe(&state, client, channel, pattern);
                Response::Ok
            }
            Request::Unsubscribe {
                client,
                channel,
                pattern,
            } => {
                unsubscribe(&state, &client, &channel, pattern);
                Response::Ok
            }
            Request::Publish { channel, payload } => {
                let n = publish(&state, &channel, payload);
                Response::Count { n }
            }
            Request::Push { queue, item } => {
                let mut inner = state.inner.lock();
                inner.queues.entry(queue).or_default().push_back(item);
                state.queue_ready.notify_all();
                Response::Ok
            }
            Request::Pop {
                queue,
                block,
                timeout_ms,
            } => {
                let item = pop(&state, &queue, block, timeout_ms.map(Duration::from_millis));
                Response::Item { item }
            }
            Request::Len { queue } => {
                let n = state
                    .inner
                    .lock()
                    .queues
                    .get(&queue)
                    .map(VecDeque::len)
                    .unwrap_or(0);
                Response::Len { n }
            }
            Request::Delete { queue } => {
                state.inner.lock().queues.remove(&queue);
                Response::Ok
            }
        };

        if write_frame(&mut *writer.lock(), &reply).is_err() {
            return;
        }
    }
}

fn subscribe(state: &HubState, client: ClientId, channel: String, pattern: bool) {
    let mut inner = state.inner.lock();
    let clients = inner.subs.entry((channel, pattern)).or_default();
    if !clients.contains(&client) {
        clients.push(client);
    }
}

fn unsubscribe(state: &HubState, client: &str, channel: &str, pattern: bool) {
    let mut inner = state.inner.lock();
    let key = (channel.to_string(), pattern);
    if let Some(clients) = inner.subs.get_mut(&key) {
        clients.retain(|c| c != client);
        if clients.is_empty() {
            inner.subs.remove(&key);
        }
    }
}

/// Fan out to every matching subscription and count them, like an external
/// broker does: one count per subscription, pattern subscriptions included.
fn publish(state: &HubState, channel: &str, payload: Document) -> usize {
    let deliveries: Vec<(Writer, Response)> = {
        let inner = state.inner.lock();
        let mut out = Vec::new();
        for ((sub_channel, is_pattern), clients) in inner.subs.iter() {
            let matched = if *is_pattern {
                glob_match(sub_channel, channel)
            } else {
                sub_channel == channel
            };
            if !matched {
                continue;
            }
            for client in clients {
                let Some(conn_id) = inner.clients.get(client) else {
                    continue;
                };
                let Some(writer) = inner.writers.get(conn_id) else {
                    continue;
                };
                let message = Response::Message {
                    channel: channel.to_string(),
                    pattern: is_pattern.then(|| sub_channel.clone()),
                    payload: payload.clone(),
                };
                out.push((writer.clone(), message));
            }
        }
        out
    };

    let n = deliveries.len();
    for (writer, message) in deliveries {
        // A write failure means the client is going away; its connection
        // thread handles the cleanup.
        let _ = write_frame(&mut *writer.lock(), &message);
    }
    n
}

fn pop(state: &HubState, queue: &str, block: bool, timeout: Option<Duration>) -> Option<Document> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut inner = state.inner.lock();
    loop {
        if let Some(item) = inner.queues.get_mut(queue).and_then(VecDeque::pop_front) {
            return Some(item);
        }
        if !block || state.closed.load(Ordering::SeqCst) {
            return None;
        }
        match deadline {
            None => {
                state.queue_ready.wait(&mut inner);
            }
            Some(deadline) => {
                if state.queue_ready.wait_until(&mut inner, deadline).timed_out() {
                    return inner.queues.get_mut(queue).and_then(VecDeque::pop_front);
                }
            }
        }
    }
}

fn disconnect(state: &HubState, conn_id: ConnId) {
    let mut inner = state.inner.lock();
    inner.writers.remove(&conn_id);

    // If this was an events connection, its client and all of the client's
    // subscriptions go with it.
    let gone: Vec<ClientId> = inner
        .clients
        .iter()
        .filter(|(_, events_conn)| **events_conn == conn_id)
        .map(|(client, _)| client.clone())
        .collect();
    for client in &gone {
        inner.clients.remove(client);
    }
    inner.subs.retain(|_, clients| {
        clients.retain(|c| !gone.contains(c));
        !clients.is_empty()
    });
    debug!(conn_id, "hub connection cleaned up");
}
