//! # Error Taxonomy
//!
//! All failure modes of the bus are modeled as dedicated error enums, one per
//! concern, so that callers can match on exactly the failures their call site
//! can produce:
//!
//! - [`BusError`]: lifecycle and registration failures of the bus itself
//! - [`CodecError`]: document encode/decode failures
//! - [`QueueError`]: FIFO operations, including the `Empty` timeout signal
//! - [`TransportError`]: adapter-level failures (I/O, protocol, naming)
//! - [`RpcError`] / [`RemoteInvocationError`]: stub-side RPC failures
//!
//! The conversions between them follow the call graph: transport failures
//! bubble into bus failures, bus and queue failures bubble into RPC failures.
//! Errors raised *inside* subscriber callbacks or exposed functions never
//! surface here; they are caught by the dispatcher and skeleton respectively,
//! logged, and (for RPC) translated into error responses.

use std::fmt;

use thiserror::Error;

/// Lifecycle and registration errors of the event bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// An operation that requires a bound transport was called before
    /// `init`. Only `subscribe`, `unsubscribe`, `expose` and `topic` are
    /// deferred-capable; everything else fails with this.
    #[error("event bus is not initialized, run init() first")]
    NotSet,

    /// `init` was called while a bus is already bound and running.
    #[error("event bus is already initialized")]
    AlreadyInitialized,

    /// The bus has been shut down; it cannot be revived.
    #[error("event bus has been shut down")]
    Closed,

    /// `expose` was called for a channel that already has an exposed
    /// function. Call `unexpose` first.
    #[error("a function is already exposed on channel `{0}`")]
    AlreadyExposed(String),

    /// `publish` was called on a pattern topic; patterns only receive.
    #[error("cannot publish to pattern topic `{0}`")]
    PatternPublish(String),

    /// The bound transport adapter failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Payload could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Failures of the self-describing document codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The value could not be converted into a document.
    #[error("failed to encode value as document: {0}")]
    Encode(#[source] serde_json::Error),

    /// The document could not be reconstructed as the requested type.
    #[error("failed to decode document into {target}: {source}")]
    Decode {
        /// Static name of the requested target type.
        target: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// A `__type` tag named a type that is not in the type registry.
    #[error("no type registered under name `{0}`")]
    UnknownType(String),
}

/// Failures of queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// `get` found no item: the timeout expired, or the queue was empty and
    /// the call was non-blocking. This is a normal control-flow signal, not
    /// a defect.
    #[error("queue is empty")]
    Empty,

    /// A non-blocking `put` found no room.
    #[error("queue is full")]
    Full,

    /// The backing transport cannot perform the requested variant of the
    /// operation (e.g. a blocking put on a hub list).
    #[error("operation not supported by this transport: {0}")]
    NotImplemented(&'static str),

    /// The adapter failed while performing the operation.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The item could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Adapter-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A channel or queue name is outside the transport's allowed character
    /// set or length limits. See [`crate::channel::validate_name`].
    #[error("invalid topic name `{0}`")]
    InvalidTopicName(String),

    /// The underlying socket or OS resource failed.
    #[error("transport i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// The peer violated the wire protocol, or reported an error of its own.
    #[error("transport protocol error: {0}")]
    Protocol(String),

    /// The transport has been closed.
    #[error("transport is closed")]
    Closed,
}

/// Stub-side RPC failures.
///
/// Every stub invocation terminates in exactly one of: a decoded result, a
/// [`RpcError::NoSuchRemote`], or a [`RpcError::Remote`] carrying the remote
/// failure (including synthesized timeouts). Remote errors are never dropped
/// silently.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The request was published but no subscriber accepted it, or the
    /// transport could not produce a recipient count.
    #[error("no remote function is exposed on channel `{0}`")]
    NoSuchRemote(String),

    /// The remote function produced an error response.
    #[error(transparent)]
    Remote(#[from] RemoteInvocationError),

    /// The bus rejected the request before it reached the wire.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Request arguments or the response payload failed to round-trip.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The reply queue failed in a way other than a timeout.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// A structured error reported by the remote side of an RPC call.
///
/// The remote error type itself is not required to exist in the calling
/// process; only its canonical type name and its argument tuple travel over
/// the wire. A stub wait that expires is reported as a
/// `RemoteInvocationError` whose `type_name` is `"TimeoutError"`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteInvocationError {
    /// Canonical name of the error type raised by the remote function.
    pub type_name: String,
    /// The error's argument tuple, as generic document values.
    pub args: Vec<serde_json::Value>,
}

impl RemoteInvocationError {
    pub fn new(type_name: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        Self {
            type_name: type_name.into(),
            args,
        }
    }

    /// Whether the remote failure was a synthesized stub-side timeout.
    pub fn is_timeout(&self) -> bool {
        self.type_name == "TimeoutError"
    }
}

impl fmt::Display for RemoteInvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remote invocation raised {}(", self.type_name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")
    }
}

impl std::error::Error for RemoteInvocationError {}
