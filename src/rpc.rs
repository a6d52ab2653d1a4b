//! # RPC Protocol
//!
//! Request/response calls built from the two primitives the bus already
//! has: the request fans out over pub/sub on the function's channel, and
//! the responses come back over an ephemeral reply queue owned by the
//! caller.
//!
//! ## Stub side
//!
//! A [`Stub`] publishes an [`RpcRequest`] carrying a globally unique reply
//! queue name (`__rpc_<uuid>`), then reads responses off that queue:
//!
//! 1. The publish returns the recipient count `n`. Zero, or `None` from a
//!    transport that cannot count, means nobody is exposed on the channel:
//!    [`RpcError::NoSuchRemote`].
//! 2. A single-result stub waits for one response; a multi-result stub
//!    collects all `n`. The configured timeout applies to **each** response
//!    wait, so a multi-result call can take up to `n × timeout`. A wait
//!    that expires yields a synthesized error response whose result type is
//!    `"TimeoutError"`.
//! 3. The reply queue is freed on every exit path.
//!
//! Pattern subscriptions must not be used on RPC channels: a pattern
//! observer inflates `n` without ever responding, and the stub would wait
//! for responses that cannot arrive.
//!
//! ## Skeleton side
//!
//! [`expose`](crate::EventBus::expose) registers a skeleton as a plain
//! subscriber on the function channel. Per request it decodes each
//! positional argument to the exposed function's parameter types, invokes,
//! and enqueues an [`RpcResponse`] on the request's reply queue. A
//! returned `Err`, a panic, an arity mismatch or an argument decode
//! failure all become error responses carrying the failure's type name and
//! argument tuple; nothing a remote caller sends can take the dispatch
//! loop down. If the reply queue was destroyed because the stub gave up,
//! the enqueue is a no-op.
//!
//! ## Wire envelopes
//!
//! Both envelopes travel as ordered 4-field sequences so foreign peers can
//! speak them without this crate:
//!
//! ```text
//! request  = [function_channel, reply_queue, args, kwargs|null]
//! response = [function_channel, result, result_type|null, error]
//! ```
//!
//! `kwargs` exists for envelope parity with peers whose functions take
//! keyword arguments; stubs here always send null, and skeletons answer
//! non-empty kwargs with an error response.

use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::BusCore;
use crate::codec::{fullname, Document};
use crate::error::{CodecError, QueueError, RemoteInvocationError, RpcError};
use crate::queue::QueueBackend;
use crate::registry::ErasedCallback;

/// An RPC request envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    /// Channel of the remote function.
    pub function: String,
    /// Ephemeral queue the response must be enqueued on.
    pub reply_queue: String,
    /// Positional arguments, one document each.
    pub args: Vec<Document>,
    /// Keyword arguments; always `None` from stubs in this crate.
    pub kwargs: Option<Map<String, Value>>,
}

impl Serialize for RpcRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(4)?;
        tuple.serialize_element(&self.function)?;
        tuple.serialize_element(&self.reply_queue)?;
        tuple.serialize_element(&self.args)?;
        tuple.serialize_element(&self.kwargs)?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for RpcRequest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (function, reply_queue, args, kwargs) =
            <(String, String, Vec<Document>, Option<Map<String, Value>>)>::deserialize(
                deserializer,
            )?;
        Ok(Self {
            function,
            reply_queue,
            args,
            kwargs,
        })
    }
}

/// An RPC response envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    /// Channel of the remote function that produced this response.
    pub function: String,
    /// Result value, or the error's argument tuple when `error` is set.
    pub result: Document,
    /// Canonical name of the result's type; decodes the result on the
    /// caller side for untyped peers, names the error type otherwise.
    pub result_type: Option<String>,
    /// Whether the invocation failed.
    pub error: bool,
}

impl Serialize for RpcResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(4)?;
        tuple.serialize_element(&self.function)?;
        tuple.serialize_element(&self.result)?;
        tuple.serialize_element(&self.result_type)?;
        tuple.serialize_element(&self.error)?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for RpcResponse {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (function, result, result_type, error) =
            <(String, Document, Option<String>, bool)>::deserialize(deserializer)?;
        Ok(Self {
            function,
            result,
            result_type,
            error,
        })
    }
}

/// Positional argument tuples a stub can send: unit and tuples of up to
/// five serializable values.
pub trait RpcArgs: Send {
    fn encode_args(&self) -> Result<Vec<Document>, CodecError>;
}

impl RpcArgs for () {
    fn encode_args(&self) -> Result<Vec<Document>, CodecError> {
        Ok(Vec::new())
    }
}

macro_rules! impl_rpc_args {
    ($($T:ident => $idx:tt),+) => {
        impl<$($T,)+> RpcArgs for ($($T,)+)
        where
            $($T: Serialize + Send + 'static,)+
        {
            fn encode_args(&self) -> Result<Vec<Document>, CodecError> {
                Ok(vec![$(Document::encode(&self.$idx)?,)+])
            }
        }
    };
}

impl_rpc_args!(T0 => 0);
impl_rpc_args!(T0 => 0, T1 => 1);
impl_rpc_args!(T0 => 0, T1 => 1, T2 => 2);
impl_rpc_args!(T0 => 0, T1 => 1, T2 => 2, T3 => 3);
impl_rpc_args!(T0 => 0, T1 => 1, T2 => 2, T3 => 3, T4 => 4);

/// Outcome of one skeleton-side invocation, before it becomes a response
/// envelope.
pub enum CallOutcome {
    Success {
        result: Document,
        result_type: Option<String>,
    },
    Failure {
        type_name: String,
        args: Vec<Value>,
    },
}

impl CallOutcome {
    fn success<R: Serialize + 'static>(result: R) -> Self {
        match Document::encode(&result) {
            Ok(doc) => {
                let result_type = if std::any::TypeId::of::<R>() == std::any::TypeId::of::<()>() {
                    None
                } else {
                    Some(fullname::<R>())
                };
                CallOutcome::Success {
                    result: doc,
                    result_type,
                }
            }
            Err(e) => CallOutcome::Failure {
                type_name: fullname::<CodecError>(),
                args: vec![Value::String(e.to_string())],
            },
        }
    }

    fn arity_error(expected: usize, got: usize) -> Self {
        CallOutcome::Failure {
            type_name: "TypeError".to_string(),
            args: vec![Value::String(format!(
                "takes {expected} positional arguments but {got} were given"
            ))],
        }
    }

    fn decode_error(e: CodecError) -> Self {
        CallOutcome::Failure {
            type_name: fullname::<CodecError>(),
            args: vec![Value::String(e.to_string())],
        }
    }

    fn panic_error(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "remote function panicked".to_string());
        CallOutcome::Failure {
            type_name: "panic".to_string(),
            args: vec![Value::String(message)],
        }
    }
}

/// Marker types distinguishing the two exposable return shapes. Inferred;
/// never named by applications.
pub mod marker {
    use std::marker::PhantomData;

    pub struct Value<R>(PhantomData<R>);
    pub struct Fallible<R, E>(PhantomData<(R, E)>);
}

/// A function that can be exposed as a remote procedure: up to five
/// deserializable positional parameters, returning either a serializable
/// value or a `Result` of one.
///
/// The `Marker` parameter only disambiguates the two return shapes during
/// inference. In the rare ambiguous case (a `Result` whose error type is
/// itself serializable and displayable) annotate the expose call.
pub trait RemoteFn<Args, Marker>: Send + Sync + 'static {
    fn invoke(&self, args: &[Document]) -> CallOutcome;
}

macro_rules! impl_remote_fn {
    ($count:expr $(, $A:ident => $idx:tt)*) => {
        impl<Func, R $(, $A)*> RemoteFn<($($A,)*), marker::Value<R>> for Func
        where
            Func: Fn($($A),*) -> R + Send + Sync + 'static,
            R: Serialize + 'static,
            $($A: DeserializeOwned + 'static,)*
        {
            fn invoke(&self, args: &[Document]) -> CallOutcome {
                if args.len() != $count {
                    return CallOutcome::arity_error($count, args.len());
                }
                let _decoded: ($($A,)*) = ($(
                    match args[$idx].decode::<$A>() {
                        Ok(value) => value,
                        Err(e) => return CallOutcome::decode_error(e),
                    },
                )*);
                match catch_unwind(AssertUnwindSafe(|| (self)($(_decoded.$idx),*))) {
                    Ok(result) => CallOutcome::success(result),
                    Err(payload) => CallOutcome::panic_error(payload),
                }
            }
        }

        impl<Func, R, E $(, $A)*> RemoteFn<($($A,)*), marker::Fallible<R, E>> for Func
        where
            Func: Fn($($A),*) -> Result<R, E> + Send + Sync + 'static,
            R: Serialize + 'static,
            E: std::fmt::Display + 'static,
            $($A: DeserializeOwned + 'static,)*
        {
            fn invoke(&self, args: &[Document]) -> CallOutcome {
                if args.len() != $count {
                    return CallOutcome::arity_error($count, args.len());
                }
                let _decoded: ($($A,)*) = ($(
                    match args[$idx].decode::<$A>() {
                        Ok(value) => value,
                        Err(e) => return CallOutcome::decode_error(e),
                    },
                )*);
                match catch_unwind(AssertUnwindSafe(|| (self)($(_decoded.$idx),*))) {
                    Ok(Ok(result)) => CallOutcome::success(result),
                    Ok(Err(e)) => CallOutcome::Failure {
                        type_name: fullname::<E>(),
                        args: vec![Value::String(e.to_string())],
                    },
                    Err(payload) => CallOutcome::panic_error(payload),
                }
            }
        }
    };
}

impl_remote_fn!(0);
impl_remote_fn!(1, A0 => 0);
impl_remote_fn!(2, A0 => 0, A1 => 1);
impl_remote_fn!(3, A0 => 0, A1 => 1, A2 => 2);
impl_remote_fn!(4, A0 => 0, A1 => 1, A2 => 2, A3 => 3);
impl_remote_fn!(5, A0 => 0, A1 => 1, A2 => 2, A3 => 3, A4 => 4);

/// Type-erased exposed function.
pub(crate) type RemoteHandler = Arc<dyn Fn(&[Document]) -> CallOutcome + Send + Sync>;

/// Erase a [`RemoteFn`] into the handler form stored by the bus.
pub(crate) fn erase_remote_fn<Args, Marker, F>(f: F) -> RemoteHandler
where
    F: RemoteFn<Args, Marker>,
    Args: 'static,
    Marker: 'static,
{
    Arc::new(move |args: &[Document]| <F as RemoteFn<Args, Marker>>::invoke(&f, args))
}

/// The default channel of a function value: its canonical path. Closures
/// have no usable path; expose those on an explicit channel.
pub fn remote_name<F: 'static>(_f: &F) -> String {
    fullname::<F>()
}

/// Build the skeleton subscriber for an exposed function.
///
/// The skeleton holds the bus weakly: a bus mid-shutdown stops answering
/// instead of keeping itself alive through its own registry.
pub(crate) fn make_skeleton(
    bus: Weak<BusCore>,
    channel: String,
    handler: RemoteHandler,
) -> Arc<ErasedCallback> {
    Arc::new(move |doc: Document| {
        let request: RpcRequest = match doc.decode() {
            Ok(request) => request,
            Err(e) => {
                warn!(channel = %channel, "dropping undecodable rpc request: {e}");
                return;
            }
        };
        let Some(bus) = bus.upgrade() else {
            debug!("rpc request arrived after bus shutdown");
            return;
        };

        let has_kwargs = request
            .kwargs
            .as_ref()
            .map(|kwargs| !kwargs.is_empty())
            .unwrap_or(false);
        let outcome = if has_kwargs {
            CallOutcome::Failure {
                type_name: "TypeError".to_string(),
                args: vec![Value::String(
                    "keyword arguments are not supported".to_string(),
                )],
            }
        } else {
            (*handler)(&request.args)
        };

        let response = match outcome {
            CallOutcome::Success {
                result,
                result_type,
            } => RpcResponse {
                function: request.function.clone(),
                result,
                result_type,
                error: false,
            },
            CallOutcome::Failure { type_name, args } => {
                warn!(
                    function = %request.function,
                    error_type = %type_name,
                    "exposed function failed"
                );
                RpcResponse {
                    function: request.function.clone(),
                    result: Document::from(Value::Array(args)),
                    result_type: Some(type_name),
                    error: true,
                }
            }
        };

        // The stub may have given up and destroyed the reply queue; a
        // failed enqueue is a no-op, never a dispatch-loop failure.
        let enqueued = bus
            .queue_backend(&request.reply_queue)
            .map_err(|e| e.to_string())
            .and_then(|queue| {
                Document::encode(&response)
                    .map_err(|e| e.to_string())
                    .and_then(|doc| queue.put(doc, false, None).map_err(|e| e.to_string()))
            });
        if let Err(e) = enqueued {
            debug!(
                reply_queue = %request.reply_queue,
                "discarding rpc response: {e}"
            );
        }
    })
}

/// Caller-side handle for a remote function.
///
/// Obtained from [`stub`](crate::stub) / [`stub_multi`](crate::stub_multi)
/// or the [`EventBus`](crate::EventBus) methods of the same names. `A` is
/// the positional argument tuple, `R` the result type.
pub struct Stub<A, R> {
    bus: Arc<BusCore>,
    channel: String,
    timeout: Option<Duration>,
    multi: bool,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R> Stub<A, R>
where
    A: RpcArgs,
    R: DeserializeOwned + 'static,
{
    pub(crate) fn new(
        bus: Arc<BusCore>,
        channel: String,
        timeout: Option<Duration>,
        multi: bool,
    ) -> Self {
        Self {
            bus,
            channel,
            timeout,
            multi,
            _marker: PhantomData,
        }
    }

    /// Channel this stub publishes requests on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Invoke in single-result mode.
    ///
    /// Returns `Ok(None)` when no remote is exposed, the decoded result on
    /// success, and [`RpcError::Remote`] when the remote failed or the
    /// response wait timed out.
    pub fn call(&self, args: A) -> Result<Option<R>, RpcError> {
        let responses = match self.rpc(args) {
            Ok(responses) => responses,
            Err(RpcError::NoSuchRemote(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let Some(first) = responses.into_iter().next() else {
            return Ok(None);
        };
        if first.error {
            return Err(RpcError::Remote(remote_error(first)));
        }
        Ok(Some(first.result.decode()?))
    }

    /// Invoke in multi-result mode: one entry per recipient, errors
    /// (including per-wait timeouts) collected rather than raised. No
    /// remote at all yields an empty list.
    pub fn call_multi(&self, args: A) -> Result<Vec<Result<R, RemoteInvocationError>>, RpcError> {
        let responses = match self.rpc(args) {
            Ok(responses) => responses,
            Err(RpcError::NoSuchRemote(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut results = Vec::with_capacity(responses.len());
        for response in responses {
            if response.error {
                results.push(Err(remote_error(response)));
            } else {
                results.push(Ok(response.result.decode()?));
            }
        }
        Ok(results)
    }

    /// Invoke and return the raw response envelopes.
    ///
    /// Unlike the call forms, a missing remote surfaces as
    /// [`RpcError::NoSuchRemote`] here.
    pub fn rpc(&self, args: A) -> Result<Vec<RpcResponse>, RpcError> {
        let reply_queue = next_reply_queue();
        let request = RpcRequest {
            function: self.channel.clone(),
            reply_queue: reply_queue.clone(),
            args: args.encode_args()?,
            kwargs: None,
        };

        debug!(channel = %self.channel, reply_queue = %reply_queue, "publishing rpc request");
        let payload = Document::encode(&request)?;
        let recipients = self.bus.publish_document(&self.channel, payload)?;

        // `None` from an uncounting transport is indistinguishable from
        // nobody listening; both are the no-remote condition.
        let n = match recipients {
            Some(n) if n > 0 => n,
            _ => return Err(RpcError::NoSuchRemote(self.channel.clone())),
        };

        let backend = self.bus.queue_backend(&reply_queue)?;
        let _guard = ReplyQueueGuard {
            backend: backend.clone(),
        };

        let expected = if self.multi { n } else { 1 };
        let mut responses = Vec::with_capacity(expected);
        for _ in 0..expected {
            debug!(
                reply_queue = %reply_queue,
                timeout = ?self.timeout,
                "waiting for rpc response"
            );
            match backend.get(true, self.timeout) {
                Ok(doc) => responses.push(doc.decode::<RpcResponse>()?),
                Err(QueueError::Empty) => {
                    responses.push(timeout_response(&self.channel, self.timeout))
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(responses)
    }
}

/// Frees the ephemeral reply queue on every exit path of a stub call.
struct ReplyQueueGuard {
    backend: Arc<dyn QueueBackend>,
}

impl Drop for ReplyQueueGuard {
    fn drop(&mut self) {
        if let Err(e) = self.backend.free() {
            debug!(queue = %self.backend.name(), "failed to free reply queue: {e}");
        }
    }
}

/// Globally unique reply queue name; never reused.
fn next_reply_queue() -> String {
    format!("__rpc_{}", Uuid::new_v4())
}

fn timeout_response(function: &str, timeout: Option<Duration>) -> RpcResponse {
    let waited = match timeout {
        Some(t) => format!("gave up waiting after {t:?}"),
        None => "gave up waiting".to_string(),
    };
    RpcResponse {
        function: function.to_string(),
        result: Document::from(Value::Array(vec![Value::String(waited)])),
        result_type: Some("TimeoutError".to_string()),
        error: true,
    }
}

fn remote_error(response: RpcResponse) -> RemoteInvocationError {
    let args = match response.result.into_value() {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    };
    RemoteInvocationError::new(
        response.result_type.unwrap_or_else(|| "RemoteError".to_string()),
        args,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that the request envelope is the documented 4-field sequence.
    #[test]
    fn test_request_envelope_shape() {
        let request = RpcRequest {
            function: "some_function".to_string(),
            reply_queue: "__rpc_x".to_string(),
            args: vec![Document::from(serde_json::json!("simple_arg"))],
            kwargs: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            serde_json::json!(["some_function", "__rpc_x", ["simple_arg"], null])
        );

        let parsed: RpcRequest = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, request);
    }

    /// Test that the response envelope round-trips as a 4-field sequence.
    #[test]
    fn test_response_envelope_shape() {
        let response = RpcResponse {
            function: "f".to_string(),
            result: Document::from(serde_json::json!(6)),
            result_type: Some("i64".to_string()),
            error: false,
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value, serde_json::json!(["f", 6, "i64", false]));

        let parsed: RpcResponse = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, response);
    }

    /// Test positional argument encoding for tuples.
    #[test]
    fn test_rpc_args_encoding() {
        let args = (2i64, "x".to_string());
        let docs = args.encode_args().unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].as_value(), &serde_json::json!(2));
        assert_eq!(docs[1].as_value(), &serde_json::json!("x"));
        assert!(().encode_args().unwrap().is_empty());
    }

    fn multiply(p1: i64, p2: i64) -> i64 {
        p1 * p2
    }

    /// Test a plain function invocation through the erased handler.
    #[test]
    fn test_remote_fn_invoke() {
        let handler = erase_remote_fn(multiply);
        let args = (2i64, 3i64).encode_args().unwrap();
        match (*handler)(&args) {
            CallOutcome::Success { result, .. } => {
                assert_eq!(result.decode::<i64>().unwrap(), 6);
            }
            CallOutcome::Failure { type_name, args } => {
                panic!("unexpected failure {type_name}: {args:?}")
            }
        }
    }

    /// Test that an arity mismatch becomes an error outcome, not a crash.
    #[test]
    fn test_remote_fn_arity_mismatch() {
        let handler = erase_remote_fn(multiply);
        let args = (1i64, 2i64, 3i64).encode_args().unwrap();
        match (*handler)(&args) {
            CallOutcome::Failure { type_name, args } => {
                assert_eq!(type_name, "TypeError");
                let message = args[0].as_str().unwrap();
                assert!(
                    message.contains("takes 2 positional arguments but 3 were given"),
                    "unexpected message {message}"
                );
            }
            CallOutcome::Success { .. } => panic!("arity mismatch must fail"),
        }
    }

    fn fallible(flag: bool) -> Result<String, std::io::Error> {
        if flag {
            Ok("fine".to_string())
        } else {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "broken"))
        }
    }

    /// Test that a returned error maps to its type name and message tuple.
    #[test]
    fn test_remote_fn_fallible_error() {
        let handler = erase_remote_fn(fallible);
        let args = (false,).encode_args().unwrap();
        match (*handler)(&args) {
            CallOutcome::Failure { type_name, args } => {
                assert!(type_name.ends_with("io.error.Error") || type_name.ends_with("io.Error"),
                    "unexpected error type {type_name}");
                assert_eq!(args[0], Value::String("broken".to_string()));
            }
            CallOutcome::Success { .. } => panic!("error result must map to failure"),
        }

        let args = (true,).encode_args().unwrap();
        assert!(matches!((*handler)(&args), CallOutcome::Success { .. }));
    }

    /// Test that a panic inside the exposed function is contained.
    #[test]
    fn test_remote_fn_panic_contained() {
        let exploding = |_x: i64| -> i64 { panic!("kaboom") };
        let handler = erase_remote_fn(exploding);
        let args = (1i64,).encode_args().unwrap();
        match (*handler)(&args) {
            CallOutcome::Failure { type_name, args } => {
                assert_eq!(type_name, "panic");
                assert_eq!(args[0], Value::String("kaboom".to_string()));
            }
            CallOutcome::Success { .. } => panic!("panic must map to failure"),
        }
    }

    /// Test that unit returns carry no result type.
    #[test]
    fn test_unit_return_untyped() {
        let nothing = || {};
        let handler = erase_remote_fn(nothing);
        match (*handler)(&[]) {
            CallOutcome::Success { result, result_type } => {
                assert_eq!(result.as_value(), &Value::Null);
                assert_eq!(result_type, None);
            }
            CallOutcome::Failure { type_name, args } => {
                panic!("unexpected failure {type_name}: {args:?}")
            }
        }
    }

    /// Test reply queue names are unique.
    #[test]
    fn test_reply_queue_uniqueness() {
        let a = next_reply_queue();
        let b = next_reply_queue();
        assert!(a.starts_with("__rpc_"));
        assert_ne!(a, b);
    }
}
