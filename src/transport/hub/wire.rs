//! # Hub Wire Protocol
//!
//! Frames between a hub client and the hub server are 4-byte little-endian
//! length prefixes followed by a JSON body. JSON keeps the payload
//! self-describing end to end: the document codec's type tags travel
//! through the hub untouched, so processes on either side reconstruct the
//! same application values.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::Document;

/// Upper bound on a single frame body, to fail fast on corrupted length
/// prefixes rather than attempting a huge allocation.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Client-to-hub commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    /// Identify a connection as the events channel of `client`. Sent once,
    /// first, on the events connection; pushed messages for the client's
    /// subscriptions arrive there. Reply: `Ok`.
    Hello { client: String },
    /// Register `client` for a channel or pattern. Sent on the command
    /// connection so registration is acknowledged before the caller
    /// proceeds. Reply: `Ok`.
    Subscribe {
        client: String,
        channel: String,
        pattern: bool,
    },
    /// Drop `client`'s registration. Reply: `Ok`.
    Unsubscribe {
        client: String,
        channel: String,
        pattern: bool,
    },
    /// Fan a payload out to all matching subscriptions. Reply: `Count`.
    Publish { channel: String, payload: Document },
    /// Append to a named list queue. Reply: `Ok`.
    Push { queue: String, item: Document },
    /// Take the oldest item off a named list queue, optionally blocking
    /// server-side until one arrives. Reply: `Item`.
    Pop {
        queue: String,
        block: bool,
        timeout_ms: Option<u64>,
    },
    /// Current length of a named list queue. Reply: `Len`.
    Len { queue: String },
    /// Destroy a named list queue. Reply: `Ok`.
    Delete { queue: String },
}

/// Hub-to-client replies and pushed messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Response {
    Ok,
    /// Recipient count of a publish: one per matching subscription.
    Count { n: usize },
    /// Pop result; `None` when the wait expired or the probe found nothing.
    Item { item: Option<Document> },
    Len { n: usize },
    /// A published payload delivered to one of this connection's
    /// subscriptions. `pattern` carries the matching glob when the
    /// subscription was a pattern.
    Message {
        channel: String,
        pattern: Option<String>,
        payload: Document,
    },
    /// The hub rejected the command.
    Error { message: String },
}

/// Write one length-prefixed frame.
pub fn write_frame<T: Serialize>(stream: &mut impl Write, frame: &T) -> io::Result<()> {
    let body = serde_json::to_vec(frame)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = body.len() as u32;
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(&body)?;
    stream.flush()
}

/// Read one length-prefixed frame.
pub fn read_frame<T: DeserializeOwned>(stream: &mut impl Read) -> io::Result<T> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    serde_json::from_slice(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
