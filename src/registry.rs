//! # Subscriber Registry
//!
//! The registry is the bus's routing table: a mapping from
//! `(channel, is_pattern)` to the ordered list of subscriber callbacks.
//! Callbacks are stored type-erased: each subscription carries a closure
//! that decodes the wire document into the subscriber's payload type and
//! invokes the user callback, so the registry itself never touches payload
//! types.
//!
//! Ordering matters: within one bucket, callbacks run in registration order
//! for a given message, and duplicate registrations each receive their own
//! delivery. Because Rust closures have no identity, every registration is
//! issued a process-unique [`ListenerId`] and removal is by token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::glob_match;
use crate::codec::Document;

/// A type-erased subscriber callback: decodes the document and invokes the
/// user closure, absorbing its own decode failures.
pub type ErasedCallback = dyn Fn(Document) + Send + Sync;

/// Token identifying one subscription. Unique for the lifetime of the
/// process, across all buses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ListenerId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// The routing key of a subscription bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub channel: String,
    pub pattern: bool,
}

impl SubscriptionKey {
    pub fn exact(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            pattern: false,
        }
    }

    pub fn pattern(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            pattern: true,
        }
    }
}

#[derive(Clone)]
pub(crate) struct Listener {
    pub id: ListenerId,
    pub callback: Arc<ErasedCallback>,
}

/// Mapping `(channel, pattern)` to ordered callback lists.
#[derive(Default)]
pub struct Registry {
    buckets: Mutex<HashMap<SubscriptionKey, Vec<Listener>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback to its bucket.
    ///
    /// Returns `true` when this registration created the bucket, i.e. the
    /// key transitioned from unsubscribed to subscribed, the moment an
    /// adapter must establish its external subscription.
    pub(crate) fn add(&self, id: ListenerId, key: SubscriptionKey, callback: Arc<ErasedCallback>) -> bool {
        let mut buckets = self.buckets.lock();
        let listeners = buckets.entry(key).or_default();
        listeners.push(Listener { id, callback });
        listeners.len() == 1
    }

    /// Remove the subscription identified by `id`, dropping its bucket when
    /// it becomes empty. Absence is tolerated silently.
    ///
    /// Returns the bucket key and whether the bucket was removed (the
    /// subscribed-to-unsubscribed transition), or `None` when the token was
    /// not registered.
    pub(crate) fn remove(&self, id: ListenerId) -> Option<(SubscriptionKey, bool)> {
        let mut buckets = self.buckets.lock();
        let key = buckets.iter().find_map(|(key, listeners)| {
            listeners
                .iter()
                .any(|l| l.id == id)
                .then(|| key.clone())
        })?;

        let listeners = buckets.get_mut(&key)?;
        let index = listeners.iter().position(|l| l.id == id)?;
        listeners.remove(index);

        let emptied = listeners.is_empty();
        if emptied {
            buckets.remove(&key);
        }
        Some((key, emptied))
    }

    /// Ordered callbacks of one exact bucket.
    pub(crate) fn lookup(&self, key: &SubscriptionKey) -> Vec<Listener> {
        self.buckets.lock().get(key).cloned().unwrap_or_default()
    }

    /// All callbacks a message on `channel` must reach: the exact bucket
    /// first, then every pattern bucket whose glob matches, in registration
    /// order within each bucket.
    pub(crate) fn matching(&self, channel: &str) -> Vec<Listener> {
        let buckets = self.buckets.lock();
        let mut out = Vec::new();
        if let Some(exact) = buckets.get(&SubscriptionKey::exact(channel)) {
            out.extend(exact.iter().cloned());
        }
        for (key, listeners) in buckets.iter() {
            if key.pattern && glob_match(&key.channel, channel) {
                out.extend(listeners.iter().cloned());
            }
        }
        out
    }

    /// Number of deliveries a message on `channel` would currently cause.
    pub fn match_count(&self, channel: &str) -> usize {
        let buckets = self.buckets.lock();
        let exact = buckets
            .get(&SubscriptionKey::exact(channel))
            .map(Vec::len)
            .unwrap_or(0);
        let patterned: usize = buckets
            .iter()
            .filter(|(key, _)| key.pattern && glob_match(&key.channel, channel))
            .map(|(_, listeners)| listeners.len())
            .sum();
        exact + patterned
    }

    /// Every currently subscribed key. Used by adapters that re-establish
    /// external subscriptions when their receive loop starts.
    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.buckets.lock().keys().cloned().collect()
    }

    /// Drop all subscriptions. Part of bus shutdown.
    pub fn clear(&self) {
        self.buckets.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.lock().is_empty()
    }
}
