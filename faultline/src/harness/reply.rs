//! Reply counting and the identity registry replies are dispatched through.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::transport::Endpoint;

/// Counting monitor waited on for a quorum of replies.
///
/// `reply()` may be called from any number of tasks or threads. The count
/// and the wake signal are updated under one lock, and `wait_reply` registers
/// for the signal before it checks the count, so no wake-up is lost.
#[derive(Debug, Default)]
pub struct ReplyCollector {
    count: Mutex<usize>,
    notify: Notify,
}

impl ReplyCollector {
    /// Create a collector with a zero count.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one reply and wake the waiter.
    pub fn reply(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += 1;
        self.notify.notify_waiters();
    }

    /// Zero the count. Must not race with a pending `wait_reply`.
    pub fn reset(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) = 0;
    }

    /// Replies recorded since the last reset.
    pub fn count(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until at least `expected` replies were recorded or `timeout`
    /// elapsed. Returns whether the quorum was met.
    pub async fn wait_reply(&self, expected: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count() >= expected {
                return true;
            }
            // Woken or timed out; the count decides either way.
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.count() >= expected;
            }
        }
    }
}

/// Name under which a reply target is registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Identity with a fixed name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Fresh random identity.
    pub fn random() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }

    /// The identity's name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address a remote peer sends replies to: identity plus endpoint.
#[derive(Debug, Clone)]
pub struct ReplyProxy {
    /// Identity the reply is dispatched to.
    pub identity: Identity,
    /// Endpoint the reply datagram is sent to.
    pub endpoint: Arc<dyn Endpoint>,
}

/// A registered collector and the proxy that reaches it.
#[derive(Debug, Clone)]
pub struct ReplyTarget {
    collector: Arc<ReplyCollector>,
    proxy: ReplyProxy,
}

impl ReplyTarget {
    /// The collector counting replies for this target.
    pub fn collector(&self) -> &Arc<ReplyCollector> {
        &self.collector
    }

    /// The proxy handed to peers.
    pub fn proxy(&self) -> &ReplyProxy {
        &self.proxy
    }

    /// Identity the target is registered under.
    pub fn identity(&self) -> &Identity {
        &self.proxy.identity
    }
}

struct AdapterInner {
    endpoint: Arc<dyn Endpoint>,
    collectors: Mutex<HashMap<Identity, Arc<ReplyCollector>>>,
}

/// Registry of reply collectors keyed by identity.
///
/// Replies for an identity that is not (or no longer) registered are
/// dropped, which is what isolates one retry attempt from stray replies to
/// the previous one.
#[derive(Clone)]
pub struct ReplyAdapter {
    inner: Arc<AdapterInner>,
}

impl fmt::Debug for ReplyAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyAdapter")
            .field("endpoint", &self.inner.endpoint.to_string())
            .field("registered", &self.len())
            .finish()
    }
}

impl ReplyAdapter {
    /// Create an adapter receiving replies on `endpoint`.
    pub fn new(endpoint: Arc<dyn Endpoint>) -> Self {
        Self {
            inner: Arc::new(AdapterInner {
                endpoint,
                collectors: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Endpoint replies are addressed to.
    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.inner.endpoint
    }

    /// Register `collector` under `identity`.
    pub fn add(&self, identity: Identity, collector: Arc<ReplyCollector>) -> ReplyProxy {
        self.inner
            .collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity.clone(), collector);
        ReplyProxy {
            identity,
            endpoint: self.inner.endpoint.clone(),
        }
    }

    /// Register `collector` under a fresh random identity.
    pub fn add_with_uuid(&self, collector: Arc<ReplyCollector>) -> ReplyProxy {
        self.add(Identity::random(), collector)
    }

    /// Unregister an identity.
    pub fn remove(&self, identity: &Identity) -> Option<Arc<ReplyCollector>> {
        self.inner
            .collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity)
    }

    /// Create and register a new collector.
    pub fn register(&self) -> ReplyTarget {
        let collector = Arc::new(ReplyCollector::new());
        let proxy = self.add_with_uuid(collector.clone());
        ReplyTarget { collector, proxy }
    }

    /// Retire `old` and register a new collector under a new identity.
    pub fn replace(&self, old: &ReplyTarget) -> ReplyTarget {
        self.remove(old.identity());
        let target = self.register();
        tracing::debug!(old = %old.identity(), new = %target.identity(), "replaced reply target");
        target
    }

    /// Deliver one reply. Returns whether the identity was registered.
    pub fn dispatch(&self, identity: &Identity) -> bool {
        let collector = self
            .inner
            .collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned();
        match collector {
            Some(collector) => {
                collector.reply();
                true
            }
            None => {
                tracing::debug!(%identity, "dropping reply for unregistered identity");
                false
            }
        }
    }

    /// Number of registered identities.
    pub fn len(&self) -> usize {
        self.inner
            .collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no identity is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
