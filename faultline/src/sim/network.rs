//! In-process datagram network.
//!
//! | Behavior | Config / Method | Default |
//! |----------|-----------------|---------|
//! | Send limit | `send_buffer_size` | 65507 bytes |
//! | Receive buffer | `recv_buffer_size` / `bind(.., Some(n))` | 65507 bytes |
//! | Random loss | `loss_probability` | 0% |
//! | Deterministic loss | `drop_next(n)` | none |
//! | Multicast | several listeners bound to one address | all receive a copy |
//!
//! Datagrams larger than a listener's receive buffer are dropped silently for
//! that listener, like a kernel discarding what does not fit.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;

use crate::transport::{Incoming, Transceiver};

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// Parameters of a [`LoopbackNetwork`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoopbackConfig {
    /// Seed of the loss RNG.
    pub seed: u64,
    /// Probability (0.0 - 1.0) that a datagram is lost.
    pub loss_probability: f64,
    /// Send buffer of new connections.
    pub send_buffer_size: usize,
    /// Receive buffer of listeners bound without an explicit size.
    pub recv_buffer_size: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            loss_probability: 0.0,
            send_buffer_size: MAX_DATAGRAM_SIZE,
            recv_buffer_size: MAX_DATAGRAM_SIZE,
        }
    }
}

impl LoopbackConfig {
    /// Lossy network for retry testing.
    pub fn lossy(seed: u64, loss_probability: f64) -> Self {
        Self {
            seed,
            loss_probability: loss_probability.clamp(0.0, 1.0),
            ..Self::default()
        }
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Datagrams handed to the network.
    pub sent: u64,
    /// Copies delivered to listeners.
    pub delivered: u64,
    /// Datagrams lost before reaching any listener.
    pub lost: u64,
    /// Copies dropped for exceeding a receive buffer.
    pub oversized: u64,
    /// Datagrams sent to an address nobody listens on.
    pub unroutable: u64,
}

struct ListenerSlot {
    id: u64,
    recv_buffer_size: usize,
    tx: mpsc::UnboundedSender<Incoming>,
}

struct NetworkState {
    config: LoopbackConfig,
    rng: ChaCha8Rng,
    listeners: HashMap<(String, u16), Vec<ListenerSlot>>,
    recv_overrides: HashMap<(String, u16), usize>,
    next_id: u64,
    drop_next: u32,
    stats: NetworkStats,
}

/// Shared handle to an in-process datagram network.
#[derive(Clone)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

impl fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("LoopbackNetwork")
            .field("config", &state.config)
            .field("stats", &state.stats)
            .finish_non_exhaustive()
    }
}

impl LoopbackNetwork {
    /// Create a network.
    pub fn new(config: LoopbackConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self {
            inner: Arc::new(Mutex::new(NetworkState {
                config,
                rng,
                listeners: HashMap::new(),
                recv_overrides: HashMap::new(),
                next_id: 1,
                drop_next: 0,
                stats: NetworkStats::default(),
            })),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current configuration.
    pub fn config(&self) -> LoopbackConfig {
        self.state().config.clone()
    }

    /// Change the loss probability.
    pub fn set_loss_probability(&self, probability: f64) {
        self.state().config.loss_probability = probability.clamp(0.0, 1.0);
    }

    /// Lose the next `count` datagrams regardless of probability.
    pub fn drop_next(&self, count: u32) {
        self.state().drop_next = count;
    }

    /// Delivery counters so far.
    pub fn stats(&self) -> NetworkStats {
        self.state().stats
    }

    /// Receive buffer for listeners bound to `host:port` from now on.
    pub fn set_recv_buffer_size(&self, host: &str, port: u16, size: usize) {
        self.state()
            .recv_overrides
            .insert((host.to_string(), port), size);
    }

    /// Listen on `host:port`. Several listeners may share an address.
    ///
    /// The receive buffer is `recv_buffer_size`, else the per-address
    /// override, else the network default.
    pub fn bind(
        &self,
        host: &str,
        port: u16,
        recv_buffer_size: Option<usize>,
    ) -> (u64, mpsc::UnboundedReceiver<Incoming>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        let recv_buffer_size = recv_buffer_size
            .or_else(|| state.recv_overrides.get(&(host.to_string(), port)).copied())
            .unwrap_or(state.config.recv_buffer_size);
        state
            .listeners
            .entry((host.to_string(), port))
            .or_default()
            .push(ListenerSlot {
                id,
                recv_buffer_size,
                tx,
            });
        tracing::debug!(host, port, id, recv_buffer_size, "listener bound");
        (id, rx)
    }

    /// Remove a listener.
    pub fn unbind(&self, host: &str, port: u16, id: u64) {
        let mut state = self.state();
        let key = (host.to_string(), port);
        if let Some(slots) = state.listeners.get_mut(&key) {
            slots.retain(|slot| slot.id != id);
            if slots.is_empty() {
                state.listeners.remove(&key);
            }
        }
    }

    /// Number of listeners bound to `host:port`.
    pub fn listener_count(&self, host: &str, port: u16) -> usize {
        self.state()
            .listeners
            .get(&(host.to_string(), port))
            .map_or(0, Vec::len)
    }

    /// Route a datagram to every listener on `host:port`.
    ///
    /// Returns the number of copies delivered. Loss is decided once per
    /// datagram, before fan-out.
    pub fn deliver(
        &self,
        host: &str,
        port: u16,
        payload: &[u8],
        back_channel: Arc<dyn Transceiver>,
    ) -> usize {
        let mut state = self.state();
        state.stats.sent += 1;

        if state.drop_next > 0 {
            state.drop_next -= 1;
            state.stats.lost += 1;
            tracing::debug!(host, port, bytes = payload.len(), "datagram dropped");
            return 0;
        }
        let loss = state.config.loss_probability;
        if loss > 0.0 && state.rng.random_bool(loss) {
            state.stats.lost += 1;
            tracing::debug!(host, port, bytes = payload.len(), "datagram lost");
            return 0;
        }

        let NetworkState {
            listeners, stats, ..
        } = &mut *state;
        let Some(slots) = listeners.get_mut(&(host.to_string(), port)) else {
            stats.unroutable += 1;
            tracing::trace!(host, port, "no listener for datagram");
            return 0;
        };

        let mut delivered = 0;
        slots.retain(|slot| {
            if payload.len() > slot.recv_buffer_size {
                stats.oversized += 1;
                tracing::debug!(
                    host,
                    port,
                    bytes = payload.len(),
                    recv_buffer_size = slot.recv_buffer_size,
                    "datagram exceeds receive buffer, dropped"
                );
                return true;
            }
            let incoming = Incoming {
                payload: payload.to_vec(),
                back_channel: back_channel.clone(),
            };
            match slot.tx.send(incoming) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        stats.delivered += delivered as u64;
        delivered
    }
}
