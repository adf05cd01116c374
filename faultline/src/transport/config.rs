//! # Fault Configuration
//!
//! Shared fault parameters consulted by every decorated endpoint and
//! transceiver on each operation.
//!
//! | Fault | Field | Default | Effect |
//! |-------|-------|---------|--------|
//! | Connect delay | `connect_delay` | 0 | Sleep before connecting |
//! | Connect failure | `connect_failure` | false | `connect()` fails with `InjectedFailure` |
//! | Read delay | `read_delay` | 0 | Sleep before each read |
//! | Read failure | `read_failure` | false | `read()` fails with `InjectedFailure` |
//! | Write delay | `write_delay` | 0 | Sleep before each write |
//! | Write failure | `write_failure` | false | `write()` fails with `InjectedFailure` |
//! | Bit flip | `bit_flip_probability` | 0.0 | Flip one random bit of an outgoing datagram |
//! | Send buffer | `send_buffer_size` | None | Override applied to new connections |
//!
//! Parameters are expected to be set between scenarios rather than during
//! one; readers take a snapshot per operation.
//!
//! ```rust
//! use faultline::transport::Configuration;
//! use std::time::Duration;
//!
//! let config = Configuration::shared();
//! config.set_write_delay(Duration::from_millis(5));
//! config.set_send_buffer_size(Some(64000));
//! assert_eq!(config.snapshot().send_buffer_size, Some(64000));
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

/// Fault parameters in effect for one operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaultSettings {
    /// Delay applied before connecting.
    pub connect_delay: Duration,
    /// Fail every connect attempt.
    pub connect_failure: bool,
    /// Delay applied before each read.
    pub read_delay: Duration,
    /// Fail every read.
    pub read_failure: bool,
    /// Delay applied before each write.
    pub write_delay: Duration,
    /// Fail every write.
    pub write_failure: bool,
    /// Probability (0.0 - 1.0) of flipping one bit in an outgoing datagram.
    pub bit_flip_probability: f64,
    /// Send buffer size applied to connections opened after it is set.
    pub send_buffer_size: Option<usize>,
}

impl FaultSettings {
    /// All faults disabled.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Bit flip probability usable as a chance: NaN reads as 0, anything
    /// else is clamped to `[0, 1]`.
    pub fn bit_flip_chance(&self) -> f64 {
        if self.bit_flip_probability.is_nan() {
            0.0
        } else {
            self.bit_flip_probability.clamp(0.0, 1.0)
        }
    }
}

/// Handle returned by [`Configuration::add_update_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type UpdateCallback = Arc<dyn Fn(&FaultSettings) + Send + Sync>;

/// Process-wide fault configuration shared by a decorated hierarchy.
pub struct Configuration {
    settings: RwLock<FaultSettings>,
    callbacks: Mutex<Vec<(CallbackId, UpdateCallback)>>,
    next_callback: AtomicU64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new(FaultSettings::disabled())
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("settings", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl Configuration {
    /// Create a configuration with the given initial settings.
    pub fn new(settings: FaultSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
            callbacks: Mutex::new(Vec::new()),
            next_callback: AtomicU64::new(1),
        }
    }

    /// Create a shared configuration with all faults disabled.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Copy of the current settings.
    pub fn snapshot(&self) -> FaultSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Modify the settings and notify update callbacks with the result.
    pub fn update(&self, f: impl FnOnce(&mut FaultSettings)) {
        let updated = {
            let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut settings);
            settings.clone()
        };
        tracing::debug!(settings = ?updated, "fault configuration updated");

        let callbacks: Vec<UpdateCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(&updated);
        }
    }

    /// Register a callback invoked after every update.
    pub fn add_update_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&FaultSettings) + Send + Sync + 'static,
    {
        let id = CallbackId(self.next_callback.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        id
    }

    /// Unregister a callback. Returns whether it was registered.
    pub fn remove_update_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        let before = callbacks.len();
        callbacks.retain(|(cb_id, _)| *cb_id != id);
        callbacks.len() != before
    }

    /// Set the connect delay.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.update(|s| s.connect_delay = delay);
    }

    /// Enable or disable forced connect failures.
    pub fn set_connect_failure(&self, fail: bool) {
        self.update(|s| s.connect_failure = fail);
    }

    /// Set the read delay.
    pub fn set_read_delay(&self, delay: Duration) {
        self.update(|s| s.read_delay = delay);
    }

    /// Enable or disable forced read failures.
    pub fn set_read_failure(&self, fail: bool) {
        self.update(|s| s.read_failure = fail);
    }

    /// Set the write delay.
    pub fn set_write_delay(&self, delay: Duration) {
        self.update(|s| s.write_delay = delay);
    }

    /// Enable or disable forced write failures.
    pub fn set_write_failure(&self, fail: bool) {
        self.update(|s| s.write_failure = fail);
    }

    /// Set the bit flip probability, clamped to 0.0 - 1.0.
    pub fn set_bit_flip_probability(&self, probability: f64) {
        self.update(|s| s.bit_flip_probability = probability.clamp(0.0, 1.0));
    }

    /// Set or clear the send buffer override.
    pub fn set_send_buffer_size(&self, size: Option<usize>) {
        self.update(|s| s.send_buffer_size = size);
    }

    /// Current send buffer override.
    pub fn send_buffer_size(&self) -> Option<usize> {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .send_buffer_size
    }
}
