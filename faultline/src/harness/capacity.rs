//! Empirical search for the largest datagram a transport accepts.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

use super::reply::{ReplyProxy, ReplyTarget};

/// Growth schedule and assertions of the capacity probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityProbe {
    /// Size the growth starts from; the first payload sent is `2 * seed + increment`.
    pub seed_size: usize,
    /// Added after each doubling.
    pub increment: usize,
    /// The last accepted size must exceed this.
    pub floor: usize,
    /// Wait this long for an acknowledgement after each accepted payload.
    /// `None` grows without waiting.
    pub ack_timeout: Option<Duration>,
    /// Growth past this size without a rejection is a failure.
    pub max_size: usize,
    /// Send buffer ceiling configured before the oversized check.
    pub send_buffer_ceiling: usize,
    /// Payload size used by the oversized check.
    pub oversized_payload: usize,
    /// How long the oversized check waits for a reply that must not come.
    pub oversized_timeout: Duration,
}

impl Default for CapacityProbe {
    fn default() -> Self {
        Self {
            seed_size: 1024,
            increment: 10,
            floor: 16384,
            ack_timeout: None,
            max_size: 16 * 1024 * 1024,
            send_buffer_ceiling: 64000,
            oversized_payload: 50000,
            oversized_timeout: Duration::from_millis(500),
        }
    }
}

/// Outcome of the growth phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityReport {
    /// Largest payload sent successfully.
    pub last_accepted: usize,
    /// First payload the transport rejected.
    pub rejected: usize,
    /// Limit reported by the transport with the rejection.
    pub limit: usize,
    /// Payloads sent, including the rejected one.
    pub sends: u32,
}

/// Capacity probe failures.
#[derive(Debug, thiserror::Error)]
pub enum CapacityError {
    /// The boundary is at or below the floor.
    #[error("datagram limit too small: last accepted {last_accepted:?}, rejected {rejected}, floor {floor}")]
    BelowFloor {
        /// Largest accepted payload, if any was accepted.
        last_accepted: Option<usize>,
        /// First rejected payload.
        rejected: usize,
        /// Required floor.
        floor: usize,
    },

    /// Growth passed `max_size` without a rejection.
    #[error("no datagram limit observed up to {size} bytes (max {max_size})")]
    Unbounded {
        /// Size that would have been sent next.
        size: usize,
        /// Configured maximum.
        max_size: usize,
    },

    /// A transport error other than the datagram limit.
    #[error("unexpected transport error sending {size} bytes: {source}")]
    Unexpected {
        /// Payload size being sent.
        size: usize,
        /// The transport error.
        #[source]
        source: TransportError,
    },

    /// An oversized payload was answered.
    #[error("reply received for oversized payload of {size} bytes")]
    OversizedDelivered {
        /// Payload size.
        size: usize,
    },
}

impl CapacityProbe {
    /// Size sent after `size`, or `None` if it does not fit in a `usize`.
    pub fn next_size(&self, size: usize) -> Option<usize> {
        size.checked_mul(2)?.checked_add(self.increment)
    }

    /// Grow the payload until the transport reports its datagram limit.
    ///
    /// `send` transmits a payload carrying a reply proxy. Only
    /// [`TransportError::DatagramLimit`] ends the growth; any other error
    /// is returned as [`CapacityError::Unexpected`].
    pub async fn discover<F, Fut>(
        &self,
        target: &ReplyTarget,
        mut send: F,
    ) -> Result<CapacityReport, CapacityError>
    where
        F: FnMut(Vec<u8>, ReplyProxy) -> Fut,
        Fut: Future<Output = Result<(), TransportError>>,
    {
        let mut size = self.seed_size;
        let mut last_accepted = None;
        let mut sends = 0;

        loop {
            size = match self.next_size(size) {
                Some(next) if next <= self.max_size => next,
                next => {
                    return Err(CapacityError::Unbounded {
                        size: next.unwrap_or(usize::MAX),
                        max_size: self.max_size,
                    })
                }
            };

            target.collector().reset();
            sends += 1;
            match send(vec![0u8; size], target.proxy().clone()).await {
                Ok(()) => {
                    tracing::trace!(size, "payload accepted");
                    last_accepted = Some(size);
                    if let Some(timeout) = self.ack_timeout {
                        let acked = target.collector().wait_reply(1, timeout).await;
                        tracing::trace!(size, acked, "acknowledgement wait finished");
                    }
                }
                Err(TransportError::DatagramLimit { limit, .. }) => {
                    tracing::info!(rejected = size, ?last_accepted, limit, "datagram limit reached");
                    return match last_accepted {
                        Some(accepted) if accepted > self.floor => Ok(CapacityReport {
                            last_accepted: accepted,
                            rejected: size,
                            limit,
                            sends,
                        }),
                        _ => Err(CapacityError::BelowFloor {
                            last_accepted,
                            rejected: size,
                            floor: self.floor,
                        }),
                    };
                }
                Err(source) => return Err(CapacityError::Unexpected { size, source }),
            }
        }
    }

    /// Send an `oversized_payload` and require that no reply arrives.
    ///
    /// The send itself must succeed: the payload fits the raised send
    /// buffer and is dropped further along.
    pub async fn verify_oversized_dropped<F, Fut>(
        &self,
        target: &ReplyTarget,
        mut send: F,
    ) -> Result<(), CapacityError>
    where
        F: FnMut(Vec<u8>, ReplyProxy) -> Fut,
        Fut: Future<Output = Result<(), TransportError>>,
    {
        let size = self.oversized_payload;
        target.collector().reset();
        send(vec![0u8; size], target.proxy().clone())
            .await
            .map_err(|source| CapacityError::Unexpected { size, source })?;

        if target
            .collector()
            .wait_reply(1, self.oversized_timeout)
            .await
        {
            return Err(CapacityError::OversizedDelivered { size });
        }
        tracing::debug!(size, "oversized payload was not answered");
        Ok(())
    }
}
