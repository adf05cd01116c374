//! Bounded retry of quorum rounds over a lossy datagram transport.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

use super::reply::{ReplyAdapter, ReplyProxy, ReplyTarget};

/// Attempt budget and per-attempt wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of probe rounds.
    pub max_attempts: u32,
    /// How long each round waits for its quorum.
    pub per_attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            per_attempt_timeout: Duration::from_millis(2000),
        }
    }
}

/// Why a retried round never met its quorum.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// Every attempt timed out short of the quorum.
    #[error("quorum of {quorum} not reached after {attempts} attempts (last count {last_count})")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Replies required per attempt.
        quorum: usize,
        /// Replies counted in the final attempt.
        last_count: usize,
    },

    /// The probe itself failed; not retried.
    #[error("probe failed on attempt {attempt}: {source}")]
    Probe {
        /// Attempt on which the probe failed (1-based).
        attempt: u32,
        /// The transport error.
        #[source]
        source: TransportError,
    },
}

/// Runs probe rounds until one meets its quorum or the budget runs out.
///
/// A failed round retires its reply target and registers a fresh one under a
/// new identity, so late replies to the old round never count toward the next.
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    /// Create a controller with the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy in effect.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run rounds of `probe` against `target` until `quorum` replies arrive.
    ///
    /// Returns the 1-based attempt that met the quorum. On return `target`
    /// holds the reply target in use (replaced after each failed round).
    pub async fn run<F, Fut>(
        &self,
        adapter: &ReplyAdapter,
        target: &mut ReplyTarget,
        quorum: usize,
        mut probe: F,
    ) -> Result<u32, RetryError>
    where
        F: FnMut(ReplyProxy) -> Fut,
        Fut: Future<Output = Result<(), TransportError>>,
    {
        let mut last_count = 0;
        for attempt in 1..=self.policy.max_attempts {
            target.collector().reset();
            probe(target.proxy().clone())
                .await
                .map_err(|source| RetryError::Probe { attempt, source })?;

            if target
                .collector()
                .wait_reply(quorum, self.policy.per_attempt_timeout)
                .await
            {
                tracing::debug!(attempt, quorum, "quorum reached");
                return Ok(attempt);
            }

            last_count = target.collector().count();
            tracing::warn!(
                attempt,
                quorum,
                last_count,
                "quorum not reached, retrying with a new reply target"
            );
            *target = adapter.replace(target);
        }

        Err(RetryError::Exhausted {
            attempts: self.policy.max_attempts,
            quorum,
            last_count,
        })
    }
}
