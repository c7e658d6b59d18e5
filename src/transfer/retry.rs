//! Deadlock Retry Policy
//!
//! Bounded retry with exponential backoff. Only transient conflicts
//! (deadlock, serialization failure) are retried, and every retry re-runs the
//! whole unit of work in a fresh scope.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::store::ConflictKind;

use super::TransferError;

/// What to do with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry(ConflictKind),
    Fatal,
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter: true,
        }
    }

    /// Policy that surfaces the first conflict as exhausted
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn classify(err: &TransferError) -> Disposition {
        match err.conflict_kind() {
            Some(kind) => Disposition::Retry(kind),
            None => Disposition::Fatal,
        }
    }

    /// Un-jittered delay before retry number `retry` (0-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_delay)
    }

    /// Delay before retry number `retry`, with equal jitter applied:
    /// half the backoff is fixed, the other half is random.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let backoff = self.backoff(retry);
        if !self.jitter || backoff.is_zero() {
            return backoff;
        }

        let half = backoff / 2;
        let spread = u64::try_from(half.as_micros()).unwrap_or(u64::MAX);
        half + Duration::from_micros(rand::thread_rng().gen_range(0..=spread))
    }

    /// Run `attempt` until it succeeds, fails fatally, or the retry bound is
    /// hit. `attempt` receives the 0-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        deadline: Option<Instant>,
        mut attempt: F,
    ) -> Result<T, TransferError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let mut retry = 0;

        loop {
            let err = match attempt(retry).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let kind = match Self::classify(&err) {
                Disposition::Retry(kind) => kind,
                Disposition::Fatal => return Err(err),
            };

            if retry >= self.max_retries {
                tracing::warn!(
                    attempts = retry + 1,
                    conflict = %kind,
                    "Transaction conflict persisted, giving up"
                );
                return Err(TransferError::RetriesExhausted {
                    attempts: retry + 1,
                    last: kind,
                });
            }

            let delay = self.delay_for(retry);
            if deadline.map_or(false, |d| Instant::now() + delay >= d) {
                return Err(TransferError::DeadlineExceeded);
            }

            tracing::warn!(
                attempt = retry + 1,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                conflict = %kind,
                "Transaction conflict, retrying"
            );
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}
