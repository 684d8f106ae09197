//! Retry disciplines used while waiting for a dependency to come up.
//!
//! The broker is awaited forever under exponential backoff with jitter, since an orchestrated
//! deployment eventually brings it up. HTTP-backed stores are awaited a bounded number of times
//! at a fixed interval and exhaustion is treated as fatal by the caller.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry forever, doubling the wait from `base` up to `cap` and adding `[0, base)` of jitter.
    Unbounded { base: Duration, cap: Duration },
    /// Give up after `attempts` dials spaced `interval` apart.
    Bounded { attempts: u32, interval: Duration },
}

impl RetryPolicy {
    /// Policy used for the message broker.
    pub const fn broker() -> Self {
        RetryPolicy::Unbounded {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }

    /// Policy used for storage dependencies behind the HTTP services.
    pub const fn store() -> Self {
        RetryPolicy::Bounded {
            attempts: 10,
            interval: Duration::from_secs(2),
        }
    }

    /// Wait before the next dial after `attempt` consecutive failures (1-based).
    ///
    /// Returns `None` once a bounded policy has used up its attempts.
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Option<Duration> {
        match *self {
            RetryPolicy::Unbounded { base, cap } => {
                Some(backoff_floor(base, cap, attempt) + jitter(base, rng))
            }
            RetryPolicy::Bounded { attempts, interval } => {
                if attempt < attempts {
                    Some(interval)
                } else {
                    None
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::broker()
    }
}

/// Deterministic part of the unbounded wait: `min(base * 2^(attempt-1), cap)`.
pub fn backoff_floor(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map(|wait| wait.min(cap))
        .unwrap_or(cap)
}

fn jitter<R: Rng + ?Sized>(base: Duration, rng: &mut R) -> Duration {
    let span = base.as_nanos().min(u64::MAX as u128) as u64;
    if span == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rng.gen_range(0..span))
}

#[derive(Debug, Error)]
#[error("{dependency} unavailable after {attempts} attempts: {last_error}")]
pub struct RetryExhausted {
    pub dependency: String,
    pub attempts: u32,
    pub last_error: String,
}

/// Dial `dependency` until it answers or `policy` gives up.
///
/// Under [`RetryPolicy::Unbounded`] this only returns once `dial` succeeds.
pub async fn retry_connect<T, E, F, Fut>(
    dependency: &str,
    policy: &RetryPolicy,
    mut dial: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut rng = StdRng::from_entropy();
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        match dial().await {
            Ok(value) => {
                info!(dependency, attempt, "connected");
                return Ok(value);
            }
            Err(err) => match policy.delay(attempt, &mut rng) {
                Some(wait) => {
                    warn!(
                        dependency,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "dependency not ready; retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                None => {
                    error!(dependency, attempt, error = %err, "giving up on dependency");
                    return Err(RetryExhausted {
                        dependency: dependency.to_string(),
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }
            },
        }
    }
}
