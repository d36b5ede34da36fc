//! Backoff for connection establishment.
//!
//! Only the initial connect to a source or target is retried. Once a
//! transaction is open, a failure is final and must roll back.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Retries after the first attempt.
    pub retries: u32,
    /// Delay before the first retry.
    pub first_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::for_connections()
    }
}

impl Backoff {
    /// Schedule for opening database connections: 0.25s, 0.5s, 1s, 2s.
    #[must_use]
    pub const fn for_connections() -> Self {
        Self {
            retries: 4,
            first_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        self.first_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// `delay` plus up to a quarter of jitter, so concurrent runs spread out.
    fn jittered(&self, retry: u32) -> Duration {
        let base = self.delay(retry);
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        base + base.mul_f64(f64::from(nanos % 250) / 1000.0)
    }
}

/// Whether `error` is a transient connection failure worth retrying.
#[must_use]
pub fn is_transient(error: &Error) -> bool {
    match error {
        Error::Io(_) => true,
        Error::Database(sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut) => true,
        Error::Database(db) => transient_message(&db.to_string()),
        Error::SourceConnection(msg) | Error::TargetConnection(msg) => transient_message(msg),
        _ => false,
    }
}

fn transient_message(msg: &str) -> bool {
    const MARKERS: &[&str] = &[
        "timed out",
        "timeout",
        "connection refused",
        "connection reset",
        "too many connections",
        "starting up",
        "temporarily",
    ];
    let msg = msg.to_lowercase();
    MARKERS.iter().any(|m| msg.contains(m))
}

/// Runs `connect` until it succeeds, fails permanently, or the schedule is
/// exhausted. The last error is returned unchanged.
pub async fn with_retry<F, Fut, T>(backoff: Backoff, what: &'static str, mut connect: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry = 0;
    loop {
        match connect().await {
            Ok(value) => {
                if retry > 0 {
                    debug!(what, retry, "connected after retrying");
                }
                return Ok(value);
            }
            Err(e) if retry < backoff.retries && is_transient(&e) => {
                retry += 1;
                let delay = backoff.jittered(retry);
                warn!(what, retry, ?delay, "transient failure, retrying: {e}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
