use std::future::Future;

use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollConfig {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

#[derive(Debug)]
pub enum PollError<E> {
    /// The deadline passed before the check succeeded
    Timeout,
    /// The cancellation token fired
    Cancelled,
    /// The check itself failed; polling stops immediately
    Failed(E),
}

/// Runs `check` until it yields `Some`, the deadline passes, or `cancel` fires.
///
/// The first check runs immediately. A check that is still in flight when the
/// deadline passes is allowed to finish; its result still counts.
pub async fn poll_until<T, E, F, Fut>(
    config: PollConfig,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = Instant::now() + config.timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }
        if let Some(value) = check().await.map_err(PollError::Failed)? {
            return Ok(value);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::Timeout);
        }
        let wake = std::cmp::min(now + config.interval, deadline);
        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = sleep_until(wake) => {}
        }
    }
}

/// Sleeps for `delay` unless `cancel` fires first. Returns false when cancelled.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
