use std::{fmt, future::Future};
use tokio::time::{self, Duration, Instant};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The attempt did not succeed before the deadline.
#[derive(Debug, thiserror::Error)]
#[error("timed out after {elapsed:?} ({attempts} attempts): {last}")]
pub struct Timeout {
    pub elapsed: Duration,
    pub attempts: usize,
    /// A description of the last attempt.
    pub last: String,
}

/// Runs `attempt` every `interval` until it yields `Ok` or `timeout` elapses.
///
/// The attempt's errors are only kept to describe the last outcome on timeout.
pub async fn poll<T, E, F, Fut>(interval: Duration, timeout: Duration, mut attempt: F) -> Result<T, Timeout>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let mut attempts = 0;
    loop {
        attempts += 1;
        let last = match attempt().await {
            Ok(value) => return Ok(value),
            Err(error) => error.to_string(),
        };
        if start.elapsed() + interval >= timeout {
            return Err(Timeout {
                elapsed: start.elapsed(),
                attempts,
                last,
            });
        }
        tracing::trace!(attempts, %last, "Retrying");
        time::sleep(interval).await;
    }
}
