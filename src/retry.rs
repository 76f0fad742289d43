//! Retry with exponential backoff for operational failures.

use crate::config::RetryPolicy;
use crate::error::{MediaError, Result};
use std::thread;
use tokio_util::sync::CancellationToken;

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are used up. Sleeps between attempts.
pub fn with_backoff<T>(
    policy: &RetryPolicy,
    what: &str,
    cancel: &CancellationToken,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = policy.delay(attempt);
                tracing::warn!("{} failed (attempt {}/{}), retrying in {:?}: {}",
                    what, attempt, attempts, delay, e);
                thread::sleep(delay);
                if cancel.is_cancelled() {
                    return Err(MediaError::Cancelled);
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
