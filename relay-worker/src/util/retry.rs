//! Explicit retry wrapper for outbound calls.
//!
//! Only transient transport failures (connection refused, connection aborted
//! or timed out) are retried. HTTP error statuses, DNS failures and every
//! other error are returned to the caller on the first attempt.

use std::error::Error as StdError;
use std::fmt::Display;
use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

/// Maximum number of attempts for a single logical webhook call.
pub const MAX_WEBHOOK_ATTEMPTS: u32 = 3;

/// Fixed delay before resubmitting a call that failed to connect.
pub const WEBHOOK_RETRY_DELAY: Duration = Duration::from_secs(60);

/// How many times, and how far apart, a failing call is resubmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Wait between two attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_WEBHOOK_ATTEMPTS,
            delay: WEBHOOK_RETRY_DELAY,
        }
    }
}

/// Run `call` until it succeeds, fails with a non-transient error, or the
/// policy runs out of attempts.
///
/// `call` receives the 1-based attempt number so it can stamp the request
/// (the webhook dispatcher puts it in `X-Webhook-Attempt`).
pub async fn with_retry<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    is_transient: C,
    mut call: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match call(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && is_transient(&e) => {
                warn!(
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = policy.delay.as_millis() as u64,
                    error = %e,
                    "outbound_call_retrying"
                );
                sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => {
                if is_transient(&e) {
                    warn!(
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %e,
                        "outbound_call_attempts_exhausted"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Whether a reqwest failure is a connection refused/aborted condition.
///
/// Timeouts count as aborted connections.
pub fn is_transient_transport_error(err: &reqwest::Error) -> bool {
    if err.is_timeout() {
        return true;
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                ErrorKind::ConnectionRefused | ErrorKind::ConnectionAborted | ErrorKind::TimedOut
            ) {
                return true;
            }
        }
        source = cause.source();
    }

    false
}
