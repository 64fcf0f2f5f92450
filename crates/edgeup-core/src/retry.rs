use std::thread;
use std::time::Duration;

/// Attempt budget for a step that talks to the network. One attempt means
/// no retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn once() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    /// Runs `op` until it succeeds, the budget is spent, or `retryable`
    /// rejects the error. The backoff doubles after each failed attempt.
    pub fn run<T, E, F, R>(&self, label: &str, mut op: F, retryable: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let attempts = self.attempts.max(1);
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts && retryable(&err) => {
                    tracing::warn!(
                        step = label,
                        attempt,
                        attempts,
                        error = %err,
                        "attempt failed; retrying"
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}
