//! Retry helper with exponential backoff and full jitter for outbound API calls.

use rand::Rng;
use std::fmt::Display;
use std::time::Duration;
use tokio::time::sleep;

/// Base backoff (ms)
const BACKOFF_BASE_MS: u64 = 100;
/// Maximum backoff cap (ms)
const BACKOFF_MAX_MS: u64 = 5000;

/// Call async closure `op` up to `max_attempts` times, backing off with full
/// jitter between attempts. The per-attempt timeout is left to the underlying
/// HTTP client, which is always built with one.
pub async fn with_retry<F, Fut, T, E>(max_attempts: usize, op: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= max_attempts {
                    return Err(e);
                }
                let backoff_ms = backoff_with_jitter(attempt);
                tracing::debug!(
                    "call failed (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt,
                    max_attempts,
                    e,
                    backoff_ms
                );
                sleep(Duration::from_millis(backoff_ms)).await;
            }
        }
    }
}

/// random(0, min(BACKOFF_MAX_MS, BACKOFF_BASE_MS * 2^(attempt-1)))
fn backoff_with_jitter(attempt: usize) -> u64 {
    let mut rng = rand::thread_rng();
    let exp_backoff =
        BACKOFF_BASE_MS.saturating_mul(2_u64.saturating_pow((attempt.saturating_sub(1)) as u32));
    rng.gen_range(0..=exp_backoff.min(BACKOFF_MAX_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backoff_within_bounds() {
        assert!(backoff_with_jitter(1) <= BACKOFF_BASE_MS);
        assert!(backoff_with_jitter(2) <= BACKOFF_BASE_MS * 2);
        assert!(backoff_with_jitter(20) <= BACKOFF_MAX_MS);
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let result: Result<i32, String> = with_retry(3, || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let calls = AtomicUsize::new(0);
        let result: Result<i32, String> = with_retry(3, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("transient".to_string())
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let result: Result<i32, String> =
            with_retry(2, || async { Err("permanent".to_string()) }).await;
        assert_eq!(result.unwrap_err(), "permanent");
    }
}
