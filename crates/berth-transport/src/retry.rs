//! Bounded retry with exponential backoff and jitter.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use berth_types::GatewayError;

/// Retry `operation` up to `max_retries` additional times after the first
/// attempt, sleeping `base_delay * 2^n` between attempts.
pub async fn retry_with_backoff<T, F, Fut>(
    max_retries: u32,
    base_delay: Duration,
    mut operation: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut last_err = None;
    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = backoff_delay(base_delay, attempt, Duration::from_secs(30));
            debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after failure");
            tokio::time::sleep(delay).await;
        }
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                debug!(attempt, error = %err, "operation attempt failed");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| GatewayError::Internal("retry with zero attempts".to_string())))
}

/// Exponential backoff with ±20% jitter, capped at `max`.
///
/// Jitter is derived from the clock's sub-millisecond noise rather than a
/// PRNG; the spread only needs to break synchronization, not be uniform.
pub fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let backoff = base.saturating_mul(1u32 << shift).min(max);

    let jitter_range = backoff.as_millis() as u64 / 5;
    if jitter_range == 0 {
        return backoff;
    }
    let noise = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0)
        ^ u64::from(std::process::id());
    let offset = (noise % (jitter_range * 2)) as i64 - jitter_range as i64;
    let jittered = backoff.as_millis() as i64 + offset;
    Duration::from_millis(jittered.max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let attempts = AtomicU32::new(0);
        let result = retry_with_backoff(3, Duration::from_millis(1), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(GatewayError::ConnectFailed("not yet".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let result: Result<(), _> = retry_with_backoff(2, Duration::from_millis(1), || async {
            Err(GatewayError::Timeout("still down".to_string()))
        })
        .await;
        assert!(matches!(result.unwrap_err(), GatewayError::Timeout(_)));
    }

    #[test]
    fn test_backoff_is_capped() {
        let cap = Duration::from_secs(30);
        let delay = backoff_delay(Duration::from_secs(1), 12, cap);
        // Cap plus at most 20% jitter.
        assert!(delay <= cap + cap / 5);
        assert!(delay >= cap - cap / 5);
    }

    #[test]
    fn test_backoff_grows() {
        let d1 = backoff_delay(Duration::from_secs(1), 1, Duration::from_secs(30));
        let d3 = backoff_delay(Duration::from_secs(1), 3, Duration::from_secs(30));
        assert!(d3 > d1);
    }
}
