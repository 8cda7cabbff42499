//! Per-item retry budget for storage transfers (§4.2): 3 attempts,
//! exponential backoff with a 100 ms base and a 2 s cap.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_millis(100);
const MAX_DELAY: Duration = Duration::from_secs(2);

/// Run `op` up to `MAX_ATTEMPTS` times, sleeping with exponential backoff
/// (plus jitter) between attempts. Returns the last error if every attempt
/// fails.
pub async fn retry_with_backoff<T, E, F, Fut>(mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= MAX_ATTEMPTS {
                    return Err(err);
                }
                let delay = backoff_delay(attempt);
                log::debug!("storage transfer attempt {attempt} failed, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let scaled = BASE_DELAY.saturating_mul(1u32 << (attempt - 1).min(16));
    let capped = scaled.min(MAX_DELAY);
    let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4 + 1);
    capped + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn succeeds_without_retry_on_first_try() {
        let calls = Cell::new(0);
        let result: Result<i32, &str> = retry_with_backoff(|| {
            calls.set(calls.get() + 1);
            async { Ok(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<i32, &str> = retry_with_backoff(|| {
            calls.set(calls.get() + 1);
            async { Err("boom") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), MAX_ATTEMPTS);
    }
}
