use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::Result;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Backoff before retry number `attempt` (zero-based): `base * 2^attempt`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1_u32 << attempt.min(16))
}

/// Run `op`, retrying transient failures up to `max_retries` more times.
///
/// Permanent failures are returned immediately; when retries run out the last
/// error is returned.
pub async fn with_retry<T, F, Fut>(max_retries: u32, base_delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_retries => {
                let delay = backoff_delay(base_delay, attempt);
                warn!(error = %err, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "transient beans failure; backoff");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
