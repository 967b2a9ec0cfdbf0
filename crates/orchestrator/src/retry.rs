use std::{future::Future, time::Duration};

use tracing::warn;

use crate::{errors::GatewayError, COMPONENT};

/// Runs a gateway operation with bounded retries and exponential backoff.
///
/// Only transient errors are retried; a rejection is returned immediately. The delay doubles
/// after every failed attempt starting from `base_delay`, so `attempts = 3` with a 2s base
/// sleeps 2s and 4s between tries.
pub async fn with_backoff<T, F, Fut>(
    operation: &str,
    attempts: u32,
    base_delay: Duration,
    mut f: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let attempts = attempts.max(1);
    let mut delay = base_delay;

    for attempt in 1..=attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                warn!(
                    target: COMPONENT,
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %err,
                    "Transient gateway error, backing off"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            },
            Err(err) => return Err(err),
        }
    }

    unreachable!("loop returns on the final attempt")
}
