//! Connect retry with backoff.
//!
//! The NATS and Kafka clients reconnect on their own; RabbitMQ and AMQP 1.0
//! clients do not, so their adapters run the initial connect through
//! [`connect_with_retry`], driven by the configured [`ReconnectPolicy`].
//!
//! - Only [`PipeError::Connection`] is retried
//! - Every attempt is bounded by the connect timeout
//! - Delays grow by `multiplier` up to `max_delay`, with ±25% jitter; the
//!   policy's `backoff` sets the multiplier, 1 keeping the delay fixed
//!
//! [`ReconnectPolicy`]: crate::ReconnectPolicy

#![cfg_attr(
    not(any(feature = "transport_lapin", feature = "transport_fe2o3")),
    allow(dead_code)
)]

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::BuildHasher;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use crate::{
    //
    log_debug,
    log_warn,
    PipeError,
    Result,
    Settings,
};

/// Backoff schedule for retried operations.
#[derive(Debug, Clone)]
pub(crate) struct RetryConfig {
    /// Retries after the first attempt (0 = run once).
    pub max_attempts: u32,

    /// Factor applied to the delay after each retry.
    pub multiplier: f32,

    pub initial_delay: Duration,

    /// Cap on the delay between attempts.
    pub max_delay: Duration,
}

#[cfg(test)]
impl Default for RetryConfig {
    /// - `max_attempts`: 3
    /// - `multiplier`: 2.0
    /// - `initial_delay`: 100ms
    /// - `max_delay`: 5s
    fn default() -> Self {
        // ---
        Self {
            max_attempts: 3,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Run `operation`, retrying connection failures per `retry_config`.
///
/// Any other error is returned immediately. With `None` the operation runs
/// exactly once.
pub(crate) async fn retry_with_backoff<F, Fut, T>(
    retry_config: Option<&RetryConfig>,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    // ---
    let Some(retry_config) = retry_config else {
        return operation().await;
    };

    let mut attempt = 0;
    let mut current_delay = retry_config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(PipeError::Connection(details)) => {
                attempt += 1;

                if attempt > retry_config.max_attempts {
                    log_debug!(
                        "retry exhausted after {} attempts, last error: {details}",
                        retry_config.max_attempts
                    );
                    return Err(PipeError::Connection(details));
                }

                let jittered_delay = apply_jitter(current_delay);

                log_debug!(
                    "retry attempt {attempt}/{}, waiting {jittered_delay:?} (error: {details})",
                    retry_config.max_attempts
                );

                sleep(jittered_delay).await;

                let next_delay = Duration::from_secs_f64(
                    current_delay.as_secs_f64() * retry_config.multiplier as f64,
                );
                current_delay = next_delay.min(retry_config.max_delay);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Open a broker connection under the settings' timeout and reconnect policy.
///
/// An attempt that outlives `connect_timeout` counts as a connection failure
/// and is retried like one.
pub(crate) async fn connect_with_retry<F, Fut, T>(
    settings: &Settings,
    label: &str,
    mut connect: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    // ---
    let limit = settings.connect_timeout();
    let retry = settings.reconnect.retry_config();

    retry_with_backoff(retry.as_ref(), || {
        let attempt = connect();
        async move {
            match timeout(limit, attempt).await {
                Ok(result) => result,
                Err(_) => {
                    let msg = format!("{label}: connect timed out after {limit:?}");
                    log_warn!("{msg}");
                    Err(PipeError::Connection(msg))
                }
            }
        }
    })
    .await
}

/// Scale `delay` by a random factor in `0.75..1.25`.
fn apply_jitter(delay: Duration) -> Duration {
    // ---
    let random_state = RandomState::new();
    let hash = random_state.hash_one(std::time::SystemTime::now());

    let random_factor = (hash % 1000) as f64 / 1000.0;
    let jitter_multiplier = 0.75 + (random_factor * 0.5);

    Duration::from_secs_f64(delay.as_secs_f64() * jitter_multiplier)
}
