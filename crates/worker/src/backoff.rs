use std::time::Duration;

use workerhub_core::BackoffConfig;

/// Delay before reconnect attempt `attempt` (0-based, counted since the last
/// successful open): `min(initial * multiplier^attempt, max)`.
pub fn get_backoff_delay(attempt: u32, config: &BackoffConfig) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let delay = config.initial_delay_ms as f64 * config.multiplier.powi(exponent);
    let capped = delay.min(config.max_delay_ms as f64);
    Duration::from_millis(capped as u64)
}
