//! Exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Upper bound of the random jitter added to retry delays.
pub const MAX_JITTER_MS: u64 = 1000;

/// Ceiling for reconnect delays.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Delay before retry `attempt` (0-based): `base * 2^attempt + random(0..1000ms)`.
pub fn retry_delay(attempt: u32, base: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..MAX_JITTER_MS);
    retry_delay_with_jitter(attempt, base, Duration::from_millis(jitter))
}

/// Deterministic part of [`retry_delay`] plus an explicit jitter.
pub fn retry_delay_with_jitter(attempt: u32, base: Duration, jitter: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    base.saturating_mul(factor).saturating_add(jitter)
}

/// Delay before reconnect number `reconnect_count`: `min(base * 2^count, 30s)`.
pub fn reconnect_delay(reconnect_count: u32, base: Duration) -> Duration {
    let factor = 2u32.saturating_pow(reconnect_count);
    base.saturating_mul(factor).min(MAX_RECONNECT_DELAY)
}
