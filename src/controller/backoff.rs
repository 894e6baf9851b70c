//! Retry backoff for failed reconciliation passes

use std::time::Duration;

use rand::Rng;

/// Calculate exponential backoff delay
///
/// # Arguments
/// * `attempt` - Number of consecutive failures so far
/// * `base_delay_secs` - Base delay in seconds (default: 5)
/// * `max_delay_secs` - Maximum delay cap in seconds (default: 300 = 5 minutes)
///
/// # Returns
/// Duration to wait before next retry
pub fn calculate_backoff(
    attempt: u32,
    base_delay_secs: Option<u64>,
    max_delay_secs: Option<u64>,
) -> Duration {
    let base = base_delay_secs.unwrap_or(5);
    let max = max_delay_secs.unwrap_or(300);

    // Exponential: base * 2^attempt, capped at max
    let delay_secs = base.saturating_mul(2_u64.saturating_pow(attempt.min(16)));
    let capped_delay = delay_secs.min(max);

    Duration::from_secs(capped_delay)
}

/// Spread `delay` by up to `fraction` in either direction
///
/// Keeps many clusters that failed together from retrying in lockstep.
pub fn with_jitter(delay: Duration, fraction: f64) -> Duration {
    let fraction = fraction.clamp(0.0, 1.0);
    if fraction == 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range((1.0 - fraction)..=(1.0 + fraction));
    delay.mul_f64(factor)
}
