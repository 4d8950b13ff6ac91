// engine/backoff.rs - Exponential retry schedule with jitter

use rand::Rng;

/// Capped exponential delay without jitter: `min(base * 2^n, max)`.
pub fn raw_delay_ms(retry_count: i32, base_ms: u64, max_ms: u64) -> u64 {
    // Past 2^31 the doubling is academic; clamp before shifting so large
    // retry counts cannot overflow.
    let exponent = retry_count.clamp(0, 31) as u32;
    base_ms
        .saturating_mul(1u64 << exponent)
        .min(max_ms)
}

/// Full retry delay: the capped exponential plus a uniform jitter in
/// `[0, 0.1 * delay]` so stalled fleets do not thunder back in lockstep.
pub fn delay_ms(retry_count: i32, base_ms: u64, max_ms: u64) -> u64 {
    let delay = raw_delay_ms(retry_count, base_ms, max_ms);
    let jitter = rand::thread_rng().gen_range(0..=delay / 10);
    delay + jitter
}
