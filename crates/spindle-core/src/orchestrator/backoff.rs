//! Retry backoff: exponential with jitter.
//!
//! The delay for attempt `i` (1-based) is drawn uniformly from
//! `[base, min(max_delay, base * 2^i)]`, so every retry waits at least the
//! base delay and the window doubles until it hits the cap.

use std::time::Duration;

use rand::Rng;

pub fn retry_delay(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let ceiling = base_ms
        .saturating_mul(1u64 << attempt.min(16))
        .min(max_ms)
        .max(base_ms);
    let millis = if ceiling == base_ms {
        base_ms
    } else {
        rand::thread_rng().gen_range(base_ms..=ceiling)
    };
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_below_base() {
        for attempt in 1..=6 {
            for _ in 0..100 {
                let delay = retry_delay(500, 30_000, attempt);
                assert!(delay >= Duration::from_millis(500), "attempt {attempt}");
            }
        }
    }

    #[test]
    fn window_doubles_then_caps() {
        for _ in 0..100 {
            assert!(retry_delay(500, 30_000, 1) <= Duration::from_millis(1_000));
            assert!(retry_delay(500, 30_000, 3) <= Duration::from_millis(4_000));
            assert!(retry_delay(500, 2_000, 10) <= Duration::from_millis(2_000));
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let delay = retry_delay(500, 30_000, u32::MAX);
        assert!(delay <= Duration::from_millis(30_000));
    }
}
