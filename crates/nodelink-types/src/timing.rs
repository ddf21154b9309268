//! Timing helpers.

use rand::Rng;
use std::time::Duration;

/// `base` shifted by a uniformly random amount in `[-spread, +spread]`.
///
/// The result never drops below one millisecond.
pub fn jittered(base: Duration, spread: Duration) -> Duration {
    let base_ms = base.as_millis() as i64;
    let spread_ms = spread.as_millis() as i64;
    let offset = if spread_ms > 0 {
        rand::thread_rng().gen_range(-spread_ms..=spread_ms)
    } else {
        0
    };
    Duration::from_millis((base_ms + offset).max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_within_bounds() {
        let base = Duration::from_millis(1000);
        let spread = Duration::from_millis(200);
        for _ in 0..500 {
            let d = jittered(base, spread);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn test_no_spread_is_exact() {
        assert_eq!(
            jittered(Duration::from_millis(250), Duration::ZERO),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_never_zero() {
        let d = jittered(Duration::from_millis(1), Duration::from_millis(50));
        assert!(d >= Duration::from_millis(1));
    }
}
