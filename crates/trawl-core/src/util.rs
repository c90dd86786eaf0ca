use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Cheap randomness for jitter and proxy selection. Not crypto.
// xorshift64 seeded from the clock, mixed with a counter so that calls
// landing on the same clock tick still diverge.
// ---------------------------------------------------------------------------

static SEQUENCE: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

/// Uniform-ish value in `[0, bound)`. Returns 0 when `bound` is 0.
pub fn random_below(bound: u64) -> u64 {
    if bound == 0 {
        return 0;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let seq = SEQUENCE.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
    let mut x = nanos ^ seq;
    if x == 0 {
        x = 0x2545_F491_4F6C_DD1D;
    }
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % bound
}

/// Random jitter in `[0, max)`.
pub fn jitter(max: Duration) -> Duration {
    Duration::from_millis(random_below(max.as_millis() as u64))
}

/// Milliseconds in a duration, saturating at `u64::MAX`.
pub fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_below_is_bounded() {
        for _ in 0..1000 {
            assert!(random_below(7) < 7);
        }
        assert_eq!(random_below(0), 0);
        assert_eq!(random_below(1), 0);
    }

    #[test]
    fn test_random_below_covers_range() {
        let mut seen = [false; 4];
        for _ in 0..1000 {
            seen[random_below(4) as usize] = true;
        }
        assert!(seen.iter().all(|s| *s), "{seen:?}");
    }

    #[test]
    fn test_jitter_bounds() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(jitter(Duration::from_millis(500)) < Duration::from_millis(500));
        }
    }
}
