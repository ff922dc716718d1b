use rand::Rng;
use std::time::Duration;

/// Backoff before election retry `attempt` (0-based): the base interval grows
/// up to 8x, plus up to one base interval of random jitter.
pub fn election_backoff(base_ms: u64, attempt: u32) -> Duration {
    let multiplier = 1u64 << attempt.min(3);
    let mut rng = rand::thread_rng();
    let jitter = if base_ms == 0 {
        0
    } else {
        rng.gen_range(0..base_ms)
    };
    Duration::from_millis(base_ms.saturating_mul(multiplier) + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        for _ in 0..20 {
            let first = election_backoff(10, 0);
            assert!(first >= Duration::from_millis(10) && first < Duration::from_millis(20));
            let capped = election_backoff(10, 30);
            assert!(capped >= Duration::from_millis(80) && capped < Duration::from_millis(90));
        }
    }

    #[test]
    fn zero_base_means_no_wait() {
        assert_eq!(election_backoff(0, 5), Duration::ZERO);
    }
}
