//! Jittered exponential backoff shared by the HTTP collaborators.
use std::time::Duration;

use rand::Rng;

/// Fraction of the exponential delay added as uniform jitter.
const JITTER_FRACTION: f64 = 0.1;

/// Compute the delay to wait before retry number `attempt`.
///
/// The delay grows as `base * 2^attempt`, with a uniform random jitter of up
/// to 10% of that value added on top so that many clients retrying at once
/// don't synchronize into spiky load. Growth is unbounded; callers cap it
/// where a cap is wanted.
///
/// Deterministic for a given `rng`.
pub fn exponential_backoff(attempt: u32, base: Duration, rng: &mut impl Rng) -> Duration {
    let delay = base.as_secs_f64() * 2f64.powi(attempt as i32);
    let jitter = delay * JITTER_FRACTION * rng.gen::<f64>();
    Duration::from_secs_f64(delay + jitter)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::{rngs::StdRng, SeedableRng};

    use super::exponential_backoff;

    #[test]
    fn delay_stays_within_jitter_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        let base = Duration::from_millis(200);

        for attempt in 0..8 {
            let delay = exponential_backoff(attempt, base, &mut rng);
            let floor = base.as_secs_f64() * 2f64.powi(attempt as i32);
            let ceiling = floor * 1.1;

            assert!(
                delay.as_secs_f64() >= floor,
                "attempt {attempt}: {delay:?} below {floor}s"
            );
            assert!(
                delay.as_secs_f64() <= ceiling,
                "attempt {attempt}: {delay:?} above {ceiling}s"
            );
        }
    }

    #[test]
    fn delay_grows_with_attempt() {
        let base = Duration::from_millis(200);

        // The jitter-free floor doubles each attempt, so even a maximally
        // jittered attempt n stays below the floor of attempt n+4.
        for attempt in 0..6 {
            let mut rng = StdRng::seed_from_u64(7);
            let earlier = exponential_backoff(attempt, base, &mut rng);
            let mut rng = StdRng::seed_from_u64(7);
            let later = exponential_backoff(attempt + 4, base, &mut rng);
            assert!(later > earlier);
        }
    }

    #[test]
    fn zero_attempt_starts_at_base() {
        let mut rng = StdRng::seed_from_u64(1);
        let delay = exponential_backoff(0, Duration::from_secs(1), &mut rng);
        assert!(delay >= Duration::from_secs(1));
        assert!(delay <= Duration::from_secs_f64(1.1));
    }
}
