use rand::Rng;
use std::time::Duration;

/// Retries per task before a transient failure is surfaced to the monitor.
pub const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Exponential backoff with proportional jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self { base, cap, jitter }
    }

    /// The apply-worker retry policy: 1 s base, doubling, 60 s cap, ±20 %.
    pub fn apply_default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 0.2)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let cap_ms = self.cap.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(cap_ms);
        if self.jitter <= 0.0 {
            return Duration::from_millis(exp);
        }
        let factor = rng.gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_millis((exp as f64 * factor) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn backoff_without_jitter_is_exponential_and_capped() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.0);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(backoff.delay_with_rng(0, &mut rng), Duration::from_secs(1));
        assert_eq!(backoff.delay_with_rng(1, &mut rng), Duration::from_secs(2));
        assert_eq!(backoff.delay_with_rng(2, &mut rng), Duration::from_secs(4));
        assert_eq!(backoff.delay_with_rng(5, &mut rng), Duration::from_secs(32));
        assert_eq!(backoff.delay_with_rng(6, &mut rng), Duration::from_secs(60));
        assert_eq!(backoff.delay_with_rng(12, &mut rng), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let backoff = Backoff::apply_default();
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 0..6 {
            let nominal = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.0)
                .delay_with_rng(attempt, &mut rng)
                .as_millis() as f64;
            let jittered = backoff.delay_with_rng(attempt, &mut rng).as_millis() as f64;
            assert!(jittered >= nominal * 0.8 - 1.0);
            assert!(jittered <= nominal * 1.2 + 1.0);
        }
    }
}
