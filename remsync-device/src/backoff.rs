use rand::Rng;
use std::time::Duration;

/// Retry schedule for transport operations: capped exponential delays with
/// optional jitter, bounded by a fixed attempt budget.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    base: Duration,
    cap: Duration,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base: Duration, cap: Duration, jitter: bool) -> Self {
        Self {
            attempts,
            base,
            cap,
            jitter,
        }
    }

    /// Default transport policy: three attempts, 500ms base, 8s cap.
    pub fn transport() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(8), true)
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
        let delay_ms = if self.jitter { rng.gen_range(0..=exp) } else { exp };
        Duration::from_millis(delay_ms)
    }
}
