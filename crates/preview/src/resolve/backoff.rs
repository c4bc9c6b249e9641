use std::time::{Duration, Instant};

/// Exponential backoff for failing resolutions: delay doubles per consecutive
/// failure between a floor and a ceiling. Ids past `broken_after` failures are
/// parked and surfaced to the UI instead of retried forever.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub broken_after: u32,
}

impl BackoffPolicy {
    pub fn delay_for(&self, failure_count: u32) -> Duration {
        if failure_count == 0 {
            return Duration::ZERO;
        }
        // cap the shift so the multiply cannot overflow
        let exp = (failure_count - 1).min(24);
        let delay = self.min_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

/// Per-media-id resolution state tracked by the scheduler.
#[derive(Debug, Clone)]
pub struct ResolutionEntry {
    pub failure_count: u32,
    pub retry_after: Option<Instant>,
}

impl Default for ResolutionEntry {
    fn default() -> Self {
        Self {
            failure_count: 0,
            retry_after: None,
        }
    }
}

impl ResolutionEntry {
    pub fn mark_failure(&mut self, policy: &BackoffPolicy, now: Instant) {
        self.failure_count += 1;
        self.retry_after = Some(now + policy.delay_for(self.failure_count));
    }

    pub fn mark_success(&mut self) {
        self.failure_count = 0;
        self.retry_after = None;
    }

    pub fn is_broken(&self, policy: &BackoffPolicy) -> bool {
        self.failure_count >= policy.broken_after
    }

    /// Eligible for another attempt: not parked as broken and past the
    /// backoff deadline.
    pub fn is_retryable(&self, policy: &BackoffPolicy, now: Instant) -> bool {
        if self.is_broken(policy) {
            return false;
        }
        match self.retry_after {
            Some(deadline) => now >= deadline,
            None => true,
        }
    }
}
