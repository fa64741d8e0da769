use std::time::Duration;

/// Tuning for the sync core.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// First retry delay; doubles per failed attempt.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Failed subscribe attempts before falling back to polling.
    pub max_attempts: u32,
    /// Extra random delay as a fraction of the backoff (0.0 disables).
    pub jitter: f64,
    pub poll_interval: Duration,
    /// While polling, how often to try realtime again.
    pub realtime_retry_interval: Duration,
    /// How often a live connection re-announces presence.
    pub heartbeat_interval: Duration,
    pub page_size: u32,
    pub online_timeout: Duration,
    pub typing_timeout: Duration,
    /// Capacity of the SyncEvent channel.
    pub event_buffer: usize,
    /// Capacity of the change broadcast; slow subscribers lag past this.
    pub change_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            max_attempts: 5,
            jitter: 0.1,
            poll_interval: Duration::from_secs(5),
            realtime_retry_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            page_size: 50,
            online_timeout: Duration::from_secs(30),
            typing_timeout: Duration::from_secs(3),
            event_buffer: 256,
            change_buffer: 256,
        }
    }
}

impl SyncConfig {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// `backoff` plus up to `jitter` of itself at random.
    pub fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        delay + delay.mul_f64(self.jitter * rand::random::<f64>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let cfg = SyncConfig::default();
        let delays: Vec<u128> = (1..=6).map(|a| cfg.backoff(a).as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 8000]);
        assert_eq!(cfg.backoff(40), Duration::from_secs(8));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let cfg = SyncConfig::default();
        for _ in 0..100 {
            let d = cfg.backoff_with_jitter(3);
            assert!(d >= Duration::from_secs(2) && d <= Duration::from_millis(2200));
        }
    }
}
