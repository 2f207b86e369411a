//! Chunk expiration times
//!
//! Chunks expire `retention` after they are stored, plus a buffer window of
//! `min(max_buffer_window, 2 * retention)`. One computed expiration is
//! reused for every chunk stored within a buffer window of it, so a burst of
//! chunks lands in a single expiry group. Reuse never makes a chunk expire
//! before its full retention has passed.

use std::time::Duration;

use crate::config::PersistenceConfig;

/// Computes and reuses expiration timestamps
#[derive(Debug, Clone)]
pub struct ExpirationPolicy {
    retention_ms: i64,
    buffer_ms: i64,
    /// `(computed_at_ms, expires_at_ms)` of the value being reused
    current: Option<(i64, i64)>,
}

impl ExpirationPolicy {
    pub fn new(retention: Duration, max_buffer_window: Duration) -> Self {
        let retention_ms = duration_ms(retention);
        let buffer_ms = duration_ms(max_buffer_window).min(retention_ms.saturating_mul(2));
        Self {
            retention_ms,
            buffer_ms,
            current: None,
        }
    }

    pub fn from_config(config: &PersistenceConfig) -> Self {
        Self::new(config.retention, config.max_buffer_window)
    }

    pub fn buffer_window(&self) -> Duration {
        Duration::from_millis(self.buffer_ms.max(0) as u64)
    }

    /// Expiration for a chunk stored at `now_ms`
    pub fn expiration_ms(&mut self, now_ms: i64) -> i64 {
        if let Some((computed_at, expires_at)) = self.current
            && now_ms >= computed_at
            && now_ms - computed_at < self.buffer_ms
        {
            return expires_at;
        }
        let expires_at = now_ms
            .saturating_add(self.retention_ms)
            .saturating_add(self.buffer_ms);
        self.current = Some((now_ms, expires_at));
        expires_at
    }
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);
    const FIVE_MINUTES: Duration = Duration::from_secs(300);

    #[test]
    fn test_buffer_window_is_bounded() {
        let policy = ExpirationPolicy::new(HOUR, FIVE_MINUTES);
        assert_eq!(policy.buffer_window(), FIVE_MINUTES);

        // Short retention: twice the retention
        let policy = ExpirationPolicy::new(Duration::from_secs(60), FIVE_MINUTES);
        assert_eq!(policy.buffer_window(), Duration::from_secs(120));
    }

    #[test]
    fn test_burst_reuses_expiration() {
        let mut policy = ExpirationPolicy::new(HOUR, FIVE_MINUTES);
        let first = policy.expiration_ms(1_000_000);
        assert_eq!(first, 1_000_000 + 3_600_000 + 300_000);

        assert_eq!(policy.expiration_ms(1_000_000 + 5_000), first);
        assert_eq!(policy.expiration_ms(1_000_000 + 299_999), first);

        let next = policy.expiration_ms(1_000_000 + 300_000);
        assert_eq!(next, first + 300_000);
    }

    #[test]
    fn test_reuse_never_cuts_retention_short() {
        let mut policy = ExpirationPolicy::new(Duration::from_secs(10), FIVE_MINUTES);
        for now in (0..200_000).step_by(997) {
            let expires = policy.expiration_ms(now);
            assert!(expires >= now + 10_000, "expired early at {now}");
        }
    }

    #[test]
    fn test_clock_going_backwards_recomputes() {
        let mut policy = ExpirationPolicy::new(HOUR, FIVE_MINUTES);
        let first = policy.expiration_ms(10_000_000);
        let earlier = policy.expiration_ms(9_000_000);
        assert_ne!(first, earlier);
        assert_eq!(earlier, 9_000_000 + 3_900_000);
    }
}
