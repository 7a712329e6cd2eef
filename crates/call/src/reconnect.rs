//! Bounded reconnect policy

use std::time::Duration;
use voice_client_config::ReconnectConfig;

/// Exponential backoff with a hard attempt limit
///
/// The counter only goes back to zero through [`ReconnectPolicy::reset`],
/// which the controller calls when the user starts a new call. Internal
/// recoveries never reset it.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    base_delay: Duration,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            attempts: 0,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay())
    }

    /// Delay before the next attempt, `None` once the limit is reached
    ///
    /// Attempt `n` (0-based) waits `base * 2^n`.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let delay = self.base_delay.saturating_mul(1u32 << self.attempts.min(16));
        self.attempts += 1;
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_stops_after_limit() {
        let mut policy = ReconnectPolicy::new(3, Duration::from_secs(1));

        assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.next_delay(), None);
        assert!(policy.is_exhausted());
        assert_eq!(policy.attempts(), 3);

        policy.reset();
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_defaults_from_config() {
        let policy = ReconnectPolicy::from_config(&ReconnectConfig::default());
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.attempts(), 0);
    }
}
