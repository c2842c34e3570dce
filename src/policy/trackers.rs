use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use super::rules::RateLimit;

/// Sliding-window quota per rule id.
///
/// Quotas are keyed by id only, so they survive a ruleset reload.
#[derive(Debug, Default)]
pub struct RuleRateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RuleRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one unit of `rule_id`'s quota. Returns `false` when the
    /// window is exhausted, in which case nothing is recorded.
    pub fn try_acquire(&self, rule_id: &str, limit: RateLimit, now: Instant) -> bool {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let window = windows.entry(rule_id.to_string()).or_default();
        prune(window, limit, now);
        if window.len() >= usize::try_from(limit.max).unwrap_or(usize::MAX) {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Uses left in the current window, without recording.
    pub fn remaining(&self, rule_id: &str, limit: RateLimit, now: Instant) -> u32 {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(window) = windows.get_mut(rule_id) else {
            return limit.max;
        };
        prune(window, limit, now);
        limit
            .max
            .saturating_sub(u32::try_from(window.len()).unwrap_or(u32::MAX))
    }
}

fn prune(window: &mut VecDeque<Instant>, limit: RateLimit, now: Instant) {
    while let Some(oldest) = window.front() {
        if now.saturating_duration_since(*oldest) >= limit.window {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const LIMIT: RateLimit = RateLimit {
        max: 2,
        window: Duration::from_secs(60),
    };

    #[test]
    fn quota_is_exhausted_within_window() {
        let limiter = RuleRateLimiter::new();
        let t0 = Instant::now();
        assert!(limiter.try_acquire("r", LIMIT, t0));
        assert!(limiter.try_acquire("r", LIMIT, t0 + Duration::from_secs(1)));
        assert!(!limiter.try_acquire("r", LIMIT, t0 + Duration::from_secs(2)));
        assert_eq!(limiter.remaining("r", LIMIT, t0 + Duration::from_secs(2)), 0);
    }

    #[test]
    fn quota_recovers_after_window() {
        let limiter = RuleRateLimiter::new();
        let t0 = Instant::now();
        limiter.try_acquire("r", LIMIT, t0);
        limiter.try_acquire("r", LIMIT, t0);
        assert!(limiter.try_acquire("r", LIMIT, t0 + Duration::from_secs(61)));
    }

    #[test]
    fn rules_have_independent_quotas() {
        let limiter = RuleRateLimiter::new();
        let t0 = Instant::now();
        limiter.try_acquire("a", LIMIT, t0);
        limiter.try_acquire("a", LIMIT, t0);
        assert!(limiter.try_acquire("b", LIMIT, t0));
        assert_eq!(limiter.remaining("c", LIMIT, t0), 2);
    }
}
