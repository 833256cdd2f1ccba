use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

pub const CHAT_ACTION: &str = "chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    tokens: u32,
    reset_at: DateTime<Utc>,
}

/// Fixed-window quota keyed by `(user, action)`. A window starts on the first
/// check after the previous one expired and refills completely at `reset_at`.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window_secs: u64) -> Self {
        Self {
            limit,
            window: Duration::seconds(window_secs.min(i64::MAX as u64) as i64),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Consume one token for `user_id`/`action` if any remain.
    pub fn check(&self, user_id: &str, action: &str) -> RateDecision {
        self.check_at(user_id, action, Utc::now())
    }

    pub fn check_at(&self, user_id: &str, action: &str, now: DateTime<Utc>) -> RateDecision {
        let key = format!("{}_{}", user_id, action);
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let window = windows.entry(key).or_insert(Window {
            tokens: self.limit,
            reset_at: now + self.window,
        });
        if now > window.reset_at {
            *window = Window {
                tokens: self.limit,
                reset_at: now + self.window,
            };
        }

        if window.tokens > 0 {
            window.tokens -= 1;
            RateDecision {
                allowed: true,
                remaining: window.tokens,
                reset_at: window.reset_at,
            }
        } else {
            RateDecision {
                allowed: false,
                remaining: 0,
                reset_at: window.reset_at,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_then_refills_after_window() {
        let limiter = RateLimiter::new(2, 60);
        let start = Utc::now();

        let first = limiter.check_at("u1", CHAT_ACTION, start);
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);
        assert!(limiter.check_at("u1", CHAT_ACTION, start).allowed);

        let blocked = limiter.check_at("u1", CHAT_ACTION, start + Duration::seconds(30));
        assert!(!blocked.allowed);
        assert_eq!(blocked.reset_at, first.reset_at);

        let refilled = limiter.check_at("u1", CHAT_ACTION, start + Duration::seconds(61));
        assert!(refilled.allowed);
        assert_eq!(refilled.remaining, 1);
    }

    #[test]
    fn quotas_are_per_user_and_action() {
        let limiter = RateLimiter::new(1, 60);
        let now = Utc::now();
        assert!(limiter.check_at("u1", CHAT_ACTION, now).allowed);
        assert!(!limiter.check_at("u1", CHAT_ACTION, now).allowed);
        assert!(limiter.check_at("u2", CHAT_ACTION, now).allowed);
        assert!(limiter.check_at("u1", "upload", now).allowed);
    }

    #[test]
    fn zero_limit_rejects_everything() {
        let limiter = RateLimiter::new(0, 60);
        assert!(!limiter.check("u1", CHAT_ACTION).allowed);
    }
}
