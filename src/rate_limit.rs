//! Per-sender sliding-window rate limiter.
//!
//! Hand-rolled rather than pulled from a crate — the window algorithm
//! needed (100 admits per rolling 60s, per sender) is a dozen lines and
//! doesn't warrant an external dependency.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const WINDOW: Duration = Duration::from_secs(60);
const LIMIT: usize = 100;
/// Entries untouched for this long are dropped on the next prune sweep.
const STALE_AFTER: Duration = Duration::from_secs(300);

struct Window {
    hits: Vec<Instant>,
    last_seen: Instant,
}

/// A sliding window of accepted-message timestamps per `user_id`. `check`
/// both tests and records: a caller that decides not to admit the message
/// for other reasons (e.g. a prior validation failure) should not call it.
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if `user_id` is under the limit, recording this
    /// attempt either way so a persistent abuser's window keeps shifting
    /// forward rather than never filling.
    pub fn check(&self, user_id: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let window = windows.entry(user_id.to_string()).or_insert_with(|| Window {
            hits: Vec::new(),
            last_seen: now,
        });

        window.hits.retain(|t| now.duration_since(*t) < WINDOW);
        window.last_seen = now;

        if window.hits.len() >= LIMIT {
            return false;
        }
        window.hits.push(now);
        true
    }

    /// Drops windows for users not seen within `STALE_AFTER`. Intended to
    /// run periodically from a background task alongside the Hub.
    pub fn prune(&self) {
        let now = Instant::now();
        self.windows
            .lock()
            .retain(|_, w| now.duration_since(w.last_seen) < STALE_AFTER);
    }

    pub fn len(&self) -> usize {
        self.windows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new();
        for _ in 0..LIMIT {
            assert!(limiter.check("alice"));
        }
        assert!(!limiter.check("alice"));
    }

    #[test]
    fn independent_per_user() {
        let limiter = RateLimiter::new();
        for _ in 0..LIMIT {
            assert!(limiter.check("alice"));
        }
        assert!(limiter.check("bob"));
    }

    #[test]
    fn prune_drops_nothing_for_recent_windows() {
        let limiter = RateLimiter::new();
        limiter.check("alice");
        limiter.prune();
        assert_eq!(limiter.len(), 1);
    }
}
