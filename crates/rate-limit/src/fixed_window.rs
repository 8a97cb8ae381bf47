use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::store::{lock_bucket, BucketStore};

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Configured ceiling for the window.
    pub limit: u64,
    /// Tokens left in the current window after this decision.
    pub remaining: u64,
    /// When the current window ends and the bucket refills. Equals the
    /// decision time when the window is too long to represent.
    pub reset_at: Instant,
    /// Time from the decision until the window ends.
    pub reset_after: Duration,
}

impl Decision {
    /// Whole seconds until the window resets, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.reset_after.as_secs();
        if self.reset_after.subsec_nanos() > 0 {
            secs.saturating_add(1)
        } else {
            secs
        }
    }

    /// Reset time as Unix epoch seconds.
    pub fn reset_unix_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .saturating_add(self.reset_after)
            .as_secs()
    }
}

/// Fixed-window token bucket.
///
/// A bucket holds up to `capacity` tokens and is refilled to full, all at
/// once, on the first check at or after `window_start + window`. Refill is
/// not continuous: a client can spend a full bucket just before a boundary
/// and another just after it.
pub struct FixedWindowLimiter {
    store: BucketStore,
    capacity: u64,
    window: Duration,
}

impl FixedWindowLimiter {
    pub fn new(capacity: u64, window: Duration) -> Self {
        Self {
            store: BucketStore::new(capacity),
            capacity,
            window,
        }
    }

    pub fn store(&self) -> &BucketStore {
        &self.store
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Check and consume one token for `key` as of `now`.
    ///
    /// Runs under the bucket's own lock, so checks for one key are totally
    /// ordered and never grant more than `capacity` per window, while
    /// checks for different keys do not contend.
    pub fn check_at(&self, key: &str, now: Instant) -> Decision {
        loop {
            let bucket = self.store.get_or_create(key, now);
            let mut state = lock_bucket(&bucket);

            // The sweeper removed this bucket after we fetched it; go back to
            // the store so the decision lands on the live entry.
            if state.evicted {
                continue;
            }

            if now.saturating_duration_since(state.window_start) >= self.window {
                state.tokens_remaining = self.capacity;
                state.window_start = now;
            }

            // A window too long for `Instant` saturates the delay instead.
            let (reset_at, reset_after) = match state.window_start.checked_add(self.window) {
                Some(at) => (at, at.saturating_duration_since(now)),
                None => {
                    let elapsed = now.saturating_duration_since(state.window_start);
                    (now, self.window.saturating_sub(elapsed))
                }
            };

            let (allowed, remaining) = if state.tokens_remaining > 0 {
                state.tokens_remaining -= 1;
                (true, state.tokens_remaining)
            } else {
                (false, 0)
            };

            return Decision {
                allowed,
                limit: self.capacity,
                remaining,
                reset_at,
                reset_after,
            };
        }
    }

    pub fn check(&self, key: &str) -> Decision {
        self.check_at(key, Instant::now())
    }

    /// Drop buckets idle for more than twice the window.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let idle_after = self.window.checked_mul(2).unwrap_or(Duration::MAX);
        self.store.sweep(now, idle_after)
    }
}
