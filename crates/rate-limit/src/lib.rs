//! Per-client request throttling.
//!
//! A [`RateLimiter`] keeps one fixed-window token bucket per client key in an
//! in-memory store and decides, per request, whether the client still has
//! quota in the current window. The pieces:
//!
//! - [`client_key`] -- derives the client key from the peer address, and
//!   from `X-Forwarded-For` / `X-Real-IP` only when the peer is a trusted
//!   proxy.
//! - [`store`] -- the key-to-bucket map, with a structural lock for
//!   insert/remove and a lock per bucket for token updates.
//! - [`fixed_window`] -- the admit/deny decision and the quota metadata
//!   reported back to the client.
//! - [`sweeper`] -- a cancellable background task that drops buckets idle
//!   for more than twice the window.
//! - [`middleware`] -- the axum adapter that applies all of the above.
//!
//! Limiters are independent: chaining a strict limiter behind a lenient one
//! gives each its own store and its own configuration.

pub mod client_key;
pub mod config;
pub mod fixed_window;
pub mod middleware;
pub mod store;
pub mod sweeper;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use serde::Serialize;
use tracing::warn;

use turnstile_common::TurnstileResult;

pub use client_key::{ClientKey, TrustedProxies};
pub use config::RateLimitConfig;
pub use fixed_window::{Decision, FixedWindowLimiter};
pub use middleware::throttle;
pub use store::BucketStore;
pub use sweeper::Sweeper;

/// A named, cloneable rate limiter.
///
/// Clones share the same buckets and statistics. The sweeper, once started,
/// belongs to the limiter and stops with [`stop_sweeper`](Self::stop_sweeper)
/// or when the last clone is dropped.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

struct RateLimiterInner {
    name: String,
    config: RateLimitConfig,
    engine: FixedWindowLimiter,
    stats: LimiterStats,
    sweeper: Mutex<Option<Sweeper>>,
}

#[derive(Default)]
struct LimiterStats {
    admitted: AtomicU64,
    throttled: AtomicU64,
    evicted: AtomicU64,
}

/// Point-in-time view of a limiter's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterSnapshot {
    pub name: String,
    pub capacity: u64,
    pub window_secs: u64,
    pub trusted_proxies: Vec<String>,
    pub tracked_clients: usize,
    pub admitted: u64,
    pub throttled: u64,
    pub evicted: u64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::named("default", config)
    }

    pub fn named(name: impl Into<String>, config: RateLimitConfig) -> Self {
        let name = name.into();
        tracing::info!(
            limiter = %name,
            capacity = config.capacity(),
            window_secs = config.window().as_secs_f64(),
            trusted_proxies = config.trusted_proxies().len(),
            "creating fixed window rate limiter"
        );
        Self {
            inner: Arc::new(RateLimiterInner {
                engine: FixedWindowLimiter::new(config.capacity(), config.window()),
                name,
                config,
                stats: LimiterStats::default(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.inner.config
    }

    /// Resolve the client key for a request from `peer_addr`.
    pub fn client_key(&self, peer_addr: &str, headers: &HeaderMap) -> ClientKey {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        client_key::resolve(
            peer_addr,
            header("x-forwarded-for"),
            header("x-real-ip"),
            self.inner.config.trusted_proxies(),
        )
    }

    /// Check whether a request identified by `key` is allowed, consuming a
    /// token if it is.
    pub fn check(&self, key: &str) -> Decision {
        self.check_at(key, Instant::now())
    }

    /// [`check`](Self::check) with an explicit clock.
    pub fn check_at(&self, key: &str, now: Instant) -> Decision {
        let decision = self.inner.engine.check_at(key, now);
        let counter = if decision.allowed {
            &self.inner.stats.admitted
        } else {
            &self.inner.stats.throttled
        };
        counter.fetch_add(1, Ordering::Relaxed);
        decision
    }

    /// Run one sweep now. Returns the number of buckets removed.
    pub fn sweep_now(&self) -> usize {
        self.inner.sweep_at(Instant::now())
    }

    /// Run one sweep as of `now`.
    pub fn sweep_at(&self, now: Instant) -> usize {
        self.inner.sweep_at(now)
    }

    /// Start the background sweeper with the given period.
    ///
    /// Returns `Ok(false)` if a sweeper is already running. Must be called
    /// from within a tokio runtime.
    pub fn start_sweeper(&self, period: Duration) -> TurnstileResult<bool> {
        let mut slot = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(running) if !running.is_finished() => return Ok(false),
            Some(_) => warn!(limiter = %self.inner.name, "sweeper task had exited, restarting it"),
            None => {}
        }

        let sweeper = Sweeper::spawn(
            self.inner.name.clone(),
            Arc::downgrade(&self.inner),
            period,
            |inner: &RateLimiterInner| {
                inner.sweep_at(Instant::now());
            },
        )?;
        *slot = Some(sweeper);
        Ok(true)
    }

    /// Stop the background sweeper, if any, and wait for it to exit.
    ///
    /// Reports a sweeper that died from a panic while the limiter was running.
    pub async fn stop_sweeper(&self) -> TurnstileResult<()> {
        let sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sweeper {
            Some(sweeper) => sweeper.shutdown().await,
            None => Ok(()),
        }
    }

    pub fn sweeper_running(&self) -> bool {
        self.inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|s| !s.is_finished())
    }

    /// Number of client keys currently holding a bucket.
    pub fn tracked_clients(&self) -> usize {
        self.inner.engine.store().len()
    }

    pub fn stats(&self) -> LimiterSnapshot {
        let inner = &self.inner;
        LimiterSnapshot {
            name: inner.name.clone(),
            capacity: inner.config.capacity(),
            window_secs: inner.config.window().as_secs(),
            trusted_proxies: inner.config.trusted_proxies().to_sorted_vec(),
            tracked_clients: inner.engine.store().len(),
            admitted: inner.stats.admitted.load(Ordering::Relaxed),
            throttled: inner.stats.throttled.load(Ordering::Relaxed),
            evicted: inner.stats.evicted.load(Ordering::Relaxed),
        }
    }
}

impl RateLimiterInner {
    fn sweep_at(&self, now: Instant) -> usize {
        let removed = self.engine.sweep_at(now);
        self.stats
            .evicted
            .fetch_add(removed as u64, Ordering::Relaxed);
        tracing::debug!(
            limiter = %self.name,
            removed,
            remaining = self.engine.store().len(),
            "fixed window sweep complete"
        );
        removed
    }
}
