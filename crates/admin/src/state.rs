use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};
use turnstile_common::AppConfig;
use turnstile_rate_limit::{LimiterSnapshot, RateLimiter};

/// Shared state type alias used across all route handlers.
pub type SharedState = Arc<AppState>;

/// State behind the admin API: the loaded config, the limiters being
/// served, and the Prometheus registry their counters are exported through.
pub struct AppState {
    pub config: AppConfig,
    pub limiters: Vec<RateLimiter>,
    pub metrics: ThrottleMetrics,
    pub start_time: Instant,
}

/// Prometheus metrics, labelled by limiter name.
pub struct ThrottleMetrics {
    pub registry: Registry,
    pub admitted: IntCounterVec,
    pub throttled: IntCounterVec,
    pub evicted: IntCounterVec,
    pub tracked_clients: IntGaugeVec,
    /// Serialises `record` so concurrent scrapes cannot both apply a delta.
    record_lock: Mutex<()>,
}

impl ThrottleMetrics {
    /// Create the metric families and register them against a fresh registry.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let admitted = IntCounterVec::new(
            Opts::new(
                "turnstile_requests_admitted_total",
                "Requests admitted by a rate limiter",
            ),
            &["limiter"],
        )?;
        let throttled = IntCounterVec::new(
            Opts::new(
                "turnstile_requests_throttled_total",
                "Requests rejected with 429 by a rate limiter",
            ),
            &["limiter"],
        )?;
        let evicted = IntCounterVec::new(
            Opts::new(
                "turnstile_buckets_evicted_total",
                "Idle client buckets removed by the sweeper",
            ),
            &["limiter"],
        )?;
        let tracked_clients = IntGaugeVec::new(
            Opts::new(
                "turnstile_tracked_clients",
                "Client keys currently holding a bucket",
            ),
            &["limiter"],
        )?;

        registry.register(Box::new(admitted.clone()))?;
        registry.register(Box::new(throttled.clone()))?;
        registry.register(Box::new(evicted.clone()))?;
        registry.register(Box::new(tracked_clients.clone()))?;

        Ok(Self {
            registry,
            admitted,
            throttled,
            evicted,
            tracked_clients,
            record_lock: Mutex::new(()),
        })
    }

    /// Bring the exported values up to date with a limiter snapshot.
    ///
    /// Limiter counters only grow, so each Prometheus counter is advanced by
    /// the difference since the previous sync.
    pub fn record(&self, snapshot: &LimiterSnapshot) {
        let _guard = self.record_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let label = [snapshot.name.as_str()];
        advance(&self.admitted, &label, snapshot.admitted);
        advance(&self.throttled, &label, snapshot.throttled);
        advance(&self.evicted, &label, snapshot.evicted);
        self.tracked_clients
            .with_label_values(&label)
            .set(snapshot.tracked_clients as i64);
    }
}

fn advance(counter: &IntCounterVec, label: &[&str], total: u64) {
    let counter = counter.with_label_values(label);
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

impl AppState {
    pub fn new(config: AppConfig, limiters: Vec<RateLimiter>) -> anyhow::Result<Self> {
        Ok(Self {
            config,
            limiters,
            metrics: ThrottleMetrics::new()?,
            start_time: Instant::now(),
        })
    }

    /// Snapshots of every limiter, also refreshing the exported metrics.
    pub fn snapshots(&self) -> Vec<LimiterSnapshot> {
        self.limiters
            .iter()
            .map(|limiter| {
                let snapshot = limiter.stats();
                self.metrics.record(&snapshot);
                snapshot
            })
            .collect()
    }
}
