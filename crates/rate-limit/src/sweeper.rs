use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use turnstile_common::{TurnstileError, TurnstileResult};

/// Handle to a periodic background sweep.
///
/// The task stops when [`shutdown`](Sweeper::shutdown) is called, when the
/// handle is dropped, or when the swept target has been dropped.
pub struct Sweeper {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Spawn a task on the current tokio runtime that calls `sweep` on
    /// `target` every `period`. The first sweep happens one period after
    /// spawning.
    pub fn spawn<T, F>(
        name: impl Into<String>,
        target: Weak<T>,
        period: Duration,
        sweep: F,
    ) -> TurnstileResult<Self>
    where
        T: Send + Sync + 'static,
        F: Fn(&T) + Send + 'static,
    {
        if period.is_zero() {
            return Err(TurnstileError::Config(
                "sweep period must be greater than zero".to_string(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TurnstileError::Runtime(format!("sweeper needs a tokio runtime: {e}")))?;

        let name = name.into();
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let task_name = name.clone();

        let handle = runtime.spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await; // first tick completes immediately

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = tick.tick() => {
                        let Some(target) = target.upgrade() else {
                            break;
                        };
                        sweep(&target);
                    }
                }
            }

            debug!(limiter = %task_name, "sweeper task exited");
        });

        info!(limiter = %name, period_secs = period.as_secs_f64(), "sweeper started");

        Ok(Self {
            name,
            token,
            handle: Some(handle),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel the task and wait for it to exit.
    ///
    /// Fails if the task had already died from a panic in the sweep.
    pub async fn shutdown(mut self) -> TurnstileResult<()> {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    return Err(TurnstileError::Runtime(format!(
                        "sweeper for '{}' panicked: {e}",
                        self.name
                    )));
                }
                debug!(limiter = %self.name, error = %e, "sweeper task was cancelled");
            }
        }
        info!(limiter = %self.name, "sweeper stopped");
        Ok(())
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn runs_periodically_until_shutdown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let sweeper = Sweeper::spawn(
            "test",
            Arc::downgrade(&counter),
            Duration::from_millis(10),
            |c: &AtomicUsize| {
                c.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        sweeper.shutdown().await.unwrap();

        let runs = counter.load(Ordering::SeqCst);
        assert!(runs >= 2, "expected several sweeps, got {}", runs);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(counter.load(Ordering::SeqCst), runs, "no sweeps after shutdown");
    }

    #[tokio::test]
    async fn exits_when_target_is_dropped() {
        let target = Arc::new(AtomicUsize::new(0));
        let sweeper = Sweeper::spawn(
            "orphan",
            Arc::downgrade(&target),
            Duration::from_millis(5),
            |_: &AtomicUsize| {},
        )
        .unwrap();

        drop(target);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(sweeper.is_finished());
    }

    #[tokio::test]
    async fn panicking_sweep_is_reported_on_shutdown() {
        let target = Arc::new(AtomicUsize::new(0));
        let sweeper = Sweeper::spawn(
            "broken",
            Arc::downgrade(&target),
            Duration::from_millis(5),
            |_: &AtomicUsize| panic!("sweep failed"),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sweeper.is_finished());

        let result = sweeper.shutdown().await;
        assert!(matches!(result, Err(TurnstileError::Runtime(msg)) if msg.contains("broken")));
    }

    #[test]
    fn spawn_outside_runtime_is_an_error() {
        let target = Arc::new(AtomicUsize::new(0));
        let result = Sweeper::spawn(
            "no-runtime",
            Arc::downgrade(&target),
            Duration::from_secs(1),
            |_: &AtomicUsize| {},
        );

        assert!(matches!(result, Err(TurnstileError::Runtime(_))));
    }
}
