//! Periodic re-application of a desired field value across the pool.

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What the enforcer writes through.
#[async_trait]
pub trait Fanout: Send + Sync + 'static {
    /// Number of sessions a broadcast would reach right now.
    async fn active_sessions(&self) -> usize;

    async fn fan_out(&self, field: &str, value: Value);
}

/// A running enforcement loop. Stopping it (or dropping it) cancels the timer;
/// no write is issued after [`Enforcer::stop`] returns.
pub struct Enforcer {
    field: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Enforcer {
    /// Start writing `value` to `field` every `period`, first after one period.
    /// The loop ends by itself once the target is gone or has no sessions.
    pub fn spawn<F: Fanout>(
        target: Weak<F>,
        field: &str,
        value: Value,
        period: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            target,
            field.to_string(),
            value,
            period,
            cancel.clone(),
        ));
        info!(%field, period_ms = period.as_millis() as u64, "enforcer started");
        Self {
            field: field.to_string(),
            cancel,
            handle: Some(handle),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!(field = %self.field, "enforcer stopped");
    }
}

impl Drop for Enforcer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run<F: Fanout>(
    target: Weak<F>,
    field: String,
    value: Value,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(target) = target.upgrade() else {
            debug!(%field, "enforcer target dropped");
            break;
        };
        let keep_going = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            more = enforce_once(&*target, &field, &value) => more,
        };
        if !keep_going {
            break;
        }
    }
}

async fn enforce_once<F: Fanout>(target: &F, field: &str, value: &Value) -> bool {
    if target.active_sessions().await == 0 {
        debug!(%field, "pool is empty, enforcer exiting");
        return false;
    }
    target.fan_out(field, value.clone()).await;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        sessions: AtomicUsize,
        writes: AtomicUsize,
    }

    impl Counting {
        fn with_sessions(n: usize) -> Arc<Self> {
            let c = Self::default();
            c.sessions.store(n, Ordering::SeqCst);
            Arc::new(c)
        }

        fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fanout for Counting {
        async fn active_sessions(&self) -> usize {
            self.sessions.load(Ordering::SeqCst)
        }

        async fn fan_out(&self, _field: &str, _value: Value) {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
    }

    const PERIOD: Duration = Duration::from_millis(500);

    #[tokio::test(start_paused = true)]
    async fn fires_every_period() {
        let target = Counting::with_sessions(3);
        let enforcer = Enforcer::spawn(Arc::downgrade(&target), "b", json!("Cow"), PERIOD);
        assert_eq!(enforcer.field(), "b");

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(target.writes(), 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(target.writes(), 2);
        enforcer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_timer() {
        let target = Counting::with_sessions(3);
        let enforcer = Enforcer::spawn(Arc::downgrade(&target), "b", json!("Cow"), PERIOD);
        tokio::time::sleep(Duration::from_millis(1250)).await;
        enforcer.stop().await;

        let after_stop = target.writes();
        tokio::time::sleep(PERIOD * 10).await;
        assert_eq!(target.writes(), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_pool_ends_loop() {
        let target = Counting::with_sessions(1);
        let enforcer = Enforcer::spawn(Arc::downgrade(&target), "b", json!("Cow"), PERIOD);
        tokio::time::sleep(Duration::from_millis(750)).await;
        assert_eq!(target.writes(), 1);

        target.sessions.store(0, Ordering::SeqCst);
        tokio::time::sleep(PERIOD * 2).await;
        assert!(!enforcer.is_running());
        assert_eq!(target.writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_target_ends_loop() {
        let target = Counting::with_sessions(1);
        let enforcer = Enforcer::spawn(Arc::downgrade(&target), "b", json!("Cow"), PERIOD);
        drop(target);
        tokio::time::sleep(PERIOD * 2).await;
        assert!(!enforcer.is_running());
    }
}
