//! Keep-alive ping scheduling
//!
//! A [`PingScheduler`] fires at the negotiated keep-alive interval and asks the
//! engine to check for activity. Each check runs while holding a [`WakeGuard`]
//! so a host that suspends idle processes keeps the check alive until it
//! resolves. The guard is released on every exit path, including when the
//! scheduler is stopped in the middle of a check.

use crate::engine::ProtocolEngine;
use crate::message::ConnectionHandle;
use crate::observability::metrics::metrics;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Platform resource that keeps the host awake while held
pub trait WakeLock: Send + Sync {
    fn acquire(&self, tag: &str);
    fn release(&self, tag: &str);
}

/// Wake lock for hosts without power management
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWakeLock;

impl WakeLock for NoopWakeLock {
    fn acquire(&self, _tag: &str) {}
    fn release(&self, _tag: &str) {}
}

/// Holds a wake lock until dropped
pub struct WakeGuard {
    lock: Arc<dyn WakeLock>,
    tag: String,
}

impl WakeGuard {
    pub fn acquire(lock: Arc<dyn WakeLock>, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        lock.acquire(&tag);
        Self { lock, tag }
    }
}

impl Drop for WakeGuard {
    fn drop(&mut self) {
        self.lock.release(&self.tag);
    }
}

struct Armed {
    interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Periodic keep-alive trigger for one connection
pub struct PingScheduler {
    handle: ConnectionHandle,
    engine: Arc<dyn ProtocolEngine>,
    wake_lock: Arc<dyn WakeLock>,
    armed: Mutex<Option<Armed>>,
}

impl PingScheduler {
    pub fn new(
        handle: ConnectionHandle,
        engine: Arc<dyn ProtocolEngine>,
        wake_lock: Arc<dyn WakeLock>,
    ) -> Self {
        Self {
            handle,
            engine,
            wake_lock,
            armed: Mutex::new(None),
        }
    }

    fn armed(&self) -> MutexGuard<'_, Option<Armed>> {
        self.armed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Arm the repeating timer. Re-arms if already started; a zero interval disables pings.
    pub fn start(&self, interval: Duration) {
        self.stop();
        if interval.is_zero() {
            debug!(handle = %self.handle, "Keep-alive disabled, ping scheduler not armed");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Self::run(
            self.handle.clone(),
            self.engine.clone(),
            self.wake_lock.clone(),
            interval,
            shutdown_rx,
        ));

        debug!(
            handle = %self.handle,
            interval_ms = interval.as_millis() as u64,
            "Ping scheduler armed"
        );
        *self.armed() = Some(Armed {
            interval,
            shutdown_tx,
            task,
        });
    }

    /// Cancel the timer. Returns false when it was not started.
    pub fn stop(&self) -> bool {
        let Some(armed) = self.armed().take() else {
            return false;
        };
        let _ = armed.shutdown_tx.send(true);
        armed.task.abort();
        debug!(handle = %self.handle, "Ping scheduler stopped");
        true
    }

    pub fn is_started(&self) -> bool {
        self.armed()
            .as_ref()
            .is_some_and(|armed| !armed.task.is_finished())
    }

    pub fn interval(&self) -> Option<Duration> {
        self.armed().as_ref().map(|armed| armed.interval)
    }

    async fn run(
        handle: ConnectionHandle,
        engine: Arc<dyn ProtocolEngine>,
        wake_lock: Arc<dyn WakeLock>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    Self::check(&handle, engine.as_ref(), wake_lock.clone()).await;
                }
            }
        }
    }

    async fn check(
        handle: &ConnectionHandle,
        engine: &dyn ProtocolEngine,
        wake_lock: Arc<dyn WakeLock>,
    ) {
        let _guard = WakeGuard::acquire(wake_lock, format!("mqttlink-ping:{handle}"));
        metrics().record_ping_check();

        // no retry here: the engine's own loss detection decides what a failed check means
        match engine.check_activity().await {
            Ok(()) => debug!(handle = %handle, "Keep-alive check succeeded"),
            Err(e) => {
                metrics().record_ping_failure();
                warn!(handle = %handle, "Keep-alive check failed: {}", e);
            }
        }
    }
}

impl Drop for PingScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Tally {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    impl WakeLock for Tally {
        fn acquire(&self, _tag: &str) {
            self.acquired.fetch_add(1, Ordering::SeqCst);
        }
        fn release(&self, _tag: &str) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_wake_guard_releases_on_drop() {
        let tally = Arc::new(Tally::default());
        {
            let _guard = WakeGuard::acquire(tally.clone(), "t");
            assert_eq!(tally.acquired.load(Ordering::SeqCst), 1);
            assert_eq!(tally.released.load(Ordering::SeqCst), 0);
        }
        assert_eq!(tally.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wake_guard_releases_on_unwind() {
        let tally = Arc::new(Tally::default());
        let inner = tally.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = WakeGuard::acquire(inner, "t");
            panic!("check blew up");
        }));

        assert!(result.is_err());
        assert_eq!(tally.released.load(Ordering::SeqCst), 1);
    }
}
