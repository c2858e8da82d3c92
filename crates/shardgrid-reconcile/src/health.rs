//! Store-health gate.
//!
//! A background loop times a small read against the store. While the last
//! probe was slower than `health.store_latency_threshold_ms`, or failed,
//! the store counts as degraded and the reconcile service defers events
//! instead of running workers against it.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use shardgrid_core::HealthSettings;
use shardgrid_state::StateStore;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct StoreHealth {
    store: StateStore,
    threshold: Duration,
    degraded: Arc<AtomicBool>,
    last_latency: Arc<Mutex<Option<Duration>>>,
}

impl StoreHealth {
    pub fn new(store: StateStore, settings: &HealthSettings) -> Self {
        Self {
            store,
            threshold: Duration::from_millis(settings.store_latency_threshold_ms),
            degraded: Arc::new(AtomicBool::new(false)),
            last_latency: Arc::new(Mutex::new(None)),
        }
    }

    /// Probe the store once and update the gate. Returns the new state.
    pub fn probe(&self) -> bool {
        let degraded = match self.store.probe() {
            Ok(latency) => {
                if let Ok(mut last) = self.last_latency.lock() {
                    *last = Some(latency);
                }
                let slow = latency > self.threshold;
                if slow {
                    warn!(
                        latency_ms = latency.as_millis() as u64,
                        threshold_ms = self.threshold.as_millis() as u64,
                        "store probe slow"
                    );
                }
                slow
            }
            Err(e) => {
                error!(error = %e, "store probe failed");
                true
            }
        };
        self.set_degraded(degraded);
        degraded
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn set_degraded(&self, degraded: bool) {
        let previous = self.degraded.swap(degraded, Ordering::Relaxed);
        if previous != degraded {
            if degraded {
                warn!("store degraded, deferring reconciliation");
            } else {
                info!("store healthy, reconciliation resumed");
            }
        }
    }

    pub fn last_latency(&self) -> Option<Duration> {
        self.last_latency.lock().ok().and_then(|last| *last)
    }

    /// Probe every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        debug!(interval_ms = interval.as_millis() as u64, "store health loop starting");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.probe();
                }
                _ = shutdown.changed() => {
                    debug!("store health loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(threshold_ms: u64) -> StoreHealth {
        let settings = HealthSettings {
            store_latency_threshold_ms: threshold_ms,
            ..HealthSettings::default()
        };
        StoreHealth::new(StateStore::open_in_memory().unwrap(), &settings)
    }

    #[test]
    fn fast_store_is_healthy() {
        let health = health(10_000);
        assert!(!health.probe());
        assert!(!health.is_degraded());
        assert!(health.last_latency().is_some());
    }

    #[test]
    fn manual_degrade_and_recover() {
        let health = health(10_000);
        health.set_degraded(true);
        assert!(health.is_degraded());
        // Clones share the gate.
        let clone = health.clone();
        assert!(clone.is_degraded());
        clone.probe();
        assert!(!health.is_degraded());
    }

    #[tokio::test]
    async fn loop_stops_on_shutdown() {
        let health = health(10_000);
        let (tx, rx) = watch::channel(false);
        let runner = health.clone();
        let handle = tokio::spawn(async move {
            runner.run(Duration::from_millis(10), rx).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(health.last_latency().is_some());
    }
}
