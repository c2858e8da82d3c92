//! Pass chaining and bounded back-off.
//!
//! A pass that reports `re_enqueue` is followed immediately by the next one.
//! Anything else (no remaining work, a held lease, a store error) is retried
//! after `initial_backoff * 2^retry`, and the chain stops once `max_retries`
//! retries have been spent.

use std::sync::Arc;
use std::time::Duration;

use shardgrid_core::{RolloutSettings, epoch_secs};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::controller::{RolloutController, RolloutReport};
use crate::error::{RolloutError, RolloutResult};

/// What the chain does after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRun {
    Immediately,
    After(Duration),
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RolloutSettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RolloutSettings) -> Self {
        Self {
            initial_backoff: Duration::from_secs(settings.initial_backoff_secs),
            max_retries: settings.max_retries,
        }
    }

    /// Decide the next step after a pass that ran as retry number `retry`.
    pub fn next_run(&self, result: &RolloutResult<RolloutReport>, retry: u32) -> NextRun {
        if let Ok(report) = result
            && report.re_enqueue
        {
            return NextRun::Immediately;
        }
        if retry >= self.max_retries {
            return NextRun::Stop;
        }
        NextRun::After(self.backoff(retry))
    }

    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor)
    }
}

/// Drives rollout chains for the daemon.
pub struct RolloutRunner {
    controller: Arc<RolloutController>,
    policy: RetryPolicy,
    /// Pause between a stopped chain and the next one.
    restart_interval: Duration,
}

impl RolloutRunner {
    pub fn new(
        controller: Arc<RolloutController>,
        policy: RetryPolicy,
        restart_interval: Duration,
    ) -> Self {
        Self {
            controller,
            policy,
            restart_interval,
        }
    }

    /// Run passes until the policy says stop or `shutdown` flips.
    /// Returns the number of passes executed.
    pub async fn run_chain(&self, shutdown: &mut watch::Receiver<bool>) -> u32 {
        let mut retry = 0;
        let mut passes = 0;
        loop {
            if *shutdown.borrow() {
                return passes;
            }

            let result = self.controller.execute(false, None, epoch_secs());
            passes += 1;
            match &result {
                Ok(report) => debug!(message = %report.message, retry, "rollout pass"),
                Err(RolloutError::LeaseHeld { holder }) => {
                    debug!(%holder, retry, "rollout pass skipped")
                }
                Err(e) => warn!(error = %e, retry, "rollout pass failed"),
            }

            match self.policy.next_run(&result, retry) {
                NextRun::Immediately => {
                    retry = 0;
                    tokio::task::yield_now().await;
                }
                NextRun::After(delay) => {
                    retry += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return passes,
                    }
                }
                NextRun::Stop => {
                    info!(
                        passes,
                        retries = retry,
                        holder = self.controller.holder(),
                        "rollout chain stopped after exhausting retries"
                    );
                    return passes;
                }
            }
        }
    }

    /// Start a new chain every `restart_interval` until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            restart_interval_secs = self.restart_interval.as_secs(),
            max_retries = self.policy.max_retries,
            "rollout runner started"
        );
        loop {
            self.run_chain(&mut shutdown).await;
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.restart_interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("rollout runner stopped");
    }
}
