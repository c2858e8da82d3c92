//! Worker results and batch helpers.

use shardgrid_events::FleetEvent;
use shardgrid_state::{Record, StateResult, StateStore, WriteScope};
use tracing::{debug, info};

use crate::error::ReconcileResult;

/// What one worker invocation did.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOutcome {
    pub worker: &'static str,
    /// Rows transitioned, inserted or deleted.
    pub affected: usize,
    /// Events to publish right away.
    pub follow_up: Vec<FleetEvent>,
    /// Events to publish after the health defer delay.
    pub retry_later: Vec<FleetEvent>,
}

impl WorkerOutcome {
    pub fn new(worker: &'static str) -> Self {
        Self {
            worker,
            affected: 0,
            follow_up: Vec::new(),
            retry_later: Vec::new(),
        }
    }

    pub fn with_affected(mut self, affected: usize) -> Self {
        self.affected = affected;
        self
    }

    pub fn then(mut self, event: FleetEvent) -> Self {
        self.follow_up.push(event);
        self
    }

    pub fn then_if(self, condition: bool, event: FleetEvent) -> Self {
        if condition { self.then(event) } else { self }
    }

    pub fn later(mut self, event: FleetEvent) -> Self {
        self.retry_later.push(event);
        self
    }

    /// Whether the worker re-published its own wake-up event.
    pub fn chained(&self, event: &FleetEvent) -> bool {
        self.follow_up.contains(event)
    }

    pub fn log(&self) {
        if self.affected > 0 {
            info!(
                worker = self.worker,
                affected = self.affected,
                follow_up = self.follow_up.len(),
                "worker finished"
            );
        } else {
            debug!(worker = self.worker, "worker found nothing to do");
        }
    }
}

/// Truncate a `cap + 1` scan to `cap` rows, reporting whether rows remain.
pub(crate) fn split_batch<T>(mut rows: Vec<T>, cap: usize) -> (Vec<T>, bool) {
    let more = rows.len() > cap;
    rows.truncate(cap);
    (rows, more)
}

/// Read up to `cap` rows through `scope` and apply `mutate` to them, all in
/// one transaction. Returns the affected count and whether rows remain.
pub(crate) fn bulk_transition<T: Record>(
    store: &StateStore,
    cap: usize,
    scope: impl FnOnce(&WriteScope, usize) -> StateResult<Vec<T>>,
    mutate: impl FnMut(&mut T),
) -> ReconcileResult<(usize, bool)> {
    let result = store.write(|w| {
        let (rows, more) = split_batch(scope(w, cap + 1)?, cap);
        let ids: Vec<u64> = rows.iter().map(|row| row.id()).collect();
        Ok((w.update_many(&ids, mutate)?, more))
    })?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_reports_remaining_rows() {
        assert_eq!(split_batch(vec![1, 2, 3], 2), (vec![1, 2], true));
        assert_eq!(split_batch(vec![1, 2], 2), (vec![1, 2], false));
        assert_eq!(split_batch(Vec::<u8>::new(), 2), (vec![], false));
    }

    #[test]
    fn builder_collects_events() {
        let outcome = WorkerOutcome::new("test")
            .with_affected(2)
            .then_if(false, FleetEvent::Purge)
            .then_if(true, FleetEvent::IndexToEvict)
            .later(FleetEvent::RepoToIndex);
        assert_eq!(outcome.follow_up, vec![FleetEvent::IndexToEvict]);
        assert!(outcome.chained(&FleetEvent::IndexToEvict));
        assert_eq!(outcome.retry_later, vec![FleetEvent::RepoToIndex]);
    }
}
