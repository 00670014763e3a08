//! Reporters: callback objects notified when remote calls terminate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::agent::dispatch::AgentResult;

/// Terminal outcome of one agent connection.
#[derive(Debug)]
pub struct AgentOutcome {
    pub success: bool,
    pub agent: String,
    pub failure: Option<String>,
    pub warning: Option<String>,
    pub result: AgentResult,
}

/// Notified by the net loop as remote calls finish. `feed_task(true)` is
/// called once per expected connection before it starts; `report` fires on
/// terminal outcomes only (retries are consumed internally).
pub trait Reporter: Send + Sync {
    fn feed_task(&self, add: bool);
    fn report(&self, outcome: AgentOutcome);
    fn is_done(&self) -> bool;
}

/// Aggregating observer for one distributed dispatch: counts successes,
/// collects outcomes in arrival order, and wakes waiters when everything
/// expected has reported.
#[derive(Default)]
pub struct RemoteAgentsObserver {
    expected: AtomicUsize,
    finished: AtomicUsize,
    succeeded: AtomicUsize,
    outcomes: Mutex<Vec<AgentOutcome>>,
    notify: Notify,
}

impl RemoteAgentsObserver {
    pub fn new() -> Arc<RemoteAgentsObserver> {
        Arc::new(RemoteAgentsObserver::default())
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::Acquire)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::Acquire)
    }

    /// Block until every fed task has reported.
    pub async fn wait_done(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_done() {
                return;
            }
            notified.await;
        }
    }

    /// Drain collected outcomes, arrival order.
    pub fn take_outcomes(&self) -> Vec<AgentOutcome> {
        std::mem::take(&mut self.outcomes.lock())
    }
}

impl Reporter for RemoteAgentsObserver {
    fn feed_task(&self, add: bool) {
        if add {
            self.expected.fetch_add(1, Ordering::AcqRel);
        } else {
            self.expected.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn report(&self, outcome: AgentOutcome) {
        if outcome.success {
            self.succeeded.fetch_add(1, Ordering::AcqRel);
        }
        self.outcomes.lock().push(outcome);
        self.finished.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    fn is_done(&self) -> bool {
        self.finished.load(Ordering::Acquire) >= self.expected.load(Ordering::Acquire)
    }
}
