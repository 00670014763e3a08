//! Per-host rolling health metrics.
//!
//! Every host gets one dashboard holding a ring of period buckets stamped
//! with the wall-clock second index divided by the karma period. Writes to a
//! bucket with a stale stamp reset it first. The errors-in-a-row counter
//! drives retry-state decisions and weighted mirror selection.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::agent::desc::HostDesc;
use crate::net::pool::PersistentPool;

/// Buckets kept in the history ring.
pub const DASH_PERIODS: usize = 15;

/// Default aggregation window for host health, in seconds.
pub const DEFAULT_KARMA_SECS: u64 = 60;

/// Raw per-attempt event counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum AgentEvent {
    TimeoutQuery = 0,
    TimeoutConnect,
    ConnectFailure,
    NetworkError,
    WrongReply,
    UnexpectedClose,
    Warning,
    Success,
}

pub const AGENT_EVENT_COUNT: usize = 8;

pub const AGENT_EVENT_NAMES: [&str; AGENT_EVENT_COUNT] = [
    "query_timeouts",
    "connect_timeouts",
    "connect_failures",
    "network_errors",
    "wrong_replies",
    "unexpected_closings",
    "warnings",
    "succeeded_queries",
];

/// Everything one finished request contributes to its host's dashboard.
#[derive(Debug, Clone, Default)]
pub struct RequestOutcome {
    pub events: [u64; AGENT_EVENT_COUNT],
    pub latency_us: u64,
    pub connect_attempts: u64,
    /// Sum of connect times over the attempts, in milliseconds.
    pub connect_ms_sum: u64,
}

impl RequestOutcome {
    pub fn note(&mut self, ev: AgentEvent) {
        self.events[ev as usize] += 1;
    }

    /// Any failure counter touched?
    pub fn has_failures(&self) -> bool {
        self.events[..AgentEvent::Warning as usize]
            .iter()
            .any(|&c| c > 0)
    }

    pub fn is_clean_success(&self) -> bool {
        !self.has_failures() && self.events[AgentEvent::Success as usize] > 0
    }

    /// Reduce to the connection-attempt metrics only.
    pub fn connects_only(&self) -> RequestOutcome {
        RequestOutcome {
            connect_attempts: self.connect_attempts,
            connect_ms_sum: self.connect_ms_sum,
            ..Default::default()
        }
    }
}

/// One bucket's worth of accumulated counters and derived metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeriodMetrics {
    pub events: [u64; AGENT_EVENT_COUNT],
    pub queries: u64,
    pub total_us: u64,
    pub connect_attempts: u64,
    pub avg_connect_ms: u64,
    pub max_connect_ms: u64,
}

impl PeriodMetrics {
    fn absorb(&mut self, o: &RequestOutcome) {
        for (dst, src) in self.events.iter_mut().zip(o.events.iter()) {
            *dst += src;
        }
        self.queries += 1;
        self.total_us += o.latency_us;
        if o.connect_attempts > 0 {
            let avg = o.connect_ms_sum / o.connect_attempts;
            self.merge_connect(o.connect_attempts, avg, avg);
        }
    }

    /// Merge another metrics block, keeping the connect average weighted by
    /// attempt counts.
    pub fn merge(&mut self, rhs: &PeriodMetrics) {
        for (dst, src) in self.events.iter_mut().zip(rhs.events.iter()) {
            *dst += src;
        }
        self.queries += rhs.queries;
        self.total_us += rhs.total_us;
        self.merge_connect(rhs.connect_attempts, rhs.avg_connect_ms, rhs.max_connect_ms);
    }

    fn merge_connect(&mut self, attempts: u64, avg_ms: u64, max_ms: u64) {
        if attempts == 0 {
            return;
        }
        if self.connect_attempts > 0 {
            self.avg_connect_ms = (self.avg_connect_ms * self.connect_attempts
                + avg_ms * attempts)
                / (self.connect_attempts + attempts);
        } else {
            self.avg_connect_ms = avg_ms;
        }
        self.max_connect_ms = self.max_connect_ms.max(max_ms);
        self.connect_attempts += attempts;
    }

    /// Mean per-query latency over this window, microseconds.
    pub fn avg_latency_us(&self) -> u64 {
        if self.queries == 0 {
            0
        } else {
            self.total_us / self.queries
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    metrics: PeriodMetrics,
    period: u64,
}

impl Default for Bucket {
    fn default() -> Self {
        Self {
            metrics: PeriodMetrics::default(),
            period: u64::MAX,
        }
    }
}

#[derive(Default)]
struct DashState {
    buckets: [Bucket; DASH_PERIODS],
    last_query_us: i64,
    last_answer_us: i64,
    errors_a_row: u64,
}

/// Current wall clock in microseconds since the epoch.
pub fn unix_micros() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

pub struct HostDashboard {
    pub host: HostDesc,
    karma_secs: u64,
    /// Subscriber count; pinged while positive.
    ping_subs: AtomicI32,
    /// Persistent connection pool, present for persistent hosts.
    pub pool: Option<PersistentPool>,
    state: RwLock<DashState>,
    total_queries: AtomicU64,
    total_connects: AtomicU64,
}

impl HostDashboard {
    pub fn new(host: HostDesc, karma_secs: u64, pool_size: usize) -> Self {
        let pool = (host.persistent && pool_size > 0).then(|| PersistentPool::new(pool_size));
        Self {
            host,
            karma_secs: karma_secs.max(1),
            ping_subs: AtomicI32::new(0),
            pool,
            state: RwLock::new(DashState::default()),
            total_queries: AtomicU64::new(0),
            total_connects: AtomicU64::new(0),
        }
    }

    fn period_of(&self, now_us: i64) -> u64 {
        (now_us / 1_000_000) as u64 / self.karma_secs
    }

    /// Fold one finished request into the current bucket.
    pub fn record(&self, outcome: &RequestOutcome) {
        self.record_at(outcome, unix_micros());
    }

    pub fn record_at(&self, outcome: &RequestOutcome, now_us: i64) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        self.total_connects
            .fetch_add(outcome.connect_attempts, Ordering::Relaxed);

        let period = self.period_of(now_us);
        let idx = (period % DASH_PERIODS as u64) as usize;

        let mut state = self.state.write();
        let bucket = &mut state.buckets[idx];
        if bucket.period != period {
            bucket.metrics = PeriodMetrics::default();
            bucket.period = period;
        }
        bucket.metrics.absorb(outcome);

        if outcome.has_failures() {
            state.errors_a_row += 1;
        } else if outcome.is_clean_success() {
            state.errors_a_row = 0;
        }
        state.last_answer_us = now_us;
    }

    pub fn note_query_sent(&self) {
        self.state.write().last_query_us = unix_micros();
    }

    /// Coalesce the last `periods` buckets into one metrics block.
    pub fn snapshot(&self, periods: usize) -> PeriodMetrics {
        self.snapshot_at(periods, unix_micros())
    }

    pub fn snapshot_at(&self, periods: usize, now_us: i64) -> PeriodMetrics {
        let cur = self.period_of(now_us);
        let periods = periods.min(DASH_PERIODS) as u64;
        let mut out = PeriodMetrics::default();
        let state = self.state.read();
        for bucket in &state.buckets {
            if bucket.period != u64::MAX && cur.saturating_sub(bucket.period) < periods {
                out.merge(&bucket.metrics);
            }
        }
        out
    }

    pub fn errors_in_a_row(&self) -> u64 {
        self.state.read().errors_a_row
    }

    pub fn last_query_us(&self) -> i64 {
        self.state.read().last_query_us
    }

    pub fn last_answer_us(&self) -> i64 {
        self.state.read().last_answer_us
    }

    pub fn total_queries(&self) -> u64 {
        self.total_queries.load(Ordering::Relaxed)
    }

    pub fn total_connects(&self) -> u64 {
        self.total_connects.load(Ordering::Relaxed)
    }

    pub fn subscribe_ping(&self) {
        self.ping_subs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unsubscribe_ping(&self) {
        self.ping_subs.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn needs_ping(&self) -> bool {
        self.ping_subs.load(Ordering::Relaxed) > 0
    }

    pub fn karma_secs(&self) -> u64 {
        self.karma_secs
    }
}

/// Registry of dashboards keyed by `addr:port`. One dashboard per host, no
/// matter how many mirror groups reference it.
pub struct Dashboards {
    map: DashMap<String, Arc<HostDashboard>>,
    karma_secs: u64,
    pool_size: usize,
}

impl Dashboards {
    pub fn new(karma_secs: u64, pool_size: usize) -> Self {
        Self {
            map: DashMap::new(),
            karma_secs,
            pool_size,
        }
    }

    /// Fetch or create the dashboard for a host.
    pub fn link_host(&self, host: &HostDesc) -> Arc<HostDashboard> {
        self.map
            .entry(host.dash_key())
            .or_insert_with(|| {
                Arc::new(HostDashboard::new(
                    host.clone(),
                    self.karma_secs,
                    self.pool_size,
                ))
            })
            .clone()
    }

    pub fn find(&self, key: &str) -> Option<Arc<HostDashboard>> {
        self.map.get(key).map(|e| e.clone())
    }

    pub fn active(&self) -> Vec<Arc<HostDashboard>> {
        self.map.iter().map(|e| e.value().clone()).collect()
    }

    /// Shut down every persistent pool; part of daemon teardown.
    pub fn shutdown_pools(&self) {
        for entry in self.map.iter() {
            if let Some(pool) = entry.value().pool.as_ref() {
                pool.shutdown();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn karma_secs(&self) -> u64 {
        self.karma_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome_with(ev: AgentEvent) -> RequestOutcome {
        let mut o = RequestOutcome::default();
        o.note(ev);
        o
    }

    #[test]
    fn errors_in_a_row_tracks_failures_and_resets() {
        let dash = HostDashboard::new(HostDesc::inet("h", 9312), 60, 0);
        let t0 = 1_000_000_000i64 * 1_000_000;
        dash.record_at(&outcome_with(AgentEvent::TimeoutQuery), t0);
        dash.record_at(&outcome_with(AgentEvent::NetworkError), t0 + 1);
        assert_eq!(dash.errors_in_a_row(), 2);
        // warnings alone neither extend nor reset the streak
        dash.record_at(&outcome_with(AgentEvent::Warning), t0 + 2);
        assert_eq!(dash.errors_in_a_row(), 2);
        dash.record_at(&outcome_with(AgentEvent::Success), t0 + 3);
        assert_eq!(dash.errors_in_a_row(), 0);
    }

    #[test]
    fn stale_bucket_resets_before_accumulating() {
        let dash = HostDashboard::new(HostDesc::inet("h", 9312), 60, 0);
        let t0 = 1_000_000_000i64 * 1_000_000;
        dash.record_at(&outcome_with(AgentEvent::Success), t0);
        // same ring slot, DASH_PERIODS karma periods later
        let t1 = t0 + (DASH_PERIODS as i64) * 60 * 1_000_000;
        dash.record_at(&outcome_with(AgentEvent::Success), t1);
        let snap = dash.snapshot_at(1, t1);
        assert_eq!(snap.events[AgentEvent::Success as usize], 1);
        assert_eq!(snap.queries, 1);
    }

    #[test]
    fn snapshot_coalesces_requested_periods() {
        let dash = HostDashboard::new(HostDesc::inet("h", 9312), 60, 0);
        let t0 = 1_000_000_000i64 * 1_000_000;
        dash.record_at(&outcome_with(AgentEvent::Success), t0);
        dash.record_at(&outcome_with(AgentEvent::Success), t0 + 60 * 1_000_000);
        let one = dash.snapshot_at(1, t0 + 60 * 1_000_000);
        assert_eq!(one.events[AgentEvent::Success as usize], 1);
        let two = dash.snapshot_at(2, t0 + 60 * 1_000_000);
        assert_eq!(two.events[AgentEvent::Success as usize], 2);
    }

    #[test]
    fn totals_are_monotonic() {
        let dash = HostDashboard::new(HostDesc::inet("h", 9312), 60, 0);
        let mut last = 0;
        let t0 = 1_700_000_000i64 * 1_000_000;
        for i in 0..10 {
            let mut o = outcome_with(AgentEvent::Success);
            o.connect_attempts = 1;
            o.connect_ms_sum = 3;
            dash.record_at(&o, t0 + i);
            assert!(dash.total_queries() > last);
            last = dash.total_queries();
        }
        assert_eq!(dash.total_connects(), 10);
    }

    #[test]
    fn connect_average_is_weighted() {
        let mut a = PeriodMetrics::default();
        a.merge_connect(1, 10, 10);
        let mut b = PeriodMetrics::default();
        b.merge_connect(3, 2, 4);
        a.merge(&b);
        assert_eq!(a.connect_attempts, 4);
        assert_eq!(a.avg_connect_ms, 4); // (10*1 + 2*3) / 4
        assert_eq!(a.max_connect_ms, 10);
    }

    #[test]
    fn registry_links_one_dashboard_per_host() {
        let dashes = Dashboards::new(60, 2);
        let mut host = HostDesc::inet("10.0.0.1", 9312);
        host.persistent = true;
        let a = dashes.link_host(&host);
        let b = dashes.link_host(&host);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.pool.is_some());
        assert_eq!(dashes.len(), 1);
    }
}
