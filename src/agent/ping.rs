//! Background pinger: periodically probes hosts whose dashboards demand it
//! (mirrors of HA groups), feeding results through the normal counter path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::agent::conn::AgentConn;
use crate::agent::dashboard::{unix_micros, Dashboards};
use crate::agent::desc::AgentDesc;
use crate::agent::dispatch::{PingBuilder, PingParser};
use crate::agent::netloop::NetLoopHandle;
use crate::agent::reporter::{AgentOutcome, Reporter};

/// Fire-and-forget reporter: ping metrics land on the dashboard through the
/// regular finish path, nothing waits for them.
struct PingReporter;

impl Reporter for PingReporter {
    fn feed_task(&self, _add: bool) {}

    fn report(&self, outcome: AgentOutcome) {
        trace!(agent = %outcome.agent, success = outcome.success, "ping finished");
    }

    fn is_done(&self) -> bool {
        true
    }
}

pub struct Pinger {
    pub dashboards: Arc<Dashboards>,
    pub handle: NetLoopHandle,
    pub interval: Duration,
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
    pub max_packet: usize,
}

impl Pinger {
    /// Spawn the ping task; it stops when the shutdown channel fires.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the first tick completes immediately; hosts get one full
            // interval of grace before any probe
            ticker.tick().await;
            debug!(interval_ms = self.interval.as_millis() as u64, "pinger started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick(),
                    _ = shutdown.recv() => break,
                }
            }
            debug!("pinger stopped");
        })
    }

    fn tick(&self) {
        let now_us = unix_micros();
        let interval_us = self.interval.as_micros() as i64;
        let reporter: Arc<dyn Reporter> = Arc::new(PingReporter);
        for dash in self.dashboards.active() {
            if !dash.needs_ping() {
                continue;
            }
            // hosts that answered real traffic recently do not need probing
            if now_us - dash.last_query_us() < interval_us {
                continue;
            }
            let conn = AgentConn::new(
                AgentDesc::new(dash.host.clone(), Vec::new()),
                dash.clone(),
                None,
                0,
                Arc::new(PingBuilder {
                    cookie: (now_us / 1_000_000) as u32,
                }),
                Arc::new(PingParser),
                reporter.clone(),
                self.connect_timeout,
                self.query_timeout,
                0,
                Duration::from_millis(0),
                self.max_packet,
            );
            self.handle.launch(conn);
        }
    }
}
