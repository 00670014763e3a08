//! The serving frontend: listener multiplexor, per-protocol handlers, the
//! daemon lifecycle, and shared serving state.

pub mod api;
pub mod daemon;
pub mod http;
pub mod listener;
pub mod mysql;
pub mod stats;

pub use daemon::Daemon;
pub use stats::DaemonStats;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Semaphore};
use tracing::debug;

use crate::agent::dashboard::Dashboards;
use crate::agent::dispatch::{build_distributed_conns, perform_remote_tasks, AgentResult};
use crate::agent::netloop::NetLoopHandle;
use crate::agent::reporter::{RemoteAgentsObserver, Reporter};
use crate::config::DaemonConfig;
use crate::index::served::{DistributedIndex, ServedIndex};
use crate::index::Registry;
use crate::search::{QueryError, SearchIndex, SearchReply, SearchRequest};

/// Shared state every connection handler works against.
pub struct ServerContext {
    pub config: DaemonConfig,
    pub local: Registry<ServedIndex>,
    pub dist: Registry<DistributedIndex>,
    pub dashboards: Arc<Dashboards>,
    pub stats: DaemonStats,
    pub netloop: NetLoopHandle,
    pub shutdown_tx: broadcast::Sender<()>,
    /// Connection cap; `None` means unlimited. VIP listeners bypass it.
    pub conn_limit: Option<Arc<Semaphore>>,
}

impl ServerContext {
    pub fn max_packet(&self) -> usize {
        self.config.max_packet_size
    }

    /// Resolve and execute a search against a local or distributed index.
    pub async fn execute_search(&self, req: &SearchRequest) -> Result<SearchReply, QueryError> {
        let started = std::time::Instant::now();
        self.stats.queries.inc();

        if let Some(served) = self.local.get(&req.index) {
            let result = {
                let guard = served.read();
                guard.index.search(req)
            };
            let elapsed_us = started.elapsed().as_micros() as u64;
            self.stats.query_time_us.add(elapsed_us);
            let mut reply = result?;
            served.stats().add_query_stat(reply.total_found, elapsed_us);
            reply.time_ms = (elapsed_us / 1000) as u32;
            return Ok(reply);
        }

        if let Some(dist) = self.dist.get(&req.index) {
            let reply = self.execute_distributed(&dist, req).await;
            let elapsed_us = started.elapsed().as_micros() as u64;
            self.stats.query_time_us.add(elapsed_us);
            self.stats.dist_wall_us.add(elapsed_us);
            let mut reply = reply?;
            reply.time_ms = (elapsed_us / 1000) as u32;
            return Ok(reply);
        }

        Err(QueryError::IndexNotFound(req.index.clone()))
    }

    /// Fan a query out across the distributed index's mirror groups, search
    /// its local parts, and merge whatever arrives.
    async fn execute_distributed(
        &self,
        dist: &DistributedIndex,
        req: &SearchRequest,
    ) -> Result<SearchReply, QueryError> {
        self.stats.dist_queries.inc();

        let observer = RemoteAgentsObserver::new();
        let reporter: Arc<dyn Reporter> = observer.clone();
        let conns = build_distributed_conns(
            dist,
            req,
            reporter,
            self.max_packet(),
            Duration::from_millis(self.config.agent_retry_delay_ms),
        );
        let remotes = conns.len();
        self.stats.agent_connects.add(remotes as u64);

        let succeeded = perform_remote_tasks(&self.netloop, conns, &observer).await;
        debug!(index = %req.index, remotes, succeeded, "distributed dispatch finished");

        let mut merged = SearchReply::default();
        let mut got_payload = false;
        let mut failures: Vec<String> = Vec::new();
        for outcome in observer.take_outcomes() {
            if let Some(warning) = outcome.warning {
                merged.merge(SearchReply {
                    warning: Some(warning),
                    ..Default::default()
                });
            }
            match outcome.result {
                AgentResult::Search(reply) => {
                    merged.merge(reply);
                    got_payload = true;
                }
                AgentResult::None | AgentResult::Pong(_) => {}
            }
            if !outcome.success {
                failures.push(outcome.failure.unwrap_or_else(|| outcome.agent.clone()));
            }
        }

        // local parts of the distributed index
        let mut local_hits = false;
        for name in &dist.locals {
            if let Some(served) = self.local.get(name) {
                let result = {
                    let guard = served.read();
                    guard.index.search(req)
                };
                match result {
                    Ok(reply) => {
                        served.stats().add_query_stat(reply.total_found, 0);
                        merged.merge(reply);
                        local_hits = true;
                    }
                    Err(e) => failures.push(format!("local index '{name}': {e}")),
                }
            } else {
                failures.push(format!("local index '{name}' is not served"));
            }
        }

        let any_success = succeeded > 0 && got_payload;
        if !any_success && !local_hits && remotes > 0 {
            return Err(QueryError::Internal(format!(
                "all mirrors failed: {}",
                failures.join("; ")
            )));
        }
        if !failures.is_empty() {
            let note = failures.join("; ");
            match &mut merged.warning {
                Some(w) => {
                    w.push_str("; ");
                    w.push_str(&note);
                }
                None => merged.warning = Some(note),
            }
        }
        Ok(merged)
    }

    /// Insert (or replace) one document in a mutable local index.
    pub fn execute_insert(
        &self,
        index: &str,
        doc_id: u64,
        text: &str,
    ) -> Result<(), QueryError> {
        let served = self
            .local
            .get(index)
            .ok_or_else(|| QueryError::IndexNotFound(index.to_string()))?;
        let mut guard = served.write();
        if !guard.index_type.is_mutable() {
            return Err(QueryError::NotMutable(index.to_string()));
        }
        guard.index.insert(doc_id, text)
    }
}
