//! Daemon-wide counters and their Prometheus exposition.

use std::fmt::Write as FmtWrite;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::wire::{Command, COMMAND_COUNT};

/// Atomic counter for thread-safe incrementing
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Atomic gauge for thread-safe value tracking
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Daemon-lifetime counters, mirrored into STATUS replies and `/metrics`.
#[derive(Debug)]
pub struct DaemonStats {
    pub started_unix: i64,
    pub connections: Counter,
    pub active_connections: Gauge,
    pub maxed_out: Counter,
    pub command_counts: [Counter; COMMAND_COUNT],
    pub agent_connects: Counter,
    pub agent_retries: Counter,
    pub queries: Counter,
    pub query_time_us: Counter,
    pub dist_queries: Counter,
    pub dist_wall_us: Counter,
}

impl Default for DaemonStats {
    fn default() -> Self {
        Self {
            started_unix: chrono::Utc::now().timestamp(),
            connections: Counter::new(),
            active_connections: Gauge::default(),
            maxed_out: Counter::new(),
            command_counts: Default::default(),
            agent_connects: Counter::new(),
            agent_retries: Counter::new(),
            queries: Counter::new(),
            query_time_us: Counter::new(),
            dist_queries: Counter::new(),
            dist_wall_us: Counter::new(),
        }
    }
}

impl DaemonStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_command(&self, command: Command) {
        self.command_counts[command as u16 as usize].inc();
    }

    pub fn uptime_secs(&self) -> u64 {
        (chrono::Utc::now().timestamp() - self.started_unix).max(0) as u64
    }

    /// Key/value pairs for the STATUS command, in a stable order.
    pub fn status_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("uptime".to_string(), self.uptime_secs().to_string()),
            ("connections".to_string(), self.connections.get().to_string()),
            (
                "maxed_out".to_string(),
                self.maxed_out.get().to_string(),
            ),
            ("queries".to_string(), self.queries.get().to_string()),
            (
                "query_time_us".to_string(),
                self.query_time_us.get().to_string(),
            ),
            (
                "dist_queries".to_string(),
                self.dist_queries.get().to_string(),
            ),
            (
                "agent_connects".to_string(),
                self.agent_connects.get().to_string(),
            ),
            (
                "agent_retries".to_string(),
                self.agent_retries.get().to_string(),
            ),
        ];
        for i in 0..COMMAND_COUNT as u16 {
            if let Some(cmd) = Command::from_u16(i) {
                let n = self.command_counts[i as usize].get();
                pairs.push((format!("command_{}", cmd.name()), n.to_string()));
            }
        }
        pairs
    }

    /// Export in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::with_capacity(2048);
        write_counter(
            &mut out,
            "seekd_connections_total",
            "Total number of accepted client connections",
            self.connections.get(),
        );
        write_gauge(
            &mut out,
            "seekd_active_connections",
            "Number of open client connections",
            self.active_connections.get(),
        );
        write_counter(
            &mut out,
            "seekd_maxed_out_total",
            "Connections refused by the connection limit",
            self.maxed_out.get(),
        );
        write_counter(
            &mut out,
            "seekd_queries_total",
            "Total number of search queries",
            self.queries.get(),
        );
        write_counter(
            &mut out,
            "seekd_query_time_microseconds_total",
            "Wall time spent serving queries",
            self.query_time_us.get(),
        );
        write_counter(
            &mut out,
            "seekd_dist_queries_total",
            "Total number of distributed queries",
            self.dist_queries.get(),
        );
        write_counter(
            &mut out,
            "seekd_agent_connects_total",
            "Remote agent connections launched",
            self.agent_connects.get(),
        );
        write_counter(
            &mut out,
            "seekd_agent_retries_total",
            "Remote agent retries performed",
            self.agent_retries.get(),
        );
        out
    }
}

/// Write a counter metric in Prometheus exposition format
fn write_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} counter", name);
    let _ = writeln!(out, "{} {}", name, value);
    let _ = writeln!(out);
}

/// Write a gauge metric in Prometheus exposition format
fn write_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
    let _ = writeln!(out, "{} {}", name, value);
    let _ = writeln!(out);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = DaemonStats::new();
        stats.connections.inc();
        stats.count_command(Command::Search);
        stats.count_command(Command::Search);
        stats.count_command(Command::Ping);
        assert_eq!(stats.command_counts[0].get(), 2);
        assert_eq!(stats.command_counts[9].get(), 1);
        let pairs = stats.status_pairs();
        assert!(pairs
            .iter()
            .any(|(k, v)| k == "command_search" && v == "2"));
    }

    #[test]
    fn prometheus_format() {
        let stats = DaemonStats::new();
        stats.queries.add(42);
        let text = stats.to_prometheus();
        assert!(text.contains("# TYPE seekd_queries_total counter"));
        assert!(text.contains("seekd_queries_total 42"));
    }
}
