//! Per-index query statistics: a rolling record container bucketed at 100 ms
//! granularity with 15-minute retention, interval aggregates with exact
//! percentiles, and all-time aggregates with sketched percentiles.

use std::collections::VecDeque;

use parking_lot::RwLock;

use crate::agent::dashboard::unix_micros;

/// Consecutive queries inside this window share one record.
const BUCKET_DELTA_US: u64 = 100_000;

/// Records older than this are pruned.
const MAX_AGE_US: u64 = 15 * 60 * 1_000_000;

#[derive(Debug, Clone, Copy)]
pub struct QueryStatRecord {
    pub time_min: u64,
    pub time_max: u64,
    pub time_sum: u64,
    pub rows_min: u64,
    pub rows_max: u64,
    pub rows_sum: u64,
    pub timestamp: u64,
    pub count: u64,
}

#[derive(Debug, Default)]
struct RecordContainer {
    records: VecDeque<QueryStatRecord>,
}

impl RecordContainer {
    fn add(&mut self, rows: u64, time_us: u64, now_us: u64) {
        if let Some(last) = self.records.back_mut() {
            if now_us.saturating_sub(last.timestamp) <= BUCKET_DELTA_US {
                last.rows_min = last.rows_min.min(rows);
                last.rows_max = last.rows_max.max(rows);
                last.rows_sum += rows;
                last.time_min = last.time_min.min(time_us);
                last.time_max = last.time_max.max(time_us);
                last.time_sum += time_us;
                last.count += 1;
                return;
            }
        }
        while let Some(front) = self.records.front() {
            if now_us.saturating_sub(front.timestamp) <= MAX_AGE_US {
                break;
            }
            self.records.pop_front();
        }
        self.records.push_back(QueryStatRecord {
            time_min: time_us,
            time_max: time_us,
            time_sum: time_us,
            rows_min: rows,
            rows_max: rows,
            rows_sum: rows,
            timestamp: now_us,
            count: 1,
        });
    }
}

/// Fixed-boundary sketch over the full history, used for the all-time 95th
/// and 99th percentile estimates. Boundaries are powers of two, so the
/// estimate is the smallest boundary covering the requested rank.
#[derive(Debug)]
struct Sketch {
    counts: [u64; 40],
    total: u64,
}

impl Default for Sketch {
    fn default() -> Self {
        Self {
            counts: [0; 40],
            total: 0,
        }
    }
}

impl Sketch {
    fn add(&mut self, value: u64) {
        let bucket = (64 - value.leading_zeros() as usize).min(self.counts.len() - 1);
        self.counts[bucket] += 1;
        self.total += 1;
    }

    fn percentile(&self, p: f64) -> u64 {
        if self.total == 0 {
            return 0;
        }
        let rank = ((self.total as f64) * p / 100.0).ceil() as u64;
        let mut seen = 0;
        for (bucket, count) in self.counts.iter().enumerate() {
            seen += count;
            if seen >= rank {
                return if bucket == 0 { 0 } else { 1u64 << bucket };
            }
        }
        1u64 << (self.counts.len() - 1)
    }
}

/// Aggregates for one interval.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalStats {
    pub queries: u64,
    pub avg: u64,
    pub min: u64,
    pub max: u64,
    pub p95: u64,
    pub p99: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatInterval {
    Min1 = 0,
    Min5,
    Min15,
    AllTime,
}

pub const STAT_INTERVALS: [StatInterval; 4] = [
    StatInterval::Min1,
    StatInterval::Min5,
    StatInterval::Min15,
    StatInterval::AllTime,
];

const INTERVAL_SPANS_US: [u64; 3] = [60 * 1_000_000, 5 * 60 * 1_000_000, 15 * 60 * 1_000_000];

impl StatInterval {
    pub fn name(self) -> &'static str {
        match self {
            StatInterval::Min1 => "1min",
            StatInterval::Min5 => "5min",
            StatInterval::Min15 => "15min",
            StatInterval::AllTime => "total",
        }
    }
}

/// Full report: found-rows and query-time aggregates per interval.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryStatsReport {
    pub rows: [IntervalStats; 4],
    pub time: [IntervalStats; 4],
}

#[derive(Default)]
struct StatsInner {
    records: RecordContainer,
    time_sketch: Sketch,
    rows_sketch: Sketch,
    rows_min: u64,
    rows_max: u64,
    rows_sum: u64,
    time_min: u64,
    time_max: u64,
    time_sum: u64,
    total_queries: u64,
}

/// Rolling statistics embedded in every served-index handle.
#[derive(Default)]
pub struct ServedStats {
    inner: RwLock<StatsInner>,
}

impl ServedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_query_stat(&self, rows: u64, time_us: u64) {
        self.add_query_stat_at(rows, time_us, unix_micros() as u64);
    }

    pub fn add_query_stat_at(&self, rows: u64, time_us: u64, now_us: u64) {
        let mut inner = self.inner.write();
        inner.records.add(rows, time_us, now_us);
        inner.time_sketch.add(time_us);
        inner.rows_sketch.add(rows);
        if inner.total_queries == 0 {
            inner.rows_min = rows;
            inner.time_min = time_us;
        } else {
            inner.rows_min = inner.rows_min.min(rows);
            inner.time_min = inner.time_min.min(time_us);
        }
        inner.rows_max = inner.rows_max.max(rows);
        inner.rows_sum += rows;
        inner.time_max = inner.time_max.max(time_us);
        inner.time_sum += time_us;
        inner.total_queries += 1;
    }

    pub fn total_queries(&self) -> u64 {
        self.inner.read().total_queries
    }

    pub fn calculate(&self) -> QueryStatsReport {
        self.calculate_at(unix_micros() as u64)
    }

    pub fn calculate_at(&self, now_us: u64) -> QueryStatsReport {
        let inner = self.inner.read();
        let mut report = QueryStatsReport::default();

        for (i, span) in INTERVAL_SPANS_US.iter().enumerate() {
            let (rows, time) = Self::interval_stats(&inner.records, now_us, *span);
            report.rows[i] = rows;
            report.time[i] = time;
        }

        let all = StatInterval::AllTime as usize;
        if inner.total_queries > 0 {
            report.rows[all] = IntervalStats {
                queries: inner.total_queries,
                avg: inner.rows_sum / inner.total_queries,
                min: inner.rows_min,
                max: inner.rows_max,
                p95: inner.rows_sketch.percentile(95.0),
                p99: inner.rows_sketch.percentile(99.0),
            };
            report.time[all] = IntervalStats {
                queries: inner.total_queries,
                avg: inner.time_sum / inner.total_queries,
                min: inner.time_min,
                max: inner.time_max,
                p95: inner.time_sketch.percentile(95.0),
                p99: inner.time_sketch.percentile(99.0),
            };
        }
        report
    }

    fn interval_stats(
        container: &RecordContainer,
        now_us: u64,
        span_us: u64,
    ) -> (IntervalStats, IntervalStats) {
        let mut rows = IntervalStats {
            min: u64::MAX,
            ..Default::default()
        };
        let mut time = IntervalStats {
            min: u64::MAX,
            ..Default::default()
        };
        let mut row_avgs = Vec::new();
        let mut time_avgs = Vec::new();

        for rec in container.records.iter() {
            if now_us.saturating_sub(rec.timestamp) > span_us {
                continue;
            }
            rows.min = rows.min.min(rec.rows_min);
            rows.max = rows.max.max(rec.rows_max);
            time.min = time.min.min(rec.time_min);
            time.max = time.max.max(rec.time_max);
            rows.avg += rec.rows_sum;
            time.avg += rec.time_sum;
            rows.queries += rec.count;
            row_avgs.push(rec.rows_sum / rec.count);
            time_avgs.push(rec.time_sum / rec.count);
        }
        time.queries = rows.queries;

        if rows.queries == 0 {
            return (IntervalStats::default(), IntervalStats::default());
        }
        rows.avg /= rows.queries;
        time.avg /= time.queries;

        row_avgs.sort_unstable();
        time_avgs.sort_unstable();
        let rank = |p: f64| {
            let n = row_avgs.len();
            ((n as f64 * p).ceil() as usize).clamp(1, n) - 1
        };
        rows.p95 = row_avgs[rank(0.95)];
        rows.p99 = row_avgs[rank(0.99)];
        time.p95 = time_avgs[rank(0.95)];
        time.p99 = time_avgs[rank(0.99)];
        (rows, time)
    }
}
