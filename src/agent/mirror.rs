//! Mirror groups: ordered sets of interchangeable agents for one logical
//! index, with pluggable selection strategies and karma-weighted balancing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use tracing::debug;

use crate::agent::dashboard::{AgentEvent, Dashboards, HostDashboard};
use crate::agent::desc::AgentDesc;

/// Weights never drop below this floor, so a badly scoring mirror still gets
/// the occasional probe.
pub const WEIGHT_EPSILON: f32 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    #[default]
    Random,
    RoundRobin,
    AvoidDeadWeighted,
    AvoidErrorsWeighted,
    AvoidDeadMinTime,
    AvoidErrorsMinTime,
}

impl Strategy {
    pub fn parse(s: &str) -> Option<Strategy> {
        Some(match s {
            "random" => Strategy::Random,
            "round-robin" | "roundrobin" => Strategy::RoundRobin,
            "avoid-dead-weighted" | "nodeads" => Strategy::AvoidDeadWeighted,
            "avoid-errors-weighted" | "noerrors" => Strategy::AvoidErrorsWeighted,
            "avoid-dead-min-time" => Strategy::AvoidDeadMinTime,
            "avoid-errors-min-time" => Strategy::AvoidErrorsMinTime,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Strategy::Random => "random",
            Strategy::RoundRobin => "round-robin",
            Strategy::AvoidDeadWeighted => "avoid-dead-weighted",
            Strategy::AvoidErrorsWeighted => "avoid-errors-weighted",
            Strategy::AvoidDeadMinTime => "avoid-dead-min-time",
            Strategy::AvoidErrorsMinTime => "avoid-errors-min-time",
        }
    }
}

struct WeightState {
    weights: Vec<f32>,
    stamp_secs: u64,
}

pub struct MirrorGroup {
    mirrors: Vec<AgentDesc>,
    dashes: Vec<Arc<HostDashboard>>,
    rr: AtomicUsize,
    weights: RwLock<WeightState>,
    strategy: Strategy,
    retry_count: usize,
    karma_secs: u64,
}

impl MirrorGroup {
    /// Build a group, linking every mirror's dashboard. HA groups (more than
    /// one non-blackhole mirror) subscribe their hosts to the pinger.
    pub fn new(
        mirrors: Vec<AgentDesc>,
        strategy: Strategy,
        retry_count: usize,
        dashboards: &Dashboards,
    ) -> Arc<MirrorGroup> {
        assert!(!mirrors.is_empty(), "mirror group cannot be empty");
        let dashes: Vec<_> = mirrors
            .iter()
            .map(|m| dashboards.link_host(&m.host))
            .collect();
        let n = mirrors.len();
        let group = Arc::new(MirrorGroup {
            mirrors,
            dashes,
            rr: AtomicUsize::new(0),
            weights: RwLock::new(WeightState {
                weights: vec![1.0 / n as f32; n],
                stamp_secs: now_secs(),
            }),
            strategy,
            retry_count,
            karma_secs: dashboards.karma_secs(),
        });
        if group.is_ha() {
            for (mirror, dash) in group.mirrors.iter().zip(group.dashes.iter()) {
                if !mirror.host.blackhole {
                    dash.subscribe_ping();
                }
            }
        }
        group
    }

    pub fn mirror_count(&self) -> usize {
        self.mirrors.len()
    }

    pub fn is_ha(&self) -> bool {
        self.mirrors.len() > 1
    }

    pub fn retry_limit(&self) -> usize {
        self.retry_count
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn mirror(&self, ix: usize) -> (&AgentDesc, &Arc<HostDashboard>) {
        (&self.mirrors[ix], &self.dashes[ix])
    }

    pub fn mirrors(&self) -> &[AgentDesc] {
        &self.mirrors
    }

    pub fn dashboards(&self) -> &[Arc<HostDashboard>] {
        &self.dashes
    }

    /// Current weight vector (cloned under the shared lock).
    pub fn weights(&self) -> Vec<f32> {
        self.weights.read().weights.clone()
    }

    /// Pick a mirror index according to the group's strategy.
    pub fn choose(&self) -> usize {
        self.choose_at(now_secs())
    }

    pub fn choose_at(&self, now_secs: u64) -> usize {
        if self.mirrors.len() == 1 {
            return 0;
        }
        match self.strategy {
            Strategy::Random => rand::thread_rng().gen_range(0..self.mirrors.len()),
            Strategy::RoundRobin => self.rr.fetch_add(1, Ordering::Relaxed) % self.mirrors.len(),
            Strategy::AvoidDeadWeighted => {
                self.recompute_if_stale(now_secs, Penalty::Dead);
                self.weighted_pick()
            }
            Strategy::AvoidErrorsWeighted => {
                self.recompute_if_stale(now_secs, Penalty::Errors);
                self.weighted_pick()
            }
            Strategy::AvoidDeadMinTime => self.min_time_pick(),
            Strategy::AvoidErrorsMinTime => self.min_time_pick(),
        }
    }

    fn recompute_if_stale(&self, now_secs: u64, penalty: Penalty) {
        {
            let state = self.weights.read();
            if now_secs.saturating_sub(state.stamp_secs) < self.karma_secs {
                return;
            }
        }
        let mut state = self.weights.write();
        // another chooser may have won the race for the write lock
        if now_secs.saturating_sub(state.stamp_secs) < self.karma_secs {
            return;
        }
        state.weights = self.compute_weights(penalty);
        state.stamp_secs = now_secs;
        debug!(weights = ?state.weights, strategy = self.strategy.name(), "mirror weights recomputed");
    }

    fn compute_weights(&self, penalty: Penalty) -> Vec<f32> {
        let raw: Vec<f32> = self
            .dashes
            .iter()
            .map(|dash| {
                let p = match penalty {
                    Penalty::Dead => dash.errors_in_a_row(),
                    Penalty::Errors => {
                        let snap = dash.snapshot(1);
                        snap.events[AgentEvent::NetworkError as usize]
                            + snap.events[AgentEvent::TimeoutQuery as usize]
                            + snap.events[AgentEvent::TimeoutConnect as usize]
                    }
                };
                1.0 / (1.0 + p as f32)
            })
            .collect();
        normalize_with_floor(raw, WEIGHT_EPSILON)
    }

    fn weighted_pick(&self) -> usize {
        let state = self.weights.read();
        let roll: f32 = rand::thread_rng().gen();
        let mut acc = 0.0f32;
        for (ix, w) in state.weights.iter().enumerate() {
            acc += w;
            if roll < acc {
                return ix;
            }
        }
        state.weights.len() - 1
    }

    fn min_time_pick(&self) -> usize {
        let mut best = 0usize;
        let mut best_key = (u64::MAX, u64::MAX);
        for (ix, dash) in self.dashes.iter().enumerate() {
            let snap = dash.snapshot(1);
            let key = (snap.avg_latency_us(), dash.errors_in_a_row());
            if key < best_key {
                best_key = key;
                best = ix;
            }
        }
        best
    }

    #[cfg(test)]
    pub(crate) fn force_recompute(&self, penalty_errors: bool) {
        let mut state = self.weights.write();
        state.weights = self.compute_weights(if penalty_errors {
            Penalty::Errors
        } else {
            Penalty::Dead
        });
    }
}

#[derive(Clone, Copy)]
enum Penalty {
    Dead,
    Errors,
}

fn normalize_with_floor(mut weights: Vec<f32>, floor: f32) -> Vec<f32> {
    let sum: f32 = weights.iter().sum();
    if sum <= 0.0 {
        let n = weights.len() as f32;
        return vec![1.0 / n; weights.len()];
    }
    for w in weights.iter_mut() {
        *w /= sum;
    }
    // raise floored entries, then renormalize the rest
    let floored: f32 = weights.iter().filter(|w| **w < floor).count() as f32 * floor;
    let free: f32 = weights.iter().filter(|w| **w >= floor).sum();
    if free > 0.0 && floored > 0.0 {
        let scale = (1.0 - floored) / free;
        for w in weights.iter_mut() {
            if *w >= floor {
                *w *= scale;
            } else {
                *w = floor;
            }
        }
    }
    weights
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
