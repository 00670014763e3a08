//! Readiness multiplexer over a set of registered streams.
//!
//! Level-triggered from the consumer's point of view: readiness that
//! persists across `wait` calls is reported again. A waker lets another task
//! or thread interrupt a blocked `wait` with bounded latency; the wake signal
//! is consumed before the ready list is returned.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::io::Interest;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::net::socket::AgentStream;

/// Readiness mask. `PRI` is defined for contract completeness; the tokio
/// backend never reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness(u8);

impl Readiness {
    pub const NONE: Readiness = Readiness(0);
    pub const READ: Readiness = Readiness(1 << 0);
    pub const WRITE: Readiness = Readiness(1 << 1);
    pub const HUP: Readiness = Readiness(1 << 2);
    pub const ERR: Readiness = Readiness(1 << 3);
    pub const PRI: Readiness = Readiness(1 << 4);

    pub fn contains(self, other: Readiness) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Readiness) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Readiness {
    type Output = Readiness;
    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Readiness {
    fn bitor_assign(&mut self, rhs: Readiness) {
        self.0 |= rhs.0;
    }
}

fn to_interest(r: Readiness) -> Option<Interest> {
    match (r.contains(Readiness::READ), r.contains(Readiness::WRITE)) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

fn from_ready(ready: tokio::io::Ready) -> Readiness {
    let mut r = Readiness::NONE;
    if ready.is_readable() {
        r |= Readiness::READ;
    }
    if ready.is_writable() {
        r |= Readiness::WRITE;
    }
    if ready.is_read_closed() || ready.is_write_closed() {
        r |= Readiness::HUP;
    }
    if ready.is_error() {
        r |= Readiness::ERR;
    }
    r
}

/// Handle for interrupting a blocked `wait` from elsewhere.
#[derive(Clone)]
pub struct PollerWaker {
    notify: Arc<Notify>,
}

impl PollerWaker {
    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

struct PollSlot {
    io: Arc<AgentStream>,
    interest: Readiness,
}

pub struct NetPoller {
    slots: HashMap<usize, PollSlot>,
    wake: Arc<Notify>,
}

impl Default for NetPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl NetPoller {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn waker(&self) -> PollerWaker {
        PollerWaker {
            notify: self.wake.clone(),
        }
    }

    pub fn register(&mut self, token: usize, io: Arc<AgentStream>, interest: Readiness) {
        self.slots.insert(token, PollSlot { io, interest });
    }

    pub fn modify(&mut self, token: usize, interest: Readiness) {
        if let Some(slot) = self.slots.get_mut(&token) {
            slot.interest = interest;
        }
    }

    pub fn deregister(&mut self, token: usize) {
        self.slots.remove(&token);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Block until at least one registered stream is ready, the deadline
    /// passes, or the waker fires. Returns every event that is ready at that
    /// moment as `(token, mask)` pairs.
    pub async fn wait(&self, deadline: Instant) -> Vec<(usize, Readiness)> {
        let mut out = Vec::new();

        let mut futs = FuturesUnordered::new();
        for (&token, slot) in &self.slots {
            let Some(interest) = to_interest(slot.interest) else {
                continue;
            };
            let io = &slot.io;
            futs.push(async move { (token, io.ready(interest).await) });
        }

        if futs.is_empty() {
            tokio::select! {
                biased;
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
            return out;
        }

        let first = tokio::select! {
            biased;
            _ = self.wake.notified() => None,
            first = futs.next() => first,
            _ = tokio::time::sleep_until(deadline) => None,
        };
        if let Some((token, res)) = first {
            out.push(Self::map_event(token, res));
            // collect everything else that is ready right now
            while let Some(Some((token, res))) = futs.next().now_or_never() {
                out.push(Self::map_event(token, res));
            }
        }
        out
    }

    fn map_event(
        token: usize,
        res: Result<tokio::io::Ready, std::io::Error>,
    ) -> (usize, Readiness) {
        match res {
            Ok(ready) => (token, from_ready(ready)),
            Err(_) => (token, Readiness::ERR),
        }
    }
}
