//! Per-host FIFO cache of live connections.
//!
//! FIFO discipline maximizes idle-time spread across sockets so kernel-side
//! keepalive catches half-open connections early. After shutdown, returned
//! sockets are closed instead of enqueued.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::net::socket::AgentStream;

#[derive(Default)]
struct PoolInner {
    ring: Vec<Option<Arc<AgentStream>>>,
    rit: usize,
    wit: usize,
    free_window: usize,
    limit: usize,
    shutdown: bool,
}

impl PoolInner {
    fn step(&self, i: usize) -> usize {
        if self.limit == 0 {
            0
        } else {
            (i + 1) % self.limit
        }
    }
}

pub struct PersistentPool {
    inner: Mutex<PoolInner>,
}

impl PersistentPool {
    pub fn new(capacity: usize) -> Self {
        let pool = Self {
            inner: Mutex::new(PoolInner::default()),
        };
        pool.reinit(capacity);
        pool
    }

    /// Resize the ring, dropping (closing) anything currently enqueued.
    pub fn reinit(&self, capacity: usize) {
        let mut inner = self.inner.lock();
        inner.ring = (0..capacity).map(|_| None).collect();
        inner.rit = 0;
        inner.wit = 0;
        inner.free_window = 0;
        inner.limit = capacity;
    }

    /// Take the oldest enqueued socket, or `None` meaning "open a new
    /// connection". Never blocks.
    pub fn rent(&self) -> Option<Arc<AgentStream>> {
        let mut inner = self.inner.lock();
        if inner.shutdown || inner.free_window == 0 {
            return None;
        }
        let rit = inner.rit;
        let socket = inner.ring[rit].take();
        inner.rit = inner.step(rit);
        inner.free_window -= 1;
        socket
    }

    /// Enqueue a socket for reuse. Under shutdown, or when the ring is full,
    /// the socket is dropped (closed) instead.
    pub fn return_socket(&self, socket: Arc<AgentStream>) {
        let mut inner = self.inner.lock();
        if inner.shutdown || inner.limit == 0 || inner.free_window >= inner.limit {
            return; // dropped here, which closes it
        }
        let wit = inner.wit;
        inner.ring[wit] = Some(socket);
        inner.wit = inner.step(wit);
        inner.free_window += 1;
    }

    /// Flip the shutdown flag and close everything enqueued.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        for slot in inner.ring.iter_mut() {
            *slot = None;
        }
        inner.free_window = 0;
    }

    pub fn free_window(&self) -> usize {
        self.inner.lock().free_window
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().limit
    }
}
