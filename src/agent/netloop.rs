//! The net loop: a single task owning the readiness poller, a deadline
//! min-heap and a command channel, driving every in-flight agent connection.
//!
//! Workers hand connections over with `launch` and are woken through their
//! reporter when the call terminates. Connect attempts run as small spawned
//! futures bounded by the connect timeout; their completion re-enters the
//! loop as a command, so the state machine itself never blocks.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::agent::conn::{AgentConn, AgentState, RecvStep, SendStep};
use crate::agent::dashboard::{unix_micros, AgentEvent};
use crate::agent::reporter::AgentOutcome;
use crate::error::NetError;
use crate::net::poller::{NetPoller, PollerWaker, Readiness};
use crate::net::socket::AgentStream;

/// Idle wait bound when no timeout is armed.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

enum NetCommand {
    Launch(Box<AgentConn>),
    Connected {
        token: usize,
        gen: u64,
        result: Result<AgentStream, NetError>,
        connect_ms: u64,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeoutKind {
    Query,
    Retry,
}

#[derive(PartialEq, Eq)]
struct TimeoutEntry {
    at: Instant,
    seq: u64,
    token: usize,
    gen: u64,
    kind: TimeoutKind,
}

impl Ord for TimeoutEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Cloneable handle for submitting work to the net loop.
#[derive(Clone)]
pub struct NetLoopHandle {
    tx: mpsc::UnboundedSender<NetCommand>,
    waker: PollerWaker,
}

impl NetLoopHandle {
    pub fn launch(&self, conn: AgentConn) {
        let _ = self.tx.send(NetCommand::Launch(Box::new(conn)));
        self.waker.wake();
    }

    /// Cancel all in-flight connections with a terminal failure and stop the
    /// loop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(NetCommand::Shutdown);
        self.waker.wake();
    }
}

/// Spawn the net loop task; the handle submits connections to it.
pub fn spawn_netloop() -> NetLoopHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let poller = NetPoller::new();
    let waker = poller.waker();
    let handle = NetLoopHandle {
        tx: tx.clone(),
        waker,
    };
    let mut netloop = NetLoop {
        poller,
        conns: HashMap::new(),
        timeouts: BinaryHeap::new(),
        next_token: 1,
        next_seq: 0,
        tx,
        rx,
    };
    tokio::spawn(async move {
        netloop.run().await;
        debug!("net loop stopped");
    });
    handle
}

enum Step {
    Command(Option<NetCommand>),
    Ready(Vec<(usize, Readiness)>),
}

struct NetLoop {
    poller: NetPoller,
    conns: HashMap<usize, Box<AgentConn>>,
    timeouts: BinaryHeap<Reverse<TimeoutEntry>>,
    next_token: usize,
    next_seq: u64,
    tx: mpsc::UnboundedSender<NetCommand>,
    rx: mpsc::UnboundedReceiver<NetCommand>,
}

impl NetLoop {
    async fn run(&mut self) {
        loop {
            let deadline = self
                .timeouts
                .peek()
                .map(|Reverse(e)| e.at)
                .unwrap_or_else(|| Instant::now() + IDLE_WAIT);

            let step = tokio::select! {
                biased;
                cmd = self.rx.recv() => Step::Command(cmd),
                events = self.poller.wait(deadline) => Step::Ready(events),
            };

            match step {
                Step::Command(None) => break,
                Step::Command(Some(NetCommand::Shutdown)) => {
                    self.cancel_all();
                    break;
                }
                Step::Command(Some(cmd)) => self.handle_command(cmd),
                Step::Ready(events) => {
                    for (token, readiness) in events {
                        self.dispatch_event(token, readiness);
                    }
                }
            }
            self.fire_due_timeouts();
        }
    }

    fn handle_command(&mut self, cmd: NetCommand) {
        match cmd {
            NetCommand::Launch(mut conn) => {
                let token = self.next_token;
                self.next_token += 1;
                conn.token = token;
                conn.started_us = unix_micros();
                self.conns.insert(token, conn);
                self.start_attempt(token);
            }
            NetCommand::Connected {
                token,
                gen,
                result,
                connect_ms,
            } => self.on_connect_result(token, gen, result, connect_ms),
            NetCommand::Shutdown => unreachable!("handled by run loop"),
        }
    }

    fn arm(&mut self, token: usize, at: Instant, kind: TimeoutKind, gen: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timeouts.push(Reverse(TimeoutEntry {
            at,
            seq,
            token,
            gen,
            kind,
        }));
    }

    /// Open (or rent) a socket for the connection's current mirror.
    fn start_attempt(&mut self, token: usize) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        conn.state = AgentState::Connecting;
        conn.gen += 1;
        conn.dash.note_query_sent();

        // persistent hosts try the pool first; rented sockets skip the
        // handshake entirely
        if conn.is_persistent() {
            if let Some(sock) = conn.dash.pool.as_ref().and_then(|p| p.rent()) {
                trace!(agent = %conn.desc.host.url(), "reusing persistent connection");
                self.attach(token, sock, false);
                return;
            }
        }

        conn.outcome.connect_attempts += 1;
        let gen = conn.gen;
        let host = conn.desc.host.clone();
        let connect_timeout = conn.connect_timeout;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let started = std::time::Instant::now();
            let result = match host.connect_target().await {
                Ok(target) => {
                    AgentStream::connect(&target, Instant::now() + connect_timeout).await
                }
                Err(e) => Err(e),
            };
            let _ = tx.send(NetCommand::Connected {
                token,
                gen,
                result,
                connect_ms: started.elapsed().as_millis() as u64,
            });
        });
    }

    fn on_connect_result(
        &mut self,
        token: usize,
        gen: u64,
        result: Result<AgentStream, NetError>,
        connect_ms: u64,
    ) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return; // the call finished while this connect was in flight
        };
        if conn.gen != gen {
            return; // stale attempt
        }
        conn.outcome.connect_ms_sum += connect_ms;
        match result {
            Ok(stream) => self.attach(token, Arc::new(stream), true),
            Err(e) => {
                let event = match e {
                    NetError::ConnectTimeout => AgentEvent::TimeoutConnect,
                    _ => AgentEvent::ConnectFailure,
                };
                conn.outcome.note(event);
                conn.set_failure(format!("connect failed: {e}"));
                self.to_retry(token);
            }
        }
    }

    /// Socket acquired: stage the request, watch for writability, arm the
    /// query timeout.
    fn attach(&mut self, token: usize, io: Arc<AgentStream>, fresh: bool) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        conn.adopt_stream(io.clone(), fresh);
        conn.gen += 1;
        let gen = conn.gen;
        let at = Instant::now() + conn.query_timeout;
        self.poller.register(token, io, Readiness::WRITE);
        self.arm(token, at, TimeoutKind::Query, gen);
    }

    fn dispatch_event(&mut self, token: usize, readiness: Readiness) {
        if !self.conns.contains_key(&token) {
            self.poller.deregister(token);
            return;
        }

        if readiness.intersects(Readiness::ERR) {
            let conn = self.conns.get_mut(&token).unwrap();
            conn.outcome.note(AgentEvent::NetworkError);
            conn.set_failure("socket error");
            self.to_retry(token);
            return;
        }

        if readiness.intersects(Readiness::WRITE) {
            let conn = self.conns.get_mut(&token).unwrap();
            if !conn.send_complete() {
                match conn.on_writable() {
                    SendStep::Progress => {}
                    SendStep::Complete => {
                        if conn.is_blackhole() {
                            // blackholes never get their replies read
                            self.finish(token, true);
                            return;
                        }
                        // request is out: switch to the reply side with a
                        // fresh query deadline
                        conn.gen += 1;
                        let gen = conn.gen;
                        let at = Instant::now() + conn.query_timeout;
                        self.poller.modify(token, Readiness::READ);
                        self.arm(token, at, TimeoutKind::Query, gen);
                    }
                    SendStep::Closed => {
                        conn.outcome.note(AgentEvent::UnexpectedClose);
                        conn.set_failure("connection closed while sending");
                        self.to_retry(token);
                        return;
                    }
                    SendStep::Fatal(e) => {
                        conn.outcome.note(AgentEvent::NetworkError);
                        conn.set_failure(format!("send failed: {e}"));
                        self.to_retry(token);
                        return;
                    }
                }
            }
        }

        if readiness.intersects(Readiness::READ | Readiness::HUP) {
            let conn = self.conns.get_mut(&token).unwrap();
            if !conn.send_complete() {
                // reply cannot precede our request; a HUP here is a close
                if readiness.intersects(Readiness::HUP) {
                    conn.outcome.note(AgentEvent::UnexpectedClose);
                    conn.set_failure("connection closed prematurely");
                    self.to_retry(token);
                }
                return;
            }
            match conn.on_readable() {
                RecvStep::NeedMore => {}
                RecvStep::Done => {
                    self.finish(token, true);
                }
                RecvStep::Closed => {
                    let conn = self.conns.get_mut(&token).unwrap();
                    conn.outcome.note(AgentEvent::UnexpectedClose);
                    conn.set_failure("connection closed mid-reply");
                    self.to_retry(token);
                }
                RecvStep::Fatal(e) => {
                    let conn = self.conns.get_mut(&token).unwrap();
                    conn.outcome.note(AgentEvent::NetworkError);
                    conn.set_failure(format!("receive failed: {e}"));
                    self.to_retry(token);
                }
                RecvStep::Protocol(e) => {
                    // malformed traffic is terminal, no retry
                    let conn = self.conns.get_mut(&token).unwrap();
                    conn.outcome.note(AgentEvent::WrongReply);
                    conn.set_failure(e.to_string());
                    self.finish(token, false);
                }
                RecvStep::RemoteError(msg) => {
                    let conn = self.conns.get_mut(&token).unwrap();
                    conn.set_failure(msg);
                    self.finish(token, false);
                }
                RecvStep::RemoteRetry(msg) => {
                    let conn = self.conns.get_mut(&token).unwrap();
                    conn.set_failure(msg);
                    self.to_retry(token);
                }
            }
        }
    }

    fn fire_due_timeouts(&mut self) {
        let now = Instant::now();
        while let Some(Reverse(entry)) = self.timeouts.peek() {
            if entry.at > now {
                break;
            }
            let Reverse(entry) = self.timeouts.pop().unwrap();
            let Some(conn) = self.conns.get_mut(&entry.token) else {
                continue;
            };
            if conn.gen != entry.gen {
                continue; // phase moved on; stale entry
            }
            match entry.kind {
                TimeoutKind::Query => {
                    conn.outcome.note(AgentEvent::TimeoutQuery);
                    conn.set_failure("query timed out");
                    self.to_retry(entry.token);
                }
                TimeoutKind::Retry => {
                    // attribute the failed attempt to the mirror it hit
                    // before hopping anywhere else
                    let so_far = std::mem::take(&mut conn.outcome);
                    if conn.is_blackhole() {
                        conn.dash.record(&so_far.connects_only());
                    } else {
                        conn.dash.record(&so_far);
                    }
                    conn.switch_mirror();
                    self.start_attempt(entry.token);
                }
            }
        }
    }

    /// A failed attempt: close the socket (its framing state is unknown, so
    /// it is never returned to the pool) and either schedule the next try or
    /// report a permanent failure.
    fn to_retry(&mut self, token: usize) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        conn.state = AgentState::Retry;
        conn.gen += 1;
        self.poller.deregister(token);
        let conn = self.conns.get_mut(&token).unwrap();
        conn.close_socket();
        if conn.retries_left > 0 {
            conn.retries_left -= 1;
            let at = Instant::now() + conn.retry_delay;
            let gen = conn.gen;
            debug!(agent = %conn.desc.host.url(), state = conn.state.name(), "retry scheduled");
            self.arm(token, at, TimeoutKind::Retry, gen);
        } else {
            self.finish(token, false);
        }
    }

    /// Terminal transition: fold metrics into the dashboard, maybe return a
    /// persistent socket, and notify the reporter.
    fn finish(&mut self, token: usize, success: bool) {
        let Some(mut conn) = self.conns.remove(&token) else {
            return;
        };
        self.poller.deregister(token);
        conn.gen += 1;

        let now_us = unix_micros();
        conn.outcome.latency_us = (now_us - conn.started_us).max(0) as u64;
        if success {
            let event = if conn.warning.is_some() {
                AgentEvent::Warning
            } else {
                AgentEvent::Success
            };
            conn.outcome.note(event);
        }

        if conn.is_blackhole() {
            // blackholes record connection attempts and nothing else
            conn.dash.record(&conn.outcome.connects_only());
        } else {
            conn.dash.record(&conn.outcome);
        }

        // only a cleanly finished persistent socket is safe to reuse
        if success && conn.is_persistent() && !conn.is_blackhole() {
            if let (Some(pool), Some(io)) = (conn.dash.pool.as_ref(), conn.io.take()) {
                pool.return_socket(io);
            }
        }
        conn.close_socket();

        if !success && conn.failure.is_none() {
            conn.set_failure("agent failed");
        }
        if let Some(msg) = conn.failure.as_deref() {
            if !success {
                warn!(agent = %conn.desc.host.url(), "{msg}");
            }
        }

        let outcome = AgentOutcome {
            success,
            agent: conn.desc.host.url(),
            failure: conn.failure.take(),
            warning: conn.warning.take(),
            result: std::mem::take(&mut conn.result),
        };
        conn.reporter.report(outcome);
    }

    fn cancel_all(&mut self) {
        let tokens: Vec<usize> = self.conns.keys().copied().collect();
        for token in tokens {
            if let Some(conn) = self.conns.get_mut(&token) {
                conn.set_failure("daemon is shutting down");
            }
            self.finish(token, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::dashboard::Dashboards;
    use crate::agent::desc::{AgentDesc, HostDesc};
    use crate::agent::dispatch::{PingBuilder, PingParser};
    use crate::agent::reporter::{RemoteAgentsObserver, Reporter};

    fn ping_conn(
        dashes: &Dashboards,
        host: HostDesc,
        reporter: Arc<RemoteAgentsObserver>,
        retries: usize,
    ) -> AgentConn {
        let dash = dashes.link_host(&host);
        AgentConn::new(
            AgentDesc::new(host, vec![]),
            dash,
            None,
            0,
            Arc::new(PingBuilder { cookie: 7 }),
            Arc::new(PingParser),
            reporter,
            Duration::from_millis(200),
            Duration::from_millis(200),
            retries,
            Duration::from_millis(20),
            1 << 20,
        )
    }

    #[tokio::test]
    async fn unreachable_host_reports_permanent_failure() {
        let handle = spawn_netloop();
        let dashes = Dashboards::new(60, 0);
        // TEST-NET-1 address; connects either refuse instantly or time out
        let host = HostDesc::inet("192.0.2.1", 9);
        let observer = RemoteAgentsObserver::new();
        let conn = ping_conn(&dashes, host, observer.clone(), 1);
        observer.feed_task(true);
        handle.launch(conn);
        observer.wait_done().await;
        assert_eq!(observer.succeeded(), 0);
        let outcomes = observer.take_outcomes();
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].success);
        assert!(outcomes[0].failure.is_some());
        handle.shutdown();
    }

    #[tokio::test]
    async fn shutdown_synthesizes_failures() {
        let handle = spawn_netloop();
        let dashes = Dashboards::new(60, 0);
        // a listener that never answers: the query timeout would fire much
        // later than the shutdown we issue below
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut host = HostDesc::inet("127.0.0.1", addr.port());
        host.resolved = Some(std::net::Ipv4Addr::LOCALHOST);
        let observer = RemoteAgentsObserver::new();
        let mut conn = ping_conn(&dashes, host, observer.clone(), 0);
        conn.query_timeout = Duration::from_secs(30);
        observer.feed_task(true);
        handle.launch(conn);
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown();
        observer.wait_done().await;
        let outcomes = observer.take_outcomes();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0]
            .failure
            .as_deref()
            .unwrap()
            .contains("shutting down"));
    }
}
