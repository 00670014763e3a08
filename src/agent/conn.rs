//! Per-query remote-agent connection state.
//!
//! One `AgentConn` covers the whole lifecycle of a single remote call:
//! connect, send, receive, parse, retry against the same or another mirror,
//! and a terminal report. The net loop owns the connection and drives these
//! handlers from poller events and timeout callbacks; the handlers never
//! block.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::dashboard::{HostDashboard, RequestOutcome};
use crate::agent::desc::AgentDesc;
use crate::agent::dispatch::{AgentResult, ReplyParser, RequestBuilder};
use crate::agent::mirror::MirrorGroup;
use crate::agent::reporter::Reporter;
use crate::error::NetError;
use crate::net::socket::{AgentStream, ChunkStatus};
use crate::wire::{ChainedOut, InBuf, ReplyStatus, PROTO_HELLO, REPLY_HEADER_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Healthy,
    Connecting,
    Retry,
}

impl AgentState {
    pub fn name(self) -> &'static str {
        match self {
            AgentState::Healthy => "healthy",
            AgentState::Connecting => "connecting",
            AgentState::Retry => "retry",
        }
    }
}

/// Reply reception phases: fresh connections see the server hello first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvPhase {
    Hello,
    Header,
    Body,
}

/// Outcome of one batch of writability.
pub enum SendStep {
    Progress,
    Complete,
    Closed,
    Fatal(io::Error),
}

/// Outcome of one batch of readability.
pub enum RecvStep {
    NeedMore,
    Done,
    Closed,
    Fatal(io::Error),
    Protocol(NetError),
    RemoteError(String),
    RemoteRetry(String),
}

pub struct AgentConn {
    pub desc: AgentDesc,
    pub dash: Arc<HostDashboard>,
    pub group: Option<Arc<MirrorGroup>>,
    pub mirror_ix: usize,
    pub builder: Arc<dyn RequestBuilder>,
    pub parser: Arc<dyn ReplyParser>,
    pub reporter: Arc<dyn Reporter>,

    pub connect_timeout: Duration,
    pub query_timeout: Duration,
    pub retries_left: usize,
    pub retry_delay: Duration,
    pub max_packet: usize,

    pub state: AgentState,
    pub io: Option<Arc<AgentStream>>,
    /// The socket was freshly opened (handshake pending) rather than rented.
    pub fresh: bool,
    pub rented: bool,

    out: ChainedOut,
    sent: usize,
    send_done: bool,

    phase: RecvPhase,
    hello_buf: [u8; 4],
    header_buf: [u8; REPLY_HEADER_LEN],
    got: usize,
    body: Vec<u8>,

    pub reply_status: Option<ReplyStatus>,
    pub result: AgentResult,
    pub warning: Option<String>,
    pub failure: Option<String>,
    pub outcome: RequestOutcome,

    /// Query start, microseconds since the epoch.
    pub started_us: i64,
    /// Timeout generation; heap entries from older phases are ignored.
    pub gen: u64,
    pub token: usize,
}

impl AgentConn {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        desc: AgentDesc,
        dash: Arc<HostDashboard>,
        group: Option<Arc<MirrorGroup>>,
        mirror_ix: usize,
        builder: Arc<dyn RequestBuilder>,
        parser: Arc<dyn ReplyParser>,
        reporter: Arc<dyn Reporter>,
        connect_timeout: Duration,
        query_timeout: Duration,
        retries: usize,
        retry_delay: Duration,
        max_packet: usize,
    ) -> Self {
        Self {
            desc,
            dash,
            group,
            mirror_ix,
            builder,
            parser,
            reporter,
            connect_timeout,
            query_timeout,
            retries_left: retries,
            retry_delay,
            max_packet,
            state: AgentState::Connecting,
            io: None,
            fresh: true,
            rented: false,
            out: ChainedOut::new(),
            sent: 0,
            send_done: false,
            phase: RecvPhase::Header,
            hello_buf: [0; 4],
            header_buf: [0; REPLY_HEADER_LEN],
            got: 0,
            body: Vec::new(),
            reply_status: None,
            result: AgentResult::None,
            warning: None,
            failure: None,
            outcome: RequestOutcome::default(),
            started_us: 0,
            gen: 0,
            token: 0,
        }
    }

    pub fn is_blackhole(&self) -> bool {
        self.desc.host.blackhole
    }

    pub fn is_persistent(&self) -> bool {
        self.desc.host.persistent
    }

    /// Take ownership of a connected (or rented) socket and stage the
    /// request bytes. Rented sockets skip the hello exchange.
    pub fn adopt_stream(&mut self, io: Arc<AgentStream>, fresh: bool) {
        self.io = Some(io);
        self.fresh = fresh;
        self.rented = !fresh;
        self.state = AgentState::Healthy;

        self.out.reset();
        if fresh {
            self.out.send_u32(PROTO_HELLO);
            self.out.new_chunk();
        }
        let builder = self.builder.clone();
        builder.build_request(&self.desc, &mut self.out);
        self.out.commit_all_lengths();
        self.sent = 0;
        self.send_done = false;

        self.phase = if fresh { RecvPhase::Hello } else { RecvPhase::Header };
        self.got = 0;
        self.body.clear();
        self.reply_status = None;
    }

    pub fn send_complete(&self) -> bool {
        self.send_done
    }

    /// Push request bytes until the socket pushes back.
    pub fn on_writable(&mut self) -> SendStep {
        let Some(io) = self.io.clone() else {
            return SendStep::Progress;
        };
        let total = self.out.total_len();
        loop {
            if self.sent >= total {
                self.send_done = true;
                return SendStep::Complete;
            }
            let slices = self.out.as_io_slices(self.sent);
            match io.try_send_vectored(&slices) {
                Ok(ChunkStatus::Data(n)) => self.sent += n,
                Ok(ChunkStatus::WouldBlock) => return SendStep::Progress,
                Ok(ChunkStatus::Interrupted) => continue,
                Ok(ChunkStatus::Closed) => return SendStep::Closed,
                Err(e) => return SendStep::Fatal(e),
            }
        }
    }

    /// Pull reply bytes until the socket runs dry or the reply completes.
    pub fn on_readable(&mut self) -> RecvStep {
        let Some(io) = self.io.clone() else {
            return RecvStep::NeedMore;
        };
        loop {
            let (buf, want): (&mut [u8], usize) = match self.phase {
                RecvPhase::Hello => (&mut self.hello_buf, 4),
                RecvPhase::Header => (&mut self.header_buf, REPLY_HEADER_LEN),
                RecvPhase::Body => {
                    let len = self.body.len();
                    (&mut self.body, len)
                }
            };
            if self.got < want {
                match io.try_recv(&mut buf[self.got..want]) {
                    Ok(ChunkStatus::Data(n)) => {
                        self.got += n;
                        if self.got < want {
                            continue;
                        }
                    }
                    Ok(ChunkStatus::WouldBlock) => return RecvStep::NeedMore,
                    Ok(ChunkStatus::Interrupted) => continue,
                    Ok(ChunkStatus::Closed) => return RecvStep::Closed,
                    Err(e) => return RecvStep::Fatal(e),
                }
            }

            // phase complete
            match self.phase {
                RecvPhase::Hello => {
                    let version = u32::from_be_bytes(self.hello_buf);
                    if version < PROTO_HELLO {
                        return RecvStep::Protocol(NetError::BadVersion(version));
                    }
                    self.phase = RecvPhase::Header;
                    self.got = 0;
                }
                RecvPhase::Header => {
                    let status = u16::from_be_bytes([self.header_buf[0], self.header_buf[1]]);
                    let len = u32::from_be_bytes([
                        self.header_buf[4],
                        self.header_buf[5],
                        self.header_buf[6],
                        self.header_buf[7],
                    ]) as usize;
                    let Some(status) = ReplyStatus::from_u16(status) else {
                        return RecvStep::Protocol(NetError::MalformedReply(format!(
                            "unknown reply status {status}"
                        )));
                    };
                    if len > self.max_packet {
                        return RecvStep::Protocol(NetError::OversizedPacket {
                            len,
                            max: self.max_packet,
                        });
                    }
                    self.reply_status = Some(status);
                    self.body = vec![0u8; len];
                    self.phase = RecvPhase::Body;
                    self.got = 0;
                    if len == 0 {
                        return self.commit_reply();
                    }
                }
                RecvPhase::Body => return self.commit_reply(),
            }
        }
    }

    /// Body complete: interpret the status and run the reply parser.
    fn commit_reply(&mut self) -> RecvStep {
        let status = self.reply_status.unwrap_or(ReplyStatus::Error);
        let parser = self.parser.clone();
        let body = std::mem::take(&mut self.body);
        let mut inb = InBuf::with_max_packet(&body, self.max_packet);
        match status {
            ReplyStatus::Ok => match parser.parse_reply(&mut inb) {
                Ok(result) => {
                    self.result = result;
                    RecvStep::Done
                }
                Err(e) => RecvStep::Protocol(e),
            },
            ReplyStatus::Warning => {
                let warning = inb.get_string().unwrap_or_default();
                self.warning = Some(warning);
                match parser.parse_reply(&mut inb) {
                    Ok(result) => {
                        self.result = result;
                        RecvStep::Done
                    }
                    Err(e) => RecvStep::Protocol(e),
                }
            }
            ReplyStatus::Error => {
                let msg = inb.get_string().unwrap_or_else(|| "remote error".into());
                RecvStep::RemoteError(msg)
            }
            ReplyStatus::Retry => {
                let msg = inb.get_string().unwrap_or_else(|| "remote asks to retry".into());
                RecvStep::RemoteRetry(msg)
            }
        }
    }

    pub fn close_socket(&mut self) {
        self.io = None;
    }

    pub fn set_failure(&mut self, msg: impl Into<String>) {
        self.failure = Some(format!("agent {}: {}", self.desc.host.url(), msg.into()));
    }

    /// Hop to another mirror in the group, if there is one to hop to.
    pub fn switch_mirror(&mut self) {
        if let Some(group) = self.group.clone() {
            if group.mirror_count() > 1 {
                let ix = group.choose();
                let (desc, dash) = group.mirror(ix);
                self.mirror_ix = ix;
                self.desc = desc.clone();
                self.dash = dash.clone();
            }
        }
    }
}
