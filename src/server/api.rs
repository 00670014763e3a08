//! Legacy binary protocol sessions.
//!
//! Wire shape per request: `u16 command; u16 version; u32 body_length;
//! bytes[]`, preceded once per connection by the 4-byte hello exchange.
//! Replies carry `u16 status; u16 version; u32 body_length; bytes[]`.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::NetError;
use crate::net::socket::AgentStream;
use crate::search::SearchRequest;
use crate::server::ServerContext;
use crate::wire::{
    check_command_version, reply_envelope, Command, InBuf, NetReader, NetWriter, OutBuf,
    ReplyStatus, PROTO_HELLO, REQUEST_HEADER_LEN,
};

pub struct ApiSession {
    io: AgentStream,
    ctx: Arc<ServerContext>,
    peer: String,
    vip: bool,
    /// Set by the PERSIST command; switches the idle deadline to the client
    /// timeout so the connection survives between commands.
    persistent: bool,
}

impl ApiSession {
    pub fn new(io: AgentStream, ctx: Arc<ServerContext>, vip: bool) -> Self {
        let peer = io.peer_label();
        Self {
            io,
            ctx,
            peer,
            vip,
            persistent: false,
        }
    }

    fn read_timeout(&self) -> Duration {
        if self.persistent {
            Duration::from_millis(self.ctx.config.client_timeout_ms)
        } else {
            Duration::from_millis(self.ctx.config.read_timeout_ms)
        }
    }

    fn write_deadline(&self) -> Instant {
        Instant::now() + Duration::from_millis(self.ctx.config.write_timeout_ms)
    }

    async fn send(&self, mut out: OutBuf) -> Result<(), NetError> {
        let mut writer = NetWriter::new(&self.io);
        writer.flush(&mut out, self.write_deadline()).await
    }

    async fn send_error(&self, message: &str) -> Result<(), NetError> {
        warn!(peer = %self.peer, "{message}");
        self.send(crate::wire::error_reply(message)).await
    }

    /// Serve one connection until it disconnects or errors out.
    pub async fn run(mut self) -> Result<(), NetError> {
        // hello exchange: ours goes out first, the client's comes back
        let mut hello = OutBuf::new();
        hello.send_u32(PROTO_HELLO);
        self.send(hello).await?;

        let mut input = NetReader::new(&self.io);
        input
            .read_from(4, Instant::now() + self.read_timeout(), false, false)
            .await?;
        let client_version = input.in_buf(self.ctx.max_packet()).get_u32();
        if client_version < PROTO_HELLO {
            debug!(peer = %self.peer, client_version, "bad protocol hello, dropping");
            return Err(NetError::BadVersion(client_version));
        }
        debug!(peer = %self.peer, vip = self.vip, "api client connected");

        loop {
            let mut input = NetReader::new(&self.io);
            match input
                .read_from(
                    REQUEST_HEADER_LEN,
                    Instant::now() + self.read_timeout(),
                    true,
                    false,
                )
                .await
            {
                Ok(()) => {}
                Err(NetError::Reset) => {
                    debug!(peer = %self.peer, "client disconnected");
                    return Ok(());
                }
                Err(NetError::Timeout) if self.persistent => {
                    debug!(peer = %self.peer, "persistent client idled out");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }

            let (command_id, client_ver, body_len) = {
                let mut head = input.in_buf(self.ctx.max_packet());
                (head.get_u16(), head.get_u16(), head.get_u32() as usize)
            };

            if body_len > self.ctx.max_packet() {
                // cannot resync after refusing to read the body
                self.send_error(&format!(
                    "query packet of {body_len} bytes exceeds max_packet_size {}",
                    self.ctx.max_packet()
                ))
                .await?;
                return Err(NetError::OversizedPacket {
                    len: body_len,
                    max: self.ctx.max_packet(),
                });
            }

            if body_len > 0 {
                // replaces the header bytes in the buffer
                input
                    .read_from(body_len, Instant::now() + self.read_timeout(), false, false)
                    .await?;
            }

            let Some(command) = Command::from_u16(command_id) else {
                self.send_error(&format!("invalid command {command_id}")).await?;
                return Ok(());
            };
            self.ctx.stats.count_command(command);

            if let Err(msg) = check_command_version(client_ver, command.version()) {
                self.send_error(&msg).await?;
                continue;
            }

            let body: Vec<u8> = if body_len > 0 {
                input.as_slice().to_vec()
            } else {
                Vec::new()
            };
            let mut inb = InBuf::with_max_packet(&body, self.ctx.max_packet());
            let reply = self.dispatch(command, &mut inb).await;
            self.send(reply).await?;
        }
    }

    async fn dispatch(&mut self, command: Command, inb: &mut InBuf<'_>) -> OutBuf {
        match command {
            Command::Search => self.handle_search(inb).await,
            Command::Ping => {
                let cookie = inb.get_u32();
                let mut out = OutBuf::new();
                reply_envelope(&mut out, ReplyStatus::Ok, command.version(), |out| {
                    out.send_u32(cookie);
                });
                out
            }
            Command::Status => {
                let pairs = self.ctx.stats.status_pairs();
                let mut out = OutBuf::new();
                reply_envelope(&mut out, ReplyStatus::Ok, command.version(), |out| {
                    out.send_u32(pairs.len() as u32);
                    for (key, value) in &pairs {
                        out.send_string(key);
                        out.send_string(value);
                    }
                });
                out
            }
            Command::Persist => {
                self.persistent = inb.get_u32() != 0;
                debug!(peer = %self.peer, persistent = self.persistent, "persist flag updated");
                let mut out = OutBuf::new();
                reply_envelope(&mut out, ReplyStatus::Ok, command.version(), |_| {});
                out
            }
            Command::Insert | Command::Replace => self.handle_insert(inb),
            Command::Commit => {
                let mut out = OutBuf::new();
                reply_envelope(&mut out, ReplyStatus::Ok, command.version(), |out| {
                    out.send_u32(0);
                });
                out
            }
            other => {
                warn!(peer = %self.peer, command = other.name(), "unsupported command");
                crate::wire::error_reply(&format!("command '{}' is not supported", other.name()))
            }
        }
    }

    async fn handle_search(&self, inb: &mut InBuf<'_>) -> OutBuf {
        let request = match SearchRequest::decode(inb) {
            Ok(req) => req,
            Err(e) => return crate::wire::error_reply(&format!("malformed search request: {e}")),
        };
        match self.ctx.execute_search(&request).await {
            Ok(reply) => {
                let mut out = OutBuf::new();
                let (status, warning) = match reply.warning.clone() {
                    Some(w) => (ReplyStatus::Warning, Some(w)),
                    None => (ReplyStatus::Ok, None),
                };
                reply_envelope(&mut out, status, Command::Search.version(), |out| {
                    if let Some(w) = warning {
                        out.send_string(&w);
                    }
                    reply.encode(out);
                });
                out
            }
            Err(e) => crate::wire::error_reply(&e.to_string()),
        }
    }

    fn handle_insert(&self, inb: &mut InBuf<'_>) -> OutBuf {
        let index = inb.get_string().unwrap_or_default();
        let doc_id = inb.get_u64();
        let text = inb.get_string().unwrap_or_default();
        if inb.error() || index.is_empty() {
            return crate::wire::error_reply("malformed insert request");
        }
        match self.ctx.execute_insert(&index, doc_id, &text) {
            Ok(()) => {
                let mut out = OutBuf::new();
                reply_envelope(&mut out, ReplyStatus::Ok, Command::Insert.version(), |out| {
                    out.send_u32(1); // affected rows
                });
                out
            }
            Err(e) => crate::wire::error_reply(&e.to_string()),
        }
    }
}

/// Refuse a connection over the binary protocol once the connection limit is
/// hit: complete the hello, answer `retry`, close.
pub async fn refuse_maxed_out(io: AgentStream, ctx: &ServerContext) {
    let deadline = Instant::now() + Duration::from_millis(ctx.config.write_timeout_ms);
    let mut hello = OutBuf::new();
    hello.send_u32(PROTO_HELLO);
    if io
        .send_all_deadline(&hello.into_bytes(), deadline)
        .await
        .is_err()
    {
        return;
    }
    let reply = crate::wire::retry_reply("server maxed out, retry in a second");
    let _ = io.send_all_deadline(&reply.into_bytes(), deadline).await;
}
