//! Minimal MySQL-wire frontend: enough of the 4.1 protocol to greet a
//! client, answer PING, and serve `SHOW STATUS`. Anything resembling real
//! SQL is refused; the binary and HTTP frontends carry the query load.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::NetError;
use crate::net::socket::AgentStream;
use crate::server::ServerContext;

const COM_QUIT: u8 = 0x01;
const COM_QUERY: u8 = 0x03;
const COM_PING: u8 = 0x0e;

const ERR_PARSE: u16 = 1064;

struct PacketWriter {
    seq: u8,
    buf: Vec<u8>,
}

impl PacketWriter {
    fn new(seq: u8) -> Self {
        Self {
            seq,
            buf: Vec::with_capacity(256),
        }
    }

    fn push(&mut self, payload: &[u8]) {
        let len = payload.len();
        self.buf.push((len & 0xff) as u8);
        self.buf.push(((len >> 8) & 0xff) as u8);
        self.buf.push(((len >> 16) & 0xff) as u8);
        self.buf.push(self.seq);
        self.seq = self.seq.wrapping_add(1);
        self.buf.extend_from_slice(payload);
    }
}

fn lenenc_str(out: &mut Vec<u8>, s: &str) {
    // all our strings fit the one-byte length form
    out.push(s.len().min(250) as u8);
    out.extend_from_slice(&s.as_bytes()[..s.len().min(250)]);
}

fn ok_packet() -> Vec<u8> {
    vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
}

fn eof_packet() -> Vec<u8> {
    vec![0xfe, 0x00, 0x00, 0x02, 0x00]
}

fn err_packet(code: u16, message: &str) -> Vec<u8> {
    let mut p = vec![0xff];
    p.extend_from_slice(&code.to_le_bytes());
    p.push(b'#');
    p.extend_from_slice(b"42000");
    p.extend_from_slice(message.as_bytes());
    p
}

fn column_def(name: &str) -> Vec<u8> {
    let mut p = Vec::with_capacity(64);
    lenenc_str(&mut p, "def");
    lenenc_str(&mut p, "");
    lenenc_str(&mut p, "");
    lenenc_str(&mut p, "");
    lenenc_str(&mut p, name);
    lenenc_str(&mut p, name);
    p.push(0x0c); // fixed-length fields below
    p.extend_from_slice(&33u16.to_le_bytes()); // utf8
    p.extend_from_slice(&255u32.to_le_bytes());
    p.push(0xfd); // VAR_STRING
    p.extend_from_slice(&0u16.to_le_bytes());
    p.push(0);
    p.extend_from_slice(&[0, 0]);
    p
}

fn greeting() -> Vec<u8> {
    let mut p = Vec::with_capacity(96);
    p.push(0x0a); // protocol version
    p.extend_from_slice(b"seekd-sql\0");
    p.extend_from_slice(&1u32.to_le_bytes()); // thread id
    p.extend_from_slice(b"01234567\0"); // scramble, first part
    p.extend_from_slice(&0x0200u16.to_le_bytes()); // CLIENT_PROTOCOL_41
    p.push(33); // utf8
    p.extend_from_slice(&0x0002u16.to_le_bytes()); // autocommit
    p.extend_from_slice(&0u16.to_le_bytes()); // capabilities, upper half
    p.push(0); // auth data length
    p.extend_from_slice(&[0u8; 10]);
    p.extend_from_slice(b"890123456789\0"); // scramble, second part
    p
}

async fn read_packet(
    io: &AgentStream,
    deadline: Instant,
    max_packet: usize,
) -> Result<(u8, Vec<u8>), NetError> {
    let mut head = [0u8; 4];
    io.read_exact_deadline(&mut head, deadline, true).await?;
    let len = head[0] as usize | (head[1] as usize) << 8 | (head[2] as usize) << 16;
    if len > max_packet {
        return Err(NetError::OversizedPacket {
            len,
            max: max_packet,
        });
    }
    let seq = head[3];
    let mut payload = vec![0u8; len];
    if len > 0 {
        io.read_exact_deadline(&mut payload, deadline, false).await?;
    }
    Ok((seq, payload))
}

pub struct MysqlSession {
    io: AgentStream,
    ctx: Arc<ServerContext>,
    peer: String,
}

impl MysqlSession {
    pub fn new(io: AgentStream, ctx: Arc<ServerContext>) -> Self {
        let peer = io.peer_label();
        Self { io, ctx, peer }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + Duration::from_millis(self.ctx.config.client_timeout_ms)
    }

    async fn send(&self, writer: PacketWriter) -> Result<(), NetError> {
        let at = Instant::now() + Duration::from_millis(self.ctx.config.write_timeout_ms);
        self.io.send_all_deadline(&writer.buf, at).await?;
        Ok(())
    }

    pub async fn run(self) -> Result<(), NetError> {
        let mut out = PacketWriter::new(0);
        out.push(&greeting());
        self.send(out).await?;

        // client auth response; contents are accepted as-is
        let (seq, _auth) = read_packet(&self.io, self.deadline(), self.ctx.max_packet()).await?;
        let mut out = PacketWriter::new(seq.wrapping_add(1));
        out.push(&ok_packet());
        self.send(out).await?;
        debug!(peer = %self.peer, "mysql client connected");

        loop {
            let (_, payload) =
                match read_packet(&self.io, self.deadline(), self.ctx.max_packet()).await {
                    Ok(p) => p,
                    Err(NetError::Reset) => return Ok(()),
                    Err(e) => return Err(e),
                };
            let Some((&command, body)) = payload.split_first() else {
                return Err(NetError::ShortHeader {
                    got: 0,
                    expected: 1,
                });
            };
            match command {
                COM_QUIT => return Ok(()),
                COM_PING => {
                    let mut out = PacketWriter::new(1);
                    out.push(&ok_packet());
                    self.send(out).await?;
                }
                COM_QUERY => {
                    let query = String::from_utf8_lossy(body);
                    self.handle_query(query.trim()).await?;
                }
                other => {
                    warn!(peer = %self.peer, command = other, "unsupported mysql command");
                    let mut out = PacketWriter::new(1);
                    out.push(&err_packet(ERR_PARSE, "unsupported command"));
                    self.send(out).await?;
                }
            }
        }
    }

    async fn handle_query(&self, query: &str) -> Result<(), NetError> {
        if query.eq_ignore_ascii_case("show status") {
            return self.send_status_table().await;
        }
        let mut out = PacketWriter::new(1);
        out.push(&err_packet(
            ERR_PARSE,
            "only SHOW STATUS is available on this endpoint",
        ));
        self.send(out).await
    }

    async fn send_status_table(&self) -> Result<(), NetError> {
        let pairs = self.ctx.stats.status_pairs();
        let mut out = PacketWriter::new(1);
        out.push(&[0x02]); // two columns
        out.push(&column_def("Counter"));
        out.push(&column_def("Value"));
        out.push(&eof_packet());
        for (key, value) in &pairs {
            let mut row = Vec::with_capacity(key.len() + value.len() + 2);
            lenenc_str(&mut row, key);
            lenenc_str(&mut row, value);
            out.push(&row);
        }
        out.push(&eof_packet());
        self.send(out).await
    }
}
