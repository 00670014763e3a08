//! Socket-backed buffers: a growing input buffer fed by deadline-bounded
//! reads, and an output drain with a send deadline and a sticky error.

use tokio::time::Instant;
use tracing::warn;

use crate::error::NetError;
use crate::net::socket::AgentStream;
use crate::wire::{ChainedOut, InBuf, OutBuf};

/// Network input buffer: wraps a stream and an internally grown byte buffer.
/// `read_from` acquires exactly `n` additional bytes (appended or replacing),
/// setting the sticky error on timeout or short read and leaving previously
/// buffered bytes intact on failure.
pub struct NetReader<'a> {
    io: &'a AgentStream,
    buf: Vec<u8>,
    error: bool,
}

impl<'a> NetReader<'a> {
    pub fn new(io: &'a AgentStream) -> Self {
        Self {
            io,
            buf: Vec::new(),
            error: false,
        }
    }

    pub async fn read_from(
        &mut self,
        n: usize,
        deadline: Instant,
        interruptible: bool,
        append: bool,
    ) -> Result<(), NetError> {
        if self.error {
            return Err(NetError::UnexpectedEof);
        }
        let tail = if append { self.buf.len() } else { 0 };
        let mut chunk = vec![0u8; n];
        match self
            .io
            .read_exact_deadline(&mut chunk, deadline, interruptible)
            .await
        {
            Ok(()) => {
                self.buf.truncate(tail);
                self.buf.extend_from_slice(&chunk);
                Ok(())
            }
            Err(e) => {
                self.error = true;
                Err(e)
            }
        }
    }

    pub fn error(&self) -> bool {
        self.error
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Parse view over everything buffered so far.
    pub fn in_buf(&self, max_packet: usize) -> InBuf<'_> {
        InBuf::with_max_packet(&self.buf, max_packet)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

/// Network output drain: flushes an output buffer with a send deadline,
/// honoring would-block via readiness waits and recording a sticky error on
/// any other failure.
pub struct NetWriter<'a> {
    io: &'a AgentStream,
    sent: usize,
    error: bool,
}

impl<'a> NetWriter<'a> {
    pub fn new(io: &'a AgentStream) -> Self {
        Self {
            io,
            sent: 0,
            error: false,
        }
    }

    /// Seal and send the buffer's bytes, clearing it for reuse.
    pub async fn flush(&mut self, out: &mut OutBuf, deadline: Instant) -> Result<(), NetError> {
        if self.error {
            return Err(NetError::UnexpectedEof);
        }
        let bytes = out.take_bytes();
        if bytes.is_empty() {
            return Ok(());
        }
        match self.io.send_all_deadline(&bytes, deadline).await {
            Ok(n) => {
                self.sent += n;
                Ok(())
            }
            Err(e) => {
                warn!(peer = %self.io.peer_label(), error = %e, "failed to flush network buffer");
                self.error = true;
                Err(e)
            }
        }
    }

    /// Vectored flush over a chained buffer, chunk list first.
    pub async fn flush_chained(
        &mut self,
        out: &mut ChainedOut,
        deadline: Instant,
    ) -> Result<(), NetError> {
        if self.error {
            return Err(NetError::UnexpectedEof);
        }
        out.commit_all_lengths();
        let total = out.total_len();
        let mut off = 0;
        while off < total {
            let slices = out.as_io_slices(off);
            match self.io.try_send_vectored(&slices) {
                Ok(crate::net::socket::ChunkStatus::Data(n)) => {
                    off += n;
                    self.sent += n;
                    continue;
                }
                Ok(crate::net::socket::ChunkStatus::Closed) => {
                    self.error = true;
                    return Err(NetError::Reset);
                }
                Ok(crate::net::socket::ChunkStatus::Interrupted) => continue,
                Ok(crate::net::socket::ChunkStatus::WouldBlock) => {}
                Err(e) => {
                    self.error = true;
                    return Err(NetError::Io(e));
                }
            }
            match tokio::time::timeout_at(deadline, self.io.ready(tokio::io::Interest::WRITABLE))
                .await
            {
                Err(_) => {
                    self.error = true;
                    return Err(NetError::Timeout);
                }
                Ok(Err(e)) => {
                    self.error = true;
                    return Err(NetError::Io(e));
                }
                Ok(Ok(_)) => {}
            }
        }
        out.reset();
        Ok(())
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn error(&self) -> bool {
        self.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::socket::HostAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn pair() -> (AgentStream, tokio::net::TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = AgentStream::connect(
            &HostAddr::Inet(addr),
            Instant::now() + Duration::from_secs(1),
        )
        .await
        .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn reader_appends_and_replaces() {
        let (client, mut server) = pair().await;
        server.write_all(b"abcdef").await.unwrap();

        let mut rd = NetReader::new(&client);
        let deadline = Instant::now() + Duration::from_secs(1);
        rd.read_from(3, deadline, false, false).await.unwrap();
        assert_eq!(rd.as_slice(), b"abc");
        rd.read_from(3, deadline, false, true).await.unwrap();
        assert_eq!(rd.as_slice(), b"abcdef");

        server.write_all(b"xy").await.unwrap();
        rd.read_from(2, deadline, false, false).await.unwrap();
        assert_eq!(rd.as_slice(), b"xy");
    }

    #[tokio::test]
    async fn reader_sticky_error_on_timeout() {
        let (client, _server) = pair().await;
        let mut rd = NetReader::new(&client);
        let res = rd
            .read_from(4, Instant::now() + Duration::from_millis(30), false, false)
            .await;
        assert!(matches!(res, Err(NetError::Timeout)));
        assert!(rd.error());
        // stays failed
        let res = rd
            .read_from(1, Instant::now() + Duration::from_secs(1), false, false)
            .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn writer_flushes_sealed_lengths() {
        let (client, mut server) = pair().await;
        let mut out = OutBuf::new();
        out.begin_length();
        out.send_string("ping");
        // left uncommitted on purpose: flush seals it

        let mut wr = NetWriter::new(&client);
        wr.flush(&mut out, Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(wr.sent(), 12);

        let mut got = [0u8; 12];
        server.read_exact(&mut got).await.unwrap();
        let mut inb = InBuf::new(&got);
        assert_eq!(inb.get_u32(), 8);
        assert_eq!(inb.get_string().unwrap(), "ping");
    }

    #[tokio::test]
    async fn chained_vectored_flush() {
        let (client, mut server) = pair().await;
        let mut out = ChainedOut::new();
        out.send_u32(1);
        out.new_chunk();
        out.send_u32(2);

        let mut wr = NetWriter::new(&client);
        wr.flush_chained(&mut out, Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();

        let mut got = [0u8; 8];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(got, [0, 0, 0, 1, 0, 0, 0, 2]);
    }
}
