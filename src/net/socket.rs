//! Uniform non-blocking socket operations over TCP and Unix streams:
//! best-effort chunk transfer, deadline-bounded exact reads and sends, and
//! address resolution.

use std::io::{self, IoSlice};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;

use tokio::io::{Interest, Ready};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::{timeout_at, Instant};
use tracing::warn;

use crate::error::NetError;

/// A resolved connect target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl std::fmt::Display for HostAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostAddr::Inet(a) => write!(f, "{}", a),
            HostAddr::Unix(p) => write!(f, "unix://{}", p.display()),
        }
    }
}

/// Outcome of a single best-effort chunk transfer.
#[derive(Debug)]
pub enum ChunkStatus {
    /// Bytes moved; the caller advances its cursor.
    Data(usize),
    /// Peer closed the stream.
    Closed,
    /// Not ready; wait for readiness and try again.
    WouldBlock,
    /// Interrupted by a signal before any data moved.
    Interrupted,
}

fn classify(e: io::Error) -> Result<ChunkStatus, io::Error> {
    match e.kind() {
        io::ErrorKind::WouldBlock => Ok(ChunkStatus::WouldBlock),
        io::ErrorKind::Interrupted => Ok(ChunkStatus::Interrupted),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => Ok(ChunkStatus::Closed),
        _ => Err(e),
    }
}

/// One stream type for both socket families, exposing the readiness-driven
/// non-blocking surface the agent machinery and the poller work against.
#[derive(Debug)]
pub enum AgentStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AgentStream {
    /// Connect with an absolute deadline.
    pub async fn connect(addr: &HostAddr, deadline: Instant) -> Result<AgentStream, NetError> {
        let connect = async {
            match addr {
                HostAddr::Inet(sa) => TcpStream::connect(sa).await.map(AgentStream::Tcp),
                HostAddr::Unix(path) => UnixStream::connect(path).await.map(AgentStream::Unix),
            }
        };
        match timeout_at(deadline, connect).await {
            Err(_) => Err(NetError::ConnectTimeout),
            Ok(Err(e)) => Err(NetError::Io(e)),
            Ok(Ok(stream)) => {
                if let AgentStream::Tcp(ref t) = stream {
                    let _ = t.set_nodelay(true);
                }
                Ok(stream)
            }
        }
    }

    /// Wait for readiness without consuming it.
    pub async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        match self {
            AgentStream::Tcp(s) => s.ready(interest).await,
            AgentStream::Unix(s) => s.ready(interest).await,
        }
    }

    /// Best-effort receive, advancing nothing on `WouldBlock`.
    pub fn try_recv(&self, buf: &mut [u8]) -> Result<ChunkStatus, io::Error> {
        let res = match self {
            AgentStream::Tcp(s) => s.try_read(buf),
            AgentStream::Unix(s) => s.try_read(buf),
        };
        match res {
            Ok(0) => Ok(ChunkStatus::Closed),
            Ok(n) => Ok(ChunkStatus::Data(n)),
            Err(e) => classify(e),
        }
    }

    /// Best-effort send.
    pub fn try_send(&self, buf: &[u8]) -> Result<ChunkStatus, io::Error> {
        let res = match self {
            AgentStream::Tcp(s) => s.try_write(buf),
            AgentStream::Unix(s) => s.try_write(buf),
        };
        match res {
            Ok(n) => Ok(ChunkStatus::Data(n)),
            Err(e) => classify(e),
        }
    }

    /// Best-effort vectored send over a scatter-gather list.
    pub fn try_send_vectored(&self, bufs: &[IoSlice<'_>]) -> Result<ChunkStatus, io::Error> {
        let res = match self {
            AgentStream::Tcp(s) => s.try_write_vectored(bufs),
            AgentStream::Unix(s) => s.try_write_vectored(bufs),
        };
        match res {
            Ok(n) => Ok(ChunkStatus::Data(n)),
            Err(e) => classify(e),
        }
    }

    /// Read exactly `buf.len()` bytes or fail with timeout, reset or
    /// interrupted. After any partial progress the interruptible flag is
    /// cleared so a signal cannot cost the bytes already read.
    pub async fn read_exact_deadline(
        &self,
        buf: &mut [u8],
        deadline: Instant,
        mut interruptible: bool,
    ) -> Result<(), NetError> {
        let mut off = 0;
        while off < buf.len() {
            if Instant::now() >= deadline {
                return Err(NetError::Timeout);
            }
            match timeout_at(deadline, self.ready(Interest::READABLE)).await {
                Err(_) => return Err(NetError::Timeout),
                Ok(Err(e)) => return Err(NetError::Io(e)),
                Ok(Ok(_ready)) => {}
            }
            match self.try_recv(&mut buf[off..]) {
                Ok(ChunkStatus::Data(n)) => {
                    off += n;
                    interruptible = false;
                }
                Ok(ChunkStatus::Closed) => return Err(NetError::Reset),
                Ok(ChunkStatus::WouldBlock) => continue,
                Ok(ChunkStatus::Interrupted) => {
                    if interruptible {
                        return Err(NetError::Interrupted);
                    }
                }
                Err(e) => return Err(NetError::Io(e)),
            }
        }
        Ok(())
    }

    /// Send the whole buffer before the deadline, rescheduling on
    /// `WouldBlock` via readiness waits and retrying on `Interrupted`.
    pub async fn send_all_deadline(
        &self,
        buf: &[u8],
        deadline: Instant,
    ) -> Result<usize, NetError> {
        let mut off = 0;
        while off < buf.len() {
            match self.try_send(&buf[off..]) {
                Ok(ChunkStatus::Data(n)) => {
                    off += n;
                    continue;
                }
                Ok(ChunkStatus::Closed) => return Err(NetError::Reset),
                Ok(ChunkStatus::Interrupted) => continue,
                Ok(ChunkStatus::WouldBlock) => {}
                Err(e) => return Err(NetError::Io(e)),
            }
            match timeout_at(deadline, self.ready(Interest::WRITABLE)).await {
                Err(_) => return Err(NetError::Timeout),
                Ok(Err(e)) => return Err(NetError::Io(e)),
                Ok(Ok(_)) => {}
            }
        }
        Ok(off)
    }

    pub fn peer_label(&self) -> String {
        match self {
            AgentStream::Tcp(s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:?".into()),
            AgentStream::Unix(_) => "unix".into(),
        }
    }
}

/// Resolve `host` to a single IPv4 address. With `strict_ip` the host must
/// already be a literal address. When a name maps to multiple A records the
/// first is used and a warning is logged.
pub async fn resolve(host: &str, strict_ip: bool) -> Result<Ipv4Addr, NetError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    if strict_ip {
        return Err(NetError::Unresolvable(host.to_string()));
    }

    let addrs = tokio::net::lookup_host((host, 0u16))
        .await
        .map_err(|_| NetError::Unresolvable(host.to_string()))?;
    let v4: Vec<Ipv4Addr> = addrs
        .filter_map(|a| match a {
            SocketAddr::V4(sa) => Some(*sa.ip()),
            SocketAddr::V6(_) => None,
        })
        .collect();
    match v4.as_slice() {
        [] => Err(NetError::Unresolvable(host.to_string())),
        [one] => Ok(*one),
        [first, rest @ ..] => {
            warn!(
                host,
                others = ?rest,
                "multiple addresses found, using the first one ({})", first
            );
            Ok(*first)
        }
    }
}

/// Resolve a host descriptor's address and port into a connect target.
pub async fn resolve_host_addr(
    host: &str,
    port: u16,
    unix_path: Option<&PathBuf>,
) -> Result<HostAddr, NetError> {
    if let Some(path) = unix_path {
        return Ok(HostAddr::Unix(path.clone()));
    }
    let ip = resolve(host, false).await?;
    Ok(HostAddr::Inet(SocketAddr::V4(SocketAddrV4::new(ip, port))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn resolve_literal_ip() {
        let ip = resolve("127.0.0.1", true).await.unwrap();
        assert_eq!(ip, Ipv4Addr::LOCALHOST);
    }

    #[tokio::test]
    async fn resolve_strict_rejects_names() {
        assert!(matches!(
            resolve("localhost", true).await,
            Err(NetError::Unresolvable(_))
        ));
    }

    #[tokio::test]
    async fn read_exact_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = AgentStream::connect(
            &HostAddr::Inet(addr),
            Instant::now() + Duration::from_secs(1),
        )
        .await
        .unwrap();
        let (_server, _) = listener.accept().await.unwrap();

        let mut buf = [0u8; 16];
        let res = client
            .read_exact_deadline(&mut buf, Instant::now() + Duration::from_millis(50), false)
            .await;
        assert!(matches!(res, Err(NetError::Timeout)));
    }

    #[tokio::test]
    async fn read_exact_detects_reset() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = AgentStream::connect(
            &HostAddr::Inet(addr),
            Instant::now() + Duration::from_secs(1),
        )
        .await
        .unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        server.write_all(&[1, 2]).await.unwrap();
        drop(server);

        let mut buf = [0u8; 8];
        let res = client
            .read_exact_deadline(&mut buf, Instant::now() + Duration::from_secs(1), false)
            .await;
        assert!(matches!(res, Err(NetError::Reset)));
        // the partial bytes did land before the close was seen
        assert_eq!(&buf[..2], &[1, 2]);
    }

    #[tokio::test]
    async fn read_exact_happy_path() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = AgentStream::connect(
            &HostAddr::Inet(addr),
            Instant::now() + Duration::from_secs(1),
        )
        .await
        .unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        tokio::spawn(async move {
            server.write_all(b"hello world!").await.unwrap();
        });

        let mut buf = [0u8; 12];
        client
            .read_exact_deadline(&mut buf, Instant::now() + Duration::from_secs(1), true)
            .await
            .unwrap();
        assert_eq!(&buf, b"hello world!");
    }
}
