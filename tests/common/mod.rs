//! Shared helpers: a binary-protocol test client and mock remote agents.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use seekd::search::{SearchMatch, SearchReply, SearchRequest};
use seekd::wire::{InBuf, OutBuf, ReplyStatus};

/// Grab a free TCP port by binding and dropping a listener.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Binary-protocol client speaking the hello + envelope framing.
pub struct ApiClient {
    stream: TcpStream,
}

impl ApiClient {
    pub async fn connect(port: u16) -> ApiClient {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut hello = [0u8; 4];
        stream.read_exact(&mut hello).await.unwrap();
        assert_eq!(u32::from_be_bytes(hello), 1, "unexpected server hello");
        stream.write_all(&1u32.to_be_bytes()).await.unwrap();
        ApiClient { stream }
    }

    /// Raw stream access, for tests that frame bytes by hand.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Send one framed request and read back `(status, version, body)`.
    pub async fn request(&mut self, command: u16, version: u16, body: &[u8]) -> (u16, u16, Vec<u8>) {
        let mut out = OutBuf::new();
        out.send_u16(command);
        out.send_u16(version);
        out.send_u32(body.len() as u32);
        out.send_bytes(body);
        self.stream.write_all(out.as_slice()).await.unwrap();

        let mut header = [0u8; 8];
        self.stream.read_exact(&mut header).await.unwrap();
        let mut inb = InBuf::new(&header);
        let status = inb.get_u16();
        let ver = inb.get_u16();
        let len = inb.get_u32() as usize;
        let mut reply = vec![0u8; len];
        self.stream.read_exact(&mut reply).await.unwrap();
        (status, ver, reply)
    }

    /// Issue a search; returns the status plus the parsed reply or the
    /// error message.
    pub async fn search(
        &mut self,
        index: &str,
        query: &str,
    ) -> (u16, Result<SearchReply, String>) {
        let mut body = OutBuf::new();
        SearchRequest::new(index, query).encode(&mut body);
        let (status, _, reply) = self
            .request(0, seekd::wire::VER_SEARCH, body.as_slice())
            .await;
        let mut inb = InBuf::new(&reply);
        let parsed = match status {
            s if s == ReplyStatus::Ok as u16 => Ok(SearchReply::decode(&mut inb).unwrap()),
            s if s == ReplyStatus::Warning as u16 => {
                let warning = inb.get_string().unwrap();
                let mut r = SearchReply::decode(&mut inb).unwrap();
                r.warning = Some(warning);
                Ok(r)
            }
            _ => Err(inb.get_string().unwrap_or_default()),
        };
        (status, parsed)
    }
}

/// How a mock remote agent treats incoming queries.
#[derive(Clone)]
pub enum MockBehavior {
    /// Answer every search with these matches.
    Reply(Vec<SearchMatch>),
    /// Accept, read, never answer.
    Silent,
}

/// An in-process remote agent speaking the server side of the protocol.
pub struct MockAgent {
    pub addr: SocketAddr,
    pub accepted: Arc<AtomicUsize>,
    pub requests: Arc<AtomicUsize>,
}

impl MockAgent {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn agent_spec(&self, index: &str) -> String {
        format!("127.0.0.1:{}:{}", self.addr.port(), index)
    }
}

pub async fn spawn_mock_agent(behavior: MockBehavior) -> MockAgent {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(AtomicUsize::new(0));

    let accepted2 = accepted.clone();
    let requests2 = requests.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            accepted2.fetch_add(1, Ordering::SeqCst);
            let behavior = behavior.clone();
            let requests = requests2.clone();
            tokio::spawn(async move {
                let _ = serve_agent_conn(stream, behavior, requests).await;
            });
        }
    });

    MockAgent {
        addr,
        accepted,
        requests,
    }
}

async fn serve_agent_conn(
    mut stream: TcpStream,
    behavior: MockBehavior,
    requests: Arc<AtomicUsize>,
) -> std::io::Result<()> {
    stream.write_all(&1u32.to_be_bytes()).await?;
    let mut client_hello = [0u8; 4];
    stream.read_exact(&mut client_hello).await?;

    loop {
        let mut header = [0u8; 8];
        stream.read_exact(&mut header).await?;
        let mut inb = InBuf::new(&header);
        let _command = inb.get_u16();
        let _version = inb.get_u16();
        let len = inb.get_u32() as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;
        requests.fetch_add(1, Ordering::SeqCst);

        match &behavior {
            MockBehavior::Silent => {
                // hold the connection open forever
                std::future::pending::<()>().await;
            }
            MockBehavior::Reply(matches) => {
                let reply = SearchReply {
                    matches: matches.clone(),
                    total_found: matches.len() as u64,
                    time_ms: 1,
                    warning: None,
                };
                let mut out = OutBuf::new();
                seekd::wire::reply_envelope(
                    &mut out,
                    ReplyStatus::Ok,
                    seekd::wire::VER_SEARCH,
                    |out| reply.encode(out),
                );
                stream.write_all(&out.into_bytes()).await?;
            }
        }
    }
}
