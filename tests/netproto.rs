//! End-to-end tests for the binary, MySQL-wire and HTTP frontends against a
//! locally served index.

mod common;

use common::{free_port, ApiClient};
use seekd::config::Config;
use seekd::wire::{Command, ReplyStatus, VER_PING, VER_SEARCH};
use seekd::Daemon;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn local_config(api_port: u16, extra: &str) -> Config {
    let toml_src = format!(
        r#"
[daemon]
listen = ["127.0.0.1:{api_port}"]
read_timeout_ms = 2000
{extra}

[index.docs]
type = "rt"
path = "./docs"

[index.docs.seed_docs]
1 = "the quick brown fox jumps over the lazy dog"
2 = "rust network daemons poll sockets"
3 = "the lazy dog sleeps"
"#
    );
    toml::from_str(&toml_src).unwrap()
}

#[tokio::test]
async fn local_search_happy_path() {
    let port = free_port().await;
    let mut daemon = Daemon::start(local_config(port, "")).await.unwrap();

    let mut client = ApiClient::connect(port).await;
    let (status, reply) = client.search("docs", "lazy dog").await;
    assert_eq!(status, ReplyStatus::Ok as u16);
    let reply = reply.unwrap();
    assert_eq!(reply.total_found, 2);
    let ids: Vec<u64> = reply.matches.iter().map(|m| m.doc_id).collect();
    assert!(ids.contains(&1) && ids.contains(&3));

    // per-index stats saw the query
    let ctx = daemon.context();
    assert_eq!(ctx.local.get("docs").unwrap().stats().total_queries(), 1);

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_index_yields_error_status() {
    let port = free_port().await;
    let mut daemon = Daemon::start(local_config(port, "")).await.unwrap();

    let mut client = ApiClient::connect(port).await;
    let (status, reply) = client.search("nope", "x").await;
    assert_eq!(status, ReplyStatus::Error as u16);
    assert!(reply.unwrap_err().contains("unknown index"));

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn ping_echoes_cookie() {
    let port = free_port().await;
    let mut daemon = Daemon::start(local_config(port, "")).await.unwrap();

    let mut client = ApiClient::connect(port).await;
    let cookie = 0xfeed_beefu32.to_be_bytes();
    let (status, _, body) = client.request(Command::Ping as u16, VER_PING, &cookie).await;
    assert_eq!(status, ReplyStatus::Ok as u16);
    assert_eq!(body, cookie);

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn bad_command_version_is_refused() {
    let port = free_port().await;
    let mut daemon = Daemon::start(local_config(port, "")).await.unwrap();

    let mut client = ApiClient::connect(port).await;
    let (status, _, body) = client.request(Command::Ping as u16, 0x0200, &[0; 4]).await;
    assert_eq!(status, ReplyStatus::Error as u16);
    let mut inb = seekd::wire::InBuf::new(&body);
    assert!(inb.get_string().unwrap().contains("version"));

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn oversized_packet_is_refused() {
    let port = free_port().await;
    let mut daemon =
        Daemon::start(local_config(port, "max_packet_size = 1024")).await.unwrap();

    let mut client = ApiClient::connect(port).await;
    // header claims a body far beyond max_packet_size; no body follows
    let mut out = seekd::wire::OutBuf::new();
    out.send_u16(Command::Search as u16);
    out.send_u16(VER_SEARCH);
    out.send_u32(10 * 1024 * 1024);
    let stream = client.stream_mut();
    stream.write_all(out.as_slice()).await.unwrap();
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await.unwrap();
    let mut inb = seekd::wire::InBuf::new(&header);
    let status = inb.get_u16();
    let _ver = inb.get_u16();
    let len = inb.get_u32() as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();

    assert_eq!(status, ReplyStatus::Error as u16);
    let mut inb = seekd::wire::InBuf::new(&body);
    assert!(inb.get_string().unwrap().contains("max_packet_size"));

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn persist_keeps_connection_across_commands() {
    let port = free_port().await;
    let mut daemon = Daemon::start(local_config(port, "")).await.unwrap();

    let mut client = ApiClient::connect(port).await;
    let (status, _, _) = client
        .request(Command::Persist as u16, 0x100, &1u32.to_be_bytes())
        .await;
    assert_eq!(status, ReplyStatus::Ok as u16);

    // the same connection still serves queries
    let (status, reply) = client.search("docs", "rust").await;
    assert_eq!(status, ReplyStatus::Ok as u16);
    assert_eq!(reply.unwrap().total_found, 1);

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn insert_then_search_on_mutable_index() {
    let port = free_port().await;
    let mut daemon = Daemon::start(local_config(port, "")).await.unwrap();

    let mut client = ApiClient::connect(port).await;
    let mut body = seekd::wire::OutBuf::new();
    body.send_string("docs");
    body.send_u64(99);
    body.send_string("freshly inserted document");
    let (status, _, _) = client
        .request(Command::Insert as u16, 0x100, body.as_slice())
        .await;
    assert_eq!(status, ReplyStatus::Ok as u16);

    let (status, reply) = client.search("docs", "freshly inserted").await;
    assert_eq!(status, ReplyStatus::Ok as u16);
    assert_eq!(reply.unwrap().matches[0].doc_id, 99);

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn status_command_reports_counters() {
    let port = free_port().await;
    let mut daemon = Daemon::start(local_config(port, "")).await.unwrap();

    let mut client = ApiClient::connect(port).await;
    let _ = client.search("docs", "dog").await;
    let (status, _, body) = client
        .request(Command::Status as u16, seekd::wire::VER_STATUS, &[])
        .await;
    assert_eq!(status, ReplyStatus::Ok as u16);

    let mut inb = seekd::wire::InBuf::new(&body);
    let rows = inb.get_u32();
    assert!(rows > 0);
    let mut pairs = std::collections::HashMap::new();
    for _ in 0..rows {
        let k = inb.get_string().unwrap();
        let v = inb.get_string().unwrap();
        pairs.insert(k, v);
    }
    assert_eq!(pairs.get("command_search").map(String::as_str), Some("1"));
    assert_eq!(pairs.get("queries").map(String::as_str), Some("1"));

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn maxed_out_connections_get_retry_status() {
    let port = free_port().await;
    let mut daemon =
        Daemon::start(local_config(port, "max_connections = 1")).await.unwrap();

    // first client occupies the only slot
    let _held = ApiClient::connect(port).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // second client completes the hello and then sees a retry reply
    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    let mut hello = [0u8; 4];
    stream.read_exact(&mut hello).await.unwrap();
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await.unwrap();
    let mut inb = seekd::wire::InBuf::new(&header);
    assert_eq!(inb.get_u16(), ReplyStatus::Retry as u16);

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn unix_socket_endpoint_serves_api() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("seekd.sock");
    let toml_src = format!(
        r#"
[daemon]
listen = ["{}"]

[index.docs]
type = "rt"

[index.docs.seed_docs]
5 = "local socket search"
"#,
        sock.display()
    );
    let config: Config = toml::from_str(&toml_src).unwrap();
    let mut daemon = Daemon::start(config).await.unwrap();

    let mut stream = tokio::net::UnixStream::connect(&sock).await.unwrap();
    let mut hello = [0u8; 4];
    stream.read_exact(&mut hello).await.unwrap();
    assert_eq!(u32::from_be_bytes(hello), 1);
    stream.write_all(&1u32.to_be_bytes()).await.unwrap();

    let mut body = seekd::wire::OutBuf::new();
    seekd::search::SearchRequest::new("docs", "socket").encode(&mut body);
    let mut out = seekd::wire::OutBuf::new();
    out.send_u16(Command::Search as u16);
    out.send_u16(VER_SEARCH);
    out.send_u32(body.len() as u32);
    out.send_bytes(body.as_slice());
    stream.write_all(out.as_slice()).await.unwrap();

    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await.unwrap();
    let mut inb = seekd::wire::InBuf::new(&header);
    assert_eq!(inb.get_u16(), ReplyStatus::Ok as u16);
    let _ver = inb.get_u16();
    let len = inb.get_u32() as usize;
    let mut reply = vec![0u8; len];
    stream.read_exact(&mut reply).await.unwrap();
    let parsed = seekd::search::SearchReply::decode(&mut seekd::wire::InBuf::new(&reply)).unwrap();
    assert_eq!(parsed.matches[0].doc_id, 5);

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn mysql_frontend_answers_ping_and_show_status() {
    let api_port = free_port().await;
    let sql_port = free_port().await;
    let toml_src = format!(
        r#"
[daemon]
listen = ["127.0.0.1:{api_port}", "127.0.0.1:{sql_port}:mysql41"]
"#
    );
    let config: Config = toml::from_str(&toml_src).unwrap();
    let mut daemon = Daemon::start(config).await.unwrap();

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", sql_port))
        .await
        .unwrap();

    // greeting
    let payload = read_mysql_packet(&mut stream).await;
    assert_eq!(payload[0], 0x0a);
    assert!(payload.windows(9).any(|w| w == b"seekd-sql"));

    // auth (ignored content), then OK
    write_mysql_packet(&mut stream, 1, &[0u8; 32]).await;
    let ok = read_mysql_packet(&mut stream).await;
    assert_eq!(ok[0], 0x00);

    // COM_PING
    write_mysql_packet(&mut stream, 0, &[0x0e]).await;
    let pong = read_mysql_packet(&mut stream).await;
    assert_eq!(pong[0], 0x00);

    // SHOW STATUS returns a two-column result set
    let mut q = vec![0x03];
    q.extend_from_slice(b"SHOW STATUS");
    write_mysql_packet(&mut stream, 0, &q).await;
    let column_count = read_mysql_packet(&mut stream).await;
    assert_eq!(column_count, vec![0x02]);

    daemon.shutdown().await.unwrap();
}

async fn read_mysql_packet(stream: &mut tokio::net::TcpStream) -> Vec<u8> {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.unwrap();
    let len = head[0] as usize | (head[1] as usize) << 8 | (head[2] as usize) << 16;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    payload
}

async fn write_mysql_packet(stream: &mut tokio::net::TcpStream, seq: u8, payload: &[u8]) {
    let len = payload.len();
    let head = [
        (len & 0xff) as u8,
        ((len >> 8) & 0xff) as u8,
        ((len >> 16) & 0xff) as u8,
        seq,
    ];
    stream.write_all(&head).await.unwrap();
    stream.write_all(payload).await.unwrap();
}

#[tokio::test]
async fn http_frontend_serves_search_and_metrics() {
    let api_port = free_port().await;
    let http_port = free_port().await;
    let toml_src = format!(
        r#"
[daemon]
listen = ["127.0.0.1:{api_port}", "127.0.0.1:{http_port}:http"]
cors_enabled = true

[index.docs]
type = "rt"

[index.docs.seed_docs]
7 = "axum serves hypertext"
"#
    );
    let config: Config = toml::from_str(&toml_src).unwrap();
    let mut daemon = Daemon::start(config).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let body = r#"{"index":"docs","query":"hypertext"}"#;
    let request = format!(
        "POST /api/v1/search HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let response = http_roundtrip(http_port, &request).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"doc_id\":7"));

    let response = http_roundtrip(
        http_port,
        "GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.contains("seekd_queries_total"));

    // cors preflight answered because cors_enabled is set
    let response = http_roundtrip(
        http_port,
        "OPTIONS /api/v1/search HTTP/1.1\r\nHost: localhost\r\nOrigin: http://example.com\r\nAccess-Control-Request-Method: POST\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response
        .to_ascii_lowercase()
        .contains("access-control-allow-origin: *"));

    daemon.shutdown().await.unwrap();
}

async fn http_roundtrip(port: u16, request: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}
