//! Listener multiplexor: binds every configured endpoint and runs one
//! accept loop per socket, dispatching accepted connections to the
//! endpoint's protocol handler.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ListenerDesc, Proto};
use crate::net::socket::AgentStream;
use crate::server::api::{refuse_maxed_out, ApiSession};
use crate::server::http::HttpServer;
use crate::server::mysql::MysqlSession;
use crate::server::ServerContext;

enum BoundSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

async fn bind_tcp(addr: SocketAddr) -> Result<BoundSocket> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    Ok(BoundSocket::Tcp(listener))
}

fn bind_unix(path: &std::path::Path) -> Result<BoundSocket> {
    if path.exists() {
        std::fs::remove_file(path).context("failed to remove stale socket file")?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind unix socket {}", path.display()))?;
    Ok(BoundSocket::Unix(listener))
}

/// Bind every endpoint and spawn its accept loop. HTTP endpoints get the
/// axum frontend; replication endpoints are bound but refuse sessions.
pub async fn spawn_listeners(
    descs: &[ListenerDesc],
    ctx: Arc<ServerContext>,
) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::new();
    for desc in descs {
        if desc.proto == Proto::Http {
            if desc.unix_path.is_some() {
                warn!("http endpoints are tcp-only, skipping unix listener");
                continue;
            }
            let addr = SocketAddr::from((desc.ip, desc.port));
            let server = HttpServer::new(addr, ctx.clone());
            let shutdown = ctx.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                if let Err(e) = server.run(shutdown).await {
                    error!("http frontend failed: {e:#}");
                }
            }));
            continue;
        }

        let sockets = bind_endpoint(desc).await?;
        for (socket, label) in sockets {
            info!(endpoint = %label, proto = desc.proto.name(), vip = desc.vip, "listening");
            let ctx = ctx.clone();
            let proto = desc.proto;
            let vip = desc.vip;
            let shutdown = ctx.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                accept_loop(socket, proto, vip, ctx, shutdown).await;
            }));
        }
    }
    Ok(handles)
}

async fn bind_endpoint(desc: &ListenerDesc) -> Result<Vec<(BoundSocket, String)>> {
    let mut out = Vec::new();
    if let Some(path) = &desc.unix_path {
        out.push((bind_unix(path)?, path.display().to_string()));
        return Ok(out);
    }
    let count = desc.ports_count.max(1);
    for port in desc.port..desc.port + count {
        let addr = SocketAddr::from((desc.ip, port));
        out.push((bind_tcp(addr).await?, addr.to_string()));
    }
    Ok(out)
}

async fn accept_loop(
    socket: BoundSocket,
    proto: Proto,
    vip: bool,
    ctx: Arc<ServerContext>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let stream = tokio::select! {
            accepted = accept_one(&socket) => match accepted {
                Ok(stream) => stream,
                Err(e) => {
                    error!("accept error: {e}");
                    continue;
                }
            },
            _ = shutdown.recv() => {
                debug!("accept loop shutting down");
                break;
            }
        };

        ctx.stats.connections.inc();

        // the connection cap applies to everything except vip endpoints
        let permit = match (&ctx.conn_limit, vip) {
            (Some(limit), false) => match limit.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    ctx.stats.maxed_out.inc();
                    warn!("connection limit reached, refusing client");
                    if proto == Proto::Sphinx {
                        let ctx = ctx.clone();
                        tokio::spawn(async move { refuse_maxed_out(stream, &ctx).await });
                    }
                    continue;
                }
            },
            _ => None,
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            ctx.stats.active_connections.inc();
            let result = match proto {
                Proto::Sphinx => ApiSession::new(stream, ctx.clone(), vip).run().await,
                Proto::Mysql41 => MysqlSession::new(stream, ctx.clone()).run().await,
                Proto::Replication => {
                    warn!("replication endpoint refused a session (not provisioned)");
                    Ok(())
                }
                Proto::Http => unreachable!("http endpoints use the axum frontend"),
            };
            ctx.stats.active_connections.dec();
            if let Err(e) = result {
                warn!("connection error: {e}");
            }
        });
    }
}

async fn accept_one(socket: &BoundSocket) -> std::io::Result<AgentStream> {
    match socket {
        BoundSocket::Tcp(listener) => {
            let (stream, _) = listener.accept().await?;
            let _ = stream.set_nodelay(true);
            Ok(AgentStream::Tcp(stream))
        }
        BoundSocket::Unix(listener) => {
            let (stream, _) = listener.accept().await?;
            Ok(AgentStream::Unix(stream))
        }
    }
}
