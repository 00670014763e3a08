//! Daemon lifecycle: wiring the configuration into registries, the net
//! loop, listeners and the pinger; orderly shutdown on signal or request.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::signal;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agent::dashboard::Dashboards;
use crate::agent::mirror::MirrorGroup;
use crate::agent::netloop::spawn_netloop;
use crate::agent::ping::Pinger;
use crate::config::{
    parse_agent_line, parse_listener, parse_strategy, AgentOptions, Config, ListenerDesc,
};
use crate::index::served::{DistributedIndex, IndexType, ServedDesc, ServedIndex};
use crate::index::Registry;
use crate::search::{MemoryIndex, SearchIndex};
use crate::server::listener::spawn_listeners;
use crate::server::{DaemonStats, ServerContext};

/// Callbacks fired exactly once at shutdown, registration order.
#[derive(Default)]
pub struct ShutdownHooks {
    hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl ShutdownHooks {
    pub fn add(&self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.lock().push(Box::new(hook));
    }

    pub fn fire(&self) {
        let hooks = std::mem::take(&mut *self.hooks.lock());
        for hook in hooks {
            hook();
        }
    }
}

pub struct Daemon {
    ctx: Arc<ServerContext>,
    listeners: Vec<JoinHandle<()>>,
    pinger: Option<JoinHandle<()>>,
    hooks: Arc<ShutdownHooks>,
}

impl Daemon {
    /// Bring the daemon up: indexes, distributed descriptors, net loop,
    /// listeners, pinger.
    pub async fn start(config: Config) -> Result<Daemon> {
        info!("starting search daemon");

        let descs: Vec<ListenerDesc> = config
            .daemon
            .listen
            .iter()
            .map(|spec| parse_listener(spec))
            .collect::<Result<_>>()?;

        let dashboards = Arc::new(Dashboards::new(
            config.daemon.ha_period_karma_secs,
            config.daemon.persistent_pool_size,
        ));
        let netloop = spawn_netloop();
        let (shutdown_tx, _) = broadcast::channel(16);

        let local: Registry<ServedIndex> = Registry::new();
        for (name, def) in &config.index {
            let index_type = IndexType::parse(&def.index_type)
                .with_context(|| format!("index '{name}': unknown type"))?;
            if index_type == IndexType::Distributed {
                warn!(index = %name, "distributed indexes belong in [distributed.*], skipping");
                continue;
            }
            let mut memory = MemoryIndex::new();
            for (id, text) in &def.seed_docs {
                match id.parse::<u64>() {
                    Ok(doc_id) => {
                        let _ = memory.insert(doc_id, text);
                    }
                    Err(_) => warn!(index = %name, id = %id, "seed document id is not numeric"),
                }
            }
            let mut desc = ServedDesc::new(
                Box::new(memory),
                index_type,
                PathBuf::from(&def.path),
            );
            desc.preopen = def.preopen;
            desc.killlist_targets = def.killlist_targets.clone();
            desc.rotation_priority = def.rotation_priority;
            if !local.add_uniq(name, Arc::new(ServedIndex::new(desc))) {
                warn!(index = %name, "duplicate index name, first definition wins");
            } else {
                info!(index = %name, kind = index_type.name(), "serving index");
            }
        }

        let dist: Registry<DistributedIndex> = Registry::new();
        for (name, def) in &config.distributed {
            let strategy = parse_strategy(&def.ha_strategy)?;
            let retry_count = def
                .agent_retry_count
                .unwrap_or(config.daemon.agent_retry_count);

            let mut groups = Vec::new();
            let line_sets: [(&Vec<String>, bool, bool); 3] = [
                (&def.agents, false, false),
                (&def.agents_blackhole, true, false),
                (&def.agents_persistent, false, true),
            ];
            for (lines, blackhole, persistent) in line_sets {
                for line in lines {
                    let opts = AgentOptions {
                        blackhole,
                        persistent,
                        strategy,
                        retry_count,
                    };
                    let mut mirrors = parse_agent_line(line, &opts)
                        .with_context(|| format!("distributed index '{name}'"))?;
                    for mirror in mirrors.iter_mut() {
                        mirror.host.needs_resolve = config.daemon.hostname_lookup;
                        if let Ok(ip) = mirror.host.addr.parse() {
                            mirror.host.resolved = Some(ip);
                        }
                    }
                    groups.push(MirrorGroup::new(mirrors, strategy, retry_count, &dashboards));
                }
            }

            let descriptor = DistributedIndex {
                groups,
                locals: def.locals.clone(),
                connect_timeout: Duration::from_millis(
                    def.agent_connect_timeout_ms
                        .unwrap_or(config.daemon.agent_connect_timeout_ms),
                ),
                query_timeout: Duration::from_millis(
                    def.agent_query_timeout_ms
                        .unwrap_or(config.daemon.agent_query_timeout_ms),
                ),
                retry_count,
            };
            if !dist.add_uniq(name, Arc::new(descriptor)) {
                warn!(index = %name, "duplicate distributed index name");
            } else {
                info!(index = %name, "serving distributed index");
            }
        }

        let conn_limit = (config.daemon.max_connections > 0)
            .then(|| Arc::new(Semaphore::new(config.daemon.max_connections)));

        let ctx = Arc::new(ServerContext {
            config: config.daemon.clone(),
            local,
            dist,
            dashboards: dashboards.clone(),
            stats: DaemonStats::new(),
            netloop,
            shutdown_tx: shutdown_tx.clone(),
            conn_limit,
        });

        let listeners = spawn_listeners(&descs, ctx.clone()).await?;

        let pinger = Pinger {
            dashboards,
            handle: ctx.netloop.clone(),
            interval: Duration::from_millis(config.daemon.ha_ping_interval_ms),
            connect_timeout: Duration::from_millis(config.daemon.agent_connect_timeout_ms),
            query_timeout: Duration::from_millis(config.daemon.agent_query_timeout_ms),
            max_packet: config.daemon.max_packet_size,
        }
        .spawn(shutdown_tx.subscribe());

        info!(
            endpoints = descs.len(),
            indexes = ctx.local.len(),
            distributed = ctx.dist.len(),
            "daemon initialized"
        );

        Ok(Daemon {
            ctx,
            listeners,
            pinger: Some(pinger),
            hooks: Arc::new(ShutdownHooks::default()),
        })
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.ctx.clone()
    }

    pub fn shutdown_hooks(&self) -> Arc<ShutdownHooks> {
        self.hooks.clone()
    }

    /// Block until a shutdown signal, then tear everything down.
    pub async fn run(mut self) -> Result<()> {
        info!("daemon running");
        let mut shutdown_rx = self.ctx.shutdown_tx.subscribe();

        tokio::select! {
            _ = signal::ctrl_c() => info!("received ctrl-c, shutting down"),
            _ = wait_for_sigterm() => info!("received SIGTERM, shutting down"),
            _ = shutdown_rx.recv() => info!("shutdown requested"),
        }
        self.shutdown().await
    }

    /// Orderly teardown: stop accepting, cancel agent work, close pools,
    /// release index handles, fire the hooks.
    pub async fn shutdown(&mut self) -> Result<()> {
        let _ = self.ctx.shutdown_tx.send(());
        self.ctx.netloop.shutdown();
        self.ctx.dashboards.shutdown_pools();

        for handle in self.listeners.drain(..) {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("listener did not stop within 5s, aborting");
                abort.abort();
            }
        }
        if let Some(pinger) = self.pinger.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), pinger).await;
        }

        self.ctx.local.clear();
        self.ctx.dist.clear();
        self.hooks.fire();
        info!("daemon shutdown complete");
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("failed to register SIGTERM handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
