//! Remote request builders, reply parsers and distributed-job scheduling.

use std::sync::Arc;
use std::time::Duration;

use crate::agent::conn::AgentConn;
use crate::agent::desc::AgentDesc;
use crate::agent::netloop::NetLoopHandle;
use crate::agent::reporter::{RemoteAgentsObserver, Reporter};
use crate::error::NetError;
use crate::index::served::DistributedIndex;
use crate::search::{SearchReply, SearchRequest};
use crate::wire::{request_envelope, Command, InBuf, OutBuf, VER_PING, VER_SEARCH};

/// Parsed payload of a successful remote call.
#[derive(Debug, Default)]
pub enum AgentResult {
    #[default]
    None,
    Search(SearchReply),
    Pong(u32),
}

/// Builds the request bytes for one agent. The builder sees the agent so it
/// can target that mirror's remote index list.
pub trait RequestBuilder: Send + Sync {
    fn build_request(&self, agent: &AgentDesc, out: &mut OutBuf);
}

/// Parses a successful reply body.
pub trait ReplyParser: Send + Sync {
    fn parse_reply(&self, inb: &mut InBuf<'_>) -> Result<AgentResult, NetError>;
}

pub struct SearchRequestBuilder {
    pub request: SearchRequest,
}

impl RequestBuilder for SearchRequestBuilder {
    fn build_request(&self, agent: &AgentDesc, out: &mut OutBuf) {
        request_envelope(out, Command::Search, VER_SEARCH, |out| {
            let mut remote = self.request.clone();
            if !agent.indexes.is_empty() {
                remote.index = agent.index_list();
            }
            remote.encode(out);
        });
    }
}

pub struct SearchReplyParser;

impl ReplyParser for SearchReplyParser {
    fn parse_reply(&self, inb: &mut InBuf<'_>) -> Result<AgentResult, NetError> {
        Ok(AgentResult::Search(SearchReply::decode(inb)?))
    }
}

pub struct PingBuilder {
    pub cookie: u32,
}

impl RequestBuilder for PingBuilder {
    fn build_request(&self, _agent: &AgentDesc, out: &mut OutBuf) {
        request_envelope(out, Command::Ping, VER_PING, |out| {
            out.send_u32(self.cookie);
        });
    }
}

pub struct PingParser;

impl ReplyParser for PingParser {
    fn parse_reply(&self, inb: &mut InBuf<'_>) -> Result<AgentResult, NetError> {
        let cookie = inb.get_u32();
        if inb.error() {
            return Err(NetError::MalformedReply("short ping reply".into()));
        }
        Ok(AgentResult::Pong(cookie))
    }
}

/// One agent connection per mirror group, mirrors picked by each group's
/// strategy.
pub fn build_distributed_conns(
    dist: &DistributedIndex,
    request: &SearchRequest,
    reporter: Arc<dyn Reporter>,
    max_packet: usize,
    retry_delay: Duration,
) -> Vec<AgentConn> {
    let builder: Arc<dyn RequestBuilder> = Arc::new(SearchRequestBuilder {
        request: request.clone(),
    });
    let parser: Arc<dyn ReplyParser> = Arc::new(SearchReplyParser);

    dist.groups
        .iter()
        .map(|group| {
            let ix = group.choose();
            let (desc, dash) = group.mirror(ix);
            let retries = if dist.retry_count > 0 {
                dist.retry_count
            } else {
                group.retry_limit()
            };
            AgentConn::new(
                desc.clone(),
                dash.clone(),
                Some(group.clone()),
                ix,
                builder.clone(),
                parser.clone(),
                reporter.clone(),
                dist.connect_timeout,
                dist.query_timeout,
                retries,
                retry_delay,
                max_packet,
            )
        })
        .collect()
}

/// Feed the reporter and hand every connection to the net loop.
pub fn schedule_remote_jobs(handle: &NetLoopHandle, conns: Vec<AgentConn>) {
    for conn in conns {
        conn.reporter.feed_task(true);
        handle.launch(conn);
    }
}

/// Schedule jobs and block until all of them terminate; returns the number
/// of successful agents.
pub async fn perform_remote_tasks(
    handle: &NetLoopHandle,
    conns: Vec<AgentConn>,
    observer: &Arc<RemoteAgentsObserver>,
) -> usize {
    schedule_remote_jobs(handle, conns);
    observer.wait_done().await;
    observer.succeeded()
}
