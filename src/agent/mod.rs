//! Remote-agent subsystem: host descriptors, per-host dashboards, mirror
//! groups, the per-query connection state machine, and the net loop that
//! drives it all.

pub mod conn;
pub mod dashboard;
pub mod desc;
pub mod dispatch;
pub mod mirror;
pub mod netloop;
pub mod ping;
pub mod reporter;

pub use conn::{AgentConn, AgentState};
pub use dashboard::{AgentEvent, Dashboards, HostDashboard, RequestOutcome};
pub use desc::{AgentDesc, HostDesc};
pub use dispatch::{
    build_distributed_conns, perform_remote_tasks, schedule_remote_jobs, AgentResult,
    ReplyParser, RequestBuilder,
};
pub use mirror::{MirrorGroup, Strategy};
pub use netloop::{spawn_netloop, NetLoopHandle};
pub use ping::Pinger;
pub use reporter::{AgentOutcome, RemoteAgentsObserver, Reporter};
