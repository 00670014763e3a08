//! Socket abstraction, readiness poller and persistent connection pool.

pub mod poller;
pub mod pool;
pub mod socket;

pub use poller::{NetPoller, PollerWaker, Readiness};
pub use pool::PersistentPool;
pub use socket::{resolve, AgentStream, ChunkStatus, HostAddr};
