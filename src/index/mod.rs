//! Served index handles, their statistics, and the shared registry.

pub mod registry;
pub mod served;
pub mod stats;

pub use registry::Registry;
pub use served::{DistributedIndex, IndexType, ServedDesc, ServedIndex};
pub use stats::{QueryStatsReport, ServedStats, StatInterval};
