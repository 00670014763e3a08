//! Served index handles and distributed index descriptors.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use crate::agent::mirror::MirrorGroup;
use crate::index::stats::ServedStats;
use crate::search::SearchIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    Plain,
    Template,
    Rt,
    Percolate,
    Distributed,
}

impl IndexType {
    pub fn parse(s: &str) -> Option<IndexType> {
        Some(match s {
            "plain" | "" => IndexType::Plain,
            "template" => IndexType::Template,
            "rt" => IndexType::Rt,
            "percolate" => IndexType::Percolate,
            "distributed" => IndexType::Distributed,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            IndexType::Plain => "plain",
            IndexType::Template => "template",
            IndexType::Rt => "rt",
            IndexType::Percolate => "percolate",
            IndexType::Distributed => "distributed",
        }
    }

    /// Only mutable handles grant write locks for insert and replace.
    pub fn is_mutable(self) -> bool {
        matches!(self, IndexType::Rt | IndexType::Percolate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAccess {
    #[default]
    Mmap,
    File,
    Mlock,
}

/// The guarded contents of one served-index handle.
pub struct ServedDesc {
    /// Owned index object; opaque to the network core.
    pub index: Box<dyn SearchIndex>,
    pub path: PathBuf,
    /// Set while a reload is staging a replacement on disk.
    pub new_path: Option<PathBuf>,
    pub index_type: IndexType,
    pub preopen: bool,
    pub killlist_targets: Vec<String>,
    /// Relative access cost, used to order rotation work.
    pub mass: i64,
    pub rotation_priority: i32,
    pub file_access: FileAccess,
}

impl ServedDesc {
    pub fn new(index: Box<dyn SearchIndex>, index_type: IndexType, path: PathBuf) -> Self {
        Self {
            index,
            path,
            new_path: None,
            index_type,
            preopen: false,
            killlist_targets: Vec::new(),
            mass: 0,
            rotation_priority: 0,
            file_access: FileAccess::default(),
        }
    }
}

/// A served index: per-handle reader/writer lock over the descriptor plus
/// embedded query statistics. A long read on one handle never blocks
/// mutation of another.
pub struct ServedIndex {
    desc: RwLock<ServedDesc>,
    stats: ServedStats,
}

impl ServedIndex {
    pub fn new(desc: ServedDesc) -> Self {
        Self {
            desc: RwLock::new(desc),
            stats: ServedStats::new(),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ServedDesc> {
        self.desc.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ServedDesc> {
        self.desc.write()
    }

    pub fn index_type(&self) -> IndexType {
        self.desc.read().index_type
    }

    pub fn is_mutable(&self) -> bool {
        self.index_type().is_mutable()
    }

    pub fn stats(&self) -> &ServedStats {
        &self.stats
    }
}

/// Descriptor of a distributed index: remote mirror groups plus local index
/// names, with per-index agent timeout and retry overrides.
pub struct DistributedIndex {
    pub groups: Vec<Arc<MirrorGroup>>,
    pub locals: Vec<String>,
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
    /// Overrides the per-group retry limit when non-zero.
    pub retry_count: usize,
}

impl DistributedIndex {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.locals.is_empty()
    }

    /// Every host across every mirror group.
    pub fn all_hosts(&self) -> Vec<crate::agent::desc::AgentDesc> {
        self.groups
            .iter()
            .flat_map(|g| g.mirrors().iter().cloned())
            .collect()
    }
}
