//! The query-executor seam: parsed search requests, result sets, their wire
//! bodies, and a small in-memory keyword index used by demos and tests.
//!
//! The daemon core treats index internals as opaque; everything it needs is
//! the `SearchIndex` trait.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::NetError;
use crate::wire::{InBuf, OutBuf};

/// Errors reported directly to the caller without touching host dashboards.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("unknown index '{0}'")]
    IndexNotFound(String),

    #[error("index '{0}' does not support this operation")]
    NotMutable(String),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("{0}")]
    Internal(String),
}

/// A parsed search request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub index: String,
    pub query: String,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    20
}

impl SearchRequest {
    pub fn new(index: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            query: query.into(),
            limit: default_limit(),
            offset: 0,
        }
    }

    pub fn encode(&self, out: &mut OutBuf) {
        out.send_string(&self.index);
        out.send_string(&self.query);
        out.send_u32(self.limit);
        out.send_u32(self.offset);
    }

    pub fn decode(inb: &mut InBuf<'_>) -> Result<SearchRequest, NetError> {
        let index = inb.get_string();
        let query = inb.get_string();
        let limit = inb.get_u32();
        let offset = inb.get_u32();
        match (index, query) {
            (Some(index), Some(query)) if !inb.error() => Ok(SearchRequest {
                index,
                query,
                limit,
                offset,
            }),
            _ => Err(NetError::MalformedReply("truncated search request".into())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub doc_id: u64,
    pub weight: f32,
}

/// One index's (or one merged distributed) result set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchReply {
    pub matches: Vec<SearchMatch>,
    pub total_found: u64,
    pub time_ms: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl SearchReply {
    pub fn encode(&self, out: &mut OutBuf) {
        out.send_u32(self.matches.len() as u32);
        for m in &self.matches {
            out.send_u64(m.doc_id);
            out.send_f32(m.weight);
        }
        out.send_as_u32(self.total_found as i64);
        out.send_u32(self.time_ms);
    }

    pub fn decode(inb: &mut InBuf<'_>) -> Result<SearchReply, NetError> {
        let count = inb.get_u32() as usize;
        let mut matches = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let doc_id = inb.get_u64();
            let weight = inb.get_f32();
            if inb.error() {
                return Err(NetError::MalformedReply("truncated match list".into()));
            }
            matches.push(SearchMatch { doc_id, weight });
        }
        let total_found = inb.get_u32() as u64;
        let time_ms = inb.get_u32();
        if inb.error() {
            return Err(NetError::MalformedReply("truncated search reply".into()));
        }
        Ok(SearchReply {
            matches,
            total_found,
            time_ms,
            warning: None,
        })
    }

    /// Fold another result set in, arrival order. Matches are appended and
    /// re-sorted by weight; totals accumulate.
    pub fn merge(&mut self, mut other: SearchReply) {
        self.matches.append(&mut other.matches);
        self.matches
            .sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap_or(std::cmp::Ordering::Equal));
        self.total_found += other.total_found;
        self.time_ms = self.time_ms.max(other.time_ms);
        match (&mut self.warning, other.warning) {
            (None, Some(w)) => self.warning = Some(w),
            (Some(mine), Some(w)) => {
                mine.push_str("; ");
                mine.push_str(&w);
            }
            _ => {}
        }
    }
}

/// What the network core requires of an index implementation. Searches run
/// under the handle's read lock; inserts and replaces require the write lock
/// and are only offered to mutable index types.
pub trait SearchIndex: Send + Sync {
    fn search(&self, req: &SearchRequest) -> Result<SearchReply, QueryError>;

    fn insert(&mut self, _doc_id: u64, _text: &str) -> Result<(), QueryError> {
        Err(QueryError::Unsupported("insert"))
    }

    fn doc_count(&self) -> u64;
}

/// In-memory keyword index: lowercase alphanumeric tokens, conjunctive
/// matching, weight = fraction of query terms present.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    docs: HashMap<u64, String>,
    postings: HashMap<String, Vec<u64>>,
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SearchIndex for MemoryIndex {
    fn search(&self, req: &SearchRequest) -> Result<SearchReply, QueryError> {
        let terms = tokenize(&req.query);
        if terms.is_empty() {
            return Ok(SearchReply::default());
        }
        let mut hits: HashMap<u64, u32> = HashMap::new();
        for term in &terms {
            if let Some(docs) = self.postings.get(term) {
                for doc in docs {
                    *hits.entry(*doc).or_insert(0) += 1;
                }
            }
        }
        let mut matches: Vec<SearchMatch> = hits
            .into_iter()
            .filter(|(_, n)| *n as usize == terms.len())
            .map(|(doc_id, n)| SearchMatch {
                doc_id,
                weight: n as f32 / terms.len() as f32,
            })
            .collect();
        matches.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.doc_id.cmp(&b.doc_id))
        });
        let total = matches.len() as u64;
        let window: Vec<SearchMatch> = matches
            .into_iter()
            .skip(req.offset as usize)
            .take(req.limit as usize)
            .collect();
        Ok(SearchReply {
            matches: window,
            total_found: total,
            time_ms: 0,
            warning: None,
        })
    }

    fn insert(&mut self, doc_id: u64, text: &str) -> Result<(), QueryError> {
        for term in tokenize(text) {
            let docs = self.postings.entry(term).or_default();
            if !docs.contains(&doc_id) {
                docs.push(doc_id);
            }
        }
        self.docs.insert(doc_id, text.to_string());
        Ok(())
    }

    fn doc_count(&self) -> u64 {
        self.docs.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> MemoryIndex {
        let mut idx = MemoryIndex::new();
        idx.insert(1, "the quick brown fox").unwrap();
        idx.insert(2, "lazy brown dog").unwrap();
        idx.insert(3, "quick quick fox").unwrap();
        idx
    }

    #[test]
    fn conjunctive_match() {
        let idx = seeded();
        let reply = idx.search(&SearchRequest::new("t", "quick fox")).unwrap();
        let ids: Vec<u64> = reply.matches.iter().map(|m| m.doc_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(reply.total_found, 2);
    }

    #[test]
    fn limit_and_offset_window() {
        let idx = seeded();
        let mut req = SearchRequest::new("t", "brown");
        req.limit = 1;
        req.offset = 1;
        let reply = idx.search(&req).unwrap();
        assert_eq!(reply.matches.len(), 1);
        assert_eq!(reply.total_found, 2);
    }

    #[test]
    fn request_wire_roundtrip() {
        let req = SearchRequest {
            index: "docs,extra".into(),
            query: "hello world".into(),
            limit: 5,
            offset: 10,
        };
        let mut out = OutBuf::new();
        req.encode(&mut out);
        let bytes = out.into_bytes();
        let decoded = SearchRequest::decode(&mut InBuf::new(&bytes)).unwrap();
        assert_eq!(decoded.index, req.index);
        assert_eq!(decoded.query, req.query);
        assert_eq!(decoded.limit, 5);
        assert_eq!(decoded.offset, 10);
    }

    #[test]
    fn reply_wire_roundtrip() {
        let reply = SearchReply {
            matches: vec![
                SearchMatch { doc_id: 42, weight: 1.0 },
                SearchMatch { doc_id: 7, weight: 0.5 },
            ],
            total_found: 9,
            time_ms: 13,
            warning: None,
        };
        let mut out = OutBuf::new();
        reply.encode(&mut out);
        let bytes = out.into_bytes();
        let decoded = SearchReply::decode(&mut InBuf::new(&bytes)).unwrap();
        assert_eq!(decoded.matches, reply.matches);
        assert_eq!(decoded.total_found, 9);
        assert_eq!(decoded.time_ms, 13);
    }

    #[test]
    fn merge_accumulates_and_sorts() {
        let mut a = SearchReply {
            matches: vec![SearchMatch { doc_id: 1, weight: 0.3 }],
            total_found: 1,
            time_ms: 5,
            warning: None,
        };
        let b = SearchReply {
            matches: vec![SearchMatch { doc_id: 2, weight: 0.9 }],
            total_found: 4,
            time_ms: 11,
            warning: Some("late mirror".into()),
        };
        a.merge(b);
        assert_eq!(a.matches[0].doc_id, 2);
        assert_eq!(a.total_found, 5);
        assert_eq!(a.time_ms, 11);
        assert_eq!(a.warning.as_deref(), Some("late mirror"));
    }

    #[test]
    fn truncated_reply_is_malformed() {
        let mut out = OutBuf::new();
        out.send_u32(3); // claims three matches, none follow
        let bytes = out.into_bytes();
        assert!(SearchReply::decode(&mut InBuf::new(&bytes)).is_err());
    }
}
