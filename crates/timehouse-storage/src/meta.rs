//! Segment Meta File
//!
//! The meta file is the small, always-read half of a segment. It holds the
//! hash trie over the segment's iid space and, per leaf, the column
//! statistics that drive metadata pushdown.
//!
//! ## File structure
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ Magic bytes: "THMF" (4 bytes)              │
//! │ Version (2 bytes, big-endian)              │
//! ├────────────────────────────────────────────┤
//! │ Payload: bincode-encoded SegmentMeta       │
//! ├────────────────────────────────────────────┤
//! │ CRC32 of everything above (4 bytes, BE)    │
//! └────────────────────────────────────────────┘
//! ```
//!
//! ## Trie encoding
//!
//! Nodes live in a flat vector; children refer to earlier indexes and the
//! root is the last entry (nodes are appended post-order during the build).
//! Variants:
//!
//! - `Nil`: an absent subtree (only as a branch child).
//! - `BranchIid`: four children, one per 2-bit nibble value.
//! - `BranchRecency`: leaves bucketed by recency - the maximum `system_to`
//!   any of the bucket's rows can reach. A query as-of a system time at or
//!   above a bucket's key can skip the bucket entirely.
//! - `Leaf`: one data page plus its column statistics.

use serde::{Deserialize, Serialize};

use timehouse_core::{Predicate, Value};

use crate::bloom::{ColumnBloomFilter, IidBloom};
use crate::error::{Error, Result};

/// Magic bytes for meta files: "THMF".
pub const META_MAGIC: [u8; 4] = *b"THMF";

/// Version number for the meta file format.
pub const META_VERSION: u16 = 1;

/// One node of the segment trie.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TrieNode {
    Nil,
    BranchIid {
        /// Child node index per nibble value, `None` for an empty subtree.
        children: [Option<u32>; 4],
    },
    BranchRecency {
        /// `(recency, node)` pairs, ascending by recency. Every row under
        /// `node` has `system_to <= recency`; the last bucket uses `MAX_TS`.
        buckets: Vec<(i64, u32)>,
    },
    Leaf {
        data_page_idx: u32,
        columns: Vec<ColumnMeta>,
    },
}

/// Per-column statistics for one data page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    /// True for user document columns, false for the fixed event columns.
    pub root_col: bool,
    /// Number of rows in the page carrying this column.
    pub count: u64,
    pub min_int: Option<i64>,
    pub max_int: Option<i64>,
    pub min_float: Option<f64>,
    pub max_float: Option<f64>,
    pub min_str: Option<String>,
    pub max_str: Option<String>,
    /// Value bloom (serialized [`ColumnBloomFilter`]).
    pub bloom: Option<Vec<u8>>,
    /// Entity-id bloom (serialized [`IidBloom`]); carried by the `_iid` and
    /// `_system_from` columns.
    pub iid_bloom: Option<Vec<u8>>,
}

impl ColumnMeta {
    pub fn observe(&mut self, value: &Value) {
        self.count += 1;
        match value {
            Value::Int(i) => {
                self.min_int = Some(self.min_int.map_or(*i, |m| m.min(*i)));
                self.max_int = Some(self.max_int.map_or(*i, |m| m.max(*i)));
            }
            Value::Float(f) => {
                self.min_float = Some(self.min_float.map_or(*f, |m| m.min(*f)));
                self.max_float = Some(self.max_float.map_or(*f, |m| m.max(*f)));
            }
            Value::Str(s) => {
                let update_min = self.min_str.as_ref().map_or(true, |m| s < m);
                if update_min {
                    self.min_str = Some(s.clone());
                }
                let update_max = self.max_str.as_ref().map_or(true, |m| s > m);
                if update_max {
                    self.max_str = Some(s.clone());
                }
            }
            Value::Null | Value::Bool(_) | Value::Uuid(_) => {}
        }
    }

    /// May any row of the page satisfy the predicate? Conservative: `true`
    /// whenever the statistics cannot decide.
    pub fn may_match(&self, predicate: &Predicate) -> bool {
        match predicate {
            Predicate::Eq(_, value) => {
                if let (Some(bloom_bytes), Some(key)) = (&self.bloom, value.bloom_key()) {
                    match ColumnBloomFilter::from_bytes(bloom_bytes) {
                        Ok(bloom) if !bloom.might_contain(&key) => return false,
                        _ => {}
                    }
                }
                self.range_may_contain(value, true, true)
            }
            Predicate::Lt(_, value) => self.min_below(value, false),
            Predicate::Le(_, value) => self.min_below(value, true),
            Predicate::Gt(_, value) => self.max_above(value, false),
            Predicate::Ge(_, value) => self.max_above(value, true),
        }
    }

    fn range_may_contain(&self, value: &Value, allow_min: bool, allow_max: bool) -> bool {
        self.min_below(value, allow_min) && self.max_above(value, allow_max)
    }

    /// Is there possibly a page value `< value` (or `<=` when inclusive)?
    fn min_below(&self, value: &Value, inclusive: bool) -> bool {
        let below = |min: Option<&Value>| match min {
            None => true,
            Some(min) => match min.compare_same_class(value) {
                Some(std::cmp::Ordering::Less) => true,
                Some(std::cmp::Ordering::Equal) => inclusive,
                Some(std::cmp::Ordering::Greater) => false,
                None => true,
            },
        };
        match value {
            Value::Int(_) => below(self.min_int.map(Value::Int).as_ref()),
            Value::Float(_) => below(self.min_float.map(Value::Float).as_ref()),
            Value::Str(_) => below(self.min_str.clone().map(Value::Str).as_ref()),
            _ => true,
        }
    }

    /// Is there possibly a page value `> value` (or `>=` when inclusive)?
    fn max_above(&self, value: &Value, inclusive: bool) -> bool {
        let above = |max: Option<&Value>| match max {
            None => true,
            Some(max) => match max.compare_same_class(value) {
                Some(std::cmp::Ordering::Greater) => true,
                Some(std::cmp::Ordering::Equal) => inclusive,
                Some(std::cmp::Ordering::Less) => false,
                None => true,
            },
        };
        match value {
            Value::Int(_) => above(self.max_int.map(Value::Int).as_ref()),
            Value::Float(_) => above(self.max_float.map(Value::Float).as_ref()),
            Value::Str(_) => above(self.max_str.clone().map(Value::Str).as_ref()),
            _ => true,
        }
    }

    pub fn decoded_iid_bloom(&self) -> Option<IidBloom> {
        self.iid_bloom
            .as_deref()
            .and_then(|bytes| IidBloom::from_bytes(bytes).ok())
    }
}

/// The meta-file payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub table: String,
    pub level: u8,
    pub first_row: u64,
    pub next_row: u64,
    /// Actual event count in this segment (can undercut `next_row -
    /// first_row` after erases were compacted away).
    pub row_count: u64,
    pub nodes: Vec<TrieNode>,
    pub root: u32,
}

impl SegmentMeta {
    pub fn node(&self, idx: u32) -> Result<&TrieNode> {
        self.nodes
            .get(idx as usize)
            .ok_or_else(|| Error::CorruptMeta(format!("trie node {} out of range", idx)))
    }

    pub fn root_node(&self) -> Result<&TrieNode> {
        self.node(self.root)
    }

    /// All leaves in the trie, preorder, as `(path, page_idx)` pairs.
    /// Recency buckets contribute each bucket leaf at the branch's path.
    pub fn leaves(&self) -> Result<Vec<(Vec<u8>, u32)>> {
        let mut out = Vec::new();
        self.collect_leaves(self.root, &mut Vec::new(), &mut out)?;
        Ok(out)
    }

    fn collect_leaves(
        &self,
        idx: u32,
        path: &mut Vec<u8>,
        out: &mut Vec<(Vec<u8>, u32)>,
    ) -> Result<()> {
        match self.node(idx)? {
            TrieNode::Nil => Ok(()),
            TrieNode::Leaf { data_page_idx, .. } => {
                out.push((path.clone(), *data_page_idx));
                Ok(())
            }
            TrieNode::BranchIid { children } => {
                for (nibble, child) in children.iter().enumerate() {
                    if let Some(child) = child {
                        path.push(nibble as u8);
                        self.collect_leaves(*child, path, out)?;
                        path.pop();
                    }
                }
                Ok(())
            }
            TrieNode::BranchRecency { buckets } => {
                for (_, child) in buckets {
                    self.collect_leaves(*child, path, out)?;
                }
                Ok(())
            }
        }
    }

    /// Serialize to meta-file bytes (magic, version, payload, CRC).
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(4 + 2 + payload.len() + 4);
        out.extend_from_slice(&META_MAGIC);
        out.extend_from_slice(&META_VERSION.to_be_bytes());
        out.extend_from_slice(&payload);
        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_be_bytes());
        Ok(out)
    }

    /// Parse and validate meta-file bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 + 2 + 4 {
            return Err(Error::CorruptMeta("meta file too short".to_string()));
        }
        if data[..4] != META_MAGIC {
            return Err(Error::CorruptMeta("bad meta magic".to_string()));
        }
        let version = u16::from_be_bytes(data[4..6].try_into().expect("sliced"));
        if version != META_VERSION {
            return Err(Error::CorruptMeta(format!(
                "unsupported meta version {}",
                version
            )));
        }
        let body_end = data.len() - 4;
        let stored_crc = u32::from_be_bytes(data[body_end..].try_into().expect("sliced"));
        let actual_crc = crc32fast::hash(&data[..body_end]);
        if stored_crc != actual_crc {
            return Err(Error::CorruptMeta("meta CRC mismatch".to_string()));
        }
        Ok(bincode::deserialize(&data[6..body_end])?)
    }
}
