//! Entity Ids and Trie Addressing
//!
//! Every user-supplied id - string, integer, UUID or keyword - is hashed to a
//! fixed 16-byte internal id (the `iid`). Segments sort by it, the hash trie
//! partitions by it, and the merge scan compares by it. The raw user id only
//! survives inside the document itself.
//!
//! ## Why hash at all?
//!
//! - Uniform distribution: the trie splits evenly no matter how skewed the
//!   user ids are.
//! - Fixed width: 16-byte comparisons are branch-free and index-friendly.
//! - Type erasure: `"42"`, `42` and a UUID all become plain bytes with a type
//!   tag, so equality is exact and cross-type collisions are impossible.
//!
//! ## Trie paths
//!
//! The trie routes by consecutive 2-bit nibbles of the iid prefix (branching
//! factor 4). A path is a sequence of nibble values `0..=3`; a node at path
//! `p` owns exactly the iids whose nibble sequence starts with `p`.
//!
//! ```text
//! iid bytes:   [0b01_10_11_00, ...]
//! nibbles:      1   2   3   0  ...
//! path [1,2]:  owns every iid whose first two nibbles are 1,2
//! ```
//!
//! [`compare_to_path`] is the primitive both the merge planner and the
//! event-row pointer are built on: it compares an iid's leading nibbles
//! against a path, returning `Equal` on a prefix match.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::value::Value;

/// Width of an internal entity id in bytes.
pub const IID_BYTES: usize = 16;

/// Number of 2-bit nibbles in an iid (the maximum trie depth).
pub const IID_NIBBLES: usize = IID_BYTES * 4;

/// Trie branching factor: one child per 2-bit nibble value.
pub const BRANCH_FACTOR: usize = 4;

/// A trie path: a sequence of nibble values, each `0..=3`.
pub type TriePath = Vec<u8>;

/// The 16-byte internal entity id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Iid([u8; IID_BYTES]);

impl Iid {
    pub fn from_bytes(bytes: [u8; IID_BYTES]) -> Self {
        Iid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; IID_BYTES] {
        &self.0
    }

    /// The `i`-th 2-bit nibble, most significant first.
    pub fn nibble(&self, i: usize) -> u8 {
        let byte = self.0[i / 4];
        (byte >> (6 - 2 * (i % 4))) & 0b11
    }
}

impl fmt::Debug for Iid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Iid(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// A user-supplied entity id in one of the supported shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityId {
    Str(String),
    Int(i64),
    Uuid(Uuid),
    Keyword(String),
}

// Type tags prepended to the hash input. Two ids of different types never
// share an iid even when their canonical bytes collide.
const TAG_STR: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_UUID: u8 = 0x03;
const TAG_KEYWORD: u8 = 0x04;

impl EntityId {
    /// Canonical byte form: strings as UTF-8, integers fixed-width
    /// big-endian, UUIDs as their 16 raw bytes, keywords as their qualified
    /// UTF-8 name.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            EntityId::Str(s) => {
                let mut v = Vec::with_capacity(1 + s.len());
                v.push(TAG_STR);
                v.extend_from_slice(s.as_bytes());
                v
            }
            EntityId::Int(i) => {
                let mut v = Vec::with_capacity(9);
                v.push(TAG_INT);
                v.extend_from_slice(&i.to_be_bytes());
                v
            }
            EntityId::Uuid(u) => {
                let mut v = Vec::with_capacity(17);
                v.push(TAG_UUID);
                v.extend_from_slice(u.as_bytes());
                v
            }
            EntityId::Keyword(k) => {
                let mut v = Vec::with_capacity(1 + k.len());
                v.push(TAG_KEYWORD);
                v.extend_from_slice(k.as_bytes());
                v
            }
        }
    }

    /// Hash to the 16-byte internal id. Equal user ids map to equal iids.
    pub fn iid(&self) -> Iid {
        let digest = Sha256::digest(self.canonical_bytes());
        let mut bytes = [0u8; IID_BYTES];
        bytes.copy_from_slice(&digest[..IID_BYTES]);
        Iid(bytes)
    }

    /// Interpret a document value as an entity id.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Str(s) => Ok(EntityId::Str(s.clone())),
            Value::Int(i) => Ok(EntityId::Int(*i)),
            Value::Uuid(u) => Ok(EntityId::Uuid(*u)),
            other => Err(Error::InvalidArgument(format!(
                "unsupported entity id value: {:?}",
                other
            ))),
        }
    }
}

/// Compare an iid's leading nibbles against a trie path.
///
/// Returns `Less`/`Greater` at the first differing nibble; `Equal` when every
/// path nibble agrees with the iid's prefix. Used by the merge planner to
/// prune subtrees and by the event-row pointer to bound its row range.
pub fn compare_to_path(iid: &Iid, path: &[u8]) -> Ordering {
    for (i, &p) in path.iter().enumerate() {
        let n = iid.nibble(i);
        match n.cmp(&p) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
