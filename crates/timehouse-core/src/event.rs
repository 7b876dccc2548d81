//! Events and Transaction Operations
//!
//! The [`Event`] is the atomic unit in storage: an entity id, a system time,
//! and a tagged operation payload. Transactions submitted by users are lists
//! of [`TxOp`]s; the indexer lowers each op to one event with the
//! transaction's assigned system time.
//!
//! ## Op encoding
//!
//! On disk the op is leg-encoded: an integer tag per row plus the payload
//! columns it uses. [`OpKind`] is that tag; the polygon engine switches on it
//! exactly once per row.
//!
//! | tag | op     | payload                              |
//! |-----|--------|--------------------------------------|
//! | 0   | put    | document, `valid_from`, `valid_to`   |
//! | 1   | delete | `valid_from`, `valid_to`             |
//! | 2   | erase  | none - tombstones the whole entity   |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::iid::{EntityId, Iid};
use crate::normalize::normalize_name;
use crate::value::Value;

/// Document column name every put must carry (before normalization).
pub const ID_COLUMN: &str = "xt/id";

/// The normalized form of [`ID_COLUMN`], as it appears in storage.
pub const ID_COLUMN_NORMALIZED: &str = "xt$id";

/// A document: column name to value. Keys are normalized on ingest.
pub type Document = BTreeMap<String, Value>;

/// Leg tag for an event's operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpKind {
    Put = 0,
    Delete = 1,
    Erase = 2,
}

impl OpKind {
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(OpKind::Put),
            1 => Ok(OpKind::Delete),
            2 => Ok(OpKind::Erase),
            other => Err(Error::Runtime(format!("unknown op tag {}", other))),
        }
    }
}

/// An event's operation payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventOp {
    Put {
        doc: Document,
        valid_from: i64,
        valid_to: i64,
    },
    Delete {
        valid_from: i64,
        valid_to: i64,
    },
    Erase,
}

impl EventOp {
    pub fn kind(&self) -> OpKind {
        match self {
            EventOp::Put { .. } => OpKind::Put,
            EventOp::Delete { .. } => OpKind::Delete,
            EventOp::Erase => OpKind::Erase,
        }
    }
}

/// The atomic unit in storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub iid: Iid,
    /// Microseconds since epoch, UTC. Strictly monotonic within a chunk.
    pub system_from: i64,
    pub op: EventOp,
}

/// A transaction operation as submitted by a caller (or produced by a
/// registered transaction function). SQL/XTQL translation happens upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum TxOp {
    Put {
        table: String,
        doc: Document,
        valid_from: Option<i64>,
        valid_to: Option<i64>,
    },
    Delete {
        table: String,
        id: EntityId,
        valid_from: Option<i64>,
        valid_to: Option<i64>,
    },
    Erase {
        table: String,
        id: EntityId,
    },
    Call {
        fn_id: String,
        args: Vec<Value>,
    },
}

impl TxOp {
    pub fn put(table: impl Into<String>, doc: Document) -> Self {
        TxOp::Put {
            table: table.into(),
            doc,
            valid_from: None,
            valid_to: None,
        }
    }

    pub fn put_valid(
        table: impl Into<String>,
        doc: Document,
        valid_from: Option<i64>,
        valid_to: Option<i64>,
    ) -> Self {
        TxOp::Put {
            table: table.into(),
            doc,
            valid_from,
            valid_to,
        }
    }

    pub fn delete(table: impl Into<String>, id: EntityId) -> Self {
        TxOp::Delete {
            table: table.into(),
            id,
            valid_from: None,
            valid_to: None,
        }
    }

    pub fn delete_valid(
        table: impl Into<String>,
        id: EntityId,
        valid_from: Option<i64>,
        valid_to: Option<i64>,
    ) -> Self {
        TxOp::Delete {
            table: table.into(),
            id,
            valid_from,
            valid_to,
        }
    }

    pub fn erase(table: impl Into<String>, id: EntityId) -> Self {
        TxOp::Erase {
            table: table.into(),
            id,
        }
    }
}

/// Validate a put document and fold its keys to normalized form.
///
/// Returns the entity id alongside the normalized document. Rejects a
/// document without `xt/id`, and one carrying a literal `xt$id` key - the
/// normalized spelling is reserved for storage, never accepted as input.
pub fn prepare_document(doc: &Document) -> Result<(EntityId, Document)> {
    if doc.contains_key(ID_COLUMN_NORMALIZED) {
        return Err(Error::InvalidArgument(format!(
            "document may not contain the reserved column '{}'",
            ID_COLUMN_NORMALIZED
        )));
    }
    let id_value = doc.get(ID_COLUMN).ok_or_else(|| {
        Error::InvalidArgument(format!("put document is missing '{}'", ID_COLUMN))
    })?;
    let entity_id = EntityId::from_value(id_value)?;

    let mut normalized = Document::new();
    for (k, v) in doc {
        let nk = normalize_name(k);
        if normalized.insert(nk.clone(), v.clone()).is_some() {
            return Err(Error::InvalidArgument(format!(
                "columns '{}' collide after normalization",
                nk
            )));
        }
    }
    Ok((entity_id, normalized))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(pairs: &[(&str, Value)]) -> Document {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    // ---------------------------------------------------------------
    // prepare_document
    // ---------------------------------------------------------------

    #[test]
    fn test_prepare_document_normalizes_keys() {
        let d = doc(&[("xt/id", Value::Int(1)), ("First-Name", Value::from("a"))]);
        let (id, normalized) = prepare_document(&d).unwrap();
        assert_eq!(id, EntityId::Int(1));
        assert!(normalized.contains_key("xt$id"));
        assert!(normalized.contains_key("first_name"));
        assert!(!normalized.contains_key("xt/id"));
    }

    #[test]
    fn test_prepare_document_missing_id() {
        let d = doc(&[("name", Value::from("a"))]);
        assert!(matches!(
            prepare_document(&d),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_prepare_document_rejects_reserved_column() {
        let d = doc(&[("xt/id", Value::Int(1)), ("xt$id", Value::Int(2))]);
        assert!(prepare_document(&d).is_err());
    }

    #[test]
    fn test_prepare_document_rejects_collisions() {
        // "a-b" folds to "a_b", colliding with the literal "a_b"
        let d = doc(&[
            ("xt/id", Value::Int(1)),
            ("a-b", Value::Int(1)),
            ("a_b", Value::Int(2)),
        ]);
        assert!(prepare_document(&d).is_err());
    }

    // ---------------------------------------------------------------
    // Op tags
    // ---------------------------------------------------------------

    #[test]
    fn test_op_tag_roundtrip() {
        for kind in [OpKind::Put, OpKind::Delete, OpKind::Erase] {
            assert_eq!(OpKind::from_tag(kind as u8).unwrap(), kind);
        }
        assert!(OpKind::from_tag(9).is_err());
    }

    #[test]
    fn test_event_op_kind() {
        let put = EventOp::Put {
            doc: Document::new(),
            valid_from: 0,
            valid_to: 1,
        };
        assert_eq!(put.kind(), OpKind::Put);
        assert_eq!(EventOp::Delete { valid_from: 0, valid_to: 1 }.kind(), OpKind::Delete);
        assert_eq!(EventOp::Erase.kind(), OpKind::Erase);
    }
}
