//! Data Pages
//!
//! A data page is one Arrow record batch of events. [`EventRel`] is its
//! decoded columnar view - also the shape a live-index leaf materializes
//! into, so the merge scan reads disk pages and live leaves through one type.
//!
//! ## Page schema
//!
//! | column         | type                 | notes                          |
//! |----------------|----------------------|--------------------------------|
//! | `_iid`         | FixedSizeBinary(16)  | sort key, trie key             |
//! | `_system_from` | Int64                | microseconds UTC, sort key     |
//! | `op`           | UInt8                | leg tag: 0 put, 1 del, 2 erase |
//! | `_valid_from`  | Int64                |                                |
//! | `_valid_to`    | Int64                |                                |
//! | `doc`          | Binary, nullable     | JSON document; null for del/erase |
//! | `_recency`     | Int64                | compacted segments only        |
//!
//! Rows are sorted `(iid asc, system_from desc)`; ties are impossible because
//! system times are strictly monotonic within a chunk.

use arrow::array::{
    Array, ArrayRef, BinaryArray, BinaryBuilder, FixedSizeBinaryArray, FixedSizeBinaryBuilder,
    Int64Array, UInt8Array,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use std::ops::Range;
use std::sync::Arc;

use timehouse_core::{Document, Event, EventOp, Iid, OpKind, MAX_TS, MIN_TS};

use crate::error::{Error, Result};

pub const COL_IID: &str = "_iid";
pub const COL_SYSTEM_FROM: &str = "_system_from";
pub const COL_OP: &str = "op";
pub const COL_VALID_FROM: &str = "_valid_from";
pub const COL_VALID_TO: &str = "_valid_to";
pub const COL_DOC: &str = "doc";
pub const COL_RECENCY: &str = "_recency";

/// Arrow schema for a data page.
pub fn page_schema(with_recency: bool) -> SchemaRef {
    let mut fields = vec![
        Field::new(COL_IID, DataType::FixedSizeBinary(16), false),
        Field::new(COL_SYSTEM_FROM, DataType::Int64, false),
        Field::new(COL_OP, DataType::UInt8, false),
        Field::new(COL_VALID_FROM, DataType::Int64, false),
        Field::new(COL_VALID_TO, DataType::Int64, false),
        Field::new(COL_DOC, DataType::Binary, true),
    ];
    if with_recency {
        fields.push(Field::new(COL_RECENCY, DataType::Int64, false));
    }
    Arc::new(Schema::new(fields))
}

/// Decoded columnar view of a run of events.
#[derive(Debug, Clone, Default)]
pub struct EventRel {
    pub iids: Vec<Iid>,
    pub system_froms: Vec<i64>,
    pub ops: Vec<u8>,
    pub valid_froms: Vec<i64>,
    pub valid_tos: Vec<i64>,
    pub docs: Vec<Option<Document>>,
    /// Present in compacted segments only.
    pub recencies: Option<Vec<i64>>,
}

impl EventRel {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty relation that will carry a `_recency` column.
    pub fn with_recency() -> Self {
        EventRel {
            recencies: Some(Vec::new()),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.iids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.iids.is_empty()
    }

    pub fn has_recency(&self) -> bool {
        self.recencies.is_some()
    }

    pub fn op_kind(&self, row: usize) -> Result<OpKind> {
        OpKind::from_tag(self.ops[row]).map_err(|e| Error::CorruptMeta(e.to_string()))
    }

    /// Append one event. Erase rows span all valid time and carry no doc.
    pub fn push_event(&mut self, event: &Event) {
        self.iids.push(event.iid);
        self.system_froms.push(event.system_from);
        match &event.op {
            EventOp::Put {
                doc,
                valid_from,
                valid_to,
            } => {
                self.ops.push(OpKind::Put as u8);
                self.valid_froms.push(*valid_from);
                self.valid_tos.push(*valid_to);
                self.docs.push(Some(doc.clone()));
            }
            EventOp::Delete {
                valid_from,
                valid_to,
            } => {
                self.ops.push(OpKind::Delete as u8);
                self.valid_froms.push(*valid_from);
                self.valid_tos.push(*valid_to);
                self.docs.push(None);
            }
            EventOp::Erase => {
                self.ops.push(OpKind::Erase as u8);
                self.valid_froms.push(MIN_TS);
                self.valid_tos.push(MAX_TS);
                self.docs.push(None);
            }
        }
        if let Some(rec) = &mut self.recencies {
            rec.push(MAX_TS);
        }
    }

    /// Copy row `idx` of `src` onto the end of this relation, stamping its
    /// recency. Only valid on a relation built with [`EventRel::with_recency`].
    pub fn push_row_with_recency(&mut self, src: &EventRel, idx: usize, recency: i64) {
        self.iids.push(src.iids[idx]);
        self.system_froms.push(src.system_froms[idx]);
        self.ops.push(src.ops[idx]);
        self.valid_froms.push(src.valid_froms[idx]);
        self.valid_tos.push(src.valid_tos[idx]);
        self.docs.push(src.docs[idx].clone());
        self.recencies
            .as_mut()
            .expect("relation was built without a recency column")
            .push(recency);
    }

    /// Copy the given rows, in order, into a new relation.
    pub fn gather(&self, indices: &[usize]) -> EventRel {
        let mut out = EventRel {
            recencies: self.recencies.as_ref().map(|_| Vec::with_capacity(indices.len())),
            ..Default::default()
        };
        for &i in indices {
            out.iids.push(self.iids[i]);
            out.system_froms.push(self.system_froms[i]);
            out.ops.push(self.ops[i]);
            out.valid_froms.push(self.valid_froms[i]);
            out.valid_tos.push(self.valid_tos[i]);
            out.docs.push(self.docs[i].clone());
            if let (Some(dst), Some(src)) = (&mut out.recencies, &self.recencies) {
                dst.push(src[i]);
            }
        }
        out
    }

    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut rel = EventRel::new();
        for event in events {
            rel.push_event(event);
        }
        rel
    }

    /// Rows sorted `(iid asc, system_from desc)`?
    pub fn is_sorted(&self) -> bool {
        (1..self.len()).all(|i| {
            let key = (self.iids[i - 1], std::cmp::Reverse(self.system_froms[i - 1]));
            key < (self.iids[i], std::cmp::Reverse(self.system_froms[i]))
        })
    }

    /// Encode a row range as one Arrow record batch.
    pub fn to_batch(&self, range: Range<usize>) -> Result<RecordBatch> {
        let len = range.len();
        let mut iids = FixedSizeBinaryBuilder::with_capacity(len, 16);
        for i in range.clone() {
            iids.append_value(self.iids[i].as_bytes())?;
        }
        let mut docs = BinaryBuilder::new();
        for i in range.clone() {
            match &self.docs[i] {
                Some(doc) => docs.append_value(serde_json::to_vec(doc)?),
                None => docs.append_null(),
            }
        }
        let mut columns: Vec<ArrayRef> = vec![
            Arc::new(iids.finish()),
            Arc::new(Int64Array::from(self.system_froms[range.clone()].to_vec())),
            Arc::new(UInt8Array::from(self.ops[range.clone()].to_vec())),
            Arc::new(Int64Array::from(self.valid_froms[range.clone()].to_vec())),
            Arc::new(Int64Array::from(self.valid_tos[range.clone()].to_vec())),
            Arc::new(docs.finish()),
        ];
        if let Some(rec) = &self.recencies {
            columns.push(Arc::new(Int64Array::from(rec[range].to_vec())));
        }
        Ok(RecordBatch::try_new(
            page_schema(self.has_recency()),
            columns,
        )?)
    }

    /// Decode one Arrow record batch.
    pub fn from_batch(batch: &RecordBatch) -> Result<Self> {
        let iids = typed_column::<FixedSizeBinaryArray>(batch, COL_IID)?;
        let system_froms = typed_column::<Int64Array>(batch, COL_SYSTEM_FROM)?;
        let ops = typed_column::<UInt8Array>(batch, COL_OP)?;
        let valid_froms = typed_column::<Int64Array>(batch, COL_VALID_FROM)?;
        let valid_tos = typed_column::<Int64Array>(batch, COL_VALID_TO)?;
        let docs = typed_column::<BinaryArray>(batch, COL_DOC)?;
        let recencies = match batch.column_by_name(COL_RECENCY) {
            Some(_) => Some(typed_column::<Int64Array>(batch, COL_RECENCY)?),
            None => None,
        };

        let rows = batch.num_rows();
        let mut rel = EventRel {
            recencies: recencies.map(|_| Vec::with_capacity(rows)),
            ..Default::default()
        };
        for i in 0..rows {
            let raw: [u8; 16] = iids.value(i).try_into().map_err(|_| {
                Error::CorruptMeta("iid column value is not 16 bytes".to_string())
            })?;
            rel.iids.push(Iid::from_bytes(raw));
            rel.system_froms.push(system_froms.value(i));
            rel.ops.push(ops.value(i));
            rel.valid_froms.push(valid_froms.value(i));
            rel.valid_tos.push(valid_tos.value(i));
            if docs.is_null(i) {
                rel.docs.push(None);
            } else {
                rel.docs.push(Some(serde_json::from_slice(docs.value(i))?));
            }
            if let (Some(out), Some(col)) = (&mut rel.recencies, recencies) {
                out.push(col.value(i));
            }
        }
        Ok(rel)
    }
}

fn typed_column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .ok_or_else(|| Error::CorruptMeta(format!("data page missing column '{}'", name)))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Error::CorruptMeta(format!("column '{}' has unexpected type", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use timehouse_core::{EntityId, Value};

    fn put_event(id: i64, sys: i64, field: &str, value: Value) -> Event {
        let mut doc = Document::new();
        doc.insert("xt$id".to_string(), Value::Int(id));
        doc.insert(field.to_string(), value);
        Event {
            iid: EntityId::Int(id).iid(),
            system_from: sys,
            op: EventOp::Put {
                doc,
                valid_from: sys,
                valid_to: MAX_TS,
            },
        }
    }

    #[test]
    fn test_batch_roundtrip() {
        let mut events = vec![
            put_event(1, 200, "name", Value::from("b")),
            put_event(1, 100, "name", Value::from("a")),
            put_event(2, 150, "qty", Value::Int(5)),
        ];
        events.sort_by(|a, b| {
            a.iid
                .cmp(&b.iid)
                .then(b.system_from.cmp(&a.system_from))
        });
        let rel = EventRel::from_events(&events);
        assert!(rel.is_sorted());

        let batch = rel.to_batch(0..rel.len()).unwrap();
        assert_eq!(batch.num_rows(), 3);
        let back = EventRel::from_batch(&batch).unwrap();
        assert_eq!(back.iids, rel.iids);
        assert_eq!(back.system_froms, rel.system_froms);
        assert_eq!(back.ops, rel.ops);
        assert_eq!(back.docs, rel.docs);
        assert!(back.recencies.is_none());
    }

    #[test]
    fn test_delete_and_erase_rows_have_no_doc() {
        let iid = EntityId::Int(9).iid();
        let mut rel = EventRel::new();
        rel.push_event(&Event {
            iid,
            system_from: 10,
            op: EventOp::Delete {
                valid_from: 1,
                valid_to: 2,
            },
        });
        rel.push_event(&Event {
            iid,
            system_from: 5,
            op: EventOp::Erase,
        });
        let back = EventRel::from_batch(&rel.to_batch(0..2).unwrap()).unwrap();
        assert_eq!(back.docs, vec![None, None]);
        assert_eq!(back.op_kind(0).unwrap(), OpKind::Delete);
        assert_eq!(back.op_kind(1).unwrap(), OpKind::Erase);
        assert_eq!(back.valid_froms[1], MIN_TS);
        assert_eq!(back.valid_tos[1], MAX_TS);
    }

    #[test]
    fn test_recency_column_roundtrip() {
        let mut out = EventRel::with_recency();
        let src = EventRel::from_events(&[put_event(1, 100, "k", Value::Int(1))]);
        out.push_row_with_recency(&src, 0, 777);
        let back = EventRel::from_batch(&out.to_batch(0..1).unwrap()).unwrap();
        assert_eq!(back.recencies, Some(vec![777]));
    }

    #[test]
    fn test_subrange_batch() {
        let events: Vec<Event> = (0..10)
            .map(|i| put_event(i, 1000 - i, "n", Value::Int(i)))
            .collect();
        let rel = EventRel::from_events(&events);
        let batch = rel.to_batch(4..7).unwrap();
        assert_eq!(batch.num_rows(), 3);
        let back = EventRel::from_batch(&batch).unwrap();
        assert_eq!(back.system_froms, vec![996, 995, 994]);
    }

    #[test]
    fn test_is_sorted_detects_disorder() {
        let events = vec![
            put_event(1, 100, "n", Value::Int(1)),
            put_event(1, 200, "n", Value::Int(2)), // system_from ascending: wrong
        ];
        let rel = EventRel::from_events(&events);
        assert!(!rel.is_sorted());
    }
}
