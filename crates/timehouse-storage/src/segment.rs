//! Segment Build and Read
//!
//! The write side takes one sorted run of events and produces the two files
//! of a segment; the read side opens a published segment through the buffer
//! pool and decodes individual data pages on demand.
//!
//! ## Building
//!
//! The trie is built by recursive splitting: a range of rows that fits the
//! page size becomes a leaf (one data page plus its column statistics);
//! anything larger splits into four children by the next 2-bit nibble of the
//! iid. Because the input is sorted by iid, every split is a partition into
//! contiguous runs, and appending pages as leaves are reached lays the data
//! file out in trie preorder.
//!
//! A run of rows for a single entity can exceed the page size; once the
//! nibble depth is exhausted the row range becomes an oversized leaf rather
//! than splitting forever.
//!
//! When the input carries a `_recency` column (a compaction of already
//! compacted segments), each leaf splits into a recency branch: rows whose
//! final `system_to` is bounded go into a historical bucket, still-live rows
//! into the `MAX_TS` bucket. A later time-travel query prunes the historical
//! bucket by its key alone.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;

use timehouse_core::{Value, MAX_TS};

use crate::bloom::{ColumnBloomFilter, IidBloom};
use crate::buffer_pool::BufferPool;
use crate::error::{Error, Result};
use crate::layout::{data_path, meta_path, SegmentId};
use crate::meta::{ColumnMeta, SegmentMeta, TrieNode};
use crate::page::{
    page_schema, EventRel, COL_IID, COL_SYSTEM_FROM, COL_VALID_FROM, COL_VALID_TO,
};

/// Knobs for the segment build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Rows per data page (and trie leaf split threshold).
    pub page_size: usize,
    /// Split leaves into recency buckets. Only effective when the input
    /// relation carries a `_recency` column.
    pub split_recency: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            page_size: 256,
            split_recency: false,
        }
    }
}

/// An opened, published segment: identity plus decoded meta.
#[derive(Debug, Clone)]
pub struct SegmentHandle {
    pub table: String,
    pub id: SegmentId,
    pub meta: Arc<SegmentMeta>,
}

impl SegmentHandle {
    pub fn data_path(&self) -> String {
        data_path(&self.table, &self.id)
    }

    pub fn meta_path(&self) -> String {
        meta_path(&self.table, &self.id)
    }
}

/// Build a segment from a sorted run of events.
///
/// Returns the decoded meta and the data-file bytes; the caller publishes
/// both through the buffer pool. The input must already be sorted
/// `(iid asc, system_from desc)` - the live index and the merge both
/// guarantee it.
pub fn build_segment(
    table: &str,
    id: SegmentId,
    rel: &EventRel,
    opts: &BuildOptions,
) -> Result<(SegmentMeta, Bytes)> {
    debug_assert!(rel.is_sorted());
    let mut builder = TrieBuilder {
        rel,
        opts,
        nodes: Vec::new(),
        pages: Vec::new(),
    };
    let root = builder.build(0..rel.len(), 0)?;
    let root = match root {
        Some(idx) => idx,
        None => {
            // An empty segment still needs a root.
            builder.nodes.push(TrieNode::Nil);
            (builder.nodes.len() - 1) as u32
        }
    };

    let schema = page_schema(rel.has_recency());
    let mut writer = FileWriter::try_new(Vec::new(), &schema)?;
    for page in &builder.pages {
        writer.write(page)?;
    }
    writer.finish()?;
    let data = Bytes::from(writer.into_inner()?);

    let meta = SegmentMeta {
        table: table.to_string(),
        level: id.level,
        first_row: id.first_row,
        next_row: id.next_row,
        row_count: rel.len() as u64,
        nodes: builder.nodes,
        root,
    };
    tracing::debug!(
        table = %table,
        level = id.level,
        rows = rel.len(),
        pages = builder.pages.len(),
        "built segment"
    );
    Ok((meta, data))
}

struct TrieBuilder<'a> {
    rel: &'a EventRel,
    opts: &'a BuildOptions,
    nodes: Vec<TrieNode>,
    pages: Vec<RecordBatch>,
}

impl TrieBuilder<'_> {
    fn build(&mut self, range: std::ops::Range<usize>, depth: usize) -> Result<Option<u32>> {
        if range.is_empty() {
            return Ok(None);
        }
        if range.len() <= self.opts.page_size || depth >= timehouse_core::IID_NIBBLES {
            return self.build_leaf(range).map(Some);
        }

        let mut children: [Option<u32>; 4] = [None; 4];
        let mut start = range.start;
        for (nibble, child) in children.iter_mut().enumerate() {
            let mut end = start;
            while end < range.end && self.rel.iids[end].nibble(depth) == nibble as u8 {
                end += 1;
            }
            *child = self.build(start..end, depth + 1)?;
            start = end;
        }
        self.nodes.push(TrieNode::BranchIid { children });
        Ok(Some((self.nodes.len() - 1) as u32))
    }

    fn build_leaf(&mut self, range: std::ops::Range<usize>) -> Result<u32> {
        let recencies = self.rel.recencies.as_ref();
        if self.opts.split_recency {
            if let Some(recencies) = recencies {
                let historical: Vec<usize> =
                    range.clone().filter(|&i| recencies[i] < MAX_TS).collect();
                let current: Vec<usize> =
                    range.clone().filter(|&i| recencies[i] >= MAX_TS).collect();
                if !historical.is_empty() && !current.is_empty() {
                    let historical_max = historical.iter().map(|&i| recencies[i]).max().expect("nonempty");
                    let hist_rel = self.rel.gather(&historical);
                    let hist_node = self.emit_leaf(&hist_rel)?;
                    let cur_rel = self.rel.gather(&current);
                    let cur_node = self.emit_leaf(&cur_rel)?;
                    self.nodes.push(TrieNode::BranchRecency {
                        buckets: vec![(historical_max, hist_node), (MAX_TS, cur_node)],
                    });
                    return Ok((self.nodes.len() - 1) as u32);
                }
            }
        }
        let rel = self.rel.gather(&range.collect::<Vec<_>>());
        self.emit_leaf(&rel)
    }

    fn emit_leaf(&mut self, rel: &EventRel) -> Result<u32> {
        let page_idx = self.pages.len() as u32;
        self.pages.push(rel.to_batch(0..rel.len())?);
        let columns = leaf_columns(rel);
        self.nodes.push(TrieNode::Leaf {
            data_page_idx: page_idx,
            columns,
        });
        Ok((self.nodes.len() - 1) as u32)
    }
}

/// Column statistics for one leaf page: the fixed event columns plus one
/// entry per user document column present in the page.
fn leaf_columns(rel: &EventRel) -> Vec<ColumnMeta> {
    let rows = rel.len() as u64;

    let mut iid_bloom = IidBloom::new();
    for iid in &rel.iids {
        iid_bloom.add(iid);
    }
    let iid_bloom_bytes = iid_bloom.to_bytes();

    let mut sys_from = ColumnMeta {
        name: COL_SYSTEM_FROM.to_string(),
        count: rows,
        iid_bloom: Some(iid_bloom_bytes.clone()),
        ..Default::default()
    };
    let mut valid_from = ColumnMeta {
        name: COL_VALID_FROM.to_string(),
        count: rows,
        ..Default::default()
    };
    let mut valid_to = ColumnMeta {
        name: COL_VALID_TO.to_string(),
        count: rows,
        ..Default::default()
    };
    for i in 0..rel.len() {
        observe_int(&mut sys_from, rel.system_froms[i]);
        observe_int(&mut valid_from, rel.valid_froms[i]);
        observe_int(&mut valid_to, rel.valid_tos[i]);
    }

    // User columns: values first, blooms sized by what actually occurred.
    let mut doc_values: BTreeMap<&str, Vec<&Value>> = BTreeMap::new();
    for doc in rel.docs.iter().flatten() {
        for (name, value) in doc {
            doc_values.entry(name.as_str()).or_default().push(value);
        }
    }
    let mut columns = vec![
        ColumnMeta {
            name: COL_IID.to_string(),
            count: rows,
            iid_bloom: Some(iid_bloom_bytes),
            ..Default::default()
        },
        sys_from,
        valid_from,
        valid_to,
    ];
    for (name, values) in doc_values {
        let mut col = ColumnMeta {
            name: name.to_string(),
            root_col: true,
            ..Default::default()
        };
        let mut bloom = ColumnBloomFilter::new(values.len());
        for value in values {
            col.observe(value);
            if let Some(key) = value.bloom_key() {
                bloom.add(&key);
            }
        }
        col.bloom = Some(bloom.to_bytes());
        columns.push(col);
    }
    columns
}

fn observe_int(col: &mut ColumnMeta, v: i64) {
    col.min_int = Some(col.min_int.map_or(v, |m| m.min(v)));
    col.max_int = Some(col.max_int.map_or(v, |m| m.max(v)));
}

/// Open a published segment: read and validate its meta file.
pub async fn open_segment(pool: &BufferPool, table: &str, id: SegmentId) -> Result<SegmentHandle> {
    let bytes = pool.get(&meta_path(table, &id)).await?;
    let meta = SegmentMeta::decode(&bytes)?;
    Ok(SegmentHandle {
        table: table.to_string(),
        id,
        meta: Arc::new(meta),
    })
}

/// Decode one data page of an opened segment.
pub async fn read_page(
    pool: &BufferPool,
    handle: &SegmentHandle,
    page_idx: u32,
) -> Result<EventRel> {
    let bytes = pool.get(&handle.data_path()).await?;
    let mut reader = FileReader::try_new(Cursor::new(bytes), None)?;
    let batch = reader
        .nth(page_idx as usize)
        .ok_or(Error::PageOutOfRange(page_idx))??;
    pool.record_page_decode();
    EventRel::from_batch(&batch)
}
