//! Scan Cursor
//!
//! The pull-based read path: one cursor per query, one output batch per
//! merge task. For each task the cursor
//!
//! 1. opens the task's leaves - data pages through the buffer pool (pinned
//!    for the cursor's lifetime), live leaves materialized in merge order,
//! 2. seeds the merge queue with an event-row pointer per leaf,
//! 3. drains the queue through the polygon engine, newest-first per entity,
//! 4. keeps the polygon slices that intersect the query's temporal rectangle
//!    and are non-degenerate,
//! 5. applies the remaining row predicates and projects the surviving rows,
//!    with the four temporal columns appended.
//!
//! The cursor suspends only on buffer-pool fetches. Dropping it releases
//! every pin it took; close-at-any-time needs nothing more.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use timehouse_core::{Document, Iid, Predicate, TemporalBounds, Value};
use timehouse_storage::{read_page, BufferPool, EventRel};

use crate::error::Result;
use crate::live::{materialize_leaf, LiveNode};
use crate::plan::{MergeTask, PlanLeaf};
use crate::pointer::{EventPointer, MergeQueue};
use crate::polygon::{EventDisposition, PolygonEngine};

/// Output temporal columns appended to every projected row.
pub const COL_OUT_VALID_FROM: &str = "_valid_from";
pub const COL_OUT_VALID_TO: &str = "_valid_to";
pub const COL_OUT_SYSTEM_FROM: &str = "_system_from";
pub const COL_OUT_SYSTEM_TO: &str = "_system_to";

/// One projected output row.
pub type Row = BTreeMap<String, Value>;

/// One batch of output rows (the result of one merge task).
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub rows: Vec<Row>,
}

/// Lazy pull cursor over a table scan.
pub struct ScanCursor {
    pool: Arc<BufferPool>,
    tasks: VecDeque<MergeTask>,
    bounds: TemporalBounds,
    /// `None` projects every document column.
    projection: Option<Vec<String>>,
    predicates: Vec<Predicate>,
    selector: Option<Iid>,
    pinned: Vec<String>,
    /// Keeps the node's watermark accounting alive until the cursor closes.
    _reader_token: Arc<()>,
}

impl ScanCursor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pool: Arc<BufferPool>,
        tasks: Vec<MergeTask>,
        bounds: TemporalBounds,
        projection: Option<Vec<String>>,
        predicates: Vec<Predicate>,
        selector: Option<Iid>,
        reader_token: Arc<()>,
    ) -> Self {
        ScanCursor {
            pool,
            tasks: tasks.into(),
            bounds,
            projection,
            predicates,
            selector,
            pinned: Vec::new(),
            _reader_token: reader_token,
        }
    }

    /// Next non-empty batch, or `None` when the scan is exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<Batch>> {
        while let Some(task) = self.tasks.pop_front() {
            let rows = self.run_task(task).await?;
            if !rows.is_empty() {
                return Ok(Some(Batch { rows }));
            }
        }
        Ok(None)
    }

    /// Drain the whole cursor. Convenience for callers that want the full
    /// result set at once.
    pub async fn collect_rows(&mut self) -> Result<Vec<Row>> {
        let mut out = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            out.extend(batch.rows);
        }
        Ok(out)
    }

    async fn run_task(&mut self, task: MergeTask) -> Result<Vec<Row>> {
        let mut queue = MergeQueue::new(task.path.clone());
        for leaf in task.leaves {
            let rel = match leaf {
                PlanLeaf::Disk { handle, page_idx } => {
                    let path = handle.data_path();
                    self.pool.pin(&path);
                    self.pinned.push(path);
                    Arc::new(read_page(&self.pool, &handle, page_idx).await?)
                }
                PlanLeaf::Live { node } => Arc::new(match node.as_ref() {
                    LiveNode::Leaf { events } => materialize_leaf(events),
                    LiveNode::Branch { .. } => EventRel::new(),
                }),
            };
            queue.push_pointer(EventPointer::new(rel, &task.path));
        }

        let mut engine = PolygonEngine::new(self.bounds.sys_from_hi);
        let mut rows = Vec::new();
        while let Some((pointer_idx, row_idx)) = queue.pop() {
            let rel = queue.pointer(pointer_idx).rel();
            let iid = rel.iids[row_idx];
            if let Some(selector) = &self.selector {
                // a fixed iid isolates the entity: other entities cannot
                // shape its ceiling, so they are skipped wholesale
                if iid != *selector {
                    continue;
                }
            }
            let kind = rel.op_kind(row_idx)?;
            let system_from = rel.system_froms[row_idx];
            let disposition = engine.on_event(
                iid,
                system_from,
                kind,
                rel.valid_froms[row_idx],
                rel.valid_tos[row_idx],
            );
            let emit = match disposition {
                EventDisposition::Polygon { emit, .. } => emit,
                _ => continue,
            };
            if emit.is_empty() {
                continue;
            }
            let doc = rel.docs[row_idx].as_ref();
            if !self
                .predicates
                .iter()
                .all(|p| p.matches(doc.and_then(|d| d.get(p.column()))))
            {
                continue;
            }
            for (valid_from, valid_to, system_to) in emit {
                if valid_from >= valid_to || system_from >= system_to {
                    continue;
                }
                if !self
                    .bounds
                    .accepts(valid_from, valid_to, system_from, system_to)
                {
                    continue;
                }
                rows.push(project_row(
                    doc,
                    self.projection.as_deref(),
                    valid_from,
                    valid_to,
                    system_from,
                    system_to,
                ));
            }
        }
        Ok(rows)
    }
}

impl Drop for ScanCursor {
    fn drop(&mut self) {
        for path in &self.pinned {
            self.pool.unpin(path);
        }
    }
}

fn project_row(
    doc: Option<&Document>,
    projection: Option<&[String]>,
    valid_from: i64,
    valid_to: i64,
    system_from: i64,
    system_to: i64,
) -> Row {
    let mut row = Row::new();
    if let Some(doc) = doc {
        match projection {
            None => {
                for (k, v) in doc {
                    row.insert(k.clone(), v.clone());
                }
            }
            Some(columns) => {
                for column in columns {
                    if let Some(v) = doc.get(column) {
                        row.insert(column.clone(), v.clone());
                    }
                }
            }
        }
    }
    row.insert(COL_OUT_VALID_FROM.to_string(), Value::Int(valid_from));
    row.insert(COL_OUT_VALID_TO.to_string(), Value::Int(valid_to));
    row.insert(COL_OUT_SYSTEM_FROM.to_string(), Value::Int(system_from));
    row.insert(COL_OUT_SYSTEM_TO.to_string(), Value::Int(system_to));
    row
}
