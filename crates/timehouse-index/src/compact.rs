//! Compactor
//!
//! Merges groups of same-level segments into the next level up. Level-0
//! segments are chunk flushes; every level above is a fan-in-wide merge of
//! the level below, so the segment count per level stays bounded and a scan
//! co-reads a logarithmic number of tries.
//!
//! ## One step
//!
//! 1. Select: within the lowest level holding at least `fan_in` current
//!    files, take the first `fan_in` by ascending `next_row`.
//! 2. Merge: walk the four tries with the planner (pushdown off - every row
//!    must move), drain each task through the merge queue in
//!    `(iid asc, system_from desc)` order, and run the polygon engine to
//!    stamp each surviving row's `_recency` - the greatest `system_to` its
//!    window reaches, `MAX_TS` while it is still live anywhere. Events of an
//!    erased entity are dropped; the erase row itself is kept, because older
//!    history can still live in segments outside this group.
//! 3. Publish: write the level `L+1` segment covering
//!    `[first.first_row, last.next_row)`. Readers pick it up through
//!    current-set selection; the inputs become garbage once no watermark can
//!    reference them.
//!
//! Only one compaction job runs at a time; `compact_all` repeats steps until
//! no group remains at any level. A failed job is logged and abandoned - the
//! next call re-attempts from scratch, inputs untouched.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use timehouse_core::{TemporalBounds, MAX_TS};
use timehouse_storage::{
    build_segment, current_set, data_path, meta_path, open_segment, read_page, BufferPool,
    BuildOptions, EventRel, SegmentId,
};

use crate::error::Result;
use crate::plan::{plan_tasks, MergeTask, PlanContext, PlanLeaf, TrieSource};
use crate::pointer::{EventPointer, MergeQueue};
use crate::polygon::{EventDisposition, PolygonEngine};

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Segments merged per step (default: 4).
    pub fan_in: usize,
    /// Rows per output data page (default: 256).
    pub page_size: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        CompactionConfig {
            fan_in: 4,
            page_size: 256,
        }
    }
}

/// What one compaction step did.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub table: String,
    pub output: SegmentId,
    pub inputs: Vec<SegmentId>,
    pub rows_in: u64,
    pub rows_out: u64,
}

/// Single-flight compaction driver for a node.
pub struct Compactor {
    pool: Arc<BufferPool>,
    config: CompactionConfig,
    job_guard: Mutex<()>,
}

impl Compactor {
    pub fn new(pool: Arc<BufferPool>, config: CompactionConfig) -> Self {
        Compactor {
            pool,
            config,
            job_guard: Mutex::new(()),
        }
    }

    /// Run at most one compaction step for the table. `Ok(None)` means no
    /// level holds a full group.
    pub async fn compact_once(&self, table: &str) -> Result<Option<CompactionResult>> {
        let _job = self.job_guard.lock().await;
        let all = self.pool.list_segments(table).await?;
        let current = current_set(&all);
        let Some(group) = select_group(&current, self.config.fan_in) else {
            return Ok(None);
        };
        let result = self.merge_group(table, &group).await?;
        Ok(Some(result))
    }

    /// Repeat until no group of `fan_in` remains at any level. A failing
    /// step aborts only itself; what it had not yet merged is untouched.
    pub async fn compact_all(&self, table: &str) -> Vec<CompactionResult> {
        let mut results = Vec::new();
        loop {
            match self.compact_once(table).await {
                Ok(Some(result)) => results.push(result),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(table = %table, error = %e, "compaction job failed");
                    break;
                }
            }
        }
        results
    }

    async fn merge_group(&self, table: &str, group: &[SegmentId]) -> Result<CompactionResult> {
        let mut handles = Vec::with_capacity(group.len());
        for id in group {
            handles.push(Arc::new(open_segment(&self.pool, table, *id).await?));
        }
        let bounds = TemporalBounds::unbounded();
        let sources: Vec<TrieSource> = handles
            .iter()
            .map(|h| TrieSource::Disk(h.clone()))
            .collect();
        let tasks = plan_tasks(
            &sources,
            &PlanContext {
                selector: None,
                predicates: &[],
                bounds: &bounds,
                use_pushdown: false,
            },
        )?;

        let mut out = EventRel::with_recency();
        let mut rows_in = 0u64;
        for task in tasks {
            rows_in += self.merge_task(task, &mut out).await?;
        }

        let output = SegmentId {
            level: group[0].level + 1,
            first_row: group[0].first_row,
            next_row: group[group.len() - 1].next_row,
        };
        // inputs that already carry recency produce recency-split leaves
        let split_recency = group[0].level >= 1;
        let (meta, data) = build_segment(
            table,
            output,
            &out,
            &BuildOptions {
                page_size: self.config.page_size,
                split_recency,
            },
        )?;
        self.pool
            .put(&meta_path(table, &output), Bytes::from(meta.encode()?))
            .await?;
        self.pool.put(&data_path(table, &output), data).await?;

        tracing::info!(
            table = %table,
            level = output.level,
            rows_in,
            rows_out = out.len(),
            inputs = group.len(),
            "published compacted segment"
        );
        Ok(CompactionResult {
            table: table.to_string(),
            output,
            inputs: group.to_vec(),
            rows_in,
            rows_out: out.len() as u64,
        })
    }

    async fn merge_task(&self, task: MergeTask, out: &mut EventRel) -> Result<u64> {
        let mut queue = MergeQueue::new(task.path.clone());
        for leaf in task.leaves {
            if let PlanLeaf::Disk { handle, page_idx } = leaf {
                let rel = Arc::new(read_page(&self.pool, &handle, page_idx).await?);
                queue.push_pointer(EventPointer::new(rel, &task.path));
            }
        }
        let mut engine = PolygonEngine::new(MAX_TS);
        let mut rows_in = 0u64;
        while let Some((pointer_idx, row)) = queue.pop() {
            rows_in += 1;
            let rel = queue.pointer(pointer_idx).rel();
            let kind = rel.op_kind(row)?;
            let disposition = engine.on_event(
                rel.iids[row],
                rel.system_froms[row],
                kind,
                rel.valid_froms[row],
                rel.valid_tos[row],
            );
            match disposition {
                // entity erased by a newer event: physically redacted here
                EventDisposition::Skipped => {}
                // erase rows survive: older history may live outside this group
                EventDisposition::Erase => out.push_row_with_recency(rel, row, MAX_TS),
                EventDisposition::Polygon { recency, .. } => {
                    out.push_row_with_recency(rel, row, recency)
                }
                EventDisposition::OutOfRange => {}
            }
        }
        Ok(rows_in)
    }
}

/// Lowest level first; within a level ascending by `next_row`.
fn select_group(current: &[SegmentId], fan_in: usize) -> Option<Vec<SegmentId>> {
    let mut by_level: BTreeMap<u8, Vec<SegmentId>> = BTreeMap::new();
    for id in current {
        by_level.entry(id.level).or_default().push(*id);
    }
    for (_, mut ids) in by_level {
        ids.sort_by_key(|id| id.next_row);
        if ids.len() >= fan_in {
            ids.truncate(fan_in);
            return Some(ids);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use std::cmp::Reverse;
    use timehouse_core::{Document, EntityId, Event, EventOp, Value};

    fn put(id: i64, sys: i64, v: i64) -> Event {
        let mut doc = Document::new();
        doc.insert("xt$id".to_string(), Value::Int(id));
        doc.insert("v".to_string(), Value::Int(v));
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

    async fn publish_l0(pool: &BufferPool, first_row: u64, events: Vec<Event>) -> SegmentId {
        let mut events = events;
        events.sort_by_key(|e| (e.iid, Reverse(e.system_from)));
        let rel = EventRel::from_events(&events);
        let id = SegmentId {
            level: 0,
            first_row,
            next_row: first_row + rel.len() as u64,
        };
        let (meta, data) = build_segment("t", id, &rel, &BuildOptions::default()).unwrap();
        pool.put(&meta_path("t", &id), Bytes::from(meta.encode().unwrap()))
            .await
            .unwrap();
        pool.put(&data_path("t", &id), data).await.unwrap();
        id
    }

    fn pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::new(Arc::new(InMemory::new()), 1 << 24))
    }

    // ---------------------------------------------------------------
    // Selection
    // ---------------------------------------------------------------

    #[test]
    fn test_select_group_needs_full_fan_in() {
        let ids: Vec<SegmentId> = (0..3)
            .map(|i| SegmentId {
                level: 0,
                first_row: i * 10,
                next_row: (i + 1) * 10,
            })
            .collect();
        assert!(select_group(&ids, 4).is_none());
        let ids: Vec<SegmentId> = (0..5)
            .map(|i| SegmentId {
                level: 0,
                first_row: i * 10,
                next_row: (i + 1) * 10,
            })
            .collect();
        let group = select_group(&ids, 4).unwrap();
        assert_eq!(group.len(), 4);
        assert_eq!(group[0].first_row, 0);
        assert_eq!(group[3].next_row, 40);
    }

    #[test]
    fn test_select_group_prefers_lowest_level() {
        let mut ids: Vec<SegmentId> = (0..4)
            .map(|i| SegmentId {
                level: 1,
                first_row: i * 100,
                next_row: (i + 1) * 100,
            })
            .collect();
        ids.extend((4..8).map(|i| SegmentId {
            level: 0,
            first_row: i * 100,
            next_row: (i + 1) * 100,
        }));
        let group = select_group(&ids, 4).unwrap();
        assert!(group.iter().all(|id| id.level == 0));
    }

    // ---------------------------------------------------------------
    // One step
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_compact_once_merges_four_l0() {
        let pool = pool();
        let mut first_row = 0;
        for chunk in 0..4 {
            let events = (0..10).map(|i| put(i, 1_000 * (chunk + 1) + i, chunk)).collect();
            publish_l0(&pool, first_row, events).await;
            first_row += 10;
        }
        let compactor = Compactor::new(pool.clone(), CompactionConfig::default());
        let result = compactor.compact_once("t").await.unwrap().unwrap();
        assert_eq!(result.output.level, 1);
        assert_eq!(result.output.first_row, 0);
        assert_eq!(result.output.next_row, 40);
        assert_eq!(result.rows_in, 40);
        assert_eq!(result.rows_out, 40);

        // inputs drop out of the current set
        let all = pool.list_segments("t").await.unwrap();
        let current = current_set(&all);
        assert_eq!(current, vec![result.output]);

        // nothing else to do
        assert!(compactor.compact_once("t").await.unwrap().is_none());
    }

    fn put_window(id: i64, sys: i64, vf: i64, vt: i64) -> Event {
        let mut doc = Document::new();
        doc.insert("xt$id".to_string(), Value::Int(id));
        Event {
            iid: EntityId::Int(id).iid(),
            system_from: sys,
            op: EventOp::Put {
                doc,
                valid_from: vf,
                valid_to: vt,
            },
        }
    }

    #[tokio::test]
    async fn test_compacted_rows_are_sorted_with_recency() {
        let pool = pool();
        let mut first_row = 0;
        for chunk in 0..4i64 {
            // same entities rewritten over the same valid window in every
            // chunk, so each newer version fully supersedes the older one
            let events = (0..5)
                .map(|i| put_window(i, 1_000 * (chunk + 1) + i, 0, 1_000_000))
                .collect();
            publish_l0(&pool, first_row, events).await;
            first_row += 5;
        }
        let compactor = Compactor::new(pool.clone(), CompactionConfig::default());
        let result = compactor.compact_once("t").await.unwrap().unwrap();

        let handle = open_segment(&pool, "t", result.output).await.unwrap();
        for (_, page_idx) in handle.meta.leaves().unwrap() {
            let page = read_page(&pool, &handle, page_idx).await.unwrap();
            assert!(page.is_sorted());
            let recencies = page.recencies.as_ref().expect("compacted page has recency");
            for row in 0..page.len() {
                // the newest version of each entity is still live
                let newest = page
                    .iids
                    .iter()
                    .enumerate()
                    .filter(|(_, iid)| **iid == page.iids[row])
                    .map(|(i, _)| page.system_froms[i])
                    .max()
                    .expect("row exists");
                if page.system_froms[row] == newest {
                    assert_eq!(recencies[row], MAX_TS);
                } else {
                    assert!(recencies[row] < MAX_TS, "superseded row must have bounded recency");
                }
            }
        }
    }

    #[tokio::test]
    async fn test_erased_entities_are_redacted_by_compaction() {
        let pool = pool();
        publish_l0(&pool, 0, vec![put(1, 100, 1), put(2, 110, 2)]).await;
        publish_l0(&pool, 2, vec![put(1, 200, 10)]).await;
        publish_l0(
            &pool,
            3,
            vec![Event {
                iid: EntityId::Int(1).iid(),
                system_from: 300,
                op: EventOp::Erase,
            }],
        )
        .await;
        publish_l0(&pool, 4, vec![put(3, 400, 3)]).await;

        let compactor = Compactor::new(pool.clone(), CompactionConfig::default());
        let result = compactor.compact_once("t").await.unwrap().unwrap();
        // entity 1's two puts are gone; the erase row and entities 2, 3 remain
        assert_eq!(result.rows_in, 5);
        assert_eq!(result.rows_out, 3);

        let handle = open_segment(&pool, "t", result.output).await.unwrap();
        let erased = EntityId::Int(1).iid();
        for (_, page_idx) in handle.meta.leaves().unwrap() {
            let page = read_page(&pool, &handle, page_idx).await.unwrap();
            for row in 0..page.len() {
                if page.iids[row] == erased {
                    assert_eq!(
                        page.op_kind(row).unwrap(),
                        timehouse_core::OpKind::Erase,
                        "only the erase tombstone may survive"
                    );
                }
            }
        }
    }

    #[tokio::test]
    async fn test_compact_all_climbs_levels() {
        let pool = pool();
        let mut first_row = 0;
        for chunk in 0..16i64 {
            let events = (0..4).map(|i| put(i + chunk * 4, 1_000 * (chunk + 1) + i, chunk)).collect();
            publish_l0(&pool, first_row, events).await;
            first_row += 4;
        }
        let compactor = Compactor::new(pool.clone(), CompactionConfig::default());
        let results = compactor.compact_all("t").await;
        // 16 L0 -> 4 L1 -> 1 L2
        assert_eq!(results.len(), 5);
        let all = pool.list_segments("t").await.unwrap();
        let current = current_set(&all);
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].level, 2);
        assert_eq!(current[0].next_row, 64);
    }
}
