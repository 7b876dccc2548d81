//! Node Surface
//!
//! The coordinator a process embeds: it owns the per-table live tries, the
//! buffer pool, the segment lists and the compactor, and exposes the write
//! and read paths the front ends consume.
//!
//! ## Architecture
//!
//! ```text
//! Node
//!  ├─ tables: { "orders" ─ TableState { live trie, segment handles } }
//!  ├─ BufferPool ───────── object store (segment files)
//!  ├─ Compactor (single-flight)
//!  └─ tx state (monotonic system time, watch channel for await_tx)
//! ```
//!
//! ## Write path
//!
//! `submit_tx` resolves `call` ops through the registered transaction
//! functions, validates every operation up front (no partial state on
//! error), assigns the next strictly-monotonic system time, and appends one
//! event per op to the owning table's live trie under the write latch. A
//! table whose live rows reach the chunk limit is flushed to a level-0
//! segment in the same critical section.
//!
//! ## Read path
//!
//! `open_query` optionally waits for the indexer to reach `after_tx`, fixes
//! the basis, resolves the temporal clauses to bounds, takes a watermark
//! (current segment set + frozen live trie) under the read latch, plans the
//! merge tasks, and hands back a pull cursor. The watermark keeps garbage
//! collection away from the cursor's segments until it is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{watch, Mutex, RwLock};

use timehouse_core::event::{prepare_document, ID_COLUMN_NORMALIZED};
use timehouse_core::{
    normalize_name, Basis, Document, EntityId, Event, EventOp, Iid, Predicate, TemporalBounds,
    TemporalClause, TxOp, Value, MAX_TS,
};
use timehouse_storage::{
    build_segment, current_set, data_path, meta_path, open_segment, BufferPool, BuildOptions,
    EventRel, SegmentHandle, SegmentId,
};

use crate::compact::{CompactionConfig, CompactionResult, Compactor};
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::live::LiveTrie;
use crate::plan::{plan_tasks, PlanContext, TrieSource};
use crate::scan::ScanCursor;

/// Identity of a committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxKey {
    pub tx_id: u64,
    pub system_time: i64,
}

/// A table scan as the (external) planner hands it to the core.
#[derive(Debug, Clone)]
pub struct ScanQuery {
    pub table: String,
    /// `None` projects every document column.
    pub projection: Option<Vec<String>>,
    pub predicates: Vec<Predicate>,
    pub valid_time: TemporalClause,
    pub system_time: TemporalClause,
}

impl ScanQuery {
    pub fn table(name: impl Into<String>) -> Self {
        ScanQuery {
            table: name.into(),
            projection: None,
            predicates: Vec::new(),
            valid_time: TemporalClause::Default,
            system_time: TemporalClause::Default,
        }
    }

    pub fn project(mut self, columns: &[&str]) -> Self {
        self.projection = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn valid_time(mut self, clause: TemporalClause) -> Self {
        self.valid_time = clause;
        self
    }

    pub fn system_time(mut self, clause: TemporalClause) -> Self {
        self.system_time = clause;
        self
    }
}

/// Per-query options.
#[derive(Debug, Clone, Default)]
pub struct QueryOpts {
    pub basis: Basis,
    /// Wait until this transaction is indexed before planning.
    pub after_tx: Option<u64>,
    /// Bound on the `after_tx` wait; exceeding it fails the query.
    pub tx_timeout: Option<Duration>,
    pub default_all_valid_time: bool,
}

type TxFn = Arc<dyn Fn(&[Value]) -> timehouse_core::Result<Vec<TxOp>> + Send + Sync>;

const MAX_CALL_DEPTH: usize = 8;

struct TableState {
    live: LiveTrie,
    /// Every published handle we know of, current or awaiting gc.
    segments: Vec<Arc<SegmentHandle>>,
    flushed_rows: u64,
}

struct TxState {
    last_tx_id: u64,
    last_system_time: i64,
}

/// An embedded timehouse node.
pub struct Node {
    pool: Arc<BufferPool>,
    config: NodeConfig,
    tables: RwLock<HashMap<String, TableState>>,
    tx_state: Mutex<TxState>,
    latest_tx: watch::Sender<u64>,
    tx_fns: std::sync::RwLock<HashMap<String, TxFn>>,
    compactor: Compactor,
    reader_token: Arc<()>,
}

fn now_micros() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_micros() as i64
}

impl Node {
    pub fn new(
        store: Arc<dyn object_store::ObjectStore>,
        config: NodeConfig,
    ) -> timehouse_core::Result<Self> {
        config.validate()?;
        let pool = Arc::new(BufferPool::new(store, config.buffer_pool_capacity_bytes));
        let compactor = Compactor::new(
            pool.clone(),
            CompactionConfig {
                fan_in: config.compactor_fan_in,
                page_size: config.page_size_rows,
            },
        );
        let (latest_tx, _) = watch::channel(0u64);
        Ok(Node {
            pool,
            config,
            tables: RwLock::new(HashMap::new()),
            tx_state: Mutex::new(TxState {
                last_tx_id: 0,
                last_system_time: 0,
            }),
            latest_tx,
            tx_fns: std::sync::RwLock::new(HashMap::new()),
            compactor,
            reader_token: Arc::new(()),
        })
    }

    /// The shared buffer pool (its counters drive the pushdown tests).
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Register a transaction function invocable through [`TxOp::Call`].
    pub fn register_tx_fn<F>(&self, fn_id: impl Into<String>, f: F)
    where
        F: Fn(&[Value]) -> timehouse_core::Result<Vec<TxOp>> + Send + Sync + 'static,
    {
        self.tx_fns
            .write()
            .expect("tx fn registry poisoned")
            .insert(fn_id.into(), Arc::new(f));
    }

    // -----------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------

    /// Submit a transaction; the node assigns the next monotonic system time.
    pub async fn submit_tx(&self, ops: Vec<TxOp>) -> Result<TxKey> {
        self.submit_internal(ops, None).await
    }

    /// Submit with an explicit system time (the transaction-log replay entry
    /// point). A time at or before the last committed transaction conflicts.
    pub async fn submit_tx_at(&self, ops: Vec<TxOp>, system_time: i64) -> Result<TxKey> {
        self.submit_internal(ops, Some(system_time)).await
    }

    async fn submit_internal(&self, ops: Vec<TxOp>, explicit: Option<i64>) -> Result<TxKey> {
        let ops = self.resolve_calls(ops, 0)?;

        let mut tx_state = self.tx_state.lock().await;
        let system_time = match explicit {
            Some(t) => {
                if t <= tx_state.last_system_time {
                    return Err(Error::conflict(format!(
                        "system time {} is not after the last committed {}",
                        t, tx_state.last_system_time
                    )));
                }
                t
            }
            None => now_micros().max(tx_state.last_system_time + 1),
        };

        // Validate and lower everything before touching any table: an error
        // here leaves no partial state behind.
        let events = lower_ops(&ops, system_time)?;

        let mut tables = self.tables.write().await;
        let mut touched: HashSet<String> = HashSet::new();
        for (table, _) in &events {
            if touched.insert(table.clone()) {
                self.ensure_table(&mut tables, table).await?;
            }
        }
        for (table, event) in events {
            let state = tables.get_mut(&table).expect("table ensured above");
            state.live.append(event);
        }
        for table in &touched {
            let state = tables.get_mut(table).expect("table ensured above");
            if state.live.row_count() >= self.config.chunk_row_limit {
                self.flush_state(table, state).await?;
            }
        }
        drop(tables);

        tx_state.last_tx_id += 1;
        tx_state.last_system_time = system_time;
        let tx_id = tx_state.last_tx_id;
        drop(tx_state);
        // send_replace: the committed id must advance even with no waiter
        self.latest_tx.send_replace(tx_id);
        Ok(TxKey { tx_id, system_time })
    }

    fn resolve_calls(&self, ops: Vec<TxOp>, depth: usize) -> Result<Vec<TxOp>> {
        if depth > MAX_CALL_DEPTH {
            return Err(Error::invalid_argument(
                "transaction function call depth exceeded",
            ));
        }
        let mut out = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                TxOp::Call { fn_id, args } => {
                    let f = self
                        .tx_fns
                        .read()
                        .expect("tx fn registry poisoned")
                        .get(&fn_id)
                        .cloned()
                        .ok_or_else(|| {
                            Error::invalid_argument(format!("unknown transaction function '{}'", fn_id))
                        })?;
                    let produced = f(&args).map_err(Error::Core)?;
                    out.extend(self.resolve_calls(produced, depth + 1)?);
                }
                other => out.push(other),
            }
        }
        Ok(out)
    }

    /// Wait until the indexer has committed `tx_id`.
    pub async fn await_tx(&self, tx_id: u64, timeout: Option<Duration>) -> Result<()> {
        let mut rx = self.latest_tx.subscribe();
        let wait = rx.wait_for(|&latest| latest >= tx_id);
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| Error::timeout(format!("await_tx({}) exceeded {:?}", tx_id, limit)))?,
            None => wait.await,
        };
        outcome.map_err(|_| Error::timeout("transaction watch closed"))?;
        Ok(())
    }

    /// Flush a table's chunk to a level-0 segment.
    pub async fn flush_table(&self, table: &str) -> Result<()> {
        let table = normalize_name(table);
        let mut tables = self.tables.write().await;
        if let Some(state) = tables.get_mut(&table) {
            self.flush_state(&table, state).await?;
        }
        Ok(())
    }

    pub async fn flush_all(&self) -> Result<()> {
        let mut tables = self.tables.write().await;
        let names: Vec<String> = tables.keys().cloned().collect();
        for name in names {
            let state = tables.get_mut(&name).expect("key just listed");
            self.flush_state(&name, state).await?;
        }
        Ok(())
    }

    async fn flush_state(&self, table: &str, state: &mut TableState) -> Result<()> {
        if state.live.is_empty() {
            return Ok(());
        }
        let events = state.live.snapshot().sorted_events();
        let rel = EventRel::from_events(&events);
        let id = SegmentId {
            level: 0,
            first_row: state.flushed_rows,
            next_row: state.flushed_rows + rel.len() as u64,
        };
        let (meta, data) = build_segment(
            table,
            id,
            &rel,
            &BuildOptions {
                page_size: self.config.page_size_rows,
                split_recency: false,
            },
        )?;
        self.pool
            .put(&meta_path(table, &id), Bytes::from(meta.encode()?))
            .await?;
        self.pool.put(&data_path(table, &id), data).await?;
        state.segments.push(Arc::new(SegmentHandle {
            table: table.to_string(),
            id,
            meta: Arc::new(meta),
        }));
        state.flushed_rows = id.next_row;
        state.live.reset();
        tracing::info!(table = %table, rows = rel.len(), next_row = id.next_row, "flushed chunk to level 0");
        Ok(())
    }

    async fn ensure_table(
        &self,
        tables: &mut HashMap<String, TableState>,
        table: &str,
    ) -> Result<()> {
        if tables.contains_key(table) {
            return Ok(());
        }
        // first touch: adopt whatever is already published for this table
        let ids = self.pool.list_segments(table).await?;
        let mut segments = Vec::with_capacity(ids.len());
        let mut flushed_rows = 0;
        for id in ids {
            segments.push(Arc::new(open_segment(&self.pool, table, id).await?));
            flushed_rows = flushed_rows.max(id.next_row);
        }
        tables.insert(
            table.to_string(),
            TableState {
                live: LiveTrie::new(self.config.live_leaf_split_rows),
                segments,
                flushed_rows,
            },
        );
        Ok(())
    }

    // -----------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------

    /// Open a lazy cursor over a table scan.
    pub async fn open_query(&self, query: ScanQuery, opts: QueryOpts) -> Result<ScanCursor> {
        if let Some(after) = opts.after_tx {
            self.await_tx(after, opts.tx_timeout).await?;
        }

        let latest_system_time = self.tx_state.lock().await.last_system_time;
        let basis_system_time = opts.basis.at_system_time.unwrap_or(latest_system_time);
        let current_time = opts.basis.current_time.unwrap_or_else(now_micros);
        let bounds = TemporalBounds::resolve(
            query.valid_time,
            query.system_time,
            basis_system_time,
            current_time,
            opts.default_all_valid_time,
        )
        .map_err(Error::Core)?;

        let table = normalize_name(&query.table);
        let projection: Option<Vec<String>> = query
            .projection
            .map(|columns| columns.iter().map(|c| normalize_name(c)).collect());
        let predicates: Vec<Predicate> = query
            .predicates
            .into_iter()
            .map(normalize_predicate)
            .collect();
        let selector = extract_iid_selector(&predicates)?;

        // watermark: current segment set + frozen live trie
        let (handles, live) = {
            let mut tables = self.tables.write().await;
            self.ensure_table(&mut tables, &table).await?;
            let state = tables.get(&table).expect("table ensured above");
            let ids: Vec<SegmentId> = state.segments.iter().map(|h| h.id).collect();
            let current: HashSet<SegmentId> = current_set(&ids).into_iter().collect();
            let handles: Vec<Arc<SegmentHandle>> = state
                .segments
                .iter()
                .filter(|h| current.contains(&h.id))
                .cloned()
                .collect();
            (handles, state.live.snapshot())
        };

        let mut sources: Vec<TrieSource> = handles.into_iter().map(TrieSource::Disk).collect();
        sources.push(TrieSource::Live(live));
        let tasks = plan_tasks(
            &sources,
            &PlanContext {
                selector: selector.as_ref(),
                predicates: &predicates,
                bounds: &bounds,
                use_pushdown: true,
            },
        )?;
        Ok(ScanCursor::new(
            self.pool.clone(),
            tasks,
            bounds,
            projection,
            predicates,
            selector,
            self.reader_token.clone(),
        ))
    }

    // -----------------------------------------------------------------
    // Compaction & garbage collection
    // -----------------------------------------------------------------

    /// Run one compaction step for a table.
    pub async fn compact_once(&self, table: &str) -> Result<Option<CompactionResult>> {
        let table = normalize_name(table);
        let result = self.compactor.compact_once(&table).await?;
        if result.is_some() {
            self.refresh_table(&table).await?;
        }
        Ok(result)
    }

    /// Compact a table until no group remains at any level.
    pub async fn compact_all_table(&self, table: &str) -> Result<Vec<CompactionResult>> {
        let table = normalize_name(table);
        let results = self.compactor.compact_all(&table).await;
        self.refresh_table(&table).await?;
        Ok(results)
    }

    /// Compact every known table.
    pub async fn compact_all(&self) -> Result<Vec<CompactionResult>> {
        let names: Vec<String> = self.tables.read().await.keys().cloned().collect();
        let mut results = Vec::new();
        for name in names {
            results.extend(self.compact_all_table(&name).await?);
        }
        Ok(results)
    }

    async fn refresh_table(&self, table: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        let Some(state) = tables.get_mut(table) else {
            return Ok(());
        };
        let ids = self.pool.list_segments(table).await?;
        for id in ids {
            if !state.segments.iter().any(|h| h.id == id) {
                state
                    .segments
                    .push(Arc::new(open_segment(&self.pool, table, id).await?));
            }
        }
        Ok(())
    }

    /// Delete segment files covered by higher levels, once no in-flight
    /// reader can still hold a watermark over them.
    pub async fn gc(&self) -> Result<usize> {
        if Arc::strong_count(&self.reader_token) > 1 {
            tracing::debug!("gc deferred: cursors in flight");
            return Ok(0);
        }
        let mut removed = 0;
        let mut tables = self.tables.write().await;
        for (name, state) in tables.iter_mut() {
            let ids: Vec<SegmentId> = state.segments.iter().map(|h| h.id).collect();
            let current: HashSet<SegmentId> = current_set(&ids).into_iter().collect();
            let mut keep = Vec::with_capacity(state.segments.len());
            for handle in state.segments.drain(..) {
                if current.contains(&handle.id) {
                    keep.push(handle);
                } else {
                    self.pool.delete(&meta_path(name, &handle.id)).await?;
                    self.pool.delete(&data_path(name, &handle.id)).await?;
                    removed += 1;
                    tracing::info!(table = %name, segment = %handle.id.file_name(), "collected covered segment");
                }
            }
            state.segments = keep;
        }
        Ok(removed)
    }
}

/// Lower validated ops to `(table, event)` pairs.
fn lower_ops(ops: &[TxOp], system_time: i64) -> Result<Vec<(String, Event)>> {
    let mut out = Vec::with_capacity(ops.len());
    for op in ops {
        match op {
            TxOp::Put {
                table,
                doc,
                valid_from,
                valid_to,
            } => {
                let (entity, doc) = prepare_document(doc).map_err(Error::Core)?;
                let (valid_from, valid_to) =
                    validity_window(*valid_from, *valid_to, system_time)?;
                out.push((
                    normalize_name(table),
                    Event {
                        iid: entity.iid(),
                        system_from: system_time,
                        op: EventOp::Put {
                            doc,
                            valid_from,
                            valid_to,
                        },
                    },
                ));
            }
            TxOp::Delete {
                table,
                id,
                valid_from,
                valid_to,
            } => {
                let (valid_from, valid_to) =
                    validity_window(*valid_from, *valid_to, system_time)?;
                out.push((
                    normalize_name(table),
                    Event {
                        iid: id.iid(),
                        system_from: system_time,
                        op: EventOp::Delete {
                            valid_from,
                            valid_to,
                        },
                    },
                ));
            }
            TxOp::Erase { table, id } => {
                out.push((
                    normalize_name(table),
                    Event {
                        iid: id.iid(),
                        system_from: system_time,
                        op: EventOp::Erase,
                    },
                ));
            }
            TxOp::Call { fn_id, .. } => {
                return Err(Error::invalid_argument(format!(
                    "unresolved call to '{}' reached the indexer",
                    fn_id
                )));
            }
        }
    }
    Ok(out)
}

fn validity_window(
    valid_from: Option<i64>,
    valid_to: Option<i64>,
    system_time: i64,
) -> Result<(i64, i64)> {
    let valid_from = valid_from.unwrap_or(system_time);
    let valid_to = valid_to.unwrap_or(MAX_TS);
    if valid_from >= valid_to {
        return Err(Error::invalid_argument(format!(
            "valid_from {} must precede valid_to {}",
            valid_from, valid_to
        )));
    }
    Ok((valid_from, valid_to))
}

fn normalize_predicate(predicate: Predicate) -> Predicate {
    match predicate {
        Predicate::Eq(c, v) => Predicate::Eq(normalize_name(&c), v),
        Predicate::Lt(c, v) => Predicate::Lt(normalize_name(&c), v),
        Predicate::Le(c, v) => Predicate::Le(normalize_name(&c), v),
        Predicate::Gt(c, v) => Predicate::Gt(normalize_name(&c), v),
        Predicate::Ge(c, v) => Predicate::Ge(normalize_name(&c), v),
    }
}

/// An `xt$id` equality predicate fixes the entity, enabling path pruning.
fn extract_iid_selector(predicates: &[Predicate]) -> Result<Option<Iid>> {
    for predicate in predicates {
        if let Predicate::Eq(column, value) = predicate {
            if column == ID_COLUMN_NORMALIZED {
                let entity = EntityId::from_value(value).map_err(Error::Core)?;
                return Ok(Some(entity.iid()));
            }
        }
    }
    Ok(None)
}

/// Convenience: build a document from literal pairs.
pub fn doc(pairs: &[(&str, Value)]) -> Document {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lower_ops_validates_before_applying() {
        // second op is invalid: nothing should be produced
        let ops = vec![
            TxOp::put("t", doc(&[("xt/id", Value::Int(1))])),
            TxOp::put_valid("t", doc(&[("xt/id", Value::Int(2))]), Some(10), Some(10)),
        ];
        assert!(lower_ops(&ops, 1_000).is_err());
    }

    #[test]
    fn test_lower_ops_defaults_validity_to_system_time() {
        let ops = vec![TxOp::put("t", doc(&[("xt/id", Value::Int(1))]))];
        let events = lower_ops(&ops, 1_000).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0].1.op {
            EventOp::Put {
                valid_from,
                valid_to,
                ..
            } => {
                assert_eq!(*valid_from, 1_000);
                assert_eq!(*valid_to, MAX_TS);
            }
            other => panic!("expected put, got {:?}", other),
        }
    }

    #[test]
    fn test_extract_iid_selector() {
        let predicates = vec![
            Predicate::Gt("qty".into(), Value::Int(1)),
            Predicate::Eq("xt$id".into(), Value::Int(7)),
        ];
        let selector = extract_iid_selector(&predicates).unwrap().unwrap();
        assert_eq!(selector, EntityId::Int(7).iid());
        assert!(extract_iid_selector(&[]).unwrap().is_none());
        // an unhashable id value is an argument error, not a silent scan
        let bad = vec![Predicate::Eq("xt$id".into(), Value::Null)];
        assert!(extract_iid_selector(&bad).is_err());
    }
}
