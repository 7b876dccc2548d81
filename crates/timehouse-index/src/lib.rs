//! Timehouse Index
//!
//! The read/write path of the bitemporal store: everything between a
//! submitted transaction and a projected query row.
//!
//! ## Data flow
//!
//! ```text
//! submit_tx ──► live trie (per table, in memory)
//!                  │ chunk flush
//!                  ▼
//!           level-0 segment ──┐
//!           level-0 segment ──┤  compactor (fan-in 4)
//!           level-0 segment ──┼──────► level-1 segment ──► ...
//!           level-0 segment ──┘
//!
//! open_query ──► merge planner ──► merge tasks
//!                  (lock-step trie walk + pushdown)
//!                        │
//!                        ▼ per task
//!                merge queue (iid asc, system_from desc)
//!                        │
//!                        ▼ per event
//!                polygon engine ──► temporal-bounds filter ──► rows
//! ```
//!
//! ## Main Components
//!
//! - [`Node`]: the embeddable surface - transactions, queries, flush,
//!   compaction, garbage collection.
//! - [`LiveTrie`]: the in-memory chunk, snapshot-shareable with readers.
//! - [`PolygonEngine`]: per-event bitemporal rectangle reconstruction.
//! - [`plan_tasks`] / [`MergeQueue`]: the multi-segment merge machinery.
//! - [`ScanCursor`]: the pull-based batch cursor queries consume.
//! - [`Compactor`]: level-to-level segment merging with recency annotation.

pub mod compact;
pub mod config;
pub mod error;
pub mod live;
pub mod node;
pub mod plan;
pub mod pointer;
pub mod polygon;
pub mod scan;

pub use compact::{CompactionConfig, CompactionResult, Compactor};
pub use config::NodeConfig;
pub use error::{Error, Result};
pub use live::{LiveSnapshot, LiveTrie};
pub use node::{doc, Node, QueryOpts, ScanQuery, TxKey};
pub use plan::{plan_tasks, MergeTask, PlanContext, PlanLeaf, TrieSource};
pub use pointer::{EventPointer, MergeQueue};
pub use polygon::{Ceiling, EventDisposition, PolygonEngine};
pub use scan::{Batch, Row, ScanCursor};
