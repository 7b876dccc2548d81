//! Timehouse Storage Layer
//!
//! This crate implements the on-disk shape of a timehouse table - the
//! component between the in-memory live index and the object store.
//!
//! ## What is a segment?
//!
//! An immutable pair of files describing one sorted run of events:
//!
//! ```text
//! tables/<table>/meta/log-l00-fr...-nr....arrow   trie + statistics
//! tables/<table>/data/log-l00-fr...-nr....arrow   Arrow IPC data pages
//! ```
//!
//! - The **data file** holds the events as Arrow record batches ("data
//!   pages"), 256 rows each by default, sorted `(iid asc, system_from desc)`
//!   and laid out in trie preorder.
//! - The **meta file** holds a hash-trie over the iid space. Each leaf points
//!   at one data page and carries per-column statistics: count, min/max per
//!   primitive class, a value bloom filter, and an iid bloom. The scan reads
//!   the meta file first and only touches the data pages the statistics
//!   cannot rule out.
//!
//! ```text
//!            ┌──────────────┐
//!            │  meta file   │  trie: branch/leaf vector
//!            │  (small)     │  per-leaf column stats + blooms
//!            └──────┬───────┘
//!                   │ page indexes that survive pushdown
//!                   ▼
//!            ┌──────────────┐
//!            │  data file   │  RecordBatch 0 │ RecordBatch 1 │ ...
//!            │  (large)     │
//!            └──────────────┘
//! ```
//!
//! ## Main Components
//!
//! - [`EventRel`]: the decoded columnar view of one page (or one live leaf).
//! - [`SegmentMeta`] / [`TrieNode`]: the meta-file payload.
//! - [`build_segment`]: events in, `(meta, data)` file bytes out.
//! - [`SegmentHandle`] / [`read_page`]: the read side.
//! - [`BufferPool`]: shared LRU over the object store, with pinning and the
//!   counters the pushdown tests observe.
//! - [`layout`]: file naming and current-set selection.

pub mod bloom;
pub mod buffer_pool;
pub mod error;
pub mod layout;
pub mod meta;
pub mod page;
pub mod segment;

pub use bloom::{ColumnBloomFilter, IidBloom};
pub use buffer_pool::{BufferPool, PoolStats};
pub use error::{Error, Result};
pub use layout::{current_set, data_path, meta_path, parse_segment_filename, SegmentId};
pub use meta::{ColumnMeta, SegmentMeta, TrieNode, META_MAGIC, META_VERSION};
pub use page::EventRel;
pub use segment::{build_segment, open_segment, read_page, BuildOptions, SegmentHandle};
