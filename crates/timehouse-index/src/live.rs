//! Live Index
//!
//! The in-memory half of a table: the events of the current chunk, held in a
//! hash trie keyed by the same 2-bit iid nibbles as the on-disk segments. A
//! flush turns the whole trie into one level-0 segment and resets it.
//!
//! ## Snapshot semantics
//!
//! Nodes are persistent (`Arc`-shared, copy-on-write along the append path),
//! so a reader's snapshot is a single `Arc` clone of the root taken under the
//! table's read latch. The indexer keeps appending afterwards without
//! disturbing the snapshot: `Arc::make_mut` clones exactly the nodes a shared
//! snapshot still holds.
//!
//! ## Leaves
//!
//! A leaf stores events in arrival order and only materializes a sort-key
//! vector `(iid asc, system_from desc)` when the merge scan actually needs
//! it. To the event-row pointer a materialized live leaf is indistinguishable
//! from a decoded data page.

use std::cmp::Reverse;
use std::sync::Arc;

use timehouse_core::{Event, IID_NIBBLES};
use timehouse_storage::EventRel;

/// One node of the live trie. `Branch` carries no inline events.
#[derive(Debug, Clone)]
pub enum LiveNode {
    Branch {
        children: [Option<Arc<LiveNode>>; 4],
    },
    Leaf {
        events: Vec<Event>,
    },
}

impl LiveNode {
    fn empty_leaf() -> Arc<LiveNode> {
        Arc::new(LiveNode::Leaf { events: Vec::new() })
    }
}

/// The mutable live index of one table. Owned by the indexer; readers only
/// ever see [`LiveSnapshot`]s.
#[derive(Debug)]
pub struct LiveTrie {
    root: Option<Arc<LiveNode>>,
    row_count: usize,
    split_rows: usize,
}

/// An immutable view of the live trie at some instant.
#[derive(Debug, Clone)]
pub struct LiveSnapshot {
    pub root: Option<Arc<LiveNode>>,
    pub row_count: usize,
}

impl LiveTrie {
    pub fn new(split_rows: usize) -> Self {
        LiveTrie {
            root: None,
            row_count: 0,
            split_rows: split_rows.max(1),
        }
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    pub fn append(&mut self, event: Event) {
        let root = self.root.get_or_insert_with(LiveNode::empty_leaf);
        Self::insert(root, event, 0, self.split_rows);
        self.row_count += 1;
    }

    fn insert(node: &mut Arc<LiveNode>, event: Event, depth: usize, split_rows: usize) {
        let node_mut = Arc::make_mut(node);
        match node_mut {
            LiveNode::Leaf { events } => {
                events.push(event);
                if events.len() > split_rows && depth < IID_NIBBLES {
                    let drained = std::mem::take(events);
                    let mut children: [Option<Arc<LiveNode>>; 4] = Default::default();
                    for e in drained {
                        let nibble = e.iid.nibble(depth) as usize;
                        let child = children[nibble].get_or_insert_with(LiveNode::empty_leaf);
                        match Arc::make_mut(child) {
                            LiveNode::Leaf { events } => events.push(e),
                            LiveNode::Branch { .. } => unreachable!("fresh child is a leaf"),
                        }
                    }
                    *node_mut = LiveNode::Branch { children };
                }
            }
            LiveNode::Branch { children } => {
                let nibble = event.iid.nibble(depth) as usize;
                let child = children[nibble].get_or_insert_with(LiveNode::empty_leaf);
                Self::insert(child, event, depth + 1, split_rows);
            }
        }
    }

    /// Cheap immutable view; the indexer can keep appending afterwards.
    pub fn snapshot(&self) -> LiveSnapshot {
        LiveSnapshot {
            root: self.root.clone(),
            row_count: self.row_count,
        }
    }

    /// Drop all events. Called after a flush has transferred ownership of the
    /// chunk into a published level-0 segment.
    pub fn reset(&mut self) {
        self.root = None;
        self.row_count = 0;
    }
}

/// Sort-key vector of one leaf: row indexes ordered `(iid asc, system_from desc)`.
pub fn leaf_sort_keys(events: &[Event]) -> Vec<usize> {
    let mut keys: Vec<usize> = (0..events.len()).collect();
    keys.sort_by_key(|&i| (events[i].iid, Reverse(events[i].system_from)));
    keys
}

/// Materialize a live leaf in merge order, as the same columnar shape a
/// decoded data page has.
pub fn materialize_leaf(events: &[Event]) -> EventRel {
    let keys = leaf_sort_keys(events);
    let mut rel = EventRel::new();
    for i in keys {
        rel.push_event(&events[i]);
    }
    rel
}

impl LiveSnapshot {
    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    /// All events of the snapshot in global `(iid asc, system_from desc)`
    /// order: trie paths enumerate the iid space in order and every iid lives
    /// in exactly one leaf, so preorder concatenation of sorted leaves is the
    /// global sort. This is what a chunk flush writes.
    pub fn sorted_events(&self) -> Vec<Event> {
        let mut out = Vec::with_capacity(self.row_count);
        if let Some(root) = &self.root {
            collect_sorted(root, &mut out);
        }
        out
    }
}

fn collect_sorted(node: &Arc<LiveNode>, out: &mut Vec<Event>) {
    match node.as_ref() {
        LiveNode::Leaf { events } => {
            for i in leaf_sort_keys(events) {
                out.push(events[i].clone());
            }
        }
        LiveNode::Branch { children } => {
            for child in children.iter().flatten() {
                collect_sorted(child, out);
            }
        }
    }
}
