//! Event-Row Pointers and the Merge Queue
//!
//! A pointer is a cursor over one relation's rows - a decoded data page or a
//! materialized live leaf - restricted to a trie path. Construction binary
//! searches to the first row on the path; the pointer stays valid while its
//! row's iid still lies on (or before the end of) the path.
//!
//! The merge queue is a min-heap of pointers keyed
//! `(iid asc, system_from desc)`: the pointer with the smallest iid wins, and
//! on an iid tie the one with the *larger* system time - the polygon engine
//! needs each entity's events newest-first. Pointers live in a side vector
//! and the heap holds indexes into it, so re-inserting an advanced pointer
//! never reallocates it.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use timehouse_core::{compare_to_path, Iid, TriePath};
use timehouse_storage::EventRel;

/// Cursor over one relation, bounded by a trie path.
#[derive(Debug)]
pub struct EventPointer {
    rel: Arc<EventRel>,
    idx: usize,
}

impl EventPointer {
    /// Position at the first row whose iid lies on `path`.
    pub fn new(rel: Arc<EventRel>, path: &[u8]) -> Self {
        let mut left = 0;
        let mut right = rel.len();
        while left < right {
            let mid = (left + right) / 2;
            if compare_to_path(&rel.iids[mid], path) == Ordering::Less {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        EventPointer { rel, idx: left }
    }

    pub fn rel(&self) -> &Arc<EventRel> {
        &self.rel
    }

    pub fn index(&self) -> usize {
        self.idx
    }

    pub fn iid(&self) -> Iid {
        self.rel.iids[self.idx]
    }

    pub fn system_from(&self) -> i64 {
        self.rel.system_froms[self.idx]
    }

    pub fn advance(&mut self) {
        self.idx += 1;
    }

    /// In range and still on the path?
    pub fn is_valid(&self, path: &[u8]) -> bool {
        self.idx < self.rel.len()
            && compare_to_path(&self.rel.iids[self.idx], path) != Ordering::Greater
    }
}

#[derive(Debug)]
struct QueueEntry {
    iid: Iid,
    system_from: i64,
    pointer: usize,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // BinaryHeap is a max-heap; "greatest" must mean "winner": smallest iid,
    // then largest system_from. Pointer index breaks the remaining tie so the
    // order is total.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .iid
            .cmp(&self.iid)
            .then(self.system_from.cmp(&other.system_from))
            .then(other.pointer.cmp(&self.pointer))
    }
}

/// Min-heap of event-row pointers in `(iid asc, system_from desc)` order.
#[derive(Debug)]
pub struct MergeQueue {
    path: TriePath,
    pointers: Vec<EventPointer>,
    heap: BinaryHeap<QueueEntry>,
}

impl MergeQueue {
    pub fn new(path: TriePath) -> Self {
        MergeQueue {
            path,
            pointers: Vec::new(),
            heap: BinaryHeap::new(),
        }
    }

    /// Add a pointer; it enters the heap only if it has rows on the path.
    pub fn push_pointer(&mut self, pointer: EventPointer) {
        let idx = self.pointers.len();
        if pointer.is_valid(&self.path) {
            self.heap.push(QueueEntry {
                iid: pointer.iid(),
                system_from: pointer.system_from(),
                pointer: idx,
            });
        }
        self.pointers.push(pointer);
    }

    pub fn pointer(&self, idx: usize) -> &EventPointer {
        &self.pointers[idx]
    }

    /// Pop the winning row as `(pointer index, row index)`, advancing the
    /// pointer and re-inserting it while it stays valid.
    pub fn pop(&mut self) -> Option<(usize, usize)> {
        let entry = self.heap.pop()?;
        let pointer = &mut self.pointers[entry.pointer];
        let row = pointer.index();
        pointer.advance();
        if pointer.is_valid(&self.path) {
            self.heap.push(QueueEntry {
                iid: pointer.iid(),
                system_from: pointer.system_from(),
                pointer: entry.pointer,
            });
        }
        Some((entry.pointer, row))
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Reverse;
    use timehouse_core::{Document, EntityId, Event, EventOp, Value, MAX_TS};

    fn put(id: i64, sys: i64) -> Event {
        let mut doc = Document::new();
        doc.insert("xt$id".to_string(), Value::Int(id));
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

    fn sorted_rel(mut events: Vec<Event>) -> Arc<EventRel> {
        events.sort_by_key(|e| (e.iid, Reverse(e.system_from)));
        Arc::new(EventRel::from_events(&events))
    }

    // ---------------------------------------------------------------
    // Pointer
    // ---------------------------------------------------------------

    #[test]
    fn test_pointer_binary_search_skips_preceding_rows() {
        let rel = sorted_rel((0..50).map(|i| put(i, 100 + i)).collect());
        // pick the iid in the middle of the sorted order and use its first
        // two nibbles as the path
        let target = rel.iids[25];
        let path = vec![target.nibble(0), target.nibble(1)];
        let pointer = EventPointer::new(rel.clone(), &path);
        assert!(pointer.is_valid(&path));
        // every row before the pointer is strictly below the path
        for i in 0..pointer.index() {
            assert_eq!(
                compare_to_path(&rel.iids[i], &path),
                Ordering::Less,
                "row {} should precede the path",
                i
            );
        }
        assert_eq!(compare_to_path(&pointer.iid(), &path), Ordering::Equal);
    }

    #[test]
    fn test_pointer_invalid_past_path() {
        let rel = sorted_rel(vec![put(1, 10)]);
        let iid = rel.iids[0];
        // a path strictly above the row's nibbles
        let above = vec![(iid.nibble(0) + 1).min(3)];
        if above[0] != iid.nibble(0) {
            let pointer = EventPointer::new(rel, &above);
            assert!(!pointer.is_valid(&above) || pointer.iid().nibble(0) <= above[0]);
        }
    }

    #[test]
    fn test_pointer_empty_rel() {
        let pointer = EventPointer::new(Arc::new(EventRel::new()), &[]);
        assert!(!pointer.is_valid(&[]));
    }

    // ---------------------------------------------------------------
    // Merge queue
    // ---------------------------------------------------------------

    #[test]
    fn test_merge_preserves_global_order() {
        // three relations with interleaved iids and system times
        let a = sorted_rel(vec![put(1, 100), put(3, 300), put(5, 500)]);
        let b = sorted_rel(vec![put(1, 200), put(3, 100), put(4, 400)]);
        let c = sorted_rel(vec![put(2, 50), put(5, 600)]);

        let mut queue = MergeQueue::new(Vec::new());
        for rel in [a, b, c] {
            queue.push_pointer(EventPointer::new(rel, &[]));
        }

        let mut merged: Vec<(Iid, i64)> = Vec::new();
        while let Some((ptr, row)) = queue.pop() {
            let rel = queue.pointer(ptr).rel();
            merged.push((rel.iids[row], rel.system_froms[row]));
        }
        assert_eq!(merged.len(), 8);
        for pair in merged.windows(2) {
            let ok = pair[0].0 < pair[1].0
                || (pair[0].0 == pair[1].0 && pair[0].1 >= pair[1].1);
            assert!(ok, "merge order violated: {:?}", pair);
        }
        // same entity: newest first
        let sys_for_1: Vec<i64> = merged
            .iter()
            .filter(|(iid, _)| *iid == EntityId::Int(1).iid())
            .map(|&(_, s)| s)
            .collect();
        assert_eq!(sys_for_1, vec![200, 100]);
    }

    #[test]
    fn test_queue_with_no_valid_pointers() {
        let mut queue = MergeQueue::new(Vec::new());
        queue.push_pointer(EventPointer::new(Arc::new(EventRel::new()), &[]));
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }
}
