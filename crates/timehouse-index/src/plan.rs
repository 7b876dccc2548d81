//! Merge Planner
//!
//! Walks the tries of every source - the on-disk segments of the current set
//! plus the live snapshot - in lock step and emits one *merge task* per
//! shared trie path. A task lists the leaves the scan must co-read at that
//! path; the scan then merges their rows and runs the polygon engine over
//! the result.
//!
//! ## The walk
//!
//! While any source still presents an iid-branch at the current path, the
//! walk recurses positionally into the four nibble children. A source whose
//! node is already a leaf is carried down unchanged: the event-row pointer's
//! binary search restricts it to the rows on the deeper path, so one shallow
//! leaf can feed many tasks. A recency branch is treated as a set of leaves
//! at its own path. When no source presents an iid-branch the walk emits.
//!
//! ## Pushdown
//!
//! Three prunes run at emit time, all sound (they only drop what provably
//! cannot change the result):
//!
//! 1. **Path selector**: an `xt$id` equality predicate fixes the iid, so any
//!    path disagreeing with its nibbles is skipped during recursion.
//! 2. **Column statistics**: a leaf whose per-column min/max and blooms rule
//!    out a predicate is not taken.
//! 3. **Recency buckets**: a bucket whose greatest possible `system_to` is at
//!    or below the query's system lower bound cannot contribute a visible
//!    slice, nor change the `system_to` of one that is visible.
//!
//! A leaf ruled out by (2) can still matter: a newer page's put only gets a
//! correct `system_to` when every earlier event of the same entity joins the
//! merge. The planner therefore unions the iid blooms of the taken leaves
//! and pulls back, to fixpoint, any dropped leaf whose iid bloom intersects
//! the union - a *ceiling-completing* contributor.

use std::sync::Arc;

use timehouse_core::{Iid, Predicate, TemporalBounds, TriePath, BRANCH_FACTOR};
use timehouse_storage::{ColumnMeta, IidBloom, SegmentHandle, TrieNode};

use crate::error::Result;
use crate::live::{LiveNode, LiveSnapshot};

/// One trie the planner walks.
#[derive(Debug, Clone)]
pub enum TrieSource {
    Disk(Arc<SegmentHandle>),
    Live(LiveSnapshot),
}

/// A leaf the scan must read for one task.
#[derive(Debug, Clone)]
pub enum PlanLeaf {
    Disk {
        handle: Arc<SegmentHandle>,
        page_idx: u32,
    },
    Live {
        node: Arc<LiveNode>,
    },
}

/// A unit of merge work at one shared trie path.
#[derive(Debug, Clone)]
pub struct MergeTask {
    pub path: TriePath,
    pub leaves: Vec<PlanLeaf>,
}

/// Planner inputs beyond the sources themselves.
#[derive(Debug, Clone, Copy)]
pub struct PlanContext<'a> {
    /// iid fixed by an `xt$id` equality predicate, if any.
    pub selector: Option<&'a Iid>,
    pub predicates: &'a [Predicate],
    pub bounds: &'a TemporalBounds,
    /// The compactor plans with pushdown off: it must merge every row.
    pub use_pushdown: bool,
}

#[derive(Clone)]
enum WalkEntry {
    Nil,
    Disk { handle: Arc<SegmentHandle>, node: u32 },
    Live { node: Arc<LiveNode> },
}

/// Produce the merge tasks for one table scan, in trie path order.
pub fn plan_tasks(sources: &[TrieSource], ctx: &PlanContext<'_>) -> Result<Vec<MergeTask>> {
    let entries: Vec<WalkEntry> = sources
        .iter()
        .map(|source| match source {
            TrieSource::Disk(handle) => WalkEntry::Disk {
                handle: handle.clone(),
                node: handle.meta.root,
            },
            TrieSource::Live(snapshot) => match &snapshot.root {
                Some(root) => WalkEntry::Live { node: root.clone() },
                None => WalkEntry::Nil,
            },
        })
        .collect();
    let mut tasks = Vec::new();
    walk(&entries, Vec::new(), ctx, &mut tasks)?;
    Ok(tasks)
}

fn walk(
    entries: &[WalkEntry],
    path: TriePath,
    ctx: &PlanContext<'_>,
    out: &mut Vec<MergeTask>,
) -> Result<()> {
    let mut any_branch = false;
    for entry in entries {
        match entry {
            WalkEntry::Nil => {}
            WalkEntry::Disk { handle, node } => {
                if matches!(handle.meta.node(*node)?, TrieNode::BranchIid { .. }) {
                    any_branch = true;
                }
            }
            WalkEntry::Live { node } => {
                if matches!(node.as_ref(), LiveNode::Branch { .. }) {
                    any_branch = true;
                }
            }
        }
    }

    if !any_branch {
        emit_task(entries, path, ctx, out)?;
        return Ok(());
    }

    for nibble in 0..BRANCH_FACTOR as u8 {
        if let Some(selector) = ctx.selector {
            if selector.nibble(path.len()) != nibble {
                continue;
            }
        }
        let mut children = Vec::with_capacity(entries.len());
        for entry in entries {
            let child = match entry {
                WalkEntry::Nil => WalkEntry::Nil,
                WalkEntry::Disk { handle, node } => match handle.meta.node(*node)? {
                    TrieNode::BranchIid { children } => match children[nibble as usize] {
                        Some(child) => WalkEntry::Disk {
                            handle: handle.clone(),
                            node: child,
                        },
                        None => WalkEntry::Nil,
                    },
                    // leaves and recency branches are carried down; the
                    // pointer's path bound does the narrowing
                    TrieNode::Leaf { .. } | TrieNode::BranchRecency { .. } => entry.clone(),
                    TrieNode::Nil => WalkEntry::Nil,
                },
                WalkEntry::Live { node } => match node.as_ref() {
                    LiveNode::Branch { children } => match &children[nibble as usize] {
                        Some(child) => WalkEntry::Live {
                            node: child.clone(),
                        },
                        None => WalkEntry::Nil,
                    },
                    LiveNode::Leaf { .. } => entry.clone(),
                },
            };
            children.push(child);
        }
        let mut child_path = path.clone();
        child_path.push(nibble);
        walk(&children, child_path, ctx, out)?;
    }
    Ok(())
}

struct Candidate {
    leaf: PlanLeaf,
    /// Column statistics for disk leaves; live leaves have none.
    columns: Option<Vec<ColumnMeta>>,
    iid_bloom: Option<IidBloom>,
}

fn emit_task(
    entries: &[WalkEntry],
    path: TriePath,
    ctx: &PlanContext<'_>,
    out: &mut Vec<MergeTask>,
) -> Result<()> {
    let mut candidates = Vec::new();
    for entry in entries {
        match entry {
            WalkEntry::Nil => {}
            WalkEntry::Live { node } => {
                if let LiveNode::Leaf { events } = node.as_ref() {
                    if events.is_empty() {
                        continue;
                    }
                    let mut bloom = IidBloom::new();
                    for event in events {
                        bloom.add(&event.iid);
                    }
                    candidates.push(Candidate {
                        leaf: PlanLeaf::Live { node: node.clone() },
                        columns: None,
                        iid_bloom: Some(bloom),
                    });
                }
            }
            WalkEntry::Disk { handle, node } => {
                collect_disk_leaves(handle, *node, ctx, &mut candidates)?;
            }
        }
    }
    if candidates.is_empty() {
        return Ok(());
    }

    if !ctx.use_pushdown || ctx.predicates.is_empty() {
        out.push(MergeTask {
            path,
            leaves: candidates.into_iter().map(|c| c.leaf).collect(),
        });
        return Ok(());
    }

    // First pass: statistics decide who is taken outright. Live leaves have
    // no statistics and are always taken.
    let mut taken: Vec<bool> = candidates
        .iter()
        .map(|candidate| match &candidate.columns {
            None => true,
            Some(columns) => ctx.predicates.iter().all(|predicate| {
                columns
                    .iter()
                    .find(|c| c.name == predicate.column())
                    .is_some_and(|c| c.may_match(predicate))
            }),
        })
        .collect();

    // Second pass: ceiling completion, to fixpoint.
    let mut union = IidBloom::new();
    for (candidate, taken) in candidates.iter().zip(taken.iter()) {
        if *taken {
            if let Some(bloom) = &candidate.iid_bloom {
                union.union_with(bloom);
            }
        }
    }
    loop {
        let mut changed = false;
        for (candidate, taken) in candidates.iter().zip(taken.iter_mut()) {
            if *taken {
                continue;
            }
            if let Some(bloom) = &candidate.iid_bloom {
                if bloom.intersects(&union) {
                    *taken = true;
                    union.union_with(bloom);
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    let leaves: Vec<PlanLeaf> = candidates
        .into_iter()
        .zip(taken)
        .filter_map(|(candidate, taken)| taken.then_some(candidate.leaf))
        .collect();
    if !leaves.is_empty() {
        out.push(MergeTask { path, leaves });
    }
    Ok(())
}

fn collect_disk_leaves(
    handle: &Arc<SegmentHandle>,
    node: u32,
    ctx: &PlanContext<'_>,
    out: &mut Vec<Candidate>,
) -> Result<()> {
    match handle.meta.node(node)? {
        TrieNode::Nil | TrieNode::BranchIid { .. } => Ok(()),
        TrieNode::Leaf {
            data_page_idx,
            columns,
        } => {
            let iid_bloom = columns
                .iter()
                .find_map(|c| c.decoded_iid_bloom());
            out.push(Candidate {
                leaf: PlanLeaf::Disk {
                    handle: handle.clone(),
                    page_idx: *data_page_idx,
                },
                columns: Some(columns.clone()),
                iid_bloom,
            });
            Ok(())
        }
        TrieNode::BranchRecency { buckets } => {
            for (recency, child) in buckets {
                // rows in the bucket are superseded at or before `recency`;
                // nothing in it can intersect a query strictly above
                if ctx.use_pushdown && *recency <= ctx.bounds.sys_to_lo {
                    continue;
                }
                collect_disk_leaves(handle, *child, ctx, out)?;
            }
            Ok(())
        }
    }
}
