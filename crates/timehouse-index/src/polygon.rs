//! Bitemporal Polygon Engine
//!
//! Reconstructs, per put, the set of rectangles
//! `(valid_from, valid_to, system_from, system_to)` over which that put is
//! the visible version of its entity. The merge scan and the compactor both
//! run it; they only differ in what they do with the output.
//!
//! ## The ceiling
//!
//! Events for one entity arrive newest-first in system time
//! (`iid asc, system_from desc` is the global merge order). The engine keeps
//! a *ceiling*: a piecewise-constant function over valid time whose value at
//! `v` is the `system_from` of the oldest already-seen event covering `v` -
//! i.e. the system time at which the current event stops being the visible
//! version on that valid-time slice. Initially the ceiling is +inf
//! everywhere: nothing seen yet supersedes anything.
//!
//! For each event with window `[vf, vt)`:
//!
//! 1. Read the ceiling over `[vf, vt)`: each constant piece yields one slice
//!    `(slice_vf, slice_vt, system_to = ceiling value)`.
//! 2. Lower the ceiling over `[vf, vt)` to the event's own `system_from`.
//! 3. Puts emit their slices; deletes only lower the ceiling; an erase
//!    resets the ceiling and marks the entity so every older event is
//!    dropped.
//!
//! ```text
//! ceiling before:   ∞∞∞∞∞∞∞∞│ 90 90 90 │∞∞∞∞∞
//!                        vf ┊           ┊ vt
//! put @80 emits:    (vf,a,∞) (a,b,90) (b,vt,∞)
//! ceiling after:    ∞∞│ 80 80 80 80 80 80 │∞∞
//! ```
//!
//! Events whose `system_from` exceeds the query's system upper bound are
//! dropped before any of this - including erases. An as-of query must not
//! see the superseding (or redacting) effect of a future it cannot read.

use timehouse_core::{Iid, OpKind, MAX_TS, MIN_TS};

/// One emitted slice: `(valid_from, valid_to, system_to)`. The event's own
/// `system_from` completes the rectangle.
pub type Slice = (i64, i64, i64);

/// Piecewise-constant map from valid time to the superseding system time.
///
/// `valid_times` holds `n + 1` ascending boundaries for `n` pieces;
/// `sys_times[i]` covers `[valid_times[i], valid_times[i + 1])`. The pieces
/// always tile `[MIN_TS, MAX_TS)`.
#[derive(Debug, Clone)]
pub struct Ceiling {
    valid_times: Vec<i64>,
    sys_times: Vec<i64>,
}

impl Default for Ceiling {
    fn default() -> Self {
        Self::new()
    }
}

impl Ceiling {
    pub fn new() -> Self {
        Ceiling {
            valid_times: vec![MIN_TS, MAX_TS],
            sys_times: vec![MAX_TS],
        }
    }

    pub fn reset(&mut self) {
        self.valid_times.clear();
        self.valid_times.extend([MIN_TS, MAX_TS]);
        self.sys_times.clear();
        self.sys_times.push(MAX_TS);
    }

    /// The ceiling pieces overlapping `[vf, vt)`, clipped to it.
    pub fn slices(&self, vf: i64, vt: i64) -> Vec<Slice> {
        let mut out = Vec::new();
        for i in 0..self.sys_times.len() {
            let lo = self.valid_times[i].max(vf);
            let hi = self.valid_times[i + 1].min(vt);
            if lo < hi {
                out.push((lo, hi, self.sys_times[i]));
            }
        }
        out
    }

    /// Lower the ceiling to `sys` over `[vf, vt)`.
    pub fn apply(&mut self, sys: i64, vf: i64, vt: i64) {
        if vf >= vt {
            return;
        }
        let mut pieces: Vec<(i64, i64)> = Vec::with_capacity(self.sys_times.len() + 2);
        let mut inserted = false;
        for i in 0..self.sys_times.len() {
            let seg_from = self.valid_times[i];
            let seg_to = self.valid_times[i + 1];
            if seg_from < vf.min(seg_to) {
                push_piece(&mut pieces, seg_from, self.sys_times[i]);
            }
            if !inserted && seg_to > vf {
                push_piece(&mut pieces, vf, sys);
                inserted = true;
            }
            if seg_to > vt.max(seg_from) {
                push_piece(&mut pieces, seg_from.max(vt), self.sys_times[i]);
            }
        }
        self.valid_times.clear();
        self.sys_times.clear();
        for (start, sys) in pieces {
            self.valid_times.push(start);
            self.sys_times.push(sys);
        }
        self.valid_times.push(MAX_TS);
    }
}

fn push_piece(pieces: &mut Vec<(i64, i64)>, start: i64, sys: i64) {
    // merge with the previous piece when the value is unchanged
    if let Some(&(_, prev_sys)) = pieces.last() {
        if prev_sys == sys {
            return;
        }
    }
    pieces.push((start, sys));
}

/// What became of one event fed to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EventDisposition {
    /// Event committed after the queried system range; invisible, including
    /// its superseding effect.
    OutOfRange,
    /// The entity was erased by a newer (in-range) event.
    Skipped,
    /// The erase event itself.
    Erase,
    /// A put or delete was applied. `emit` holds the put's visible slices
    /// (empty for deletes); `recency` is the greatest `system_to` any slice
    /// of the event's window reaches - the compactor's pruning annotation.
    Polygon { emit: Vec<Slice>, recency: i64 },
}

/// Per-merge-task polygon state. Exclusively owned by one cursor; tasks are
/// isolated by trie path so no state crosses tasks.
#[derive(Debug)]
pub struct PolygonEngine {
    ceiling: Ceiling,
    current_iid: Option<Iid>,
    skip_iid: Option<Iid>,
    sys_from_cap: i64,
}

impl PolygonEngine {
    /// `sys_from_cap` is the query's inclusive upper bound on `system_from`
    /// (`MAX_TS` for the compactor).
    pub fn new(sys_from_cap: i64) -> Self {
        PolygonEngine {
            ceiling: Ceiling::new(),
            current_iid: None,
            skip_iid: None,
            sys_from_cap,
        }
    }

    /// Feed the next event in `(iid asc, system_from desc)` order.
    pub fn on_event(
        &mut self,
        iid: Iid,
        system_from: i64,
        kind: OpKind,
        valid_from: i64,
        valid_to: i64,
    ) -> EventDisposition {
        if self.current_iid != Some(iid) {
            self.ceiling.reset();
            self.skip_iid = None;
            self.current_iid = Some(iid);
        }
        if system_from > self.sys_from_cap {
            return EventDisposition::OutOfRange;
        }
        if self.skip_iid == Some(iid) {
            return EventDisposition::Skipped;
        }
        match kind {
            OpKind::Erase => {
                self.ceiling.reset();
                self.skip_iid = Some(iid);
                EventDisposition::Erase
            }
            OpKind::Put | OpKind::Delete => {
                if valid_from >= valid_to {
                    return EventDisposition::Polygon {
                        emit: Vec::new(),
                        recency: MIN_TS,
                    };
                }
                let slices = self.ceiling.slices(valid_from, valid_to);
                let recency = slices.iter().map(|&(_, _, st)| st).max().unwrap_or(MIN_TS);
                self.ceiling.apply(system_from, valid_from, valid_to);
                let emit = match kind {
                    OpKind::Put => slices
                        .into_iter()
                        .filter(|&(_, _, st)| st > system_from)
                        .collect(),
                    _ => Vec::new(),
                };
                EventDisposition::Polygon { emit, recency }
            }
        }
    }
}
