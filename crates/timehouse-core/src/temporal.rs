//! Temporal Bounds
//!
//! A query fixes a rectangle over the two time axes. This module parses the
//! `FOR VALID_TIME` / `FOR SYSTEM_TIME` clause pair into four numeric bounds
//! the scan applies per polygon slice.
//!
//! ## The four bounds
//!
//! A slice `(vf, vt, sf, st)` is accepted iff
//!
//! ```text
//! vf <= valid_from_hi  AND  vt > valid_to_lo  AND
//! sf <= sys_from_hi    AND  st > sys_to_lo
//! ```
//!
//! which encodes the usual clauses:
//!
//! | clause          | from-col bound | to-col bound |
//! |-----------------|----------------|--------------|
//! | `AT t`          | `hi = t`       | `lo = t`     |
//! | `IN [f, t)`     | `hi = t - 1`   | `lo = f`     |
//! | `BETWEEN [f,t]` | `hi = t`       | `lo = f`     |
//! | `ALL`           | unbounded      | unbounded    |
//!
//! `sys_from_hi` is also the cut the polygon engine applies before op
//! dispatch: an event committed after it is invisible to the query entirely,
//! including its superseding effect on older events. That is what makes
//! as-of reads repeatable - and what keeps an erase committed after the basis
//! from redacting an earlier snapshot.
//!
//! All timestamps are microseconds since epoch, UTC. `MAX_TS` encodes +inf,
//! `MIN_TS` -inf.

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// +infinity in the microsecond timeline.
pub const MAX_TS: i64 = i64::MAX;

/// -infinity in the microsecond timeline.
pub const MIN_TS: i64 = i64::MIN;

/// A `FOR VALID_TIME` / `FOR SYSTEM_TIME` clause, before resolution against
/// the query's defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemporalClause {
    /// Use the query default: basis system time / current time.
    Default,
    /// `AS OF t`.
    At(i64),
    /// Half-open `IN [from, to)`.
    In(i64, i64),
    /// Closed `BETWEEN [from, to]`.
    Between(i64, i64),
    /// `ALL` - unbounded.
    All,
}

impl TemporalClause {
    fn resolve(self, default_at: i64) -> Result<(i64, i64)> {
        match self {
            TemporalClause::Default => Ok((default_at, default_at)),
            TemporalClause::At(t) => Ok((t, t)),
            TemporalClause::In(f, t) => {
                if f >= t {
                    return Err(Error::InvalidArgument(format!(
                        "empty temporal interval [{}, {})",
                        f, t
                    )));
                }
                Ok((t.saturating_sub(1), f))
            }
            TemporalClause::Between(f, t) => {
                if f > t {
                    return Err(Error::InvalidArgument(format!(
                        "inverted temporal interval [{}, {}]",
                        f, t
                    )));
                }
                Ok((t, f))
            }
            TemporalClause::All => Ok((MAX_TS, MIN_TS)),
        }
    }
}

/// The logical snapshot a query runs against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Basis {
    /// System time of the transaction the query reads as-of. `None` means
    /// the latest committed transaction at query start.
    pub at_system_time: Option<i64>,
    /// The wall-clock instant fixed at query start for valid-time defaults.
    pub current_time: Option<i64>,
}

/// The resolved rectangle a scan filters slices with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemporalBounds {
    pub valid_from_hi: i64,
    pub valid_to_lo: i64,
    pub sys_from_hi: i64,
    pub sys_to_lo: i64,
}

impl TemporalBounds {
    /// Resolve a clause pair against the query's basis.
    ///
    /// System time defaults to `AS OF` the basis transaction; a clause naming
    /// a later bound is still capped at the basis so results stay repeatable.
    /// Valid time defaults to `AS OF current_time` unless the caller asked
    /// for all valid time.
    pub fn resolve(
        valid_time: TemporalClause,
        system_time: TemporalClause,
        basis_system_time: i64,
        current_time: i64,
        default_all_valid_time: bool,
    ) -> Result<Self> {
        let valid_time = match (valid_time, default_all_valid_time) {
            (TemporalClause::Default, true) => TemporalClause::All,
            (clause, _) => clause,
        };
        let (valid_from_hi, valid_to_lo) = valid_time.resolve(current_time)?;
        let (sys_from_hi, sys_to_lo) = system_time.resolve(basis_system_time)?;
        Ok(TemporalBounds {
            valid_from_hi,
            valid_to_lo,
            sys_from_hi: sys_from_hi.min(basis_system_time),
            sys_to_lo,
        })
    }

    /// Bounds that accept everything. Used by the compactor's merge.
    pub fn unbounded() -> Self {
        TemporalBounds {
            valid_from_hi: MAX_TS,
            valid_to_lo: MIN_TS,
            sys_from_hi: MAX_TS,
            sys_to_lo: MIN_TS,
        }
    }

    /// Does a slice rectangle intersect the query rectangle?
    pub fn accepts(&self, valid_from: i64, valid_to: i64, sys_from: i64, sys_to: i64) -> bool {
        valid_from <= self.valid_from_hi
            && valid_to > self.valid_to_lo
            && sys_from <= self.sys_from_hi
            && sys_to > self.sys_to_lo
    }
}

/// Parse an RFC 3339 timestamp literal to microseconds since epoch.
pub fn parse_timestamp(literal: &str) -> Result<i64> {
    let dt = DateTime::parse_from_rfc3339(literal).map_err(|e| {
        Error::InvalidArgument(format!("invalid temporal literal '{}': {}", literal, e))
    })?;
    Ok(dt.timestamp_micros())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_at(valid: TemporalClause, system: TemporalClause, basis: i64, now: i64) -> TemporalBounds {
        TemporalBounds::resolve(valid, system, basis, now, false).unwrap()
    }

    // ---------------------------------------------------------------
    // Clause resolution
    // ---------------------------------------------------------------

    #[test]
    fn test_defaults_are_as_of_basis_and_now() {
        let b = resolve_at(TemporalClause::Default, TemporalClause::Default, 100, 50);
        assert_eq!(b.sys_from_hi, 100);
        assert_eq!(b.sys_to_lo, 100);
        assert_eq!(b.valid_from_hi, 50);
        assert_eq!(b.valid_to_lo, 50);
    }

    #[test]
    fn test_default_all_valid_time() {
        let b = TemporalBounds::resolve(
            TemporalClause::Default,
            TemporalClause::Default,
            100,
            50,
            true,
        )
        .unwrap();
        assert_eq!(b.valid_from_hi, MAX_TS);
        assert_eq!(b.valid_to_lo, MIN_TS);
    }

    #[test]
    fn test_system_clause_capped_at_basis() {
        let b = resolve_at(TemporalClause::Default, TemporalClause::At(500), 100, 0);
        assert_eq!(b.sys_from_hi, 100, "clause beyond the basis is capped");
    }

    #[test]
    fn test_in_clause_is_half_open() {
        let b = resolve_at(TemporalClause::In(10, 20), TemporalClause::Default, 0, 0);
        // start-col < 20, end-col > 10
        assert!(b.accepts(19, 21, 0, 1));
        assert!(!b.accepts(20, 30, 0, 1), "vf == to is outside [10, 20)");
        assert!(!b.accepts(0, 10, 0, 1), "vt == from is outside [10, 20)");
    }

    #[test]
    fn test_between_clause_is_closed() {
        let b = resolve_at(TemporalClause::Between(10, 20), TemporalClause::Default, 0, 0);
        assert!(b.accepts(20, 30, 0, 1), "vf == hi is inside BETWEEN");
    }

    #[test]
    fn test_empty_intervals_rejected() {
        assert!(TemporalClause::In(5, 5).resolve(0).is_err());
        assert!(TemporalClause::Between(6, 5).resolve(0).is_err());
    }

    // ---------------------------------------------------------------
    // accepts
    // ---------------------------------------------------------------

    #[test]
    fn test_accepts_point_semantics() {
        let b = resolve_at(TemporalClause::At(100), TemporalClause::At(7), 7, 0);
        // vf <= 100 < vt and sf <= 7 < st
        assert!(b.accepts(100, 101, 7, MAX_TS));
        assert!(!b.accepts(101, 200, 7, MAX_TS), "starts after the point");
        assert!(!b.accepts(0, 100, 7, MAX_TS), "ends at the point");
        assert!(!b.accepts(100, 101, 7, 7), "superseded at the point");
    }

    #[test]
    fn test_unbounded_accepts_everything() {
        let b = TemporalBounds::unbounded();
        assert!(b.accepts(MIN_TS, MAX_TS, MIN_TS, MAX_TS));
        assert!(b.accepts(0, 1, 0, 1));
    }

    // ---------------------------------------------------------------
    // Literals
    // ---------------------------------------------------------------

    #[test]
    fn test_parse_timestamp() {
        let us = parse_timestamp("2020-01-01T00:00:00Z").unwrap();
        assert_eq!(us, 1_577_836_800_000_000);
        assert!(parse_timestamp("not-a-time").is_err());
    }
}
