//! Row Predicates
//!
//! The query planner (external to this core) hands the scan a list of
//! column-level predicates. They are consumed twice: once against per-page
//! column statistics to skip pages (metadata pushdown), and once against the
//! surviving rows. Cross-class comparisons never match and never prune.

use serde::{Deserialize, Serialize};

use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    Eq(String, Value),
    Lt(String, Value),
    Le(String, Value),
    Gt(String, Value),
    Ge(String, Value),
}

impl Predicate {
    pub fn column(&self) -> &str {
        match self {
            Predicate::Eq(c, _)
            | Predicate::Lt(c, _)
            | Predicate::Le(c, _)
            | Predicate::Gt(c, _)
            | Predicate::Ge(c, _) => c,
        }
    }

    pub fn value(&self) -> &Value {
        match self {
            Predicate::Eq(_, v)
            | Predicate::Lt(_, v)
            | Predicate::Le(_, v)
            | Predicate::Gt(_, v)
            | Predicate::Ge(_, v) => v,
        }
    }

    /// Row-level evaluation. A missing column never matches.
    pub fn matches(&self, actual: Option<&Value>) -> bool {
        use std::cmp::Ordering::*;
        let Some(actual) = actual else { return false };
        match self {
            Predicate::Eq(_, want) => actual == want,
            Predicate::Lt(_, want) => actual.compare_same_class(want) == Some(Less),
            Predicate::Le(_, want) => {
                matches!(actual.compare_same_class(want), Some(Less) | Some(Equal))
            }
            Predicate::Gt(_, want) => actual.compare_same_class(want) == Some(Greater),
            Predicate::Ge(_, want) => {
                matches!(actual.compare_same_class(want), Some(Greater) | Some(Equal))
            }
        }
    }
}
