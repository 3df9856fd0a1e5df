use crate::{
    item::Item,
    value::{Value, strict_order_cmp},
};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error as ThisError;

///
/// Predicate tree
///
/// Pure representation of a query predicate as handed over by a lowering
/// front end. This layer is conjunctive-only by contract: surface syntax
/// (host-language expressions, query builders) must already have been
/// lowered into `All` nodes over condition leaves. Disjunction and
/// negation are rejected here, not silently narrowed.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Predicate {
    /// Conjunction over child predicates.
    All(Vec<Predicate>),
    /// One per-field condition leaf.
    Where(Condition),
}

impl Predicate {
    #[must_use]
    pub fn all(children: impl IntoIterator<Item = Predicate>) -> Self {
        Self::All(children.into_iter().collect())
    }

    #[must_use]
    pub fn field(field: impl Into<String>, op: ConditionOp) -> Self {
        Self::Where(Condition::new(field, op))
    }
}

///
/// ConditionOp
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConditionOp {
    Eq(Value),
    Lt(Value),
    Le(Value),
    Gt(Value),
    Ge(Value),
    Between(Value, Value),
    In(Vec<Value>),
    Exists,
}

impl ConditionOp {
    /// Stable tag fed into fingerprints. Never renumber.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Eq(_) => 0x01,
            Self::Lt(_) => 0x02,
            Self::Le(_) => 0x03,
            Self::Gt(_) => 0x04,
            Self::Ge(_) => 0x05,
            Self::Between(..) => 0x06,
            Self::In(_) => 0x07,
            Self::Exists => 0x08,
        }
    }

    /// Bound values in declaration order.
    #[must_use]
    pub fn values(&self) -> Vec<&Value> {
        match self {
            Self::Eq(v) | Self::Lt(v) | Self::Le(v) | Self::Gt(v) | Self::Ge(v) => vec![v],
            Self::Between(lo, hi) => vec![lo, hi],
            Self::In(vs) => vs.iter().collect(),
            Self::Exists => Vec::new(),
        }
    }
}

impl fmt::Display for ConditionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq(v) => write!(f, "== {v}"),
            Self::Lt(v) => write!(f, "< {v}"),
            Self::Le(v) => write!(f, "<= {v}"),
            Self::Gt(v) => write!(f, "> {v}"),
            Self::Ge(v) => write!(f, ">= {v}"),
            Self::Between(lo, hi) => write!(f, "between {lo} and {hi}"),
            Self::In(vs) => write!(f, "in set of {}", vs.len()),
            Self::Exists => write!(f, "exists"),
        }
    }
}

///
/// Condition
///
/// One per-field constraint. A canonical query holds at most one
/// condition per field; a second condition on an already-constrained
/// field is an ambiguous constraint, never a merge.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Condition {
    pub field: String,
    pub op: ConditionOp,
}

impl Condition {
    #[must_use]
    pub fn new(field: impl Into<String>, op: ConditionOp) -> Self {
        Self {
            field: field.into(),
            op,
        }
    }

    /// True when this condition is an equality test.
    #[must_use]
    pub const fn is_eq(&self) -> bool {
        matches!(self.op, ConditionOp::Eq(_))
    }

    /// Evaluate this condition against one item.
    ///
    /// Missing attributes and cross-variant comparisons are no-match;
    /// `Exists` is exactly the presence test.
    #[must_use]
    pub fn matches(&self, item: &Item) -> bool {
        let Some(actual) = item.get(&self.field) else {
            return false;
        };

        match &self.op {
            ConditionOp::Eq(expected) => actual == expected,
            ConditionOp::Lt(expected) => {
                strict_order_cmp(actual, expected) == Some(Ordering::Less)
            }
            ConditionOp::Le(expected) => {
                matches!(
                    strict_order_cmp(actual, expected),
                    Some(Ordering::Less | Ordering::Equal)
                )
            }
            ConditionOp::Gt(expected) => {
                strict_order_cmp(actual, expected) == Some(Ordering::Greater)
            }
            ConditionOp::Ge(expected) => {
                matches!(
                    strict_order_cmp(actual, expected),
                    Some(Ordering::Greater | Ordering::Equal)
                )
            }
            ConditionOp::Between(lo, hi) => {
                matches!(
                    strict_order_cmp(actual, lo),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(
                    strict_order_cmp(actual, hi),
                    Some(Ordering::Less | Ordering::Equal)
                )
            }
            ConditionOp::In(candidates) => candidates.contains(actual),
            ConditionOp::Exists => true,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.op)
    }
}

///
/// ConditionSet
///
/// Canonical analyzer output: insertion-ordered, duplicate-rejecting set
/// of per-field conditions. Insertion order is preserved for diagnostics
/// only; correctness never depends on it.
///

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConditionSet {
    conditions: Vec<Condition>,
}

impl ConditionSet {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            conditions: Vec::new(),
        }
    }

    pub fn insert(&mut self, condition: Condition) -> Result<(), PredicateError> {
        if self.get(&condition.field).is_some() {
            return Err(PredicateError::AmbiguousConstraint {
                field: condition.field,
            });
        }
        self.conditions.push(condition);

        Ok(())
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.field == field)
    }

    #[must_use]
    pub fn iter(&self) -> std::slice::Iter<'_, Condition> {
        self.conditions.iter()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.conditions.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Remove and return the condition on `field`, if present.
    pub fn take(&mut self, field: &str) -> Option<Condition> {
        let position = self.conditions.iter().position(|c| c.field == field)?;
        Some(self.conditions.remove(position))
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<Condition> {
        self.conditions
    }

    /// True when every condition matches the item.
    #[must_use]
    pub fn matches(&self, item: &Item) -> bool {
        self.conditions.iter().all(|c| c.matches(item))
    }
}

impl<'a> IntoIterator for &'a ConditionSet {
    type Item = &'a Condition;
    type IntoIter = std::slice::Iter<'a, Condition>;

    fn into_iter(self) -> Self::IntoIter {
        self.conditions.iter()
    }
}

/// Normalize a predicate tree into a canonical condition set.
///
/// Total and pure: the same tree always yields the same set. Conjunction
/// nodes flatten recursively; anything else is unsupported at this layer.
pub fn analyze(predicate: &Predicate) -> Result<ConditionSet, PredicateError> {
    let mut set = ConditionSet::new();
    collect(predicate, &mut set)?;

    Ok(set)
}

fn collect(predicate: &Predicate, set: &mut ConditionSet) -> Result<(), PredicateError> {
    match predicate {
        Predicate::All(children) => {
            for child in children {
                collect(child, set)?;
            }

            Ok(())
        }
        Predicate::Where(condition) => {
            if let ConditionOp::In(candidates) = &condition.op
                && candidates.is_empty()
            {
                return Err(PredicateError::UnsupportedPredicate {
                    reason: format!("membership test on '{}' has no candidates", condition.field),
                });
            }

            set.insert(condition.clone())
        }
    }
}

///
/// PredicateError
///

#[derive(Clone, Debug, ThisError, Eq, PartialEq)]
pub enum PredicateError {
    #[error("ambiguous constraint: field '{field}' is constrained more than once")]
    AmbiguousConstraint { field: String },

    #[error("unsupported predicate: {reason}")]
    UnsupportedPredicate { reason: String },
}

///
/// TESTS
///
