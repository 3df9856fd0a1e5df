use crate::{
    item::PrimaryKey,
    predicate::{Condition, ConditionOp, ConditionSet, Predicate, PredicateError, analyze},
    schema::{IndexSchema, TableSchema},
    value::{Value, strict_order_cmp},
};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error as ThisError;

///
/// RangeCondition
///
/// Native key condition on the chosen path's range key. Only comparison
/// shapes the backend can enforce on a sort key qualify; membership and
/// existence tests never lower to a native range condition.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RangeCondition {
    Eq(Value),
    Lt(Value),
    Le(Value),
    Gt(Value),
    Ge(Value),
    Between(Value, Value),
}

impl RangeCondition {
    /// Lower a per-field condition to a native range condition, if possible.
    #[must_use]
    pub fn lower(op: &ConditionOp) -> Option<Self> {
        match op {
            ConditionOp::Eq(v) => Some(Self::Eq(v.clone())),
            ConditionOp::Lt(v) => Some(Self::Lt(v.clone())),
            ConditionOp::Le(v) => Some(Self::Le(v.clone())),
            ConditionOp::Gt(v) => Some(Self::Gt(v.clone())),
            ConditionOp::Ge(v) => Some(Self::Ge(v.clone())),
            ConditionOp::Between(lo, hi) => Some(Self::Between(lo.clone(), hi.clone())),
            ConditionOp::In(_) | ConditionOp::Exists => None,
        }
    }

    /// Evaluate this native condition against one range-key value.
    #[must_use]
    pub fn matches(&self, actual: &Value) -> bool {
        match self {
            Self::Eq(expected) => actual == expected,
            Self::Lt(expected) => strict_order_cmp(actual, expected) == Some(Ordering::Less),
            Self::Le(expected) => matches!(
                strict_order_cmp(actual, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Self::Gt(expected) => strict_order_cmp(actual, expected) == Some(Ordering::Greater),
            Self::Ge(expected) => matches!(
                strict_order_cmp(actual, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::Between(lo, hi) => {
                matches!(
                    strict_order_cmp(actual, lo),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(
                    strict_order_cmp(actual, hi),
                    Some(Ordering::Less | Ordering::Equal)
                )
            }
        }
    }

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
        }
    }

    /// Bound values in declaration order.
    #[must_use]
    pub fn values(&self) -> Vec<&Value> {
        match self {
            Self::Eq(v) | Self::Lt(v) | Self::Le(v) | Self::Gt(v) | Self::Ge(v) => vec![v],
            Self::Between(lo, hi) => vec![lo, hi],
        }
    }
}

///
/// AccessPath
///
/// The chosen concrete backend operation. Preference order is structural
/// (key-based beats index, index beats scan), never cost-estimated.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AccessPath {
    /// Direct key lookup; strongly consistent at the primary table.
    ExactGet { key: PrimaryKey },
    /// Primary-key query: hash equality plus optional native range condition.
    PrimaryQuery {
        hash: Value,
        range: Option<RangeCondition>,
    },
    /// Secondary-index query; eventually consistent, index capacity applies.
    IndexQuery {
        index: String,
        hash: Value,
        range: Option<RangeCondition>,
    },
    /// Full scan; last resort, every condition is residual.
    Scan,
}

///
/// PathKind
/// Diagnostic-facing discriminant of an access path.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PathKind {
    ExactGet,
    PrimaryQuery,
    IndexQuery,
    Scan,
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ExactGet => "exact get",
            Self::PrimaryQuery => "primary query",
            Self::IndexQuery => "index query",
            Self::Scan => "scan",
        };
        write!(f, "{label}")
    }
}

impl AccessPath {
    #[must_use]
    pub const fn kind(&self) -> PathKind {
        match self {
            Self::ExactGet { .. } => PathKind::ExactGet,
            Self::PrimaryQuery { .. } => PathKind::PrimaryQuery,
            Self::IndexQuery { .. } => PathKind::IndexQuery,
            Self::Scan => PathKind::Scan,
        }
    }
}

///
/// PlannedQuery
///
/// One chosen access path plus the residual filter: conditions the path
/// cannot enforce natively, applied as a post-filter on returned rows.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlannedQuery {
    pub table: String,
    pub path: AccessPath,
    pub residual: ConditionSet,
}

/// Fields a planned query's shape reads: native key fields plus residual
/// filter fields. Used by the cache mediator for conservative invalidation.
#[must_use]
pub fn shape_fields(schema: &TableSchema, plan: &PlannedQuery) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    let mut push = |field: &str| {
        if !fields.iter().any(|f| f == field) {
            fields.push(field.to_string());
        }
    };

    match &plan.path {
        AccessPath::ExactGet { .. } | AccessPath::PrimaryQuery { .. } => {
            push(&schema.hash_key);
            if let Some(range) = &schema.range_key {
                push(range);
            }
        }
        AccessPath::IndexQuery { index, .. } => {
            if let Some(index) = schema.index(index) {
                push(&index.hash_key);
                if let Some(range) = &index.range_key {
                    push(range);
                }
            }
        }
        AccessPath::Scan => {}
    }
    for condition in &plan.residual {
        push(&condition.field);
    }

    fields
}

///
/// PlanError
///

#[derive(Clone, Debug, ThisError, Eq, PartialEq)]
pub enum PlanError {
    #[error(transparent)]
    Predicate(#[from] PredicateError),
}

/// Analyze a predicate tree and plan its access path in one step.
pub fn plan_predicate(schema: &TableSchema, predicate: &Predicate) -> Result<PlannedQuery, PlanError> {
    let conditions = analyze(predicate)?;
    plan(schema, conditions)
}

/// Select the cheapest valid access path for a canonical condition set.
///
/// Strict preference order, ties broken by declaration order:
/// 1. exact get (every primary key field has an equality condition)
/// 2. primary query (hash equality, range condition lowered when possible)
/// 3. index query (first declared index with the strongest match;
///    hash+range beats hash-only)
/// 4. scan (full condition set residual)
pub fn plan(schema: &TableSchema, conditions: ConditionSet) -> Result<PlannedQuery, PlanError> {
    // 1. Exact get: all primary key fields under equality.
    if let Some(planned) = try_exact_get(schema, &conditions) {
        return Ok(planned);
    }

    // 2. Primary query: hash equality on the table's partition key.
    if conditions
        .get(&schema.hash_key)
        .is_some_and(Condition::is_eq)
    {
        let mut residual = conditions;
        let hash = take_eq_value(&mut residual, &schema.hash_key);
        let range = take_range_condition(&mut residual, schema.range_key.as_deref());

        return Ok(PlannedQuery {
            table: schema.name.clone(),
            path: AccessPath::PrimaryQuery { hash, range },
            residual,
        });
    }

    // 3. Index query: strongest match wins, then declaration order.
    if let Some(index) = select_index(schema, &conditions) {
        let index = index.clone();
        let mut residual = conditions;
        let hash = take_eq_value(&mut residual, &index.hash_key);
        let range = take_range_condition(&mut residual, index.range_key.as_deref());

        return Ok(PlannedQuery {
            table: schema.name.clone(),
            path: AccessPath::IndexQuery {
                index: index.name,
                hash,
                range,
            },
            residual,
        });
    }

    // 4. Scan: everything is residual.
    Ok(PlannedQuery {
        table: schema.name.clone(),
        path: AccessPath::Scan,
        residual: conditions,
    })
}

fn try_exact_get(schema: &TableSchema, conditions: &ConditionSet) -> Option<PlannedQuery> {
    let hash = eq_value(conditions, &schema.hash_key)?;
    let range = match &schema.range_key {
        Some(field) => Some(eq_value(conditions, field)?),
        None => None,
    };

    let mut residual = conditions.clone();
    residual.take(&schema.hash_key);
    if let Some(field) = &schema.range_key {
        residual.take(field);
    }

    Some(PlannedQuery {
        table: schema.name.clone(),
        path: AccessPath::ExactGet {
            key: PrimaryKey::new(hash, range),
        },
        residual,
    })
}

// Pick the first declared index with the strongest match:
// hash+range native condition beats hash-only.
fn select_index<'a>(schema: &'a TableSchema, conditions: &ConditionSet) -> Option<&'a IndexSchema> {
    let mut best: Option<(&IndexSchema, u8)> = None;

    for index in &schema.indexes {
        if !conditions.get(&index.hash_key).is_some_and(Condition::is_eq) {
            continue;
        }

        let strength = match &index.range_key {
            Some(range_field) => {
                let native = conditions
                    .get(range_field)
                    .is_some_and(|c| RangeCondition::lower(&c.op).is_some());
                if native { 2 } else { 1 }
            }
            None => 1,
        };

        match best {
            Some((_, best_strength)) if best_strength >= strength => {}
            _ => best = Some((index, strength)),
        }
    }

    best.map(|(index, _)| index)
}

fn eq_value(conditions: &ConditionSet, field: &str) -> Option<Value> {
    match conditions.get(field).map(|c| &c.op) {
        Some(ConditionOp::Eq(value)) => Some(value.clone()),
        _ => None,
    }
}

// The caller has already established an Eq condition on `field`.
fn take_eq_value(conditions: &mut ConditionSet, field: &str) -> Value {
    match conditions.take(field).map(|c| c.op) {
        Some(ConditionOp::Eq(value)) => value,
        _ => unreachable!("path selection requires an equality condition on '{field}'"),
    }
}

// Lower the condition on the chosen range key to a native condition when
// its shape allows; otherwise leave it in the residual filter.
fn take_range_condition(
    conditions: &mut ConditionSet,
    range_field: Option<&str>,
) -> Option<RangeCondition> {
    let field = range_field?;
    let condition = conditions.get(field)?;
    let lowered = RangeCondition::lower(&condition.op)?;
    conditions.take(field);

    Some(lowered)
}

///
/// TESTS
///
