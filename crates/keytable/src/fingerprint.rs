use crate::{
    item::PrimaryKey,
    plan::{AccessPath, PlannedQuery},
    predicate::Condition,
    value::Value,
};
use std::fmt;
use xxhash_rust::xxh3::Xxh3;

///
/// Fingerprint
///
/// Stable 128-bit digest identifying a query shape plus bound values, or
/// one entity's primary key. Used verbatim as the cache-key suffix, so
/// the feed format below is part of the cache wire contract.
///

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(32);
        for byte in &self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

const FINGERPRINT_VERSION: u8 = 1;

// Path shape tags; part of the cache-key format, never renumber.
const TAG_EXACT_GET: u8 = 0x01;
const TAG_PRIMARY_QUERY: u8 = 0x02;
const TAG_INDEX_QUERY: u8 = 0x03;
const TAG_SCAN: u8 = 0x04;
const TAG_ENTITY: u8 = 0x05;

fn feed_u8(h: &mut Xxh3, x: u8) {
    h.update(&[x]);
}

fn feed_u32(h: &mut Xxh3, x: u32) {
    h.update(&x.to_be_bytes());
}

fn feed_i64(h: &mut Xxh3, x: i64) {
    h.update(&x.to_be_bytes());
}

fn feed_u64(h: &mut Xxh3, x: u64) {
    h.update(&x.to_be_bytes());
}

fn feed_bytes(h: &mut Xxh3, b: &[u8]) {
    h.update(b);
}

// Length-framed text so adjacent strings can never collide by concatenation.
#[allow(clippy::cast_possible_truncation)]
fn feed_text(h: &mut Xxh3, s: &str) {
    feed_u32(h, s.len() as u32);
    feed_bytes(h, s.as_bytes());
}

#[allow(clippy::cast_possible_truncation)]
fn feed_value(h: &mut Xxh3, value: &Value) {
    feed_u8(h, value.canonical_tag().to_u8());

    match value {
        Value::Null => {}
        Value::Bool(b) => feed_u8(h, u8::from(*b)),
        Value::Int(i) => feed_i64(h, *i),
        Value::Uint(u) => feed_u64(h, *u),
        Value::Text(s) => feed_text(h, s),
        Value::Blob(b) => {
            feed_u32(h, b.len() as u32);
            feed_bytes(h, b);
        }
        Value::List(xs) => {
            feed_u32(h, xs.len() as u32);
            for x in xs {
                feed_value(h, x);
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn feed_condition(h: &mut Xxh3, condition: &Condition) {
    feed_text(h, &condition.field);
    feed_u8(h, condition.op.tag());

    let values = condition.op.values();
    feed_u32(h, values.len() as u32);
    for value in values {
        feed_value(h, value);
    }
}

fn new_hasher() -> Xxh3 {
    let mut h = Xxh3::with_seed(0);
    feed_u8(&mut h, FINGERPRINT_VERSION);
    h
}

fn digest(h: &Xxh3) -> Fingerprint {
    Fingerprint(h.digest128().to_be_bytes())
}

/// Fingerprint of one planned query: table name, path shape, bound values,
/// and the residual conditions in field-sorted order.
///
/// Residual order is normalized so two analyses that only differ by
/// condition insertion order share one cache entry.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn query_fingerprint(plan: &PlannedQuery) -> Fingerprint {
    let mut h = new_hasher();
    feed_text(&mut h, &plan.table);

    match &plan.path {
        AccessPath::ExactGet { key } => {
            feed_u8(&mut h, TAG_EXACT_GET);
            feed_key(&mut h, key);
        }
        AccessPath::PrimaryQuery { hash, range } => {
            feed_u8(&mut h, TAG_PRIMARY_QUERY);
            feed_value(&mut h, hash);
            feed_range(&mut h, range.as_ref());
        }
        AccessPath::IndexQuery { index, hash, range } => {
            feed_u8(&mut h, TAG_INDEX_QUERY);
            feed_text(&mut h, index);
            feed_value(&mut h, hash);
            feed_range(&mut h, range.as_ref());
        }
        AccessPath::Scan => feed_u8(&mut h, TAG_SCAN),
    }

    let mut residual: Vec<&Condition> = plan.residual.iter().collect();
    residual.sort_by(|a, b| a.field.cmp(&b.field));
    feed_u32(&mut h, residual.len() as u32);
    for condition in residual {
        feed_condition(&mut h, condition);
    }

    digest(&h)
}

/// Fingerprint of one entity's primary key within a table.
#[must_use]
pub fn entity_fingerprint(table: &str, key: &PrimaryKey) -> Fingerprint {
    let mut h = new_hasher();
    feed_text(&mut h, table);
    feed_u8(&mut h, TAG_ENTITY);
    feed_key(&mut h, key);

    digest(&h)
}

fn feed_key(h: &mut Xxh3, key: &PrimaryKey) {
    feed_value(h, &key.hash);
    match &key.range {
        Some(range) => {
            feed_u8(h, 0x01);
            feed_value(h, range);
        }
        None => feed_u8(h, 0x00),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn feed_range(h: &mut Xxh3, range: Option<&crate::plan::RangeCondition>) {
    match range {
        Some(range) => {
            feed_u8(h, 0x01);
            feed_u8(h, range.tag());
            let values = range.values();
            feed_u32(h, values.len() as u32);
            for value in values {
                feed_value(h, value);
            }
        }
        None => feed_u8(h, 0x00),
    }
}

///
/// TESTS
///

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::plan_predicate;
    use crate::predicate::{ConditionOp, Predicate};
    use crate::schema::TableSchema;

    fn schema() -> TableSchema {
        TableSchema::new("books", "Name").with_range_key("PublishYear")
    }

    fn fp(tree: &Predicate) -> Fingerprint {
        let plan = plan_predicate(&schema(), tree).expect("plan");
        query_fingerprint(&plan)
    }

    #[test]
    fn identical_plans_share_a_fingerprint() {
        let tree = Predicate::all([
            Predicate::field("Name", ConditionOp::Eq(Value::from("Dune"))),
            Predicate::field("PublishYear", ConditionOp::Ge(Value::Int(1960))),
        ]);
        assert_eq!(fp(&tree), fp(&tree));
    }

    #[test]
    fn residual_insertion_order_does_not_change_the_fingerprint() {
        let forward = Predicate::all([
            Predicate::field("Name", ConditionOp::Eq(Value::from("Dune"))),
            Predicate::field("Author", ConditionOp::Exists),
            Predicate::field("Pages", ConditionOp::Gt(Value::Int(100))),
        ]);
        let reversed = Predicate::all([
            Predicate::field("Name", ConditionOp::Eq(Value::from("Dune"))),
            Predicate::field("Pages", ConditionOp::Gt(Value::Int(100))),
            Predicate::field("Author", ConditionOp::Exists),
        ]);
        assert_eq!(
            fp(&forward),
            fp(&reversed),
            "residual conditions are field-sorted before hashing"
        );
    }

    #[test]
    fn bound_values_distinguish_fingerprints() {
        let a = Predicate::all([
            Predicate::field("Name", ConditionOp::Eq(Value::from("Dune"))),
            Predicate::field("PublishYear", ConditionOp::Eq(Value::Int(1965))),
        ]);
        let b = Predicate::all([
            Predicate::field("Name", ConditionOp::Eq(Value::from("Dune"))),
            Predicate::field("PublishYear", ConditionOp::Eq(Value::Int(1999))),
        ]);
        assert_ne!(fp(&a), fp(&b), "bound key values must separate cache entries");
    }

    #[test]
    fn entity_fingerprints_are_table_scoped() {
        let key = PrimaryKey::new(Value::from("Dune"), Some(Value::Int(1965)));
        assert_ne!(
            entity_fingerprint("books", &key),
            entity_fingerprint("archive", &key),
            "the same key in different tables must not collide"
        );
    }

    #[test]
    fn query_and_entity_fingerprints_never_collide_on_equal_values() {
        let tree = Predicate::all([
            Predicate::field("Name", ConditionOp::Eq(Value::from("Dune"))),
            Predicate::field("PublishYear", ConditionOp::Eq(Value::Int(1965))),
        ]);
        let key = PrimaryKey::new(Value::from("Dune"), Some(Value::Int(1965)));
        assert_ne!(
            fp(&tree),
            entity_fingerprint("books", &key),
            "shape tags must separate result-set keys from entity keys"
        );
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn fingerprints_are_deterministic(year in i64::MIN..i64::MAX) {
                let tree = Predicate::all([
                    Predicate::field("Name", ConditionOp::Eq(Value::from("Dune"))),
                    Predicate::field("PublishYear", ConditionOp::Eq(Value::Int(year))),
                ]);
                prop_assert_eq!(fp(&tree), fp(&tree));
            }

            #[test]
            fn distinct_years_produce_distinct_fingerprints(
                a in 0i64..100_000,
                b in 0i64..100_000,
            ) {
                prop_assume!(a != b);
                let tree_a = Predicate::field("PublishYear", ConditionOp::Eq(Value::Int(a)));
                let tree_b = Predicate::field("PublishYear", ConditionOp::Eq(Value::Int(b)));
                prop_assert_ne!(fp(&tree_a), fp(&tree_b));
            }
        }
    }
}
