use crate::{
    item::{Item, KeyError, PrimaryKey},
    plan::RangeCondition,
    predicate::ConditionSet,
    schema::TableSchema,
    value::{Value, canonical_cmp},
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error as ThisError;

/// Lazy item sequence produced by query/scan operations.
pub type ItemStream = Box<dyn Iterator<Item = Result<Item, BackendError>> + Send>;

///
/// BackendStore
///
/// Contract to the backing table store. The core plans against this
/// boundary and never reaches around it; capacity exhaustion must be
/// reported distinguishably so retry-aware callers can back off.
///

pub trait BackendStore: Send + Sync {
    /// Direct key lookup. A missing key is an error, not empty-success.
    fn get_item(&self, table: &str, key: &PrimaryKey) -> Result<Item, BackendError>;

    /// Key-condition query against the primary key (`index` = `None`) or a
    /// declared secondary index, with an optional backend-side filter.
    fn query(
        &self,
        table: &str,
        index: Option<&str>,
        hash: &Value,
        range: Option<&RangeCondition>,
        filter: &ConditionSet,
    ) -> Result<ItemStream, BackendError>;

    /// Full scan with an optional backend-side filter.
    fn scan(&self, table: &str, filter: &ConditionSet) -> Result<ItemStream, BackendError>;

    /// Batched puts and deletes with per-item outcomes. Deleting an absent
    /// key is idempotent success.
    fn batch_write(
        &self,
        table: &str,
        puts: Vec<Item>,
        deletes: Vec<PrimaryKey>,
    ) -> Result<Vec<WriteOutcome>, BackendError>;
}

///
/// WriteOutcome
/// Per-item result of one batched write, in submission order (puts first).
///

#[derive(Clone, Debug)]
pub struct WriteOutcome {
    pub op: WriteOp,
    pub error: Option<BackendError>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WriteOp {
    Put(PrimaryKey),
    Delete(PrimaryKey),
}

impl WriteOp {
    #[must_use]
    pub const fn key(&self) -> &PrimaryKey {
        match self {
            Self::Put(key) | Self::Delete(key) => key,
        }
    }
}

///
/// BackendError
///

#[derive(Clone, Debug, ThisError, Eq, PartialEq)]
pub enum BackendError {
    #[error("key {key} not found in table '{table}'")]
    NotFound { table: String, key: String },

    #[error("provisioned capacity exceeded on table '{table}'")]
    CapacityExceeded { table: String },

    #[error("table '{table}' is not bound")]
    TableMissing { table: String },

    #[error("index '{index}' is not declared on table '{table}'")]
    IndexMissing { table: String, index: String },

    #[error(transparent)]
    Key(#[from] KeyError),
}

impl BackendError {
    /// True for transient conditions the caller may retry with backoff.
    /// The core itself never retries.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}

///
/// MemoryBackend
///
/// Reference in-process backend honoring the full store contract,
/// including per-item write outcomes and capacity-fault injection. Used
/// as the collaborator implementation in tests and local tooling.
///

#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<HashMap<String, TableData>>,
    read_ops: AtomicU64,
    rebuild_ops: AtomicU64,
    trip_capacity: AtomicBool,
    reject_put_keys: Mutex<Vec<PrimaryKey>>,
}

struct TableData {
    schema: TableSchema,
    rows: Vec<Item>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a table schema. Idempotent for an identical schema.
    pub fn create_table(&self, schema: TableSchema) {
        let mut tables = self.tables.lock().expect("backend table state");
        tables
            .entry(schema.name.clone())
            .or_insert_with(|| TableData {
                schema,
                rows: Vec::new(),
            });
    }

    /// Number of get/query/scan calls served.
    #[must_use]
    pub fn read_ops(&self) -> u64 {
        self.read_ops.load(Ordering::SeqCst)
    }

    /// Number of query/scan calls served (cache rebuild work).
    #[must_use]
    pub fn rebuild_ops(&self) -> u64 {
        self.rebuild_ops.load(Ordering::SeqCst)
    }

    /// Make the next read fail once with a capacity error.
    pub fn trip_capacity_once(&self) {
        self.trip_capacity.store(true, Ordering::SeqCst);
    }

    /// Reject future puts for `key` with a per-item capacity error.
    pub fn reject_puts_for(&self, key: PrimaryKey) {
        self.reject_put_keys
            .lock()
            .expect("backend reject state")
            .push(key);
    }

    fn check_capacity(&self, table: &str) -> Result<(), BackendError> {
        if self.trip_capacity.swap(false, Ordering::SeqCst) {
            return Err(BackendError::CapacityExceeded {
                table: table.to_string(),
            });
        }

        Ok(())
    }

    fn with_table<T>(
        &self,
        table: &str,
        f: impl FnOnce(&mut TableData) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let mut tables = self.tables.lock().expect("backend table state");
        let data = tables
            .get_mut(table)
            .ok_or_else(|| BackendError::TableMissing {
                table: table.to_string(),
            })?;

        f(data)
    }
}

impl BackendStore for MemoryBackend {
    fn get_item(&self, table: &str, key: &PrimaryKey) -> Result<Item, BackendError> {
        self.check_capacity(table)?;
        self.read_ops.fetch_add(1, Ordering::SeqCst);

        self.with_table(table, |data| {
            data.rows
                .iter()
                .find(|row| key.matches(&data.schema, row))
                .cloned()
                .ok_or_else(|| BackendError::NotFound {
                    table: table.to_string(),
                    key: key.to_string(),
                })
        })
    }

    fn query(
        &self,
        table: &str,
        index: Option<&str>,
        hash: &Value,
        range: Option<&RangeCondition>,
        filter: &ConditionSet,
    ) -> Result<ItemStream, BackendError> {
        self.check_capacity(table)?;
        self.read_ops.fetch_add(1, Ordering::SeqCst);
        self.rebuild_ops.fetch_add(1, Ordering::SeqCst);

        let rows = self.with_table(table, |data| {
            let (hash_field, range_field) = match index {
                Some(name) => {
                    let index =
                        data.schema
                            .index(name)
                            .ok_or_else(|| BackendError::IndexMissing {
                                table: table.to_string(),
                                index: name.to_string(),
                            })?;
                    (index.hash_key.clone(), index.range_key.clone())
                }
                None => (data.schema.hash_key.clone(), data.schema.range_key.clone()),
            };

            let mut rows: Vec<Item> = data
                .rows
                .iter()
                .filter(|row| row.get(&hash_field) == Some(hash))
                .filter(|row| match (&range_field, range) {
                    (Some(field), Some(condition)) => {
                        row.get(field).is_some_and(|value| condition.matches(value))
                    }
                    // Sparse index: items missing the declared sort key do
                    // not appear in that index at all.
                    (Some(field), None) => row.contains_key(field),
                    (None, Some(_)) => false,
                    (None, None) => true,
                })
                .filter(|row| filter.matches(row))
                .cloned()
                .collect();

            if let Some(field) = &range_field {
                rows.sort_by(|a, b| match (a.get(field), b.get(field)) {
                    (Some(x), Some(y)) => canonical_cmp(x, y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                });
            }

            Ok(rows)
        })?;

        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn scan(&self, table: &str, filter: &ConditionSet) -> Result<ItemStream, BackendError> {
        self.check_capacity(table)?;
        self.read_ops.fetch_add(1, Ordering::SeqCst);
        self.rebuild_ops.fetch_add(1, Ordering::SeqCst);

        let rows = self.with_table(table, |data| {
            Ok(data
                .rows
                .iter()
                .filter(|row| filter.matches(row))
                .cloned()
                .collect::<Vec<_>>())
        })?;

        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn batch_write(
        &self,
        table: &str,
        puts: Vec<Item>,
        deletes: Vec<PrimaryKey>,
    ) -> Result<Vec<WriteOutcome>, BackendError> {
        let rejected: Vec<PrimaryKey> = self
            .reject_put_keys
            .lock()
            .expect("backend reject state")
            .clone();

        self.with_table(table, |data| {
            let mut outcomes = Vec::with_capacity(puts.len() + deletes.len());

            for item in puts {
                let key = PrimaryKey::of(&data.schema, &item)?;
                if rejected.contains(&key) {
                    outcomes.push(WriteOutcome {
                        op: WriteOp::Put(key),
                        error: Some(BackendError::CapacityExceeded {
                            table: table.to_string(),
                        }),
                    });
                    continue;
                }

                // Put semantics: replace the row with this key, else append.
                match data
                    .rows
                    .iter_mut()
                    .find(|row| key.matches(&data.schema, row))
                {
                    Some(existing) => *existing = item,
                    None => data.rows.push(item),
                }
                outcomes.push(WriteOutcome {
                    op: WriteOp::Put(key),
                    error: None,
                });
            }

            for key in deletes {
                data.rows.retain(|row| !key.matches(&data.schema, row));
                outcomes.push(WriteOutcome {
                    op: WriteOp::Delete(key),
                    error: None,
                });
            }

            Ok(outcomes)
        })
    }
}

///
/// TESTS
///

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::item_from;
    use crate::schema::IndexSchema;

    fn scores_backend() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.create_table(
            TableSchema::new("scores", "UserId")
                .with_range_key("GameTitle")
                .with_index(IndexSchema::new("by-title", "GameTitle").with_range_key("TopScore")),
        );
        for (user, title, score) in [
            ("101", "Galaxy Invaders", 5842),
            ("101", "Starship X", 24),
            ("103", "Starship X", 42),
        ] {
            let outcomes = backend
                .batch_write(
                    "scores",
                    vec![item_from([
                        ("UserId", Value::from(user)),
                        ("GameTitle", Value::from(title)),
                        ("TopScore", Value::Int(score)),
                    ])],
                    Vec::new(),
                )
                .expect("seed write");
            assert!(outcomes.iter().all(|o| o.error.is_none()));
        }
        backend
    }

    fn collect(stream: ItemStream) -> Vec<Item> {
        stream.map(|row| row.expect("stream row")).collect()
    }

    #[test]
    fn get_item_misses_are_errors() {
        let backend = scores_backend();
        let key = PrimaryKey::new(Value::from("999"), Some(Value::from("Nothing")));

        let err = backend
            .get_item("scores", &key)
            .expect_err("missing key must not be empty-success");
        assert!(matches!(err, BackendError::NotFound { .. }));
    }

    #[test]
    fn index_query_applies_native_range_condition() {
        let backend = scores_backend();
        let rows = collect(
            backend
                .query(
                    "scores",
                    Some("by-title"),
                    &Value::from("Starship X"),
                    Some(&RangeCondition::Gt(Value::Int(30))),
                    &ConditionSet::new(),
                )
                .expect("index query"),
        );

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("UserId"), Some(&Value::from("103")));
    }

    #[test]
    fn rows_missing_the_index_sort_key_are_absent_from_that_index() {
        let backend = scores_backend();
        backend
            .batch_write(
                "scores",
                vec![item_from([
                    ("UserId", Value::from("105")),
                    ("GameTitle", Value::from("Starship X")),
                ])],
                Vec::new(),
            )
            .expect("row without a TopScore attribute");

        let rows = collect(
            backend
                .query(
                    "scores",
                    Some("by-title"),
                    &Value::from("Starship X"),
                    None,
                    &ConditionSet::new(),
                )
                .expect("hash-only index query"),
        );

        assert_eq!(rows.len(), 2, "only rows carrying the sort key appear");
        assert!(
            rows.iter().all(|row| row.contains_key("TopScore")),
            "sparse rows must not leak into the index"
        );
    }

    #[test]
    fn query_results_sort_by_range_key() {
        let backend = scores_backend();
        let rows = collect(
            backend
                .query(
                    "scores",
                    None,
                    &Value::from("101"),
                    None,
                    &ConditionSet::new(),
                )
                .expect("primary query"),
        );

        let titles: Vec<_> = rows
            .iter()
            .map(|row| row.get("GameTitle").cloned().expect("title"))
            .collect();
        assert_eq!(
            titles,
            vec![Value::from("Galaxy Invaders"), Value::from("Starship X")],
            "rows within one partition sort by the range key"
        );
    }

    #[test]
    fn delete_of_absent_key_is_idempotent() {
        let backend = scores_backend();
        let key = PrimaryKey::new(Value::from("999"), Some(Value::from("Nothing")));

        let outcomes = backend
            .batch_write("scores", Vec::new(), vec![key])
            .expect("batch write");
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].error.is_none(), "absent delete is a success");
    }

    #[test]
    fn tripped_capacity_surfaces_retryable_error_once() {
        let backend = scores_backend();
        backend.trip_capacity_once();

        let err = match backend.scan("scores", &ConditionSet::new()) {
            Err(err) => err,
            Ok(_) => panic!("tripped backend must fail"),
        };
        assert!(err.is_retryable(), "capacity errors are retryable");

        assert!(
            backend.scan("scores", &ConditionSet::new()).is_ok(),
            "capacity trip clears after one failure"
        );
    }

    #[test]
    fn per_item_put_rejection_leaves_other_items_applied() {
        let backend = scores_backend();
        let poisoned = PrimaryKey::new(Value::from("200"), Some(Value::from("Bad Game")));
        backend.reject_puts_for(poisoned.clone());

        let outcomes = backend
            .batch_write(
                "scores",
                vec![
                    item_from([
                        ("UserId", Value::from("200")),
                        ("GameTitle", Value::from("Bad Game")),
                    ]),
                    item_from([
                        ("UserId", Value::from("201")),
                        ("GameTitle", Value::from("Good Game")),
                    ]),
                ],
                Vec::new(),
            )
            .expect("batch write");

        assert!(outcomes[0].error.is_some(), "poisoned put must fail");
        assert!(outcomes[1].error.is_none(), "other puts are unaffected");

        let good = PrimaryKey::new(Value::from("201"), Some(Value::from("Good Game")));
        assert!(backend.get_item("scores", &good).is_ok());
        assert!(backend.get_item("scores", &poisoned).is_err());
    }
}
