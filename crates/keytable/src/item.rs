use crate::{schema::TableSchema, value::Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Schema-flexible item: an attribute map with canonical iteration order.
pub type Item = BTreeMap<String, Value>;

/// Build an item from (attribute, value) pairs.
#[must_use]
pub fn item_from(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> Item {
    pairs
        .into_iter()
        .map(|(field, value)| (field.to_string(), value))
        .collect()
}

///
/// PrimaryKey
///
/// The two-part primary key of one item: a partition (hash) value and an
/// optional sort (range) value. Extraction from an item is schema-driven
/// and fails when a declared key attribute is missing.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PrimaryKey {
    pub hash: Value,
    pub range: Option<Value>,
}

impl PrimaryKey {
    #[must_use]
    pub const fn new(hash: Value, range: Option<Value>) -> Self {
        Self { hash, range }
    }

    /// Extract this table's primary key from an item.
    pub fn of(schema: &TableSchema, item: &Item) -> Result<Self, KeyError> {
        let hash = item
            .get(&schema.hash_key)
            .cloned()
            .ok_or_else(|| KeyError::MissingKeyAttribute {
                table: schema.name.clone(),
                field: schema.hash_key.clone(),
            })?;

        let range = match &schema.range_key {
            Some(field) => Some(item.get(field).cloned().ok_or_else(|| {
                KeyError::MissingKeyAttribute {
                    table: schema.name.clone(),
                    field: field.clone(),
                }
            })?),
            None => None,
        };

        Ok(Self { hash, range })
    }

    /// Key values in canonical order (hash first, range second).
    #[must_use]
    pub fn values(&self) -> Vec<&Value> {
        let mut values = vec![&self.hash];
        if let Some(range) = &self.range {
            values.push(range);
        }
        values
    }

    /// True when this key matches the item's key attributes under `schema`.
    #[must_use]
    pub fn matches(&self, schema: &TableSchema, item: &Item) -> bool {
        Self::of(schema, item).is_ok_and(|key| key == *self)
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.range {
            Some(range) => write!(f, "({}, {})", self.hash, range),
            None => write!(f, "({})", self.hash),
        }
    }
}

///
/// KeyError
///

#[derive(Clone, Debug, thiserror::Error, Eq, PartialEq)]
pub enum KeyError {
    #[error("item for table '{table}' is missing key attribute '{field}'")]
    MissingKeyAttribute { table: String, field: String },
}

///
/// TESTS
///
