///
/// TableSchema
///
/// Static schema for one hash/range keyed table: primary key attributes
/// plus zero or more secondary index descriptors. Immutable after
/// construction and shared read-only by every component above it.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub hash_key: String,
    pub range_key: Option<String>,
    pub indexes: Vec<IndexSchema>,
}

impl TableSchema {
    #[must_use]
    pub fn new(name: impl Into<String>, hash_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hash_key: hash_key.into(),
            range_key: None,
            indexes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_range_key(mut self, range_key: impl Into<String>) -> Self {
        self.range_key = Some(range_key.into());
        self
    }

    #[must_use]
    pub fn with_index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }

    /// Declared primary key attribute names (hash first, range second).
    #[must_use]
    pub fn key_fields(&self) -> Vec<&str> {
        let mut fields = vec![self.hash_key.as_str()];
        if let Some(range) = &self.range_key {
            fields.push(range.as_str());
        }
        fields
    }

    /// Look up a secondary index by declared name.
    #[must_use]
    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|index| index.name == name)
    }
}

///
/// IndexSchema
///
/// One secondary index: an alternate hash/range projection over the same
/// table, queryable independently of the primary key and provisioned with
/// its own capacity.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexSchema {
    pub name: String,
    pub hash_key: String,
    pub range_key: Option<String>,
    pub projection: Projection,
    pub capacity: CapacityUnits,
}

impl IndexSchema {
    #[must_use]
    pub fn new(name: impl Into<String>, hash_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hash_key: hash_key.into(),
            range_key: None,
            projection: Projection::All,
            capacity: CapacityUnits::default(),
        }
    }

    #[must_use]
    pub fn with_range_key(mut self, range_key: impl Into<String>) -> Self {
        self.range_key = Some(range_key.into());
        self
    }

    #[must_use]
    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    #[must_use]
    pub const fn with_capacity(mut self, capacity: CapacityUnits) -> Self {
        self.capacity = capacity;
        self
    }

    /// Declared index key attribute names (hash first, range second).
    #[must_use]
    pub fn key_fields(&self) -> Vec<&str> {
        let mut fields = vec![self.hash_key.as_str()];
        if let Some(range) = &self.range_key {
            fields.push(range.as_str());
        }
        fields
    }
}

///
/// Projection
/// Attribute set materialized into a secondary index.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Projection {
    All,
    Include(Vec<String>),
}

///
/// CapacityUnits
/// Independent read/write throughput provisioning for one index.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CapacityUnits {
    pub read: u64,
    pub write: u64,
}

impl Default for CapacityUnits {
    fn default() -> Self {
        Self { read: 5, write: 5 }
    }
}

///
/// TESTS
///
