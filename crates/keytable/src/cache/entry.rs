use crate::cache::store::CacheStoreError;
use crate::item::{Item, PrimaryKey};
use crate::plan::PathKind;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

///
/// CachedIndexEntry
///
/// One materialized query result: the ordered entity-key list plus the
/// table version observed when it was built. Dropped, never patched,
/// when a write could affect its shape.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CachedIndexEntry {
    pub keys: Vec<PrimaryKey>,
    pub version: u64,
}

///
/// CachedEntityEntry
/// One entity snapshot plus the table version it was written/read at.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CachedEntityEntry {
    pub item: Item,
    pub version: u64,
}

///
/// ShapeKind
/// Serialized discriminant of a registered result-set shape.
///

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ShapeKind {
    Key,
    Primary,
    Index,
    Scan,
}

impl From<PathKind> for ShapeKind {
    fn from(kind: PathKind) -> Self {
        match kind {
            PathKind::ExactGet => Self::Key,
            PathKind::PrimaryQuery => Self::Primary,
            PathKind::IndexQuery => Self::Index,
            PathKind::Scan => Self::Scan,
        }
    }
}

///
/// ShapeSummary
///
/// Per-fingerprint shape record driving conservative write-time
/// invalidation: the path kind and every field the shape reads. A write
/// touching any of these fields drops the result set.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ShapeSummary {
    pub kind: ShapeKind,
    pub fields: Vec<String>,
}

impl ShapeSummary {
    /// True when a write over `touched` fields could affect this shape.
    /// Scans match every write; unknown is treated as affected.
    #[must_use]
    pub fn affected_by(&self, touched: &[String]) -> bool {
        matches!(self.kind, ShapeKind::Scan)
            || self.fields.iter().any(|field| touched.contains(field))
    }
}

///
/// QueryRegistry
///
/// Per-table record of every materialized result set currently in the
/// cache, keyed by fingerprint hex. Lets writers enumerate and drop
/// affected entries without cache-side key listing.
///

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct QueryRegistry {
    pub shapes: BTreeMap<String, ShapeSummary>,
}

impl QueryRegistry {
    /// Fingerprints of shapes a write over `touched` fields could affect.
    #[must_use]
    pub fn affected_fingerprints(&self, touched: &[String]) -> Vec<String> {
        self.shapes
            .iter()
            .filter(|(_, shape)| shape.affected_by(touched))
            .map(|(fingerprint, _)| fingerprint.clone())
            .collect()
    }
}

/// Encode one cache record as CBOR.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CacheStoreError> {
    serde_cbor::to_vec(value).map_err(|err| CacheStoreError::Unavailable {
        message: format!("cache record encoding failed: {err}"),
    })
}

/// Decode one cache record; a corrupt payload is `None` (treated as a
/// miss by the mediator, never an error).
#[must_use]
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Option<T> {
    serde_cbor::from_slice(bytes).ok()
}

///
/// TESTS
///
