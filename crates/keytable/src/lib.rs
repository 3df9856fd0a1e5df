//! Query-expression driven access layer over hash/range-keyed table
//! stores, with a look-aside cache kept consistent by write-triggered
//! invalidation and a lease-based distributed lock.
//!
//! ## Crate layout
//! - `value`: attribute values, canonical ordering, and comparison rules.
//! - `schema`: table and secondary-index descriptors.
//! - `item`: attribute maps and schema-driven primary-key extraction.
//! - `predicate`: conjunctive predicate trees and canonical condition sets.
//! - `plan`: access-path selection (get / query / index query / scan).
//! - `fingerprint`: stable 128-bit identities for queries and entities.
//! - `backend`: the table-store contract plus an in-process reference.
//! - `cache`: cache store contract, distributed lock, cache records, and
//!   the mediator driving the read/invalidate protocol.
//! - `tracker`: per-session unit of work with batched submit.
//! - `session`: the explicitly constructed entry point.
//! - `obs`: diagnostics events and sinks.
//!
//! The `prelude` module mirrors the surface a typical caller touches.

pub mod backend;
pub mod cache;
pub mod fingerprint;
pub mod item;
pub mod obs;
pub mod plan;
pub mod predicate;
pub mod schema;
pub mod session;
pub mod tracker;
pub mod value;

use thiserror::Error as ThisError;

//
// Consts
//

/// Workspace version re-export for downstream tooling/tests.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

///
/// Error
///
/// Top-level error surface; every layer error converts losslessly.
///

#[derive(Clone, Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Predicate(#[from] predicate::PredicateError),

    #[error(transparent)]
    Plan(#[from] plan::PlanError),

    #[error(transparent)]
    Key(#[from] item::KeyError),

    #[error(transparent)]
    Backend(#[from] backend::BackendError),

    #[error(transparent)]
    Tracker(#[from] tracker::TrackerError),
}

///
/// Prelude
/// using _ brings traits into scope and avoids name conflicts
///

pub mod prelude {
    pub use crate::{
        Error,
        backend::{BackendError, BackendStore, MemoryBackend},
        cache::{CacheConfig, CacheStore, MemoryCacheStore},
        item::{Item, PrimaryKey, item_from},
        obs::{DiagnosticEvent, DiagnosticsSink, MemorySink, NullSink},
        plan::PathKind,
        predicate::{ConditionOp, Predicate},
        schema::{IndexSchema, TableSchema},
        session::{Session, TableContext},
        tracker::{EntityState, TrackerError},
        value::Value,
    };
}
