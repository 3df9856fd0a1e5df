use crate::{
    Error,
    backend::{BackendError, BackendStore},
    cache::{CacheConfig, CacheMediator, CacheStore},
    item::{Item, PrimaryKey},
    obs::{DiagnosticEvent, DiagnosticsSink, NullSink},
    plan::{AccessPath, PlannedQuery, plan_predicate},
    predicate::{ConditionSet, Predicate},
    schema::TableSchema,
    tracker::{ChangeTracker, EntityState, TrackedEntity},
};
use std::sync::Arc;

///
/// Session
///
/// Explicitly constructed entry point binding a backend store, an
/// optional cache layer, and a diagnostics sink. Sessions are
/// independent; only the cache state and lock namespace are shared
/// between them.
///

pub struct Session {
    backend: Arc<dyn BackendStore>,
    cache: Option<(Arc<dyn CacheStore>, CacheConfig)>,
    sink: Arc<dyn DiagnosticsSink>,
}

impl Session {
    #[must_use]
    pub fn new(backend: Arc<dyn BackendStore>) -> Self {
        Self {
            backend,
            cache: None,
            sink: Arc::new(NullSink),
        }
    }

    #[must_use]
    pub fn with_cache(mut self, store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        self.cache = Some((store, config));
        self
    }

    #[must_use]
    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Bind one table: a change tracker plus a cache mediator over it.
    #[must_use]
    pub fn table(&self, schema: &TableSchema) -> TableContext {
        TableContext {
            schema: schema.clone(),
            backend: Arc::clone(&self.backend),
            mediator: CacheMediator::new(
                schema.clone(),
                Arc::clone(&self.backend),
                self.cache
                    .as_ref()
                    .map(|(store, config)| (Arc::clone(store), *config)),
                Arc::clone(&self.sink),
            ),
            sink: Arc::clone(&self.sink),
            tracker: ChangeTracker::new(schema.clone()),
        }
    }
}

///
/// TableContext
///
/// Per-table working surface: queries flow through the planner and the
/// cache mediator; mutations accumulate in the change tracker until
/// `submit_changes`.
///

pub struct TableContext {
    schema: TableSchema,
    backend: Arc<dyn BackendStore>,
    mediator: CacheMediator,
    sink: Arc<dyn DiagnosticsSink>,
    tracker: ChangeTracker,
}

impl TableContext {
    /// Fetch one entity by its full primary key.
    ///
    /// A missing key is `BackendError::NotFound`, never empty-success.
    /// Staged session state wins: a tracked entity is returned as-is and
    /// a staged removal reads as not found.
    pub fn find(&mut self, key: &PrimaryKey) -> Result<Item, Error> {
        if let Some(entity) = self.tracker.get(key) {
            if entity.state() == EntityState::Removed {
                return Err(BackendError::NotFound {
                    table: self.schema.name.clone(),
                    key: key.to_string(),
                }
                .into());
            }
            return Ok(entity.item().clone());
        }

        let plan = PlannedQuery {
            table: self.schema.name.clone(),
            path: AccessPath::ExactGet { key: key.clone() },
            residual: ConditionSet::new(),
        };
        self.emit_plan(&plan);

        let mut rows = self.mediator.read(&plan)?;
        let item = rows.pop().ok_or_else(|| BackendError::NotFound {
            table: self.schema.name.clone(),
            key: key.to_string(),
        })?;

        Ok(self.tracker.track_read(item)?)
    }

    /// Run a conjunctive predicate through the planner and the cache.
    ///
    /// Returned entities are registered in the session as `Unchanged`;
    /// for keys already tracked, the tracked content is returned instead
    /// of the cache/backend copy.
    pub fn query(&mut self, predicate: &Predicate) -> Result<Vec<Item>, Error> {
        let plan = plan_predicate(&self.schema, predicate)?;
        self.emit_plan(&plan);

        let rows = self.mediator.read(&plan)?;
        let mut resolved = Vec::with_capacity(rows.len());
        for item in rows {
            resolved.push(self.tracker.track_read(item)?);
        }

        Ok(resolved)
    }

    /// Stage an entity for insertion at the next submit.
    pub fn insert_on_submit(&mut self, item: Item) -> Result<(), Error> {
        Ok(self.tracker.insert_on_submit(item)?)
    }

    /// Stage a replacement of an existing row.
    pub fn update_entity(&mut self, new: Item, old: Option<&Item>) -> Result<(), Error> {
        Ok(self.tracker.update_entity(new, old)?)
    }

    /// Stage a deletion at the next submit.
    pub fn remove_on_submit(&mut self, key: PrimaryKey) {
        self.tracker.remove_on_submit(key);
    }

    /// Flush staged changes in one batched write and invalidate the
    /// cache per successful item.
    pub fn submit_changes(&mut self) -> Result<(), Error> {
        Ok(self
            .tracker
            .submit_changes(self.backend.as_ref(), &self.mediator)?)
    }

    /// Drop every staged change without touching the backend.
    pub fn discard_changes(&mut self) {
        self.tracker.discard();
    }

    /// Inspect a tracked entity. Uncommitted session state is visible
    /// only here, never through new queries.
    #[must_use]
    pub fn tracked(&self, key: &PrimaryKey) -> Option<&TrackedEntity> {
        self.tracker.get(key)
    }

    /// Mutable access to a tracked entity's staged content; in-place
    /// edits are picked up by snapshot comparison at submit.
    pub fn tracked_mut(&mut self, key: &PrimaryKey) -> Option<&mut Item> {
        self.tracker.entity_mut(key)
    }

    #[must_use]
    pub const fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn emit_plan(&self, plan: &PlannedQuery) {
        self.sink.record(DiagnosticEvent::PlanChosen {
            table: self.schema.name.clone(),
            path: plan.path.kind(),
            residual: plan.residual.len(),
        });
    }
}

///
/// TESTS
///

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::item::item_from;
    use crate::obs::MemorySink;
    use crate::plan::PathKind;
    use crate::predicate::ConditionOp;
    use crate::schema::IndexSchema;
    use crate::tracker::TrackerError;
    use crate::value::Value;

    fn books_schema() -> TableSchema {
        TableSchema::new("books", "Name").with_range_key("PublishYear")
    }

    fn dune() -> Item {
        item_from([
            ("Name", Value::from("Dune")),
            ("PublishYear", Value::Int(1965)),
            ("Author", Value::from("Frank Herbert")),
        ])
    }

    fn dune_key() -> PrimaryKey {
        PrimaryKey::new(Value::from("Dune"), Some(Value::Int(1965)))
    }

    fn books_backend() -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        backend.create_table(books_schema());
        backend
    }

    #[test]
    fn insert_submit_find_round_trips() {
        let session = Session::new(books_backend());
        let mut books = session.table(&books_schema());

        books.insert_on_submit(dune()).expect("stage insert");
        books.submit_changes().expect("submit");

        let found = books.find(&dune_key()).expect("find after submit");
        assert_eq!(found, dune());
    }

    #[test]
    fn find_on_a_missing_key_is_not_found() {
        let session = Session::new(books_backend());
        let mut books = session.table(&books_schema());

        let missing = PrimaryKey::new(Value::from("Dune"), Some(Value::Int(1999)));
        let err = books.find(&missing).expect_err("missing key");
        assert!(matches!(
            err,
            Error::Backend(BackendError::NotFound { .. })
        ));
    }

    #[test]
    fn staged_removal_hides_the_entity_from_find() {
        let backend = books_backend();
        backend
            .batch_write("books", vec![dune()], Vec::new())
            .expect("seed row");
        let session = Session::new(backend);
        let mut books = session.table(&books_schema());

        books.find(&dune_key()).expect("row exists");
        books.remove_on_submit(dune_key());

        let err = books.find(&dune_key()).expect_err("staged removal wins");
        assert!(matches!(
            err,
            Error::Backend(BackendError::NotFound { .. })
        ));
    }

    #[test]
    fn query_reports_the_chosen_path_through_the_sink() {
        let schema = TableSchema::new("scores", "UserId")
            .with_range_key("GameTitle")
            .with_index(IndexSchema::new("by-title", "GameTitle").with_range_key("TopScore"));
        let backend = Arc::new(MemoryBackend::new());
        backend.create_table(schema.clone());

        let sink = Arc::new(MemorySink::new());
        let session = Session::new(backend)
            .with_diagnostics(Arc::clone(&sink) as Arc<dyn DiagnosticsSink>);
        let mut scores = session.table(&schema);

        let tree = Predicate::all([
            Predicate::field("GameTitle", ConditionOp::Eq(Value::from("Starship X"))),
            Predicate::field("TopScore", ConditionOp::Gt(Value::Int(30))),
        ]);
        scores.query(&tree).expect("query");

        let events = sink.events();
        assert!(
            events.iter().any(|event| matches!(
                event,
                DiagnosticEvent::PlanChosen {
                    path: PathKind::IndexQuery,
                    ..
                }
            )),
            "index query plan must be reported, got {events:?}"
        );
    }

    #[test]
    fn insert_after_find_is_a_key_conflict() {
        let backend = books_backend();
        backend
            .batch_write("books", vec![dune()], Vec::new())
            .expect("seed row");
        let session = Session::new(backend);
        let mut books = session.table(&books_schema());

        books.find(&dune_key()).expect("read registers the entity");
        let err = books
            .insert_on_submit(dune())
            .expect_err("key already tracked from the read");
        assert!(matches!(
            err,
            Error::Tracker(TrackerError::KeyAlreadyExists { .. })
        ));
    }

    #[test]
    fn query_returns_staged_content_for_tracked_keys() {
        let backend = books_backend();
        backend
            .batch_write("books", vec![dune()], Vec::new())
            .expect("seed row");
        let session = Session::new(backend);
        let mut books = session.table(&books_schema());

        let mut revised = dune();
        revised.insert("Author".to_string(), Value::from("F. Herbert"));
        books
            .update_entity(revised.clone(), Some(&dune()))
            .expect("stage update");

        let tree = Predicate::all([
            Predicate::field("Name", ConditionOp::Eq(Value::from("Dune"))),
            Predicate::field("PublishYear", ConditionOp::Eq(Value::Int(1965))),
        ]);
        let rows = books.query(&tree).expect("query");
        assert_eq!(rows, vec![revised], "tracked content wins over the backend copy");
    }

    #[test]
    fn discard_changes_leaves_the_backend_untouched() {
        let session = Session::new(books_backend());
        let mut books = session.table(&books_schema());

        books.insert_on_submit(dune()).expect("stage insert");
        books.discard_changes();
        books.submit_changes().expect("nothing staged");

        assert!(books.find(&dune_key()).is_err());
    }
}
