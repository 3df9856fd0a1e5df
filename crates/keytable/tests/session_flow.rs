//! End-to-end flows across sessions sharing one backend and one cache:
//! planner selection, cache round-trips, write-triggered invalidation,
//! lock-serialized rebuilds, and degraded operation under cache outage.

use keytable::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn books_schema() -> TableSchema {
    TableSchema::new("books", "Name").with_range_key("PublishYear")
}

fn scores_schema() -> TableSchema {
    TableSchema::new("scores", "UserId")
        .with_range_key("GameTitle")
        .with_index(IndexSchema::new("by-title", "GameTitle").with_range_key("TopScore"))
}

fn dune() -> Item {
    item_from([
        ("Name", Value::from("Dune")),
        ("PublishYear", Value::Int(1965)),
        ("Author", Value::from("Frank Herbert")),
    ])
}

fn seeded_scores() -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    backend.create_table(scores_schema());
    let mut session = Session::new(Arc::clone(&backend) as Arc<dyn BackendStore>)
        .table(&scores_schema());
    for (user, title, score) in [
        ("101", "Galaxy Invaders", 5842),
        ("101", "Starship X", 24),
        ("103", "Starship X", 42),
        ("103", "Meteor Blasters", 723),
    ] {
        session
            .insert_on_submit(item_from([
                ("UserId", Value::from(user)),
                ("GameTitle", Value::from(title)),
                ("TopScore", Value::Int(score)),
            ]))
            .expect("stage seed row");
    }
    session.submit_changes().expect("seed submit");
    backend
}

fn fast_config() -> CacheConfig {
    CacheConfig {
        lock_retry: Duration::from_millis(2),
        ..CacheConfig::default()
    }
}

#[test]
fn insert_submit_then_find_by_full_key() {
    let backend = Arc::new(MemoryBackend::new());
    backend.create_table(books_schema());
    let session = Session::new(backend as Arc<dyn BackendStore>);
    let mut books = session.table(&books_schema());

    books.insert_on_submit(dune()).expect("stage insert");
    books.submit_changes().expect("submit");

    let key = PrimaryKey::new(Value::from("Dune"), Some(Value::Int(1965)));
    assert_eq!(books.find(&key).expect("find"), dune());

    let missing = PrimaryKey::new(Value::from("Dune"), Some(Value::Int(1999)));
    let err = books.find(&missing).expect_err("wrong edition year");
    assert!(matches!(err, Error::Backend(BackendError::NotFound { .. })));
}

#[test]
fn score_query_uses_the_title_index_and_filters_by_range() {
    let backend = seeded_scores();
    let sink = Arc::new(MemorySink::new());
    let session = Session::new(Arc::clone(&backend) as Arc<dyn BackendStore>)
        .with_diagnostics(Arc::clone(&sink) as Arc<dyn DiagnosticsSink>);
    let mut scores = session.table(&scores_schema());

    let tree = Predicate::all([
        Predicate::field("GameTitle", ConditionOp::Eq(Value::from("Starship X"))),
        Predicate::field("TopScore", ConditionOp::Gt(Value::Int(30))),
    ]);
    let rows = scores.query(&tree).expect("query");

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("UserId"), Some(&Value::from("103")));
    assert!(
        sink.events().iter().any(|event| matches!(
            event,
            DiagnosticEvent::PlanChosen {
                path: PathKind::IndexQuery,
                ..
            }
        )),
        "hash+range condition set must select the index"
    );
}

#[test]
fn cached_result_survives_until_a_write_invalidates_it() {
    let backend = seeded_scores();
    let store = Arc::new(MemoryCacheStore::new());

    let make_session = || {
        Session::new(Arc::clone(&backend) as Arc<dyn BackendStore>)
            .with_cache(Arc::clone(&store) as Arc<dyn CacheStore>, fast_config())
    };
    let tree = Predicate::all([
        Predicate::field("GameTitle", ConditionOp::Eq(Value::from("Starship X"))),
        Predicate::field("TopScore", ConditionOp::Gt(Value::Int(30))),
    ]);

    let mut reader = make_session().table(&scores_schema());
    let first = reader.query(&tree).expect("cold read");
    assert_eq!(first.len(), 1);
    let rebuilds = backend.rebuild_ops();

    // A second session over the same shared cache is served without the
    // backend.
    let mut other = make_session().table(&scores_schema());
    assert_eq!(other.query(&tree).expect("warm read"), first);
    assert_eq!(
        backend.rebuild_ops(),
        rebuilds,
        "warm read must not rebuild"
    );

    // A write touching the index fields drops the cached result set.
    let mut writer = make_session().table(&scores_schema());
    writer
        .update_entity(
            item_from([
                ("UserId", Value::from("101")),
                ("GameTitle", Value::from("Starship X")),
                ("TopScore", Value::Int(9000)),
            ]),
            None,
        )
        .expect("stage update");
    writer.submit_changes().expect("submit");

    let mut late = make_session().table(&scores_schema());
    let rows = late.query(&tree).expect("read after invalidation");
    assert_eq!(
        backend.rebuild_ops(),
        rebuilds + 1,
        "invalidated entry must rebuild exactly once"
    );
    assert_eq!(rows.len(), 2, "the promoted row now matches");
}

#[test]
fn concurrent_cold_readers_share_one_rebuild() {
    let backend = seeded_scores();
    let store = Arc::new(MemoryCacheStore::new());

    let rebuilds_before = backend.rebuild_ops();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let backend = Arc::clone(&backend);
        let store = Arc::clone(&store);
        handles.push(std::thread::spawn(move || {
            let session = Session::new(backend as Arc<dyn BackendStore>)
                .with_cache(store as Arc<dyn CacheStore>, fast_config());
            let mut scores = session.table(&scores_schema());
            let tree = Predicate::all([
                Predicate::field("GameTitle", ConditionOp::Eq(Value::from("Starship X"))),
                Predicate::field("TopScore", ConditionOp::Gt(Value::Int(30))),
            ]);
            scores.query(&tree).expect("concurrent read")
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.join().expect("reader thread"));
    }

    assert!(
        results.windows(2).all(|pair| pair[0] == pair[1]),
        "every reader must observe the same rows"
    );
    assert_eq!(
        backend.rebuild_ops(),
        rebuilds_before + 1,
        "the fingerprint lock must serialize the rebuild"
    );
}

#[test]
fn cache_outage_is_invisible_to_callers() {
    let backend = seeded_scores();
    let store = Arc::new(MemoryCacheStore::new());
    let sink = Arc::new(MemorySink::new());
    let session = Session::new(Arc::clone(&backend) as Arc<dyn BackendStore>)
        .with_cache(Arc::clone(&store) as Arc<dyn CacheStore>, fast_config())
        .with_diagnostics(Arc::clone(&sink) as Arc<dyn DiagnosticsSink>);
    let mut scores = session.table(&scores_schema());

    store.set_unavailable(true);
    let tree = Predicate::field("GameTitle", ConditionOp::Eq(Value::from("Starship X")));
    let rows = scores.query(&tree).expect("reads keep working");
    assert_eq!(rows.len(), 2);
    assert!(sink.degraded_reads() >= 1, "outage shows up in diagnostics");

    // Writes keep working too; invalidation degrades silently.
    scores
        .insert_on_submit(item_from([
            ("UserId", Value::from("200")),
            ("GameTitle", Value::from("Comet Chase")),
            ("TopScore", Value::Int(1)),
        ]))
        .expect("stage insert");
    scores.submit_changes().expect("submit under outage");

    store.set_unavailable(false);
    let key = PrimaryKey::new(Value::from("200"), Some(Value::from("Comet Chase")));
    let mut fresh = Session::new(Arc::clone(&backend) as Arc<dyn BackendStore>)
        .table(&scores_schema());
    assert!(fresh.find(&key).is_ok(), "the write reached the backend");
}

#[test]
fn capacity_errors_surface_verbatim_without_retry() {
    let backend = seeded_scores();
    let session = Session::new(Arc::clone(&backend) as Arc<dyn BackendStore>);
    let mut scores = session.table(&scores_schema());

    backend.trip_capacity_once();
    let tree = Predicate::field("GameTitle", ConditionOp::Eq(Value::from("Starship X")));
    let err = scores.query(&tree).expect_err("tripped capacity");
    match err {
        Error::Backend(inner) => assert!(inner.is_retryable()),
        other => panic!("expected a backend error, got {other}"),
    }

    assert!(
        scores.query(&tree).is_ok(),
        "retry policy belongs to the caller"
    );
}

#[test]
fn between_on_the_range_key_queries_natively() {
    let backend = Arc::new(MemoryBackend::new());
    backend.create_table(books_schema());
    let session = Session::new(Arc::clone(&backend) as Arc<dyn BackendStore>);
    let mut books = session.table(&books_schema());

    for (name, year) in [("Dune", 1965), ("Dune", 1984), ("Dune", 2003)] {
        books
            .insert_on_submit(item_from([
                ("Name", Value::from(name)),
                ("PublishYear", Value::Int(year)),
            ]))
            .expect("stage edition");
    }
    books.submit_changes().expect("submit");

    let tree = Predicate::all([
        Predicate::field("Name", ConditionOp::Eq(Value::from("Dune"))),
        Predicate::field(
            "PublishYear",
            ConditionOp::Between(Value::Int(1960), Value::Int(1990)),
        ),
    ]);
    let rows = books.query(&tree).expect("between query");
    let years: Vec<_> = rows
        .iter()
        .map(|row| row.get("PublishYear").cloned().expect("year"))
        .collect();
    assert_eq!(years, vec![Value::Int(1965), Value::Int(1984)]);
}
