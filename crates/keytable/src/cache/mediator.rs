use crate::{
    backend::{BackendError, BackendStore, ItemStream},
    cache::{
        CacheConfig,
        entry::{self, CachedEntityEntry, CachedIndexEntry, QueryRegistry, ShapeSummary},
        lock::{self, LockError},
        store::{CacheStore, CacheStoreError},
    },
    fingerprint::{Fingerprint, entity_fingerprint, query_fingerprint},
    item::{Item, PrimaryKey},
    obs::{DegradedReason, DiagnosticEvent, DiagnosticsSink},
    plan::{AccessPath, PlannedQuery, shape_fields},
    schema::TableSchema,
};
use std::sync::Arc;

// Reserved lock key guarding registry read-modify-write cycles.
const REGISTRY_LOCK_KEY: &str = "registry";

fn query_key(table: &str, fingerprint: &Fingerprint) -> String {
    format!("kt:{table}:q:{fingerprint}")
}

fn entity_key(table: &str, fingerprint: &Fingerprint) -> String {
    format!("kt:{table}:e:{fingerprint}")
}

fn version_key(table: &str) -> String {
    format!("kt:{table}:ver")
}

fn registry_key(table: &str) -> String {
    format!("kt:{table}:reg")
}

///
/// CacheMediator
///
/// Cache-first protocol around backend reads and writes. Reads serve
/// cached result sets when present, otherwise rebuild under the
/// distributed table lock (double-checked); writes bump the table
/// version, update the entity snapshot, and conservatively drop every
/// registered result set the write could affect.
///
/// Cache-layer failures never surface: every path degrades to direct
/// backend access and reports through the diagnostics sink.
///

pub struct CacheMediator {
    schema: TableSchema,
    backend: Arc<dyn BackendStore>,
    cache: Option<CacheBinding>,
    sink: Arc<dyn DiagnosticsSink>,
}

struct CacheBinding {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
}

enum CachedLookup {
    Hit(Vec<Item>),
    Miss,
    Unavailable,
}

impl CacheMediator {
    #[must_use]
    pub fn new(
        schema: TableSchema,
        backend: Arc<dyn BackendStore>,
        cache: Option<(Arc<dyn CacheStore>, CacheConfig)>,
        sink: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        Self {
            schema,
            backend,
            cache: cache.map(|(store, config)| CacheBinding { store, config }),
            sink,
        }
    }

    #[must_use]
    pub const fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Serve a planned query cache-first.
    ///
    /// Guarantee: at most one backend rebuild per (table, fingerprint) is
    /// in flight across all clients sharing the lock namespace. A lock
    /// wait that exceeds its bound degrades this single call to an
    /// uncached read instead of blocking indefinitely.
    pub fn read(&self, plan: &PlannedQuery) -> Result<Vec<Item>, BackendError> {
        let Some(binding) = &self.cache else {
            return self.execute(plan);
        };
        let fingerprint = query_fingerprint(plan);

        match self.lookup(binding, &fingerprint)? {
            CachedLookup::Hit(items) => {
                self.emit(DiagnosticEvent::CacheHit {
                    table: self.schema.name.clone(),
                    fingerprint: fingerprint.to_hex(),
                });
                return Ok(items);
            }
            CachedLookup::Unavailable => {
                return self.degraded_read(plan, DegradedReason::CacheUnavailable);
            }
            CachedLookup::Miss => {}
        }

        self.emit(DiagnosticEvent::CacheMiss {
            table: self.schema.name.clone(),
            fingerprint: fingerprint.to_hex(),
        });

        let guard = match lock::acquire(
            &binding.store,
            &self.schema.name,
            &fingerprint.to_hex(),
            binding.config.lock_wait,
            binding.config.lock_ttl,
            binding.config.lock_retry,
        ) {
            Ok(guard) => guard,
            Err(LockError::TimedOut { .. }) => {
                return self.degraded_read(plan, DegradedReason::LockTimeout);
            }
            Err(_) => {
                return self.degraded_read(plan, DegradedReason::CacheUnavailable);
            }
        };

        // Double-checked: another caller may have rebuilt while we waited.
        if let CachedLookup::Hit(items) = self.lookup(binding, &fingerprint)? {
            self.emit(DiagnosticEvent::CacheHit {
                table: self.schema.name.clone(),
                fingerprint: fingerprint.to_hex(),
            });
            let _ = guard.release();
            return Ok(items);
        }

        let version_before = match self.table_version(binding) {
            Ok(version) => version,
            Err(_) => {
                let _ = guard.release();
                return self.degraded_read(plan, DegradedReason::CacheUnavailable);
            }
        };

        let items = self.execute(plan)?;

        match self.populate(binding, plan, &fingerprint, &items, version_before) {
            Ok(true) => self.emit(DiagnosticEvent::CachePopulated {
                table: self.schema.name.clone(),
                fingerprint: fingerprint.to_hex(),
                rows: items.len(),
                version: version_before,
            }),
            Ok(false) => self.emit(DiagnosticEvent::PopulateSkipped {
                table: self.schema.name.clone(),
                fingerprint: fingerprint.to_hex(),
            }),
            Err(_) => self.emit(DiagnosticEvent::DegradedRead {
                table: self.schema.name.clone(),
                reason: DegradedReason::CacheUnavailable,
            }),
        }
        let _ = guard.release();

        Ok(items)
    }

    /// Invalidate cache state after a backend mutation.
    ///
    /// `old`/`new` are the pre- and post-write snapshots (`None` for
    /// insert and delete respectively). Never fails: cache outages are
    /// reported through the sink and bounded by the entry TTL.
    pub fn invalidate_write(&self, old: Option<&Item>, new: Option<&Item>) {
        let Some(binding) = &self.cache else {
            return;
        };

        match self.invalidate_inner(binding, old, new) {
            Ok((dropped, version)) => self.emit(DiagnosticEvent::CacheInvalidated {
                table: self.schema.name.clone(),
                dropped,
                version,
            }),
            Err(_) => self.emit(DiagnosticEvent::DegradedRead {
                table: self.schema.name.clone(),
                reason: DegradedReason::CacheUnavailable,
            }),
        }
    }

    // ---------------------------------------------------------------------
    // Read side
    // ---------------------------------------------------------------------

    fn degraded_read(
        &self,
        plan: &PlannedQuery,
        reason: DegradedReason,
    ) -> Result<Vec<Item>, BackendError> {
        self.emit(DiagnosticEvent::DegradedRead {
            table: self.schema.name.clone(),
            reason,
        });

        self.execute(plan)
    }

    // Resolve a cached result set: index entry first, then each entity via
    // its snapshot or a backend fallback. A key that vanished from the
    // backend marks the whole entry stale (miss), forcing a rebuild.
    fn lookup(
        &self,
        binding: &CacheBinding,
        fingerprint: &Fingerprint,
    ) -> Result<CachedLookup, BackendError> {
        let table = &self.schema.name;
        let Ok(cached) = binding.store.get(&query_key(table, fingerprint)) else {
            return Ok(CachedLookup::Unavailable);
        };
        let Some(bytes) = cached else {
            return Ok(CachedLookup::Miss);
        };
        let Some(index_entry) = entry::decode::<CachedIndexEntry>(&bytes) else {
            return Ok(CachedLookup::Miss);
        };

        let mut items = Vec::with_capacity(index_entry.keys.len());
        for key in &index_entry.keys {
            let entity_fp = entity_fingerprint(table, key);
            let cached_entity = match binding.store.get(&entity_key(table, &entity_fp)) {
                Ok(cached) => cached.and_then(|bytes| entry::decode::<CachedEntityEntry>(&bytes)),
                Err(_) => return Ok(CachedLookup::Unavailable),
            };

            match cached_entity {
                Some(entity) => items.push(entity.item),
                None => match self.backend.get_item(table, key) {
                    Ok(item) => {
                        // Best-effort snapshot refresh for the next reader.
                        let _ = entry::encode(&CachedEntityEntry {
                            item: item.clone(),
                            version: index_entry.version,
                        })
                        .and_then(|bytes| {
                            binding.store.set(
                                &entity_key(table, &entity_fp),
                                bytes,
                                binding.config.entry_ttl,
                            )
                        });
                        items.push(item);
                    }
                    Err(BackendError::NotFound { .. }) => return Ok(CachedLookup::Miss),
                    Err(other) => return Err(other),
                },
            }
        }

        Ok(CachedLookup::Hit(items))
    }

    // Execute the planned operation directly against the backend.
    fn execute(&self, plan: &PlannedQuery) -> Result<Vec<Item>, BackendError> {
        let table = &self.schema.name;

        match &plan.path {
            AccessPath::ExactGet { key } => {
                let item = self.backend.get_item(table, key)?;
                if plan.residual.matches(&item) {
                    Ok(vec![item])
                } else {
                    Ok(Vec::new())
                }
            }
            AccessPath::PrimaryQuery { hash, range } => collect(self.backend.query(
                table,
                None,
                hash,
                range.as_ref(),
                &plan.residual,
            )?),
            AccessPath::IndexQuery { index, hash, range } => collect(self.backend.query(
                table,
                Some(index),
                hash,
                range.as_ref(),
                &plan.residual,
            )?),
            AccessPath::Scan => collect(self.backend.scan(table, &plan.residual)?),
        }
    }

    fn table_version(&self, binding: &CacheBinding) -> Result<u64, CacheStoreError> {
        let bytes = binding.store.get(&version_key(&self.schema.name))?;
        Ok(bytes
            .and_then(|bytes| bytes.as_slice().try_into().ok())
            .map_or(0, u64::from_be_bytes))
    }

    // Store a freshly rebuilt result set, registering its shape first so
    // the entry is invalidatable from birth. Returns false when a
    // concurrent write intervened and the result must not be cached.
    fn populate(
        &self,
        binding: &CacheBinding,
        plan: &PlannedQuery,
        fingerprint: &Fingerprint,
        items: &[Item],
        version_before: u64,
    ) -> Result<bool, CacheStoreError> {
        let table = &self.schema.name;

        if self.table_version(binding)? != version_before {
            return Ok(false);
        }
        if !self.register_shape(binding, plan, fingerprint)? {
            return Ok(false);
        }

        let mut keys = Vec::with_capacity(items.len());
        for item in items {
            let Ok(key) = PrimaryKey::of(&self.schema, item) else {
                // Rows without full key attributes cannot be re-resolved;
                // leave this result set uncached.
                return Ok(false);
            };
            keys.push(key);
        }

        let mut snapshot_keys = Vec::with_capacity(keys.len());
        for (key, item) in keys.iter().zip(items) {
            let record_key = entity_key(table, &entity_fingerprint(table, key));
            let bytes = entry::encode(&CachedEntityEntry {
                item: item.clone(),
                version: version_before,
            })?;
            binding
                .store
                .set(&record_key, bytes, binding.config.entry_ttl)?;
            snapshot_keys.push(record_key);
        }

        let bytes = entry::encode(&CachedIndexEntry {
            keys,
            version: version_before,
        })?;
        binding
            .store
            .set(&query_key(table, fingerprint), bytes, binding.config.entry_ttl)?;

        // Close the window between the first version check and the writes
        // above: a write that raced us has already enumerated the registry,
        // so neither the entry nor the snapshots written here may survive.
        // The snapshots could sit on top of the racing writer's fresher
        // ones; deleting them forces a backend fallback instead.
        if self.table_version(binding)? != version_before {
            binding.store.delete(&query_key(table, fingerprint))?;
            for record_key in &snapshot_keys {
                binding.store.delete(record_key)?;
            }
            return Ok(false);
        }

        Ok(true)
    }

    // Record this fingerprint's shape in the per-table registry under the
    // registry lock. Returns false when the lock is contended away; the
    // caller must then skip caching.
    fn register_shape(
        &self,
        binding: &CacheBinding,
        plan: &PlannedQuery,
        fingerprint: &Fingerprint,
    ) -> Result<bool, CacheStoreError> {
        let table = &self.schema.name;
        let guard = match lock::acquire(
            &binding.store,
            table,
            REGISTRY_LOCK_KEY,
            binding.config.lock_wait,
            binding.config.lock_ttl,
            binding.config.lock_retry,
        ) {
            Ok(guard) => guard,
            Err(LockError::TimedOut { .. }) => return Ok(false),
            Err(LockError::NotOwner { .. }) => return Ok(false),
            Err(LockError::Store(err)) => return Err(err),
        };

        let mut registry = self.load_registry(binding)?;
        registry.shapes.insert(
            fingerprint.to_hex(),
            ShapeSummary {
                kind: plan.path.kind().into(),
                fields: shape_fields(&self.schema, plan),
            },
        );
        let bytes = entry::encode(&registry)?;
        binding.store.set(&registry_key(table), bytes, None)?;
        let _ = guard.release();

        Ok(true)
    }

    fn load_registry(&self, binding: &CacheBinding) -> Result<QueryRegistry, CacheStoreError> {
        let bytes = binding.store.get(&registry_key(&self.schema.name))?;
        Ok(bytes
            .and_then(|bytes| entry::decode::<QueryRegistry>(&bytes))
            .unwrap_or_default())
    }

    // ---------------------------------------------------------------------
    // Write side
    // ---------------------------------------------------------------------

    fn invalidate_inner(
        &self,
        binding: &CacheBinding,
        old: Option<&Item>,
        new: Option<&Item>,
    ) -> Result<(usize, u64), CacheStoreError> {
        let table = &self.schema.name;

        // Bump first: in-flight rebuilds that read the old version will
        // refuse to cache their (possibly stale) result.
        let version = binding.store.incr(&version_key(table))?;

        // Entity snapshot follows the write.
        if let Some(snapshot) = new.or(old)
            && let Ok(key) = PrimaryKey::of(&self.schema, snapshot)
        {
            let entity_fp = entity_fingerprint(table, &key);
            match new {
                Some(item) => {
                    let bytes = entry::encode(&CachedEntityEntry {
                        item: item.clone(),
                        version,
                    })?;
                    binding
                        .store
                        .set(&entity_key(table, &entity_fp), bytes, binding.config.entry_ttl)?;
                }
                None => binding.store.delete(&entity_key(table, &entity_fp))?,
            }
        }

        let touched = touched_fields(&self.schema, old, new);

        // Prefer pruning the registry under its lock; if the lock is
        // contended away, drop the affected entries anyway and leave the
        // registry stale. Stale records only cause harmless re-drops.
        match lock::acquire(
            &binding.store,
            table,
            REGISTRY_LOCK_KEY,
            binding.config.lock_wait,
            binding.config.lock_ttl,
            binding.config.lock_retry,
        ) {
            Ok(guard) => {
                let mut registry = self.load_registry(binding)?;
                let affected = registry.affected_fingerprints(&touched);
                for fingerprint_hex in &affected {
                    binding
                        .store
                        .delete(&format!("kt:{table}:q:{fingerprint_hex}"))?;
                }
                registry
                    .shapes
                    .retain(|fingerprint_hex, _| !affected.contains(fingerprint_hex));
                let bytes = entry::encode(&registry)?;
                binding.store.set(&registry_key(table), bytes, None)?;
                let _ = guard.release();

                Ok((affected.len(), version))
            }
            Err(LockError::TimedOut { .. } | LockError::NotOwner { .. }) => {
                let registry = self.load_registry(binding)?;
                let affected = registry.affected_fingerprints(&touched);
                for fingerprint_hex in &affected {
                    binding
                        .store
                        .delete(&format!("kt:{table}:q:{fingerprint_hex}"))?;
                }

                Ok((affected.len(), version))
            }
            Err(LockError::Store(err)) => Err(err),
        }
    }

    fn emit(&self, event: DiagnosticEvent) {
        self.sink.record(event);
    }
}

fn collect(stream: ItemStream) -> Result<Vec<Item>, BackendError> {
    stream.collect()
}

// Fields a write plausibly touches: attributes whose values changed plus
// every key attribute (primary or index) the entity participates in.
// Conservative by design; precision here is an optimization, not a
// correctness requirement.
fn touched_fields(schema: &TableSchema, old: Option<&Item>, new: Option<&Item>) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    let mut push = |field: &str| {
        if !fields.iter().any(|f| f == field) {
            fields.push(field.to_string());
        }
    };

    let changed = |field: &str| match (old.and_then(|o| o.get(field)), new.and_then(|n| n.get(field)))
    {
        (Some(a), Some(b)) => a != b,
        (None, None) => false,
        _ => true,
    };

    for item in [old, new].into_iter().flatten() {
        for field in item.keys() {
            if changed(field) {
                push(field);
            }
        }
    }

    push(&schema.hash_key);
    if let Some(range) = &schema.range_key {
        push(range);
    }
    for index in &schema.indexes {
        let participates = |field: &str| {
            old.is_some_and(|o| o.contains_key(field)) || new.is_some_and(|n| n.contains_key(field))
        };
        if participates(&index.hash_key) {
            push(&index.hash_key);
            if let Some(range) = &index.range_key {
                push(range);
            }
        }
    }

    fields
}

///
/// TESTS
///
