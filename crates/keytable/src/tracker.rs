use crate::{
    backend::{BackendError, BackendStore, WriteOp, WriteOutcome},
    cache::CacheMediator,
    item::{Item, KeyError, PrimaryKey},
    schema::TableSchema,
};
use thiserror::Error as ThisError;

///
/// EntityState
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntityState {
    /// Read into the session, no staged change.
    Unchanged,
    /// Staged for creation; must not exist at submit time.
    Inserted,
    /// Staged replacement of an existing row.
    Modified,
    /// Staged deletion.
    Removed,
}

///
/// TrackedEntity
///
/// One entity under session tracking: its staged content plus the
/// snapshot taken when it entered the session. The snapshot drives both
/// modification detection and write-time cache invalidation.
///

#[derive(Clone, Debug)]
pub struct TrackedEntity {
    key: PrimaryKey,
    state: EntityState,
    snapshot: Option<Item>,
    current: Item,
}

impl TrackedEntity {
    #[must_use]
    pub const fn key(&self) -> &PrimaryKey {
        &self.key
    }

    #[must_use]
    pub const fn state(&self) -> EntityState {
        self.state
    }

    #[must_use]
    pub const fn item(&self) -> &Item {
        &self.current
    }
}

///
/// ChangeTracker
///
/// Unit of work over one table. Mutations accumulate here and only reach
/// the backend on `submit_changes`; reads register their results so a
/// session always observes its own staged state. Last-writer-wins at the
/// snapshot level, no optimistic-concurrency rejection.
///

pub struct ChangeTracker {
    schema: TableSchema,
    entities: Vec<TrackedEntity>,
}

impl ChangeTracker {
    #[must_use]
    pub const fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            entities: Vec::new(),
        }
    }

    #[must_use]
    pub fn get(&self, key: &PrimaryKey) -> Option<&TrackedEntity> {
        self.position(key).map(|pos| &self.entities[pos])
    }

    /// Direct mutable access to a tracked entity's staged content.
    /// Uncommitted edits are visible here and nowhere else.
    pub fn entity_mut(&mut self, key: &PrimaryKey) -> Option<&mut Item> {
        self.position(key)
            .map(|pos| &mut self.entities[pos].current)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Drop every staged change and tracked snapshot.
    pub fn discard(&mut self) {
        self.entities.clear();
    }

    /// Register an entity returned by a read as `Unchanged`.
    ///
    /// An entity already tracked in this session wins over the incoming
    /// backend/cache copy; the tracked content is returned instead.
    pub fn track_read(&mut self, item: Item) -> Result<Item, TrackerError> {
        let key = PrimaryKey::of(&self.schema, &item)?;
        if let Some(pos) = self.position(&key) {
            return Ok(self.entities[pos].current.clone());
        }

        self.entities.push(TrackedEntity {
            key,
            state: EntityState::Unchanged,
            snapshot: Some(item.clone()),
            current: item.clone(),
        });

        Ok(item)
    }

    /// Stage an entity for insertion at the next submit.
    pub fn insert_on_submit(&mut self, item: Item) -> Result<(), TrackerError> {
        let key = PrimaryKey::of(&self.schema, &item)?;
        match self.position(&key) {
            Some(pos) => {
                let entity = &mut self.entities[pos];
                match entity.state {
                    EntityState::Inserted => Err(TrackerError::DuplicateTrackedEntity {
                        key: key.to_string(),
                    }),
                    // A key seen in this session already exists.
                    EntityState::Unchanged | EntityState::Modified => {
                        Err(TrackerError::KeyAlreadyExists {
                            key: key.to_string(),
                        })
                    }
                    // Insert over a staged removal nets out to a replacement.
                    EntityState::Removed => {
                        entity.state = EntityState::Modified;
                        entity.current = item;
                        Ok(())
                    }
                }
            }
            None => {
                self.entities.push(TrackedEntity {
                    key,
                    state: EntityState::Inserted,
                    snapshot: None,
                    current: item,
                });
                Ok(())
            }
        }
    }

    /// Stage a replacement of an existing row. `old` supplies the
    /// pre-image snapshot when the entity was not read in this session.
    pub fn update_entity(&mut self, new: Item, old: Option<&Item>) -> Result<(), TrackerError> {
        let key = PrimaryKey::of(&self.schema, &new)?;
        match self.position(&key) {
            Some(pos) => {
                let entity = &mut self.entities[pos];
                entity.current = new;
                if entity.state != EntityState::Inserted {
                    entity.state = EntityState::Modified;
                    if entity.snapshot.is_none() {
                        entity.snapshot = old.cloned();
                    }
                }
            }
            None => {
                self.entities.push(TrackedEntity {
                    key,
                    state: EntityState::Modified,
                    snapshot: old.cloned(),
                    current: new,
                });
            }
        }

        Ok(())
    }

    /// Stage a deletion at the next submit. A never-submitted insert is
    /// simply evicted.
    pub fn remove_on_submit(&mut self, key: PrimaryKey) {
        match self.position(&key) {
            Some(pos) => {
                if self.entities[pos].state == EntityState::Inserted {
                    self.entities.remove(pos);
                } else {
                    self.entities[pos].state = EntityState::Removed;
                }
            }
            None => {
                self.entities.push(TrackedEntity {
                    current: key_item(&self.schema, &key),
                    key,
                    state: EntityState::Removed,
                    snapshot: None,
                });
            }
        }
    }

    /// Flush staged changes as one batched backend write.
    ///
    /// Successful items transition to `Unchanged` (or are evicted when
    /// removed) and drive cache invalidation with their old/new
    /// snapshots. Failed items retain their pre-submit state; the first
    /// failure is surfaced after the whole batch has been processed.
    pub fn submit_changes(
        &mut self,
        backend: &dyn BackendStore,
        mediator: &CacheMediator,
    ) -> Result<(), TrackerError> {
        // Entities handed out via `entity_mut` modify in place; detect
        // them by snapshot comparison.
        for entity in &mut self.entities {
            if entity.state == EntityState::Unchanged
                && entity.snapshot.as_ref() != Some(&entity.current)
            {
                entity.state = EntityState::Modified;
            }
        }

        // Staged inserts must not collide with rows this session never saw.
        for entity in &self.entities {
            if entity.state != EntityState::Inserted {
                continue;
            }
            match backend.get_item(&self.schema.name, &entity.key) {
                Ok(_) => {
                    return Err(TrackerError::KeyAlreadyExists {
                        key: entity.key.to_string(),
                    });
                }
                Err(BackendError::NotFound { .. }) => {}
                Err(other) => return Err(other.into()),
            }
        }

        let mut puts = Vec::new();
        let mut deletes = Vec::new();
        for entity in &self.entities {
            match entity.state {
                EntityState::Inserted | EntityState::Modified => {
                    puts.push(entity.current.clone());
                }
                EntityState::Removed => deletes.push(entity.key.clone()),
                EntityState::Unchanged => {}
            }
        }
        if puts.is_empty() && deletes.is_empty() {
            return Ok(());
        }

        let outcomes = backend.batch_write(&self.schema.name, puts, deletes)?;

        let mut first_failure: Option<BackendError> = None;
        let mut evict: Vec<PrimaryKey> = Vec::new();
        for outcome in outcomes {
            match self.apply_outcome(&outcome, mediator) {
                Applied::Put | Applied::Skipped => {}
                Applied::Delete(key) => evict.push(key),
                Applied::Failed(error) => {
                    if first_failure.is_none() {
                        first_failure = Some(error);
                    }
                }
            }
        }
        self.entities.retain(|entity| !evict.contains(&entity.key));

        match first_failure {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    fn apply_outcome(&mut self, outcome: &WriteOutcome, mediator: &CacheMediator) -> Applied {
        if let Some(error) = &outcome.error {
            return Applied::Failed(error.clone());
        }

        let key = outcome.op.key();
        let Some(pos) = self.position(key) else {
            return Applied::Skipped;
        };

        match &outcome.op {
            WriteOp::Put(_) => {
                let entity = &mut self.entities[pos];
                let old = entity.snapshot.take();
                mediator.invalidate_write(old.as_ref(), Some(&entity.current));
                entity.snapshot = Some(entity.current.clone());
                entity.state = EntityState::Unchanged;
                Applied::Put
            }
            WriteOp::Delete(_) => {
                let entity = &self.entities[pos];
                let old = entity.snapshot.clone().unwrap_or_else(|| entity.current.clone());
                mediator.invalidate_write(Some(&old), None);
                Applied::Delete(key.clone())
            }
        }
    }

    fn position(&self, key: &PrimaryKey) -> Option<usize> {
        self.entities.iter().position(|entity| entity.key == *key)
    }
}

enum Applied {
    Put,
    Delete(PrimaryKey),
    Skipped,
    Failed(BackendError),
}

// Minimal item carrying just the key attributes; stands in for the
// pre-image of a row this session never read.
fn key_item(schema: &TableSchema, key: &PrimaryKey) -> Item {
    let mut item = Item::new();
    item.insert(schema.hash_key.clone(), key.hash.clone());
    if let (Some(field), Some(range)) = (&schema.range_key, &key.range) {
        item.insert(field.clone(), range.clone());
    }
    item
}

///
/// TrackerError
///

#[derive(Clone, Debug, ThisError, Eq, PartialEq)]
pub enum TrackerError {
    #[error("entity {key} is already tracked for insertion")]
    DuplicateTrackedEntity { key: String },

    #[error("entity {key} cannot be added, because entity with that key already exists")]
    KeyAlreadyExists { key: String },

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

///
/// TESTS
///
