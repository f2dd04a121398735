//! An in-process [`ObjectStore`] with the API server's optimistic
//! concurrency semantics, for tests of this crate and of its consumers.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use snafu::OptionExt;

use super::{ConflictSnafu, NotFoundSnafu, ObjectKey, ObjectStore, Result, StoredObject};

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, StoredObject>,
    next_revision: u64,
}

impl State {
    fn stamp(&mut self, object: &mut StoredObject) {
        self.next_revision += 1;
        object.metadata_mut().resource_version = Some(self.next_revision.to_string());
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Inserts or replaces an object unconditionally, stamping a fresh
    /// resource version. Meant for seeding test fixtures.
    pub fn insert(&self, mut object: StoredObject) {
        let mut state = self.lock();
        state.stamp(&mut object);
        state.objects.insert(object.key(), object);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<StoredObject>> {
        Ok(self.lock().objects.get(key).cloned())
    }

    async fn create(&self, object: &StoredObject) -> Result<()> {
        let mut state = self.lock();
        let key = object.key();
        snafu::ensure!(!state.objects.contains_key(&key), ConflictSnafu { key });
        let mut object = object.clone();
        state.stamp(&mut object);
        state.objects.insert(key, object);
        Ok(())
    }

    async fn update(&self, object: &StoredObject) -> Result<()> {
        let mut state = self.lock();
        let key = object.key();
        let current = state
            .objects
            .get(&key)
            .with_context(|| NotFoundSnafu { key: key.clone() })?;
        let stale = object
            .metadata()
            .resource_version
            .as_ref()
            .is_some_and(|version| {
                current.metadata().resource_version.as_ref() != Some(version)
            });
        snafu::ensure!(!stale, ConflictSnafu { key });
        let mut object = object.clone();
        state.stamp(&mut object);
        state.objects.insert(key, object);
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut state = self.lock();
        state
            .objects
            .remove(key)
            .with_context(|| NotFoundSnafu { key: key.clone() })?;
        Ok(())
    }
}
