//! In-memory object store backing the mock client
//!
//! Every create and update happens under a single lock so compare-and-create
//! and compare-and-swap are atomic, matching what the API server guarantees.

use crate::error::ResourceError;
use kube::Resource;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Store key: namespace ("" for cluster-scoped objects) and name
pub(crate) type ObjectKey = (String, String);

/// Monotonic resourceVersion source shared by all stores of one mock
#[derive(Debug, Clone, Default)]
pub(crate) struct VersionClock(Arc<AtomicU64>);

impl VersionClock {
    fn next(&self) -> String {
        (self.0.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

/// Objects of one kind
#[derive(Debug)]
pub(crate) struct ObjectStore<T> {
    kind: &'static str,
    objects: Mutex<BTreeMap<ObjectKey, T>>,
    clock: VersionClock,
}

impl<T> ObjectStore<T>
where
    T: Resource + Clone,
{
    pub(crate) fn new(kind: &'static str, clock: VersionClock) -> Self {
        Self {
            kind,
            objects: Mutex::new(BTreeMap::new()),
            clock,
        }
    }

    fn key_of(&self, object: &T) -> Result<ObjectKey, ResourceError> {
        let meta = object.meta();
        let name = meta.name.clone()
            .ok_or_else(|| ResourceError::InvalidObject(format!("{} missing metadata.name", self.kind)))?;
        Ok((meta.namespace.clone().unwrap_or_default(), name))
    }

    fn describe(&self, key: &ObjectKey) -> String {
        if key.0.is_empty() {
            format!("{} {}", self.kind, key.1)
        } else {
            format!("{} {}/{}", self.kind, key.0, key.1)
        }
    }

    pub(crate) fn get(&self, namespace: &str, name: &str) -> Result<T, ResourceError> {
        let key = (namespace.to_string(), name.to_string());
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        objects.get(&key)
            .cloned()
            .ok_or_else(|| ResourceError::NotFound(self.describe(&key)))
    }

    pub(crate) fn list(&self) -> Vec<T> {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        objects.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Atomic compare-and-create: fails if an object with the same key exists
    pub(crate) fn create(&self, object: &T) -> Result<T, ResourceError> {
        let key = self.key_of(object)?;
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        if objects.contains_key(&key) {
            return Err(ResourceError::AlreadyExists(self.describe(&key)));
        }

        let mut stored = object.clone();
        stored.meta_mut().resource_version = Some(self.clock.next());
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    /// Atomic compare-and-swap on resourceVersion
    ///
    /// An update without a resourceVersion is unconditional, as with the API
    /// server's replace.
    pub(crate) fn update(&self, object: &T) -> Result<T, ResourceError> {
        let key = self.key_of(object)?;
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let current = objects.get(&key)
            .ok_or_else(|| ResourceError::NotFound(self.describe(&key)))?;

        if let Some(expected) = object.meta().resource_version.as_deref() {
            if current.meta().resource_version.as_deref() != Some(expected) {
                return Err(ResourceError::Conflict(format!(
                    "{} has been modified; resourceVersion {} is stale",
                    self.describe(&key),
                    expected
                )));
            }
        }

        let mut stored = object.clone();
        stored.meta_mut().resource_version = Some(self.clock.next());
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    /// Insert or overwrite without any checks (for test setup)
    pub(crate) fn put(&self, object: T) {
        if let Ok(key) = self.key_of(&object) {
            let mut stored = object;
            stored.meta_mut().resource_version = Some(self.clock.next());
            self.objects.lock().unwrap_or_else(PoisonError::into_inner).insert(key, stored);
        }
    }
}
