use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{InstanceError, InstanceResult};
use crate::instance_record::InstanceRecord;

/// Process-wide map of live instances keyed by name.
///
/// Lookups and listings clone out `Arc`s, so callers never hold the map lock
/// while they work on a record.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: RwLock<HashMap<String, Arc<InstanceRecord>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<InstanceRecord>>> {
        match self.instances.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<InstanceRecord>>> {
        match self.instances.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Inserts `record`; a name that is already taken yields `Conflict`.
    pub fn register(&self, record: Arc<InstanceRecord>) -> InstanceResult<()> {
        let mut instances = self.write();
        if instances.contains_key(record.name()) {
            return Err(InstanceError::Conflict(record.name().to_string()));
        }
        instances.insert(record.name().to_string(), record);
        Ok(())
    }

    pub fn get(&self, instance_name: &str) -> Option<Arc<InstanceRecord>> {
        self.read().get(instance_name).cloned()
    }

    pub fn contains(&self, instance_name: &str) -> bool {
        self.read().contains_key(instance_name)
    }

    pub fn unregister(&self, instance_name: &str) -> Option<Arc<InstanceRecord>> {
        self.write().remove(instance_name)
    }

    /// Removes the entry only if it still points at `record`.
    pub(crate) fn unregister_record(&self, record: &Arc<InstanceRecord>) -> bool {
        let mut instances = self.write();
        match instances.get(record.name()) {
            Some(current) if Arc::ptr_eq(current, record) => {
                instances.remove(record.name());
                true
            }
            _ => false,
        }
    }

    /// True while the entry for `record`'s name is `record` itself.
    pub(crate) fn is_current(&self, record: &InstanceRecord) -> bool {
        self.read()
            .get(record.name())
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), record))
    }

    /// Copy of the live set sorted by name, taken under one read lock.
    pub fn list_all(&self) -> Vec<Arc<InstanceRecord>> {
        let mut records: Vec<Arc<InstanceRecord>> = self.read().values().cloned().collect();
        records.sort_by(|left, right| left.name().cmp(right.name()));
        records
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub(crate) fn token_in_use(&self, token_fingerprint: &str, except: Option<&str>) -> bool {
        self.read().values().any(|record| {
            except != Some(record.name()) && record.token_fingerprint() == token_fingerprint
        })
    }
}
