//! In-memory function registry and the process-wide completed-run-once set.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::function::{FunctionRecord, FunctionStatus};

/// Registry of loaded functions, keyed by name.
///
/// Reads vastly outnumber writes: every trigger path looks records up, while
/// only the loader replaces the map. A rescan builds a complete map off to the
/// side and swaps it in under the write lock, so readers never observe a
/// partially populated registry. Locks are never held across await points.
#[derive(Debug, Default)]
pub struct Registry {
    functions: RwLock<HashMap<String, Arc<FunctionRecord>>>,
    completed: RwLock<HashSet<String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<FunctionRecord>> {
        self.functions
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.functions.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all records, sorted by name for deterministic iteration.
    pub fn snapshot(&self) -> Vec<Arc<FunctionRecord>> {
        let mut records: Vec<_> = self
            .functions
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Atomically replace the whole registry with a freshly built map.
    pub fn replace_all(&self, records: HashMap<String, Arc<FunctionRecord>>) {
        *self.functions.write().expect("registry lock poisoned") = records;
    }

    /// Insert or replace a single record.
    pub fn insert(&self, record: Arc<FunctionRecord>) {
        self.functions
            .write()
            .expect("registry lock poisoned")
            .insert(record.name.clone(), record);
    }

    pub fn remove(&self, name: &str) -> Option<Arc<FunctionRecord>> {
        self.functions
            .write()
            .expect("registry lock poisoned")
            .remove(name)
    }

    /// Mutate one function's status under its own lock.
    pub fn update_status<F>(&self, name: &str, mutate: F)
    where
        F: FnOnce(&mut FunctionStatus),
    {
        if let Some(record) = self.get(name) {
            let mut status = record.status.write().expect("status lock poisoned");
            mutate(&mut status);
        }
    }

    /// Whether a successful run-once execution has ever been recorded for
    /// this name during the process lifetime.
    pub fn is_completed(&self, name: &str) -> bool {
        self.completed
            .read()
            .expect("completed set lock poisoned")
            .contains(name)
    }

    pub fn mark_completed(&self, name: &str) {
        self.completed
            .write()
            .expect("completed set lock poisoned")
            .insert(name.to_string());
    }
}
