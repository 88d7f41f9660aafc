// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasherDefault;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ahash::AHasher;

use crate::{CommitResult, DataStore, ManagedObject, ObjId, StoreError, StoreTransaction};

type AHashMap<K, V> = HashMap<K, V, BuildHasherDefault<AHasher>>;

/// In-memory optimistic store. Object and binding versions stamp every
/// committed write; a transaction validates its read set against those stamps
/// at commit and loses with `ConflictRetry` if any moved underneath it.
pub struct MemStore {
    committed: Arc<Mutex<Committed>>,
    next_obj_id: Arc<AtomicU64>,
}

struct Committed {
    bindings: BTreeMap<String, ObjId>,
    binding_versions: AHashMap<String, u64>,
    objects: AHashMap<ObjId, Arc<dyn ManagedObject>>,
    obj_versions: AHashMap<ObjId, u64>,
    next_version: u64,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            committed: Arc::new(Mutex::new(Committed {
                bindings: BTreeMap::new(),
                binding_versions: HashMap::default(),
                objects: HashMap::default(),
                obj_versions: HashMap::default(),
                next_version: 1,
            })),
            next_obj_id: Arc::new(AtomicU64::new(1)),
        })
    }
}

impl DataStore for MemStore {
    fn begin_transaction(&self) -> Box<dyn StoreTransaction> {
        Box::new(MemTransaction {
            committed: self.committed.clone(),
            obj_reads: HashMap::default(),
            binding_reads: HashMap::default(),
            obj_writes: HashMap::default(),
            binding_writes: HashMap::default(),
            next_obj_id: self.next_obj_id.clone(),
        })
    }
}

struct MemTransaction {
    committed: Arc<Mutex<Committed>>,
    /// Object id -> version observed (0 = observed absent).
    obj_reads: AHashMap<ObjId, u64>,
    /// Binding name -> version observed (0 = observed absent).
    binding_reads: AHashMap<String, u64>,
    /// Object id -> new value, or None for removal.
    obj_writes: AHashMap<ObjId, Option<Arc<dyn ManagedObject>>>,
    /// Binding name -> bound id, or None for removal.
    binding_writes: AHashMap<String, Option<ObjId>>,
    next_obj_id: Arc<AtomicU64>,
}

fn note_obj_read(reads: &mut AHashMap<ObjId, u64>, committed: &Committed, obj_id: ObjId) {
    reads
        .entry(obj_id)
        .or_insert_with(|| committed.obj_versions.get(&obj_id).copied().unwrap_or(0));
}

fn note_binding_read(reads: &mut AHashMap<String, u64>, committed: &Committed, name: &str) {
    if !reads.contains_key(name) {
        let version = committed.binding_versions.get(name).copied().unwrap_or(0);
        reads.insert(name.to_string(), version);
    }
}

impl MemTransaction {
    fn committed_value(&mut self, obj_id: ObjId) -> Option<Arc<dyn ManagedObject>> {
        let committed = self.committed.lock().unwrap();
        note_obj_read(&mut self.obj_reads, &committed, obj_id);
        committed.objects.get(&obj_id).cloned()
    }
}

impl StoreTransaction for MemTransaction {
    fn create(&mut self, value: Arc<dyn ManagedObject>) -> ObjId {
        let obj_id = self.next_obj_id.fetch_add(1, Ordering::SeqCst);
        self.obj_writes.insert(obj_id, Some(value));
        obj_id
    }

    fn resolve(&mut self, obj_id: ObjId) -> Result<Arc<dyn ManagedObject>, StoreError> {
        if let Some(local) = self.obj_writes.get(&obj_id) {
            return match local {
                Some(value) => Ok(value.clone()),
                None => Err(StoreError::ObjectNotFound(obj_id)),
            };
        }
        self.committed_value(obj_id)
            .ok_or(StoreError::ObjectNotFound(obj_id))
    }

    fn update(&mut self, obj_id: ObjId, value: Arc<dyn ManagedObject>) -> Result<(), StoreError> {
        self.mark_for_update(obj_id)?;
        self.obj_writes.insert(obj_id, Some(value));
        Ok(())
    }

    fn mark_for_update(&mut self, obj_id: ObjId) -> Result<(), StoreError> {
        // The write-set entry is what makes the commit conflict with
        // concurrent writers, even if the value ends up unchanged.
        if let Some(local) = self.obj_writes.get(&obj_id) {
            return match local {
                Some(_) => Ok(()),
                None => Err(StoreError::ObjectNotFound(obj_id)),
            };
        }
        match self.committed_value(obj_id) {
            Some(value) => {
                self.obj_writes.insert(obj_id, Some(value));
                Ok(())
            }
            None => Err(StoreError::ObjectNotFound(obj_id)),
        }
    }

    fn remove_object(&mut self, obj_id: ObjId) -> Result<(), StoreError> {
        // Resolve first so removal of a missing object reports not-found.
        self.resolve(obj_id)?;
        self.obj_writes.insert(obj_id, None);
        Ok(())
    }

    fn set_binding(&mut self, name: &str, obj_id: ObjId) {
        self.binding_writes.insert(name.to_string(), Some(obj_id));
    }

    fn get_binding(&mut self, name: &str) -> Result<ObjId, StoreError> {
        if let Some(local) = self.binding_writes.get(name) {
            return match local {
                Some(obj_id) => Ok(*obj_id),
                None => Err(StoreError::NameNotBound(name.to_string())),
            };
        }
        let committed = self.committed.lock().unwrap();
        note_binding_read(&mut self.binding_reads, &committed, name);
        committed
            .bindings
            .get(name)
            .copied()
            .ok_or_else(|| StoreError::NameNotBound(name.to_string()))
    }

    fn next_bound_name(&mut self, prev: &str) -> Option<String> {
        let committed = self.committed.lock().unwrap();
        // Walk committed names after `prev`, skipping ones we've locally
        // removed, then merge in locally-added names.
        let mut candidate: Option<String> = None;
        for (name, _) in committed
            .bindings
            .range::<str, _>((Bound::Excluded(prev), Bound::Unbounded))
        {
            match self.binding_writes.get(name) {
                Some(None) => continue,
                _ => {
                    candidate = Some(name.clone());
                    break;
                }
            }
        }
        for (name, write) in &self.binding_writes {
            if write.is_some()
                && name.as_str() > prev
                && candidate.as_deref().is_none_or(|c| name.as_str() < c)
            {
                candidate = Some(name.clone());
            }
        }
        if let Some(ref name) = candidate {
            // The scan position is part of the read set: a binding committed
            // between prev and the candidate would change the walk.
            note_binding_read(&mut self.binding_reads, &committed, name);
        }
        candidate
    }

    fn remove_binding(&mut self, name: &str) -> Result<(), StoreError> {
        self.get_binding(name)?;
        self.binding_writes.insert(name.to_string(), None);
        Ok(())
    }

    fn commit(self: Box<Self>) -> CommitResult {
        let mut committed = self.committed.lock().unwrap();

        // Validate the read sets.
        for (obj_id, seen) in &self.obj_reads {
            let current = committed.obj_versions.get(obj_id).copied().unwrap_or(0);
            if current != *seen {
                return CommitResult::ConflictRetry;
            }
        }
        for (name, seen) in &self.binding_reads {
            let current = committed.binding_versions.get(name).copied().unwrap_or(0);
            if current != *seen {
                return CommitResult::ConflictRetry;
            }
        }

        // Apply the working set.
        let version = committed.next_version;
        committed.next_version += 1;
        for (obj_id, write) in self.obj_writes {
            match write {
                Some(value) => {
                    committed.objects.insert(obj_id, value);
                }
                None => {
                    committed.objects.remove(&obj_id);
                }
            }
            committed.obj_versions.insert(obj_id, version);
        }
        for (name, write) in self.binding_writes {
            match write {
                Some(obj_id) => {
                    committed.bindings.insert(name.clone(), obj_id);
                }
                None => {
                    committed.bindings.remove(&name);
                }
            }
            committed.binding_versions.insert(name, version);
        }
        CommitResult::Success
    }

    fn rollback(self: Box<Self>) {
        // Working set is dropped; nothing touched committed state.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downcast;
    use pretty_assertions::assert_eq;

    #[test]
    fn bindings_roundtrip_across_commit() {
        let store = MemStore::new();
        let mut tx = store.begin_transaction();
        let id = tx.create(Arc::new("hello".to_string()));
        tx.set_binding("svc.greeting", id);
        assert_eq!(tx.commit(), CommitResult::Success);

        let mut tx = store.begin_transaction();
        let bound = tx.get_binding("svc.greeting").unwrap();
        assert_eq!(bound, id);
        let value = tx.resolve(bound).unwrap();
        assert_eq!(downcast::<String>(&value).unwrap(), "hello");
        tx.rollback();
    }

    #[test]
    fn rollback_discards_writes() {
        let store = MemStore::new();
        let mut tx = store.begin_transaction();
        let id = tx.create(Arc::new(1u64));
        tx.set_binding("svc.x", id);
        tx.rollback();

        let mut tx = store.begin_transaction();
        assert_eq!(
            tx.get_binding("svc.x"),
            Err(StoreError::NameNotBound("svc.x".to_string()))
        );
        tx.rollback();
    }

    #[test]
    fn conflicting_writers_retry() {
        let store = MemStore::new();
        let mut tx = store.begin_transaction();
        let id = tx.create(Arc::new(0u64));
        tx.set_binding("svc.counter", id);
        assert_eq!(tx.commit(), CommitResult::Success);

        let mut tx_a = store.begin_transaction();
        let mut tx_b = store.begin_transaction();
        tx_a.update(id, Arc::new(1u64)).unwrap();
        tx_b.update(id, Arc::new(2u64)).unwrap();
        assert_eq!(tx_a.commit(), CommitResult::Success);
        assert_eq!(tx_b.commit(), CommitResult::ConflictRetry);

        let mut tx = store.begin_transaction();
        let value = tx.resolve(id).unwrap();
        assert_eq!(downcast::<u64>(&value), Some(&1));
        tx.rollback();
    }

    #[test]
    fn next_bound_name_walks_lexically() {
        let store = MemStore::new();
        let mut tx = store.begin_transaction();
        for name in ["p.a.1", "p.a.2", "p.b.1", "q.z"] {
            let id = tx.create(Arc::new(()));
            tx.set_binding(name, id);
        }
        assert_eq!(tx.commit(), CommitResult::Success);

        let mut tx = store.begin_transaction();
        let mut walked = Vec::new();
        let mut cursor = "p.a".to_string();
        while let Some(next) = tx.next_bound_name(&cursor) {
            if !next.starts_with("p.a") {
                break;
            }
            walked.push(next.clone());
            cursor = next;
        }
        assert_eq!(walked, vec!["p.a.1".to_string(), "p.a.2".to_string()]);
        tx.rollback();
    }

    #[test]
    fn next_bound_name_sees_uncommitted_writes() {
        let store = MemStore::new();
        let mut tx = store.begin_transaction();
        let id = tx.create(Arc::new(()));
        tx.set_binding("p.m", id);
        assert_eq!(tx.next_bound_name("p"), Some("p.m".to_string()));
        tx.remove_binding("p.m").unwrap();
        assert_eq!(tx.next_bound_name("p"), None);
        tx.rollback();
    }

    #[test]
    fn remove_object_then_resolve_fails() {
        let store = MemStore::new();
        let mut tx = store.begin_transaction();
        let id = tx.create(Arc::new(42u64));
        assert_eq!(tx.commit(), CommitResult::Success);

        let mut tx = store.begin_transaction();
        tx.remove_object(id).unwrap();
        assert!(matches!(tx.resolve(id), Err(StoreError::ObjectNotFound(e)) if e == id));
        assert_eq!(tx.commit(), CommitResult::Success);

        let mut tx = store.begin_transaction();
        assert!(matches!(tx.resolve(id), Err(StoreError::ObjectNotFound(e)) if e == id));
        tx.rollback();
    }

    #[test]
    fn downcast_sees_the_stored_concrete_type() {
        #[derive(Debug, PartialEq)]
        struct Record {
            node: u64,
        }

        let store = MemStore::new();
        let mut tx = store.begin_transaction();
        let id = tx.create(Arc::new(Record { node: 7 }));
        let value = tx.resolve(id).unwrap();
        assert_eq!(downcast::<Record>(&value), Some(&Record { node: 7 }));
        assert!(downcast::<u64>(&value).is_none());
        assert_eq!(tx.commit(), CommitResult::Success);

        // Same round-trip through committed state.
        let mut tx = store.begin_transaction();
        let value = tx.resolve(id).unwrap();
        assert_eq!(downcast::<Record>(&value), Some(&Record { node: 7 }));
        tx.rollback();
    }
}
