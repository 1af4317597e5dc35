use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{DataKey, DataKeyStore, StoreError, StoreResult, StoreTransaction};

/// In-process store. Keys survive only as long as the value does.
#[derive(Default)]
pub struct MemoryStore {
    /// namespace → uid → key
    keys: RwLock<HashMap<String, HashMap<String, DataKey>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(
        keys: &mut HashMap<String, HashMap<String, DataKey>>,
        key: &DataKey,
    ) -> StoreResult<()> {
        let ns = keys.entry(key.namespace.clone()).or_default();
        if ns.contains_key(&key.uid) {
            return Err(StoreError::Duplicate(key.uid.clone()));
        }
        ns.insert(key.uid.clone(), key.clone());
        Ok(())
    }
}

fn current<'a>(keys: impl Iterator<Item = &'a DataKey>, label: &str) -> Option<&'a DataKey> {
    keys.filter(|k| k.active && k.label == label)
        .max_by_key(|k| k.created)
}

impl DataKeyStore for MemoryStore {
    fn get_data_key(&self, namespace: &str, uid: &str) -> StoreResult<DataKey> {
        self.keys
            .read()
            .get(namespace)
            .and_then(|ns| ns.get(uid))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn get_current_data_key(&self, namespace: &str, label: &str) -> StoreResult<DataKey> {
        let keys = self.keys.read();
        let ns = keys.get(namespace).ok_or(StoreError::NotFound)?;
        current(ns.values(), label)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn list_data_keys(&self, namespace: &str) -> StoreResult<Vec<DataKey>> {
        Ok(self
            .keys
            .read()
            .get(namespace)
            .map(|ns| ns.values().cloned().collect())
            .unwrap_or_default())
    }

    fn create_data_key(&self, key: &DataKey) -> StoreResult<()> {
        if !key.active {
            return Err(StoreError::InactiveKey);
        }
        Self::insert(&mut self.keys.write(), key)
    }

    fn disable_data_keys(&self, namespace: &str, updated: DateTime<Utc>) -> StoreResult<()> {
        if let Some(ns) = self.keys.write().get_mut(namespace) {
            for key in ns.values_mut().filter(|k| k.active) {
                key.active = false;
                key.updated = updated;
            }
        }
        Ok(())
    }

    fn delete_data_key(&self, namespace: &str, uid: &str) -> StoreResult<()> {
        self.keys
            .write()
            .get_mut(namespace)
            .and_then(|ns| ns.remove(uid))
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    fn update_data_key(
        &self,
        namespace: &str,
        uid: &str,
        provider: &str,
        encrypted_data: &[u8],
        updated: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut keys = self.keys.write();
        let key = keys
            .get_mut(namespace)
            .and_then(|ns| ns.get_mut(uid))
            .ok_or(StoreError::NotFound)?;
        key.provider = provider.to_owned();
        key.encrypted_data = encrypted_data.to_vec();
        key.updated = updated;
        Ok(())
    }

    fn begin(&self) -> StoreResult<Box<dyn StoreTransaction + '_>> {
        Ok(Box::new(MemoryTransaction {
            store: self,
            pending: Vec::new(),
        }))
    }
}

/// Buffers creations until commit; reads see pending keys first.
struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    pending: Vec<DataKey>,
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn get_data_key(&self, namespace: &str, uid: &str) -> StoreResult<DataKey> {
        match self
            .pending
            .iter()
            .find(|k| k.namespace == namespace && k.uid == uid)
        {
            Some(key) => Ok(key.clone()),
            None => self.store.get_data_key(namespace, uid),
        }
    }

    fn get_current_data_key(&self, namespace: &str, label: &str) -> StoreResult<DataKey> {
        let pending = self.pending.iter().filter(|k| k.namespace == namespace);
        match current(pending, label) {
            Some(key) => Ok(key.clone()),
            None => self.store.get_current_data_key(namespace, label),
        }
    }

    fn create_data_key(&mut self, key: &DataKey) -> StoreResult<()> {
        if !key.active {
            return Err(StoreError::InactiveKey);
        }
        if self.get_data_key(&key.namespace, &key.uid).is_ok() {
            return Err(StoreError::Duplicate(key.uid.clone()));
        }
        self.pending.push(key.clone());
        Ok(())
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut keys = self.store.keys.write();
        if let Some(dup) = self
            .pending
            .iter()
            .find(|k| keys.get(&k.namespace).is_some_and(|ns| ns.contains_key(&k.uid)))
        {
            return Err(StoreError::Duplicate(dup.uid.clone()));
        }
        for key in &self.pending {
            MemoryStore::insert(&mut keys, key)?;
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
