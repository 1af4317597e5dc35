//! Namespace-scoped, TTL-bounded cache of cleartext data keys.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::{clock::Clock, crypto::keys::Dek};

#[derive(Clone, Debug)]
pub struct DataKeyCacheEntry {
    pub id: String,
    pub label: String,
    pub namespace: String,
    pub data_key: Dek,
    pub active: bool,
    pub expiration: DateTime<Utc>,
}

impl DataKeyCacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expiration
    }
}

/// Both indices of one namespace. They are filled independently.
#[derive(Default)]
struct NamespaceEntries {
    by_id: HashMap<String, DataKeyCacheEntry>,
    by_label: HashMap<String, DataKeyCacheEntry>,
}

impl NamespaceEntries {
    fn remove_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.by_id.len() + self.by_label.len();
        self.by_id.retain(|_, e| !e.is_expired(now));
        self.by_label.retain(|_, e| !e.is_expired(now));
        before - self.by_id.len() - self.by_label.len()
    }

    fn is_empty(&self) -> bool {
        self.by_id.is_empty() && self.by_label.is_empty()
    }
}

pub struct DataKeyCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    namespaces: RwLock<HashMap<String, NamespaceEntries>>,
}

impl DataKeyCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_by_id(&self, namespace: &str, id: &str) -> Option<DataKeyCacheEntry> {
        self.get(namespace, |ns| ns.by_id.get(id))
    }

    pub fn get_by_label(&self, namespace: &str, label: &str) -> Option<DataKeyCacheEntry> {
        self.get(namespace, |ns| ns.by_label.get(label))
    }

    /// `now + ttl`, saturating at the latest representable instant.
    fn expiration(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.clock.now().checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn get(
        &self,
        namespace: &str,
        lookup: impl for<'n> FnOnce(&'n NamespaceEntries) -> Option<&'n DataKeyCacheEntry>,
    ) -> Option<DataKeyCacheEntry> {
        let now = self.clock.now();
        let namespaces = self.namespaces.read();
        let entry = lookup(namespaces.get(namespace)?)?;
        if entry.is_expired(now) {
            log::debug!("data key cache: expired entry for {:?} in {namespace:?}", entry.id);
            return None;
        }
        Some(entry.clone())
    }

    /// Insert under the entry's id. The expiration is always reset to
    /// `now + ttl`.
    pub fn add_by_id(&self, mut entry: DataKeyCacheEntry) {
        entry.expiration = self.expiration();
        let key = entry.id.clone();
        self.namespaces
            .write()
            .entry(entry.namespace.clone())
            .or_default()
            .by_id
            .insert(key, entry);
    }

    /// Insert under the entry's label. The expiration is always reset to
    /// `now + ttl`.
    pub fn add_by_label(&self, mut entry: DataKeyCacheEntry) {
        entry.expiration = self.expiration();
        let key = entry.label.clone();
        self.namespaces
            .write()
            .entry(entry.namespace.clone())
            .or_default()
            .by_label
            .insert(key, entry);
    }

    /// Physically drop every expired entry in every namespace.
    pub fn remove_expired(&self) -> usize {
        let now = self.clock.now();
        let mut namespaces = self.namespaces.write();
        let removed: usize = namespaces
            .values_mut()
            .map(|ns| ns.remove_expired(now))
            .sum();
        namespaces.retain(|_, ns| !ns.is_empty());
        if removed > 0 {
            log::debug!("data key cache: swept {removed} expired entries");
        }
        removed
    }

    /// Forget both indices of one namespace.
    pub fn flush(&self, namespace: &str) {
        self.namespaces.write().remove(namespace);
    }

    pub fn len(&self) -> usize {
        self.namespaces
            .read()
            .values()
            .map(|ns| ns.by_id.len() + ns.by_label.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
