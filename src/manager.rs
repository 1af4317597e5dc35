//! Envelope encryption: payloads are sealed under data keys, data keys are
//! wrapped by KMS providers and persisted, and cleartext data keys are
//! only ever held in the cache.

use std::{
    collections::HashMap,
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use uuid::Uuid;

use crate::{
    cache::{DataKeyCache, DataKeyCacheEntry},
    clock::{Clock, SystemClock},
    config::Settings,
    crypto::{Encryption, framing, keys::Dek},
    error::{Error, Result},
    kms::{self, KmsProvider, ProviderConfig, ProviderId, ProviderRegistry},
    metrics::{Metrics, UsageStats, metric_name},
    store::{DataKey, DataKeyStore, StoreError, StoreResult, StoreTransaction},
};

pub struct ManagerBuilder {
    settings: Settings,
    store: Arc<dyn DataKeyStore>,
    providers: Vec<(ProviderId, Arc<dyn KmsProvider>)>,
    clock: Arc<dyn Clock>,
    usage_stats: Option<Arc<dyn UsageStats>>,
}

impl ManagerBuilder {
    pub fn new(settings: Settings, store: Arc<dyn DataKeyStore>) -> Self {
        Self {
            settings,
            store,
            providers: Vec::new(),
            clock: Arc::new(SystemClock),
            usage_stats: None,
        }
    }

    /// Register an extra KMS provider next to the ones named in the settings.
    pub fn provider(mut self, id: ProviderId, provider: Arc<dyn KmsProvider>) -> Self {
        self.providers.push((id, provider));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn usage_stats(mut self, usage_stats: Arc<dyn UsageStats>) -> Self {
        self.usage_stats = Some(usage_stats);
        self
    }

    pub fn build(self) -> Result<Manager> {
        self.settings.validate()?;
        let encryption = Arc::new(Encryption::new(&self.settings.encryption_algorithm)?);

        let mut available = kms::providers_from_settings(&self.settings, encryption.clone())?;
        available.extend(self.providers);
        let current = self.settings.current_provider_id()?;
        let providers = ProviderRegistry::new();
        providers.initialize(ProviderConfig::new(current.clone(), available)?)?;

        if let Some(usage_stats) = &self.usage_stats {
            let metrics = provider_metrics(&self.settings.metrics_prefix, &current, &providers.ids());
            usage_stats.register_metrics_func(Box::new(move || Ok(metrics.clone())));
        }

        log::info!(
            "envelope encryption ready: provider={current} algorithm={} providers={}",
            encryption.current_algorithm(),
            providers.ids().len()
        );

        Ok(Manager {
            store: self.store,
            providers,
            encryption,
            cache: Arc::new(DataKeyCache::new(
                self.settings.data_key_cache_ttl(),
                self.clock.clone(),
            )),
            clock: self.clock,
            cleanup_interval: self.settings.data_key_cache_cleanup_interval(),
            current_key: ReentrantMutex::new(()),
        })
    }
}

fn provider_metrics(prefix: &str, current: &ProviderId, ids: &[ProviderId]) -> Metrics {
    let mut metrics = Metrics::new();
    metrics.insert(
        metric_name(
            prefix,
            &format!("encryption.current_provider.{}.count", current.kind()),
        ),
        1,
    );
    for id in ids {
        *metrics
            .entry(metric_name(
                prefix,
                &format!("encryption.providers.{}.count", id.kind()),
            ))
            .or_default() += 1;
    }
    metrics
}

pub struct Manager {
    store: Arc<dyn DataKeyStore>,
    providers: ProviderRegistry,
    encryption: Arc<Encryption>,
    cache: Arc<DataKeyCache>,
    clock: Arc<dyn Clock>,
    cleanup_interval: Duration,
    /// Held while deciding whether a current data key exists, and while
    /// minting one if it does not. Reentrant so that a call made from inside
    /// [`Manager::with_transaction`] reaches the store and fails there
    /// instead of waiting on itself.
    current_key: ReentrantMutex<()>,
}

impl Manager {
    pub fn new(settings: Settings, store: Arc<dyn DataKeyStore>) -> Result<Self> {
        ManagerBuilder::new(settings, store).build()
    }

    pub fn builder(settings: Settings, store: Arc<dyn DataKeyStore>) -> ManagerBuilder {
        ManagerBuilder::new(settings, store)
    }

    /// Id of the data key a ciphertext produced by [`Manager::encrypt`] was
    /// sealed under.
    pub fn data_key_id(payload: &[u8]) -> Option<String> {
        framing::split_data_key_id(payload).map(|(id, _)| id)
    }

    pub fn current_provider_id(&self) -> Result<ProviderId> {
        Ok(self.providers.current()?.0.clone())
    }

    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.providers.ids()
    }

    /// Seal `payload` under the namespace's current data key, minting and
    /// persisting one first if there is none for today's label.
    pub fn encrypt(&self, namespace: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let label = self.current_label()?;
        let (id, dek) = {
            let _current_key = self.current_key.lock();
            self.resolve_current(&mut Direct(self.store.as_ref()), namespace, &label)?
        };
        self.seal(&id, &dek, payload)
    }

    pub fn decrypt(&self, namespace: &str, payload: &[u8]) -> Result<Vec<u8>> {
        self.open(&mut Direct(self.store.as_ref()), namespace, payload)
    }

    /// Run `f` against a store transaction. Data keys minted or loaded
    /// inside it reach the cache only once the transaction commits; if `f`
    /// fails the transaction rolls back and nothing is cached.
    ///
    /// Inside `f`, go through the [`Transaction`] handle. Manager methods
    /// that bypass it (`encrypt`, `decrypt`, `rotate_data_keys`,
    /// `re_encrypt_data_keys`, `list_data_keys`, `delete_data_key`) do not
    /// see the transaction's writes, and on a store that holds its
    /// connection for the transaction they fail with
    /// [`StoreError::TransactionInProgress`] whenever they need the store.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let current_key = self.current_key.lock();
        let tx = self.store.begin()?;
        let mut scope = Transaction {
            manager: self,
            source: InTransaction {
                tx,
                pending: Vec::new(),
            },
            _current_key: current_key,
        };

        let result = f(&mut scope);
        let Transaction {
            source: InTransaction { tx, pending },
            _current_key,
            ..
        } = scope;

        match result {
            Ok(value) => {
                tx.commit()?;
                for (key, dek, by_label) in &pending {
                    self.cache_data_key(key, dek, *by_label);
                }
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    log::warn!("data key transaction rollback failed: {rollback}");
                }
                Err(e)
            }
        }
    }

    pub fn encrypt_json_data(
        &self,
        namespace: &str,
        data: &HashMap<String, String>,
    ) -> Result<HashMap<String, Vec<u8>>> {
        data.iter()
            .map(|(k, v)| Ok((k.clone(), self.encrypt(namespace, v.as_bytes())?)))
            .collect()
    }

    pub fn decrypt_json_data(
        &self,
        namespace: &str,
        data: &HashMap<String, Vec<u8>>,
    ) -> Result<HashMap<String, String>> {
        data.iter()
            .map(|(k, v)| {
                let decrypted = self.decrypt(namespace, v)?;
                Ok((k.clone(), String::from_utf8_lossy(&decrypted).into_owned()))
            })
            .collect()
    }

    /// Decrypted `data[key]`, or `fallback` if it is absent or unreadable.
    pub fn get_decrypted_value(
        &self,
        namespace: &str,
        data: &HashMap<String, Vec<u8>>,
        key: &str,
        fallback: &str,
    ) -> String {
        let Some(value) = data.get(key) else {
            return fallback.to_owned();
        };
        match self.decrypt(namespace, value) {
            Ok(decrypted) => String::from_utf8_lossy(&decrypted).into_owned(),
            Err(e) => {
                log::warn!("falling back for {key:?} in {namespace:?}: {e}");
                fallback.to_owned()
            }
        }
    }

    /// Deactivate every data key in the namespace. The next encrypt mints a
    /// fresh key; existing ciphertext stays readable.
    pub fn rotate_data_keys(&self, namespace: &str) -> Result<()> {
        let _current_key = self.current_key.lock();
        self.store.disable_data_keys(namespace, self.clock.now())?;
        self.cache.flush(namespace);
        log::info!("rotated data keys in {namespace:?}");
        Ok(())
    }

    /// Re-wrap every data key of the namespace with the current provider.
    /// Returns the number of keys rewritten.
    pub fn re_encrypt_data_keys(&self, namespace: &str) -> Result<usize> {
        let (current_id, current) = self.providers.current()?;
        let keys = self.store.list_data_keys(namespace)?;
        for key in &keys {
            let dek = self.unwrap_data_key(key)?;
            let wrapped = current.encrypt(dek.as_bytes())?;
            self.store.update_data_key(
                namespace,
                &key.uid,
                current_id.as_str(),
                &wrapped,
                self.clock.now(),
            )?;
        }
        log::info!(
            "re-encrypted {} data keys in {namespace:?} with {current_id}",
            keys.len()
        );
        Ok(keys.len())
    }

    pub fn list_data_keys(&self, namespace: &str) -> Result<Vec<DataKey>> {
        Ok(self.store.list_data_keys(namespace)?)
    }

    /// Delete one data key. Anything sealed under it becomes unreadable.
    pub fn delete_data_key(&self, namespace: &str, uid: &str) -> Result<()> {
        self.store
            .delete_data_key(namespace, uid)
            .map_err(|e| not_found(e, namespace, uid))?;
        self.cache.flush(namespace);
        log::info!("deleted data key {uid:?} in {namespace:?}");
        Ok(())
    }

    /// Sweep expired cache entries every cleanup interval until the handle
    /// is dropped.
    pub fn spawn_cache_cleanup(&self) -> std::io::Result<CacheCleanup> {
        let (stop, stopped) = mpsc::channel::<()>();
        let cache = self.cache.clone();
        let interval = self.cleanup_interval;
        let handle = thread::Builder::new()
            .name("data-key-cache-cleanup".into())
            .spawn(move || {
                while let Err(mpsc::RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    cache.remove_expired();
                }
            })?;
        Ok(CacheCleanup {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    fn current_label(&self) -> Result<String> {
        let (provider, _) = self.providers.current()?;
        Ok(format!("{}@{provider}", self.clock.now().format("%Y-%m-%d")))
    }

    /// cache by label → source → mint. Callers hold `current_key`.
    fn resolve_current(
        &self,
        source: &mut impl KeySource,
        namespace: &str,
        label: &str,
    ) -> Result<(String, Dek)> {
        if let Some(entry) = self.cache.get_by_label(namespace, label) {
            log::debug!("data key cache hit for {label} in {namespace:?}");
            return Ok((entry.id, entry.data_key));
        }

        match source.current(namespace, label) {
            Ok(key) => {
                let dek = self.unwrap_data_key(&key)?;
                source.keep(self, &key, &dek, true);
                return Ok((key.uid, dek));
            }
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let (key, dek) = self.mint_data_key(namespace, label)?;
        // Nothing may cache or use the key before it is persisted.
        source.create(&key)?;
        log::info!("minted data key {:?} for {namespace:?} ({label})", key.uid);
        source.keep(self, &key, &dek, true);
        Ok((key.uid, dek))
    }

    fn mint_data_key(&self, namespace: &str, label: &str) -> Result<(DataKey, Dek)> {
        let dek = Dek::generate()?;
        let (provider_id, provider) = self.providers.current()?;
        let encrypted_data = provider.encrypt(dek.as_bytes())?;
        let now = self.clock.now();
        let key = DataKey {
            uid: Uuid::new_v4().simple().to_string(),
            namespace: namespace.to_owned(),
            label: label.to_owned(),
            active: true,
            provider: provider_id.to_string(),
            encrypted_data,
            created: now,
            updated: now,
        };
        Ok((key, dek))
    }

    fn unwrap_data_key(&self, key: &DataKey) -> Result<Dek> {
        let provider = self.providers.get(&key.provider)?;
        Ok(Dek::from_bytes(provider.decrypt(&key.encrypted_data)?))
    }

    fn cache_data_key(&self, key: &DataKey, dek: &Dek, by_label: bool) {
        let entry = DataKeyCacheEntry {
            id: key.uid.clone(),
            label: key.label.clone(),
            namespace: key.namespace.clone(),
            data_key: dek.clone(),
            active: key.active,
            expiration: self.clock.now(),
        };
        if by_label && key.active {
            self.cache.add_by_label(entry.clone());
        }
        self.cache.add_by_id(entry);
    }

    fn seal(&self, id: &str, dek: &Dek, payload: &[u8]) -> Result<Vec<u8>> {
        let encrypted = self.encryption.encrypt(payload, dek.as_bytes())?;
        Ok(framing::embed_data_key_id(id, &encrypted))
    }

    fn open(
        &self,
        source: &mut impl KeySource,
        namespace: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        // Empty and id-less payloads are rejected alike.
        let (id, body) = framing::split_data_key_id(payload).ok_or(Error::EmptyPayload)?;

        let dek = self.data_key_by_id(source, namespace, &id).inspect_err(|e| {
            log::error!("failed to resolve data key: namespace={namespace:?} data_key_id={id:?}: {e}")
        })?;
        self.encryption.decrypt(body, dek.as_bytes()).inspect_err(|e| {
            log::error!("failed to decrypt payload: namespace={namespace:?} data_key_id={id:?}: {e}")
        })
    }

    /// cache by id → source. Only the id index is filled here, so a key read
    /// for decryption can never become a namespace's current key.
    fn data_key_by_id(
        &self,
        source: &mut impl KeySource,
        namespace: &str,
        id: &str,
    ) -> Result<Dek> {
        if let Some(entry) = self.cache.get_by_id(namespace, id) {
            return Ok(entry.data_key);
        }
        log::debug!("data key cache miss for {id:?} in {namespace:?}");
        let key = source
            .get(namespace, id)
            .map_err(|e| not_found(e, namespace, id))?;
        let dek = self.unwrap_data_key(&key)?;
        source.keep(self, &key, &dek, false);
        Ok(dek)
    }
}

fn not_found(e: StoreError, namespace: &str, id: &str) -> Error {
    match e {
        StoreError::NotFound => Error::DataKeyNotFound {
            namespace: namespace.to_owned(),
            id: id.to_owned(),
        },
        e => e.into(),
    }
}

/// Where key reads and writes go: straight to the store, or through an
/// open transaction.
trait KeySource {
    fn get(&self, namespace: &str, uid: &str) -> StoreResult<DataKey>;

    fn current(&self, namespace: &str, label: &str) -> StoreResult<DataKey>;

    fn create(&mut self, key: &DataKey) -> StoreResult<()>;

    /// Called once `key` is known to be persisted (or to be persisted on
    /// commit).
    fn keep(&mut self, manager: &Manager, key: &DataKey, dek: &Dek, by_label: bool);
}

struct Direct<'a>(&'a dyn DataKeyStore);

impl KeySource for Direct<'_> {
    fn get(&self, namespace: &str, uid: &str) -> StoreResult<DataKey> {
        self.0.get_data_key(namespace, uid)
    }

    fn current(&self, namespace: &str, label: &str) -> StoreResult<DataKey> {
        self.0.get_current_data_key(namespace, label)
    }

    fn create(&mut self, key: &DataKey) -> StoreResult<()> {
        self.0.create_data_key(key)
    }

    fn keep(&mut self, manager: &Manager, key: &DataKey, dek: &Dek, by_label: bool) {
        manager.cache_data_key(key, dek, by_label);
    }
}

struct InTransaction<'a> {
    tx: Box<dyn StoreTransaction + 'a>,
    pending: Vec<(DataKey, Dek, bool)>,
}

impl KeySource for InTransaction<'_> {
    fn get(&self, namespace: &str, uid: &str) -> StoreResult<DataKey> {
        self.tx.get_data_key(namespace, uid)
    }

    fn current(&self, namespace: &str, label: &str) -> StoreResult<DataKey> {
        self.tx.get_current_data_key(namespace, label)
    }

    fn create(&mut self, key: &DataKey) -> StoreResult<()> {
        self.tx.create_data_key(key)
    }

    fn keep(&mut self, _: &Manager, key: &DataKey, dek: &Dek, by_label: bool) {
        self.pending.push((key.clone(), dek.clone(), by_label));
    }
}

/// Encrypt/decrypt scope handed to [`Manager::with_transaction`].
pub struct Transaction<'m> {
    manager: &'m Manager,
    source: InTransaction<'m>,
    _current_key: ReentrantMutexGuard<'m, ()>,
}

impl Transaction<'_> {
    pub fn encrypt(&mut self, namespace: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let label = self.manager.current_label()?;
        let (id, dek) = self
            .manager
            .resolve_current(&mut self.source, namespace, &label)?;
        self.manager.seal(&id, &dek, payload)
    }

    pub fn decrypt(&mut self, namespace: &str, payload: &[u8]) -> Result<Vec<u8>> {
        self.manager.open(&mut self.source, namespace, payload)
    }
}

/// Handle of the background cache sweep. Dropping it stops the sweep.
pub struct CacheCleanup {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Drop for CacheCleanup {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("data key cache cleanup thread panicked");
            }
        }
    }
}
