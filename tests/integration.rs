use std::{
    collections::HashMap,
    sync::{
        Arc, Barrier,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use chrono::{DateTime, Utc};
use sqlsecrets::{
    DataKey, DataKeyStore, Error, KmsProvider, Manager, MemoryStore, Result, Settings,
    SqliteStore,
    crypto::{Cipher, Encryption, cfb::AesCfb, framing},
    kms::secret_key::SecretKeyProvider,
    store::{StoreError, StoreResult, StoreTransaction},
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn manager(store: Arc<dyn DataKeyStore>) -> Result<Manager> {
    init();
    Manager::new(Settings::default(), store)
}

/// XORs every byte; enough to tell which provider wrapped a key.
struct XorProvider(u8);

impl KmsProvider for XorProvider {
    fn encrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        Ok(blob.iter().map(|b| b ^ self.0).collect())
    }

    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        self.encrypt(blob)
    }
}

/// Counts key creations on the way through to a memory store.
#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    created: AtomicUsize,
}

impl DataKeyStore for CountingStore {
    fn get_data_key(&self, namespace: &str, uid: &str) -> StoreResult<DataKey> {
        self.inner.get_data_key(namespace, uid)
    }

    fn get_current_data_key(&self, namespace: &str, label: &str) -> StoreResult<DataKey> {
        self.inner.get_current_data_key(namespace, label)
    }

    fn list_data_keys(&self, namespace: &str) -> StoreResult<Vec<DataKey>> {
        self.inner.list_data_keys(namespace)
    }

    fn create_data_key(&self, key: &DataKey) -> StoreResult<()> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.inner.create_data_key(key)
    }

    fn disable_data_keys(&self, namespace: &str, updated: DateTime<Utc>) -> StoreResult<()> {
        self.inner.disable_data_keys(namespace, updated)
    }

    fn delete_data_key(&self, namespace: &str, uid: &str) -> StoreResult<()> {
        self.inner.delete_data_key(namespace, uid)
    }

    fn update_data_key(
        &self,
        namespace: &str,
        uid: &str,
        provider: &str,
        encrypted_data: &[u8],
        updated: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.inner
            .update_data_key(namespace, uid, provider, encrypted_data, updated)
    }

    fn begin(&self) -> StoreResult<Box<dyn StoreTransaction + '_>> {
        self.inner.begin()
    }
}

#[test]
fn test_round_trip() -> Result<()> {
    let manager = manager(Arc::new(MemoryStore::new()))?;

    let sealed = manager.encrypt("org-1", b"grafana")?;
    assert_ne!(sealed, b"grafana");
    assert_eq!(sealed[0], b'#');
    assert_eq!(manager.decrypt("org-1", &sealed)?, b"grafana");

    // Fresh nonce and salt every time.
    let again = manager.encrypt("org-1", b"grafana")?;
    assert_ne!(sealed, again);
    assert_eq!(manager.decrypt("org-1", &again)?, b"grafana");
    Ok(())
}

#[test]
fn test_same_day_reuses_data_key() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let manager = manager(store.clone())?;

    let first = manager.encrypt("org-1", b"a")?;
    let second = manager.encrypt("org-1", b"b")?;
    assert_eq!(Manager::data_key_id(&first), Manager::data_key_id(&second));
    assert_eq!(store.list_data_keys("org-1")?.len(), 1);

    // A second process sharing the store picks up the persisted key.
    let other = manager_on(store.clone())?;
    let third = other.encrypt("org-1", b"c")?;
    assert_eq!(Manager::data_key_id(&first), Manager::data_key_id(&third));
    assert_eq!(other.decrypt("org-1", &first)?, b"a");
    Ok(())
}

fn manager_on(store: Arc<MemoryStore>) -> Result<Manager> {
    manager(store)
}

#[test]
fn test_namespaces_are_isolated() -> Result<()> {
    let manager = manager(Arc::new(MemoryStore::new()))?;

    let one = manager.encrypt("org-1", b"secret")?;
    let two = manager.encrypt("org-2", b"secret")?;
    assert_ne!(Manager::data_key_id(&one), Manager::data_key_id(&two));

    let err = manager.decrypt("org-2", &one).unwrap_err();
    assert!(
        matches!(&err, Error::DataKeyNotFound { namespace, .. } if namespace == "org-2"),
        "unexpected error: {err}"
    );
    Ok(())
}

#[test]
fn test_concurrent_first_encrypt_mints_one_key() -> Result<()> {
    const THREADS: usize = 8;

    let store = Arc::new(CountingStore::default());
    let manager = manager(store.clone())?;
    let barrier = Barrier::new(THREADS);

    let ids: Vec<Option<String>> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let manager = &manager;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    let sealed = manager.encrypt("org-1", format!("payload-{i}").as_bytes())?;
                    assert_eq!(manager.decrypt("org-1", &sealed)?, format!("payload-{i}").as_bytes());
                    Ok::<_, Error>(Manager::data_key_id(&sealed))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("encrypt thread panicked"))
            .collect::<Result<_>>()
    })?;

    assert_eq!(store.created.load(Ordering::SeqCst), 1);
    assert!(ids.iter().all(|id| id.is_some() && *id == ids[0]));
    Ok(())
}

#[test]
fn test_legacy_untagged_payload() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let manager = manager(store.clone())?;

    // A key wrapped the way the built-in provider wraps keys, and a payload
    // sealed with the untagged CFB format that predates algorithm tags.
    let dek = b"0123456789abcdef";
    let wrapper = SecretKeyProvider::new(
        sqlsecrets::config::DEFAULT_SECRET_KEY,
        Arc::new(Encryption::new(sqlsecrets::crypto::AES_GCM)?),
    );
    let now = Utc::now();
    store.create_data_key(&DataKey {
        uid: "legacy".into(),
        namespace: "org-1".into(),
        label: "2019-01-01@secretKey.v1".into(),
        active: true,
        provider: "secretKey.v1".into(),
        encrypted_data: wrapper.encrypt(dek)?,
        created: now,
        updated: now,
    })?;

    let untagged = AesCfb.encrypt(b"old secret", dek)?;
    assert_ne!(untagged[0], b'*');
    let payload = framing::embed_data_key_id("legacy", &untagged);

    assert_eq!(manager.decrypt("org-1", &payload)?, b"old secret");
    Ok(())
}

#[test]
fn test_malformed_payloads() -> Result<()> {
    let manager = manager(Arc::new(MemoryStore::new()))?;

    let err = manager.decrypt("org-1", b"").unwrap_err();
    assert!(matches!(err, Error::EmptyPayload));
    assert_eq!(err.to_string(), "unable to derive encryption algorithm");

    assert!(matches!(
        manager.decrypt("org-1", b"no frame here"),
        Err(Error::EmptyPayload)
    ));

    let mut sealed = manager.encrypt("org-1", b"grafana")?;
    let last = sealed.len() - 1;
    sealed[last] ^= 0x01;
    assert!(matches!(
        manager.decrypt("org-1", &sealed),
        Err(Error::Authentication)
    ));
    Ok(())
}

#[test]
fn test_transaction_commit() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let manager = manager(store.clone())?;

    let sealed = manager.with_transaction(|tx| {
        let sealed = tx.encrypt("org-1", b"in tx")?;
        // Keys minted inside the transaction are readable inside it.
        assert_eq!(tx.decrypt("org-1", &sealed)?, b"in tx");
        Ok(sealed)
    })?;

    assert_eq!(store.list_data_keys("org-1")?.len(), 1);
    assert_eq!(manager.decrypt("org-1", &sealed)?, b"in tx");
    let after = manager.encrypt("org-1", b"after")?;
    assert_eq!(Manager::data_key_id(&sealed), Manager::data_key_id(&after));
    Ok(())
}

#[test]
fn test_transaction_rollback_leaves_no_key_behind() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let manager = manager(store.clone())?;

    let mut leaked = None;
    let err = manager
        .with_transaction(|tx| {
            leaked = Some(tx.encrypt("org-1", b"doomed")?);
            Err::<(), _>(Error::Configuration("abort".into()))
        })
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(store.list_data_keys("org-1")?.is_empty());

    // The rolled-back key was never cached, so a new key is minted and
    // persisted before use.
    let sealed = manager.encrypt("org-1", b"kept")?;
    let leaked = leaked.expect("encrypt ran inside the transaction");
    assert_ne!(Manager::data_key_id(&leaked), Manager::data_key_id(&sealed));
    assert!(matches!(
        manager.decrypt("org-1", &leaked),
        Err(Error::DataKeyNotFound { .. })
    ));

    let other = manager_on(store)?;
    assert_eq!(other.decrypt("org-1", &sealed)?, b"kept");
    Ok(())
}

#[test]
fn test_rotation() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let manager = manager(store.clone())?;

    let before = manager.encrypt("org-1", b"before")?;
    manager.rotate_data_keys("org-1")?;
    let after = manager.encrypt("org-1", b"after")?;

    let old_id = Manager::data_key_id(&before).unwrap();
    let new_id = Manager::data_key_id(&after).unwrap();
    assert_ne!(old_id, new_id);
    assert_eq!(manager.decrypt("org-1", &before)?, b"before");

    let keys: HashMap<String, bool> = manager
        .list_data_keys("org-1")?
        .into_iter()
        .map(|k| (k.uid, k.active))
        .collect();
    assert_eq!(keys.len(), 2);
    assert!(!keys[&old_id]);
    assert!(keys[&new_id]);
    Ok(())
}

#[test]
fn test_delete_data_key() -> Result<()> {
    let manager = manager(Arc::new(MemoryStore::new()))?;

    let sealed = manager.encrypt("org-1", b"gone")?;
    let id = Manager::data_key_id(&sealed).unwrap();
    manager.delete_data_key("org-1", &id)?;

    assert!(matches!(
        manager.decrypt("org-1", &sealed),
        Err(Error::DataKeyNotFound { .. })
    ));
    assert!(matches!(
        manager.delete_data_key("org-1", &id),
        Err(Error::DataKeyNotFound { .. })
    ));
    Ok(())
}

#[test]
fn test_re_encrypt_with_new_provider() -> Result<()> {
    init();
    let store = Arc::new(MemoryStore::new());
    let original = manager(store.clone())?;
    let sealed = original.encrypt("org-1", b"grafana")?;

    let mut settings = Settings::default();
    settings.current_provider = "xor.v1".into();
    let migrated = Manager::builder(settings, store.clone())
        .provider("xor.v1".parse()?, Arc::new(XorProvider(0x5a)))
        .build()?;
    assert_eq!(migrated.current_provider_id()?.as_str(), "xor.v1");
    assert_eq!(
        migrated
            .provider_ids()
            .iter()
            .map(|id| id.as_str())
            .collect::<Vec<_>>(),
        ["secretKey.v1", "xor.v1"]
    );

    assert_eq!(migrated.re_encrypt_data_keys("org-1")?, 1);
    let keys = store.list_data_keys("org-1")?;
    assert_eq!(keys[0].provider, "xor.v1");
    assert_eq!(migrated.decrypt("org-1", &sealed)?, b"grafana");

    // Without the provider that now wraps the key, it cannot be unwrapped.
    let stale = manager_on(store)?;
    assert!(matches!(
        stale.decrypt("org-1", &sealed),
        Err(Error::ProviderNotFound(id)) if id == "xor.v1"
    ));
    Ok(())
}

#[test]
fn test_unknown_current_provider_is_rejected() {
    init();
    let mut settings = Settings::default();
    settings.current_provider = "missing.v1".into();
    assert!(matches!(
        Manager::new(settings, Arc::new(MemoryStore::new())),
        Err(Error::Configuration(_))
    ));
}

#[test]
fn test_json_data() -> Result<()> {
    let manager = manager(Arc::new(MemoryStore::new()))?;

    let plain = HashMap::from([
        ("password".to_string(), "hunter2".to_string()),
        ("token".to_string(), "abc".to_string()),
    ]);
    let sealed = manager.encrypt_json_data("org-1", &plain)?;
    assert_eq!(sealed.len(), 2);
    assert_eq!(manager.decrypt_json_data("org-1", &sealed)?, plain);

    assert_eq!(
        manager.get_decrypted_value("org-1", &sealed, "password", "fallback"),
        "hunter2"
    );
    assert_eq!(
        manager.get_decrypted_value("org-1", &sealed, "missing", "fallback"),
        "fallback"
    );
    assert_eq!(
        manager.get_decrypted_value("org-2", &sealed, "token", "fallback"),
        "fallback"
    );
    Ok(())
}

#[test]
fn test_sqlite_store_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("secrets.db");

    let sealed = {
        let manager = manager(Arc::new(SqliteStore::open(&path)?))?;
        let sealed = manager.encrypt("org-1", b"durable")?;
        manager.with_transaction(|tx| tx.encrypt("org-2", b"also durable"))?;
        sealed
    };

    let manager = manager(Arc::new(SqliteStore::open(&path)?))?;
    assert_eq!(manager.decrypt("org-1", &sealed)?, b"durable");
    assert_eq!(manager.list_data_keys("org-2")?.len(), 1);
    Ok(())
}

#[test]
fn test_sqlite_transaction_rollback() -> Result<()> {
    let manager = manager(Arc::new(SqliteStore::open_in_memory()?))?;

    let result = manager.with_transaction(|tx| {
        tx.encrypt("org-1", b"doomed")?;
        Err::<(), _>(Error::Configuration("abort".into()))
    });
    assert!(result.is_err());
    assert!(manager.list_data_keys("org-1")?.is_empty());

    // The connection is usable again after the rollback.
    let sealed = manager.encrypt("org-1", b"ok")?;
    assert_eq!(manager.decrypt("org-1", &sealed)?, b"ok");
    Ok(())
}

#[test]
fn test_sqlite_store_access_inside_transaction_fails_fast() -> Result<()> {
    init();
    let store: Arc<dyn DataKeyStore> = Arc::new(SqliteStore::open_in_memory()?);
    let sealed = manager(store.clone())?.encrypt("org-1", b"secret")?;

    // A fresh manager has nothing cached, so decrypt must reach the store.
    let manager = manager(store)?;
    let err = manager
        .with_transaction(|_tx| manager.decrypt("org-1", &sealed))
        .unwrap_err();
    assert!(
        matches!(err, Error::Persistence(StoreError::TransactionInProgress)),
        "unexpected error: {err}"
    );

    let err = manager
        .with_transaction(|_tx| manager.list_data_keys("org-1"))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Persistence(StoreError::TransactionInProgress)
    ));

    let err = manager
        .with_transaction(|_tx| manager.encrypt("org-2", b"x"))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Persistence(StoreError::TransactionInProgress)
    ));
    assert!(manager.list_data_keys("org-2")?.is_empty());

    assert_eq!(manager.decrypt("org-1", &sealed)?, b"secret");
    Ok(())
}

#[test]
fn test_settings_from_env_overrides() -> Result<()> {
    let env = HashMap::from([
        ("SECRETS_DATA_KEY_CACHE_TTL", "30"),
        ("SECRETS_ENCRYPTION_ALGORITHM", "aes-gcm"),
    ]);
    let settings = Settings::default().with_overrides(|k| env.get(k).map(|v| v.to_string()))?;
    assert_eq!(settings.data_key_cache_ttl_secs, 30);

    let manager = Manager::new(settings, Arc::new(MemoryStore::new()))?;
    let sealed = manager.encrypt("org-1", b"x")?;
    let (_, body) = framing::split_data_key_id(&sealed).unwrap();
    assert!(body.starts_with(b"*YWVzLWdjbQ*"));
    Ok(())
}
