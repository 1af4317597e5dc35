//! Durable storage of wrapped data keys.
//!
//! The store only ever sees data keys wrapped by a KMS provider; cleartext
//! keys live in the manager's cache and nowhere else.

pub mod memory;
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// One wrapped data encryption key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataKey {
    pub uid: String,
    pub namespace: String,
    /// `<yyyy-mm-dd>@<provider id>` of the day the key was minted.
    pub label: String,
    pub active: bool,
    /// Id of the KMS provider that wrapped `encrypted_data`.
    pub provider: String,
    pub encrypted_data: Vec<u8>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("data key not found")]
    NotFound,

    #[error("refusing to create an inactive data key")]
    InactiveKey,

    #[error("data key {0:?} already exists")]
    Duplicate(String),

    /// The calling thread holds an open transaction on this store; waiting
    /// for the connection would never return.
    #[error("a data key transaction is open on this thread")]
    TransactionInProgress,

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Namespace-scoped table of wrapped data keys.
pub trait DataKeyStore: Send + Sync + 'static {
    fn get_data_key(&self, namespace: &str, uid: &str) -> StoreResult<DataKey>;

    /// The active key carrying `label`, if any.
    fn get_current_data_key(&self, namespace: &str, label: &str) -> StoreResult<DataKey>;

    fn list_data_keys(&self, namespace: &str) -> StoreResult<Vec<DataKey>>;

    /// Fails with [`StoreError::InactiveKey`] unless `key.active`.
    fn create_data_key(&self, key: &DataKey) -> StoreResult<()>;

    /// Mark every key in the namespace inactive, stamping `updated`.
    fn disable_data_keys(&self, namespace: &str, updated: DateTime<Utc>) -> StoreResult<()>;

    fn delete_data_key(&self, namespace: &str, uid: &str) -> StoreResult<()>;

    /// Replace the wrapped bytes of a key, e.g. after re-wrapping it with a
    /// different provider.
    fn update_data_key(
        &self,
        namespace: &str,
        uid: &str,
        provider: &str,
        encrypted_data: &[u8],
        updated: DateTime<Utc>,
    ) -> StoreResult<()>;

    fn begin(&self) -> StoreResult<Box<dyn StoreTransaction + '_>>;
}

/// A unit of work against the store. Dropping it without `commit` rolls
/// it back.
pub trait StoreTransaction {
    fn get_data_key(&self, namespace: &str, uid: &str) -> StoreResult<DataKey>;

    fn get_current_data_key(&self, namespace: &str, label: &str) -> StoreResult<DataKey>;

    fn create_data_key(&mut self, key: &DataKey) -> StoreResult<()>;

    fn commit(self: Box<Self>) -> StoreResult<()>;

    fn rollback(self: Box<Self>) -> StoreResult<()>;
}
