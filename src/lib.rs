//! Envelope encryption for application secrets.
//!
//! Payloads are encrypted under per-namespace data keys; data keys are
//! wrapped by a KMS provider and stored, and their cleartext lives only in
//! a short-lived in-process cache.

pub mod cache;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod kms;
pub mod manager;
pub mod metrics;
pub mod store;

pub use crate::{
    clock::{Clock, ManualClock, SystemClock},
    config::Settings,
    crypto::Encryption,
    error::{Error, Result},
    kms::{KmsProvider, ProviderId},
    manager::{Manager, ManagerBuilder, Transaction},
    store::{DataKey, DataKeyStore, MemoryStore, SqliteStore},
};
