use thiserror::Error;

use crate::store::StoreError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("kms providers are already initialized")]
    AlreadyInitialized,

    #[error("data key {id:?} not found in namespace {namespace:?}")]
    DataKeyNotFound { namespace: String, id: String },

    /// Raised for empty payloads at both the manager and the cipher layer,
    /// and for manager payloads without a data key id.
    #[error("unable to derive encryption algorithm")]
    EmptyPayload,

    #[error("payload too short")]
    PayloadTooShort,

    #[error("ciphertext failed authentication")]
    Authentication,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("unknown encryption algorithm: {0:?}")]
    UnknownAlgorithm(String),

    #[error("kms provider {0:?} is not registered")]
    ProviderNotFound(String),

    #[error("data key store: {0}")]
    Persistence(StoreError),

    #[error("kms provider failure: {0}")]
    Provider(#[source] anyhow::Error),

    #[error("invalid settings file: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Error::Persistence(e)
    }
}
