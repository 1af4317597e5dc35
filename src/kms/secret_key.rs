use std::sync::Arc;

use zeroize::Zeroizing;

use super::{KmsProvider, ProviderId};
use crate::{crypto::Encryption, error::Result};

pub const KIND: &str = "secretKey";

/// Id of the provider that is always registered.
pub fn default_provider_id() -> ProviderId {
    ProviderId(format!("{KIND}.v1"))
}

/// Local provider that wraps data keys with the payload cipher suite, keyed
/// by a statically configured master secret.
pub struct SecretKeyProvider {
    secret_key: Zeroizing<Vec<u8>>,
    encryption: Arc<Encryption>,
}

impl SecretKeyProvider {
    pub fn new(secret_key: &str, encryption: Arc<Encryption>) -> Self {
        Self {
            secret_key: Zeroizing::new(secret_key.as_bytes().to_vec()),
            encryption,
        }
    }
}

impl KmsProvider for SecretKeyProvider {
    fn encrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        self.encryption.encrypt(blob, &self.secret_key)
    }

    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        self.encryption.decrypt(blob, &self.secret_key)
    }
}
