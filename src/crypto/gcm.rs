use aes_gcm::{Aes256Gcm, KeyInit, Nonce, aead::Aead};

use super::{
    Cipher, Decipher,
    kdf::{self, SALT_LEN},
    keys::fill_random,
};
use crate::error::{Error, Result};

pub const NONCE_LEN: usize = 12;

/// AES-256-GCM over a PBKDF2-stretched secret.
///
/// Layout:
/// ```text
/// [ salt (8) | nonce (12) | ciphertext || tag (16) ]
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct AesGcm;

impl Cipher for AesGcm {
    fn encrypt(&self, payload: &[u8], secret: &[u8]) -> Result<Vec<u8>> {
        let salt = kdf::generate_salt()?;
        let key = kdf::derive_key(secret, &salt)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| Error::KeyDerivation(format!("aes-gcm init failed: {e}")))?;

        let mut nonce = [0u8; NONCE_LEN];
        fill_random(&mut nonce)?;
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|e| Error::KeyDerivation(format!("aes-gcm seal failed: {e}")))?;

        let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + sealed.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }
}

impl Decipher for AesGcm {
    fn decrypt(&self, payload: &[u8], secret: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < SALT_LEN + NONCE_LEN {
            return Err(Error::PayloadTooShort);
        }
        let (salt, rest) = payload.split_at(SALT_LEN);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);

        let key = kdf::derive_key(secret, salt)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| Error::KeyDerivation(format!("aes-gcm init failed: {e}")))?;
        cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| Error::Authentication)
    }
}
