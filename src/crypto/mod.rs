//! Payload cipher suite and the algorithm registry that frames its output.

pub mod cfb;
pub mod framing;
pub mod gcm;
pub mod kdf;
pub mod keys;

use std::{collections::HashMap, sync::Arc};

use self::framing::Frame;
use crate::error::{Error, Result};

pub const AES_GCM: &str = "aes-gcm";
pub const AES_CFB: &str = "aes-cfb";

/// Algorithm assumed for payloads that carry no algorithm tag.
pub const LEGACY_ALGORITHM: &str = AES_CFB;

/// Algorithms that may only ever be used to read old payloads.
const DECRYPT_ONLY: &[&str] = &[AES_CFB];

/// Turns a payload and an arbitrary-length secret into self-describing
/// ciphertext.
pub trait Cipher: Send + Sync + 'static {
    fn encrypt(&self, payload: &[u8], secret: &[u8]) -> Result<Vec<u8>>;
}

pub trait Decipher: Send + Sync + 'static {
    fn decrypt(&self, payload: &[u8], secret: &[u8]) -> Result<Vec<u8>>;
}

/// Registry of cipher variants, keyed by algorithm id.
///
/// Encryption always uses the current algorithm and tags the output with
/// it; decryption dispatches on the tag, falling back to
/// [`LEGACY_ALGORITHM`] for untagged payloads.
pub struct Encryption {
    current: String,
    ciphers: HashMap<String, Arc<dyn Cipher>>,
    deciphers: HashMap<String, Arc<dyn Decipher>>,
}

impl Encryption {
    /// The built-in suite: AES-GCM for both directions, AES-CFB for
    /// decryption only.
    pub fn new(current: &str) -> Result<Self> {
        Self::builder()
            .cipher(AES_GCM, Arc::new(gcm::AesGcm))
            .decipher(AES_GCM, Arc::new(gcm::AesGcm))
            .decipher(AES_CFB, Arc::new(cfb::AesCfb))
            .current(current)
            .build()
    }

    pub fn builder() -> EncryptionBuilder {
        EncryptionBuilder::default()
    }

    pub fn current_algorithm(&self) -> &str {
        &self.current
    }

    pub fn encrypt(&self, payload: &[u8], secret: &[u8]) -> Result<Vec<u8>> {
        let cipher = self
            .ciphers
            .get(&self.current)
            .ok_or_else(|| Error::UnknownAlgorithm(self.current.clone()))?;
        let encrypted = cipher.encrypt(payload, secret)?;
        Ok(framing::tag_algorithm(&self.current, &encrypted))
    }

    pub fn decrypt(&self, payload: &[u8], secret: &[u8]) -> Result<Vec<u8>> {
        if payload.is_empty() {
            return Err(Error::EmptyPayload);
        }
        let (algorithm, body) = match framing::split_algorithm(payload) {
            Frame::Framed(algorithm, body) => (algorithm, body),
            Frame::Absent => (LEGACY_ALGORITHM.to_string(), payload),
            Frame::Malformed => {
                return Err(Error::UnknownAlgorithm("<malformed tag>".into()));
            }
        };
        let decipher = self
            .deciphers
            .get(&algorithm)
            .ok_or(Error::UnknownAlgorithm(algorithm))?;
        decipher.decrypt(body, secret)
    }
}

#[derive(Default)]
pub struct EncryptionBuilder {
    current: Option<String>,
    ciphers: HashMap<String, Arc<dyn Cipher>>,
    deciphers: HashMap<String, Arc<dyn Decipher>>,
    rejected: Vec<String>,
}

impl EncryptionBuilder {
    /// Register an algorithm for new writes. Decrypt-only algorithms are
    /// refused at `build`.
    pub fn cipher(mut self, algorithm: &str, cipher: Arc<dyn Cipher>) -> Self {
        if DECRYPT_ONLY.contains(&algorithm) {
            self.rejected.push(algorithm.to_owned());
        } else {
            self.ciphers.insert(algorithm.to_owned(), cipher);
        }
        self
    }

    pub fn decipher(mut self, algorithm: &str, decipher: Arc<dyn Decipher>) -> Self {
        self.deciphers.insert(algorithm.to_owned(), decipher);
        self
    }

    pub fn current(mut self, algorithm: &str) -> Self {
        self.current = Some(algorithm.to_owned());
        self
    }

    pub fn build(self) -> Result<Encryption> {
        if let Some(algorithm) = self.rejected.first() {
            return Err(Error::Configuration(format!(
                "{algorithm} can only be registered for decryption"
            )));
        }
        let current = self
            .current
            .ok_or_else(|| Error::Configuration("no current encryption algorithm".into()))?;
        if !self.ciphers.contains_key(&current) {
            return Err(Error::Configuration(format!(
                "encryption algorithm {current:?} is not registered as a cipher"
            )));
        }
        if !self.deciphers.contains_key(&current) {
            return Err(Error::Configuration(format!(
                "encryption algorithm {current:?} is not registered as a decipher"
            )));
        }
        Ok(Encryption {
            current,
            ciphers: self.ciphers,
            deciphers: self.deciphers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_gcm_round_trip_with_tag() {
        let enc = Encryption::new(AES_GCM).unwrap();
        let encrypted = enc.encrypt(b"grafana", b"1234").unwrap();
        assert!(encrypted.starts_with(b"*YWVzLWdjbQ*"));
        assert_eq!(enc.decrypt(&encrypted, b"1234").unwrap(), b"grafana");
    }

    #[test]
    fn empty_payload_cannot_derive_algorithm() {
        let enc = Encryption::new(AES_GCM).unwrap();
        let err = enc.decrypt(b"", b"1234").unwrap_err();
        assert!(matches!(err, Error::EmptyPayload));
        assert_eq!(err.to_string(), "unable to derive encryption algorithm");
    }

    #[test]
    fn untagged_payload_uses_legacy_cipher() {
        let enc = Encryption::new(AES_GCM).unwrap();
        let legacy = cfb::AesCfb.encrypt(b"grafana", b"1234").unwrap();
        assert_eq!(enc.decrypt(&legacy, b"1234").unwrap(), b"grafana");
    }

    #[test]
    fn explicitly_tagged_legacy_payload() {
        let enc = Encryption::new(AES_GCM).unwrap();
        let legacy = cfb::AesCfb.encrypt(b"grafana", b"1234").unwrap();
        let tagged = framing::tag_algorithm(AES_CFB, &legacy);
        assert_eq!(enc.decrypt(&tagged, b"1234").unwrap(), b"grafana");
    }

    #[test]
    fn legacy_cipher_refused_for_encryption() {
        assert!(matches!(Encryption::new(AES_CFB), Err(Error::Configuration(_))));

        let err = Encryption::builder()
            .cipher(AES_GCM, Arc::new(gcm::AesGcm))
            .cipher(AES_CFB, Arc::new(cfb::AesCfb))
            .decipher(AES_GCM, Arc::new(gcm::AesGcm))
            .current(AES_GCM)
            .build();
        assert!(matches!(err, Err(Error::Configuration(_))));
    }

    #[test]
    fn unknown_algorithm_rejected() {
        let enc = Encryption::new(AES_GCM).unwrap();
        let tagged = framing::tag_algorithm("rot13", b"whatever");
        assert!(matches!(
            enc.decrypt(&tagged, b"1234"),
            Err(Error::UnknownAlgorithm(alg)) if alg == "rot13"
        ));
        assert!(matches!(Encryption::new("rot13"), Err(Error::Configuration(_))));
    }
}
