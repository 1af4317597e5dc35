//! Secret stretching shared by every cipher variant.
//!
//! Callers hand in secrets of arbitrary length (a 16-byte DEK, an
//! operator-chosen master passphrase); both are stretched to an AES-256 key
//! with PBKDF2-HMAC-SHA256 over a per-payload salt.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::keys::fill_random;
use crate::error::{Error, Result};

pub const SALT_LEN: usize = 8;
pub const KEY_LEN: usize = 32;
pub const ROUNDS: u32 = 10_000;

const SALT_ALPHABET: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

type HmacSha256 = Hmac<Sha256>;

/// Fresh random salt drawn from `[A-Za-z0-9]`.
///
/// Keeping the salt alphanumeric means untagged legacy payloads never start
/// with the algorithm delimiter.
pub fn generate_salt() -> Result<[u8; SALT_LEN]> {
    let mut salt = [0u8; SALT_LEN];
    fill_random(&mut salt)?;
    for b in salt.iter_mut() {
        *b = SALT_ALPHABET[(*b as usize) % SALT_ALPHABET.len()];
    }
    Ok(salt)
}

/// Derive the 256-bit payload key for `secret` and `salt`.
pub fn derive_key(secret: &[u8], salt: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac_sha256(secret, salt, ROUNDS, &mut *key)?;
    Ok(key)
}

/// PBKDF2 (RFC 8018) with HMAC-SHA256 as the PRF.
pub fn pbkdf2_hmac_sha256(password: &[u8], salt: &[u8], rounds: u32, out: &mut [u8]) -> Result<()> {
    if rounds == 0 {
        return Err(Error::KeyDerivation("pbkdf2 needs at least one round".into()));
    }
    let prf = HmacSha256::new_from_slice(password)
        .map_err(|e| Error::KeyDerivation(format!("hmac init failed: {e}")))?;

    for (i, block) in out.chunks_mut(32).enumerate() {
        let mut mac = prf.clone();
        mac.update(salt);
        mac.update(&(i as u32 + 1).to_be_bytes());
        let mut u = mac.finalize().into_bytes();
        let mut t = u;

        for _ in 1..rounds {
            let mut mac = prf.clone();
            mac.update(&u);
            u = mac.finalize().into_bytes();
            t.iter_mut().zip(u.iter()).for_each(|(t, u)| *t ^= u);
        }

        block.copy_from_slice(&t[..block.len()]);
    }
    Ok(())
}
