use aes::Aes256;
use cfb_mode::{
    Decryptor, Encryptor,
    cipher::{AsyncStreamCipher, KeyIvInit, InvalidLength},
};

use super::{
    Cipher, Decipher,
    kdf::{self, SALT_LEN},
    keys::fill_random,
};
use crate::error::{Error, Result};

pub const IV_LEN: usize = 16;

/// Legacy AES-256-CFB (128-bit feedback) over a PBKDF2-stretched secret.
///
/// Layout:
/// ```text
/// [ salt (8) | iv (16) | ciphertext ]
/// ```
///
/// There is no authentication tag: decrypting with the wrong secret yields
/// garbage rather than an error. The encryption registry only accepts this
/// variant as a decipher; `Cipher` is implemented so old payloads can be
/// reproduced.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesCfb;

impl Cipher for AesCfb {
    fn encrypt(&self, payload: &[u8], secret: &[u8]) -> Result<Vec<u8>> {
        let salt = kdf::generate_salt()?;
        let key = kdf::derive_key(secret, &salt)?;
        let mut iv = [0u8; IV_LEN];
        fill_random(&mut iv)?;

        let mut out = Vec::with_capacity(SALT_LEN + IV_LEN + payload.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&iv);
        out.extend_from_slice(payload);
        seal_in_place(key.as_slice(), &iv, &mut out[SALT_LEN + IV_LEN..])?;
        Ok(out)
    }
}

impl Decipher for AesCfb {
    fn decrypt(&self, payload: &[u8], secret: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < SALT_LEN + IV_LEN {
            return Err(Error::PayloadTooShort);
        }
        let (salt, rest) = payload.split_at(SALT_LEN);
        let (iv, ciphertext) = rest.split_at(IV_LEN);

        let key = kdf::derive_key(secret, salt)?;
        let mut out = ciphertext.to_vec();
        open_in_place(key.as_slice(), iv, &mut out)?;
        Ok(out)
    }
}

fn init_failed(e: InvalidLength) -> Error {
    Error::KeyDerivation(format!("aes-cfb init failed: {e}"))
}

fn seal_in_place(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    Encryptor::<Aes256>::new_from_slices(key, iv)
        .map_err(init_failed)?
        .encrypt(data);
    Ok(())
}

fn open_in_place(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    Decryptor::<Aes256>::new_from_slices(key, iv)
        .map_err(init_failed)?
        .decrypt(data);
    Ok(())
}
