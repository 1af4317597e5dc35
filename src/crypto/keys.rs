use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Length of a freshly minted data encryption key. The cipher suite
/// stretches it to 256 bits, so it does not need to be a full AES key.
pub const DEK_LEN: usize = 16;

/// A cleartext data encryption key. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Dek {
    bytes: Vec<u8>,
}

impl Dek {
    pub fn generate() -> Result<Self> {
        let mut bytes = vec![0u8; DEK_LEN];
        fill_random(&mut bytes)?;
        Ok(Self { bytes })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for Dek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Dek(***)")
    }
}

pub(crate) fn fill_random(buf: &mut [u8]) -> Result<()> {
    getrandom::getrandom(buf).map_err(|e| Error::KeyDerivation(format!("rng failed: {e}")))
}
