//! Envelope key derivation
//!
//! Turns the shared password into a fixed-length key for the configured
//! algorithm using HKDF-SHA256.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::core::{CryptoError, KDF_INFO_PREFIX, MAX_KEY_SIZE};

use super::Algorithm;

/// A derived envelope key.
///
/// The key material is zeroized on drop.
#[derive(Clone)]
pub struct EnvelopeKey {
    key: [u8; MAX_KEY_SIZE],
    len: usize,
}

impl EnvelopeKey {
    /// Derive the key for `algorithm` from `password`.
    ///
    /// The algorithm name is bound into the HKDF info, so switching
    /// algorithms with the same password yields unrelated keys.
    pub fn derive(algorithm: Algorithm, password: &str) -> Result<Self, CryptoError> {
        let len = algorithm.key_len();
        let mut info = Vec::with_capacity(KDF_INFO_PREFIX.len() + algorithm.name().len());
        info.extend_from_slice(KDF_INFO_PREFIX);
        info.extend_from_slice(algorithm.name().as_bytes());

        let hk = Hkdf::<Sha256>::new(None, password.as_bytes());
        let mut key = [0u8; MAX_KEY_SIZE];
        hk.expand(&info, &mut key[..len])
            .map_err(|_| CryptoError::KeyDerivationFailed)?;

        Ok(Self { key, len })
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn as_bytes(&self) -> &[u8] {
        &self.key[..self.len]
    }
}

impl Drop for EnvelopeKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for EnvelopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeKey")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}
