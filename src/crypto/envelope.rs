//! Datagram envelope
//!
//! Every datagram is sealed independently under a fresh random nonce that
//! travels in front of the ciphertext:
//!
//! ```text
//! [ nonce (nonce_len) | ciphertext (len) | tag (16) ]
//! ```
//!
//! The two pipeline stages [`encode_buf`] and [`decode_buf`] wrap this in the
//! shape the transport composes: produce the transformed payload, then hand
//! it to the next stage. Without a configured algorithm they pass the input
//! buffer through untouched.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use bytes::Bytes;
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};
use rand::{RngCore, rngs::OsRng};

use crate::config::PoolConfig;
use crate::core::{CryptoError, CryptoResult, XAEAD_NONCE_SIZE};

use super::{Algorithm, EnvelopeKey};

enum Cipher {
    Aes128Gcm(Aes128Gcm),
    Aes256Gcm(Aes256Gcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
    XChaCha20Poly1305(XChaCha20Poly1305),
}

impl Cipher {
    fn new(algorithm: Algorithm, key: &EnvelopeKey) -> CryptoResult<Self> {
        let key = key.as_bytes();
        let cipher = match algorithm {
            Algorithm::Aes128Gcm => Aes128Gcm::new_from_slice(key).map(Self::Aes128Gcm),
            Algorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key).map(Self::Aes256Gcm),
            Algorithm::ChaCha20Poly1305 => {
                ChaCha20Poly1305::new_from_slice(key).map(Self::ChaCha20Poly1305)
            }
            Algorithm::XChaCha20Poly1305 => {
                XChaCha20Poly1305::new_from_slice(key).map(Self::XChaCha20Poly1305)
            }
        };
        cipher.map_err(|_| CryptoError::KeyDerivationFailed)
    }

    fn encrypt(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, aes_gcm::aead::Error> {
        match self {
            Self::Aes128Gcm(c) => c.encrypt(GenericArray::from_slice(nonce), plaintext),
            Self::Aes256Gcm(c) => c.encrypt(GenericArray::from_slice(nonce), plaintext),
            Self::ChaCha20Poly1305(c) => c.encrypt(GenericArray::from_slice(nonce), plaintext),
            Self::XChaCha20Poly1305(c) => c.encrypt(GenericArray::from_slice(nonce), plaintext),
        }
    }

    fn decrypt(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, aes_gcm::aead::Error> {
        match self {
            Self::Aes128Gcm(c) => c.decrypt(GenericArray::from_slice(nonce), ciphertext),
            Self::Aes256Gcm(c) => c.decrypt(GenericArray::from_slice(nonce), ciphertext),
            Self::ChaCha20Poly1305(c) => c.decrypt(GenericArray::from_slice(nonce), ciphertext),
            Self::XChaCha20Poly1305(c) => c.decrypt(GenericArray::from_slice(nonce), ciphertext),
        }
    }
}

/// A prepared envelope: the password-derived key bound to one algorithm.
///
/// Deriving the key is the costly part, so long-lived users (the pool) keep
/// one of these instead of going through [`encode_buf`] per datagram.
pub struct Envelope {
    algorithm: Algorithm,
    cipher: Cipher,
}

impl Envelope {
    /// Derive the key for `algorithm` from `password` and prepare the cipher.
    pub fn new(algorithm: Algorithm, password: &str) -> CryptoResult<Self> {
        let key = EnvelopeKey::derive(algorithm, password)?;
        let cipher = Cipher::new(algorithm, &key)?;
        Ok(Self { algorithm, cipher })
    }

    /// Prepare the envelope described by `config`.
    ///
    /// Returns `Ok(None)` when no algorithm is configured.
    pub fn from_config(config: &PoolConfig) -> CryptoResult<Option<Self>> {
        let Some(algorithm) = config.algorithm else {
            return Ok(None);
        };
        let password = config
            .password
            .as_deref()
            .ok_or(CryptoError::MissingPassword)?;
        Self::new(algorithm, password).map(Some)
    }

    /// Get the algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Bytes added to every sealed datagram.
    pub fn overhead(&self) -> usize {
        self.algorithm.overhead()
    }

    /// Seal `plaintext` under a fresh random nonce.
    ///
    /// Returns `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let nonce_len = self.algorithm.nonce_len();
        let mut nonce = [0u8; XAEAD_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce[..nonce_len]);

        let ciphertext = self
            .cipher
            .encrypt(&nonce[..nonce_len], plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(nonce_len + ciphertext.len());
        out.extend_from_slice(&nonce[..nonce_len]);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a datagram produced by [`Envelope::seal`].
    pub fn open(&self, datagram: &[u8]) -> CryptoResult<Vec<u8>> {
        let min = self.overhead();
        if datagram.len() < min {
            return Err(CryptoError::Truncated {
                len: datagram.len(),
                min,
            });
        }

        let (nonce, ciphertext) = datagram.split_at(self.algorithm.nonce_len());
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Outbound pipeline stage.
///
/// Seals `data` when `config` names an algorithm and hands the result to
/// `next`; otherwise hands `data` itself to `next`.
pub fn encode_buf<F, R>(config: &PoolConfig, next: F, data: Bytes) -> CryptoResult<R>
where
    F: FnOnce(Bytes) -> R,
{
    match Envelope::from_config(config)? {
        Some(envelope) => Ok(next(Bytes::from(envelope.seal(&data)?))),
        None => Ok(next(data)),
    }
}

/// Inbound pipeline stage.
///
/// Opens `data` when `config` names an algorithm and hands the plaintext and
/// `peer` to `next`; otherwise hands both through unchanged. A datagram
/// that fails to open never reaches `next`.
pub fn decode_buf<F, P, R>(config: &PoolConfig, next: F, data: Bytes, peer: P) -> CryptoResult<R>
where
    F: FnOnce(Bytes, P) -> R,
{
    match Envelope::from_config(config)? {
        Some(envelope) => Ok(next(Bytes::from(envelope.open(&data)?), peer)),
        None => Ok(next(data, peer)),
    }
}
