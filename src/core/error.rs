//! Error types for the socket pool.

use thiserror::Error;

/// Errors in the crypto envelope.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// An algorithm is configured but no password was given.
    #[error("algorithm configured without a password")]
    MissingPassword,

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag or corrupted).
    #[error("AEAD decryption failed (invalid tag or corrupted)")]
    DecryptionFailed,

    /// Datagram too short to hold the envelope.
    #[error("datagram truncated: {len} bytes, envelope needs at least {min}")]
    Truncated {
        /// Received length.
        len: usize,
        /// Minimum envelope length.
        min: usize,
    },
}

/// Errors in pool configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Algorithm name not recognised.
    #[error("unknown cipher algorithm: {0}")]
    UnknownAlgorithm(String),

    /// An algorithm is configured but no password was given.
    #[error("algorithm {0} configured without a password")]
    MissingPassword(String),
}

/// Top-level pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// I/O error (bind, send, receive).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl PoolError {
    /// Check if the datagram that caused this error should simply be dropped.
    ///
    /// Envelope failures concern one datagram only; the socket stays usable.
    pub fn is_drop(&self) -> bool {
        matches!(self, PoolError::Crypto(_))
    }
}

/// Result type for envelope operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;
