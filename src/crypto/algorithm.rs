//! Cipher algorithm catalogue.
//!
//! Both ends of a tunnel must be configured with the same algorithm; the
//! envelope does not name it in-band.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::{AEAD_NONCE_SIZE, AEAD_TAG_SIZE, ConfigError, XAEAD_NONCE_SIZE};

/// An AEAD algorithm usable for the datagram envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// aes-128-gcm
    #[serde(rename = "aes-128-gcm")]
    Aes128Gcm,

    /// aes-256-gcm
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,

    /// chacha20-poly1305 (RFC 8439, 96-bit nonce)
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,

    /// xchacha20-poly1305 (192-bit nonce)
    #[serde(rename = "xchacha20-poly1305")]
    XChaCha20Poly1305,
}

impl Algorithm {
    /// Every supported algorithm.
    pub const ALL: [Algorithm; 4] = [
        Algorithm::Aes128Gcm,
        Algorithm::Aes256Gcm,
        Algorithm::ChaCha20Poly1305,
        Algorithm::XChaCha20Poly1305,
    ];

    /// Canonical configuration name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Aes128Gcm => "aes-128-gcm",
            Self::Aes256Gcm => "aes-256-gcm",
            Self::ChaCha20Poly1305 => "chacha20-poly1305",
            Self::XChaCha20Poly1305 => "xchacha20-poly1305",
        }
    }

    /// Key length in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            Self::Aes128Gcm => 16,
            Self::Aes256Gcm | Self::ChaCha20Poly1305 | Self::XChaCha20Poly1305 => 32,
        }
    }

    /// Nonce length in bytes. The nonce is sent in front of every datagram.
    pub fn nonce_len(&self) -> usize {
        match self {
            Self::XChaCha20Poly1305 => XAEAD_NONCE_SIZE,
            _ => AEAD_NONCE_SIZE,
        }
    }

    /// Authentication tag length in bytes.
    pub fn tag_len(&self) -> usize {
        AEAD_TAG_SIZE
    }

    /// Bytes the envelope adds to every datagram.
    pub fn overhead(&self) -> usize {
        self.nonce_len() + self.tag_len()
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|alg| alg.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ConfigError::UnknownAlgorithm(s.to_string()))
    }
}
