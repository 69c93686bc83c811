//! Crypto envelope pipeline.
//!
//! - [`Algorithm`]: the supported AEAD ciphers and their overhead
//! - [`EnvelopeKey`]: password based key derivation (HKDF-SHA256)
//! - [`Envelope`]: nonce-prefixed seal/open of single datagrams
//! - [`encode_buf`] / [`decode_buf`]: the outbound and inbound stages

mod algorithm;
mod envelope;
mod keys;

pub use algorithm::Algorithm;
pub use envelope::{Envelope, decode_buf, encode_buf};
pub use keys::EnvelopeKey;
