//! Fixed constants for the socket pool and its envelope.
//!
//! The link MTU is shared with the transport layer above; both ends of a
//! tunnel MUST agree on it, so it is not configurable.

// =============================================================================
// LINK SIZES
// =============================================================================

/// Base link MTU handed to the transport before any envelope overhead.
pub const BASE_MTU: usize = 1400;

/// Receive buffer size for pooled sockets (largest UDP datagram).
pub const RECV_BUFFER_SIZE: usize = 65535;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// Poly1305 / GHASH authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// Nonce size for AES-GCM and ChaCha20-Poly1305.
pub const AEAD_NONCE_SIZE: usize = 12;

/// Nonce size for XChaCha20-Poly1305.
pub const XAEAD_NONCE_SIZE: usize = 24;

/// Largest key any supported algorithm needs.
pub const MAX_KEY_SIZE: usize = 32;

/// HKDF info prefix for envelope key derivation. The algorithm name is
/// appended so two algorithms never share a key for the same password.
pub const KDF_INFO_PREFIX: &[u8] = b"kcp-socket-pool envelope v1 ";
