//! # KCP socket pool
//!
//! Session-multiplexing layer beneath a KCP-style reliable-UDP tunnel.
//!
//! - **Socket pooling**: one UDP socket per remote peer, reused by every
//!   session to that peer and closed when its last user goes away
//! - **Conversation ids**: per-peer allocation of the smallest free conv
//! - **Envelope**: optional AEAD sealing of every datagram, with the MTU
//!   left for the transport reduced by the envelope overhead
//!
//! The KCP state machine itself lives above this crate; it takes a conv from
//! [`Pool::new_conv`], sizes segments with [`Pool::mtu`] and moves datagrams
//! through [`Pool::send`] and [`listen_remote`].
//!
//! ## Modules
//!
//! - [`core`]: constants, error types and peer identity keying
//! - [`config`]: pool configuration
//! - [`crypto`]: the envelope pipeline
//! - [`transport`]: socket pool, listener registry and conv allocation
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::net::{IpAddr, Ipv4Addr};
//!
//! use kcp_socket_pool::prelude::*;
//!
//! # async fn run() -> Result<(), PoolError> {
//! let config = PoolConfig::builder()
//!     .algorithm(Algorithm::ChaCha20Poly1305)
//!     .password("shared secret")
//!     .build();
//! let pool = Pool::new(config)?;
//!
//! let peer = IpAddr::V4(Ipv4Addr::LOCALHOST);
//! let conv = pool.new_conv(29900, peer);
//!
//! let listener = Listener::new(|datagram, from| {
//!     println!("{} bytes from {}", datagram.len(), from);
//! });
//! listen_remote(&pool, 29900, peer, listener.clone())?;
//!
//! let segment = bytes::Bytes::from_static(b"kcp segment");
//! pool.send(&pool.encode(segment)?, 29900, peer).await?;
//!
//! remove_listener(&pool, 29900, peer, &listener);
//! pool.delete_conv(29900, peer, conv);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod core;
pub mod crypto;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{PoolConfig, PoolConfigBuilder};
    pub use crate::core::*;
    pub use crate::crypto::*;
    pub use crate::transport::*;
}

// Re-export commonly used items at crate root
pub use config::PoolConfig;
pub use crate::core::{ConfigError, CryptoError, PeerKey, PoolError, get_id};
pub use crypto::{Algorithm, Envelope, decode_buf, encode_buf};
pub use transport::{Listener, Pool, SocketInfo, listen_remote, remove_listener};
