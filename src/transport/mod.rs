//! Socket pool, listener registry and conversation ids.
//!
//! This module owns the UDP sockets the tunnel runs over. It provides:
//!
//! - **Conv allocation**: [`ConvTable`], one conv space per remote peer
//! - **Inbound dispatch**: [`Listener`] callbacks fed by a receive task per socket
//! - **Socket pooling**: [`Pool`] with one reused socket per peer and
//!   reference-counted listener registration ([`listen_remote`] /
//!   [`remove_listener`])
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         KCP Transport                   │
//! ├─────────────────────────────────────────┤
//! │         Envelope (crypto)               │
//! ├─────────────────────────────────────────┤
//! │         Socket Pool                     │  ← This module
//! │   peer sockets, listeners, convs        │
//! ├─────────────────────────────────────────┤
//! │              UDP                        │
//! └─────────────────────────────────────────┘
//! ```

mod conv;
mod pool;
mod socket;

pub use conv::ConvTable;
pub use pool::{BoundSocket, Pool, SocketInfo, listen_remote, remove_listener};
pub use socket::{Listener, MessageFn};
