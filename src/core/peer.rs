//! Peer identity keying.
//!
//! Every piece of per-peer state (conv spaces, pooled sockets) is indexed by
//! a [`PeerKey`] derived from the remote port and address.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Canonical identity of a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey(SocketAddr);

impl PeerKey {
    /// Get the remote socket address this key stands for.
    pub fn addr(&self) -> SocketAddr {
        self.0
    }

    /// Get the remote port.
    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// Get the remote IP address.
    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }
}

/// Derive the peer key for a remote port and address.
///
/// Identical inputs give identical keys and distinct inputs distinct keys.
/// IPv4-mapped IPv6 addresses are kept as written; `::ffff:1.2.3.4` and
/// `1.2.3.4` are different peers, as they are to the socket layer.
pub fn get_id(port: u16, address: IpAddr) -> PeerKey {
    PeerKey(SocketAddr::new(address, port))
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddr> for PeerKey {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<PeerKey> for SocketAddr {
    fn from(key: PeerKey) -> SocketAddr {
        key.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_same_inputs_same_key() {
        let a = get_id(4000, IpAddr::V4(Ipv4Addr::LOCALHOST));
        let b = get_id(4000, "127.0.0.1".parse().unwrap());
        assert_eq!(a, b);
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_different_inputs_different_keys() {
        let base = get_id(4000, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_ne!(base, get_id(4001, IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_ne!(base, get_id(4000, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2))));
        assert_ne!(base, get_id(4000, IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert_ne!(
            base,
            get_id(4000, IpAddr::V6(Ipv4Addr::LOCALHOST.to_ipv6_mapped()))
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            get_id(53, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))).to_string(),
            "10.0.0.1:53"
        );
        assert_eq!(get_id(53, IpAddr::V6(Ipv6Addr::LOCALHOST)).to_string(), "[::1]:53");
    }

    #[test]
    fn test_accessors() {
        let key = get_id(9000, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(key.port(), 9000);
        assert_eq!(key.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(SocketAddr::from(key), key.addr());
    }
}
