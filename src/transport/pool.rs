//! Socket pool and listener registry.
//!
//! The pool owns every UDP socket of the tunnel. Outbound traffic to a peer
//! reuses one socket per [`PeerKey`]; inbound interest in that socket is
//! reference counted through [`listen_remote`] / [`remove_listener`] and the
//! socket is closed in the same call that drops the last reference.
//!
//! A peer socket is kept alive by two kinds of reference:
//!
//! - registered listeners, counted in [`SocketInfo::using_count`]
//! - the outbound binding taken by [`Pool::send`] and dropped by
//!   [`Pool::release`]
//!
//! It is torn down as soon as neither remains. Fixed-port sockets opened by
//! [`Pool::listen`] are separate and live until [`Pool::unlisten`].
//!
//! Tearing a socket down releases its local port right away, even while
//! callers still hold the [`SocketInfo`] or [`BoundSocket`]; sends through a
//! torn-down handle fail with [`io::ErrorKind::NotConnected`]. A socket whose
//! receive task fails is closed and dropped from the registry on its own.
//!
//! All registry updates happen under one mutex that is never held across an
//! `.await`, so no caller observes a half-updated count.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use super::conv::ConvTable;
use super::socket::{Dispatcher, Listener, bind_ephemeral, lock};
use crate::config::PoolConfig;
use crate::core::{CryptoResult, PeerKey, PoolResult, get_id};
use crate::crypto::Envelope;

/// A pooled socket shared by everything talking to one remote peer.
pub struct SocketInfo {
    peer: PeerKey,
    dispatcher: Dispatcher,
    using_count: AtomicUsize,
    outbound: AtomicBool,
}

impl SocketInfo {
    fn new(peer: PeerKey, dispatcher: Dispatcher) -> Self {
        Self {
            peer,
            dispatcher,
            using_count: AtomicUsize::new(0),
            outbound: AtomicBool::new(false),
        }
    }

    /// Get the peer this socket talks to.
    pub fn peer(&self) -> PeerKey {
        self.peer
    }

    /// Get the remote address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.peer.addr()
    }

    /// Get the local address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.dispatcher.local_addr()
    }

    /// Number of listener registrations outstanding.
    pub fn using_count(&self) -> usize {
        self.using_count.load(Ordering::SeqCst)
    }

    /// Whether an outbound binding from [`Pool::send`] is held.
    pub fn is_outbound(&self) -> bool {
        self.outbound.load(Ordering::SeqCst)
    }

    /// Check whether `listener` is registered on this socket.
    pub fn has_listener(&self, listener: &Listener) -> bool {
        self.dispatcher.contains(listener)
    }

    /// Snapshot of the registered listeners.
    pub fn listeners(&self) -> Vec<Listener> {
        self.dispatcher.listeners()
    }

    /// Whether the socket has been closed.
    pub fn is_closed(&self) -> bool {
        self.dispatcher.is_closed()
    }

    /// Send a datagram to the peer.
    ///
    /// Fails with [`io::ErrorKind::NotConnected`] once the socket is closed.
    pub async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let socket = self.dispatcher.socket()?;
        socket.send_to(buf, self.peer.addr()).await
    }
}

impl fmt::Debug for SocketInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketInfo")
            .field("peer", &self.peer)
            .field("local_addr", &self.local_addr())
            .field("using_count", &self.using_count())
            .field("outbound", &self.is_outbound())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A socket bound to a fixed local address by [`Pool::listen`].
pub struct BoundSocket {
    dispatcher: Dispatcher,
}

impl BoundSocket {
    /// Get the local address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.dispatcher.local_addr()
    }

    /// Send a datagram from the bound address, e.g. a reply to a client.
    ///
    /// Fails with [`io::ErrorKind::NotConnected`] once the socket is closed.
    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let socket = self.dispatcher.socket()?;
        socket.send_to(buf, target).await
    }

    /// Whether the socket has been closed.
    pub fn is_closed(&self) -> bool {
        self.dispatcher.is_closed()
    }
}

impl fmt::Debug for BoundSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundSocket")
            .field("local_addr", &self.local_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}

type SharedState = Arc<Mutex<PoolState>>;

#[derive(Default)]
struct PoolState {
    /// Live sockets: `connections.len() + bound.len()`.
    udp_count: usize,
    connections: HashMap<PeerKey, Arc<SocketInfo>>,
    bound: HashMap<SocketAddr, Arc<BoundSocket>>,
    convs: ConvTable,
}

impl PoolState {
    fn get_or_create(
        &mut self,
        shared: Weak<Mutex<PoolState>>,
        peer: PeerKey,
    ) -> io::Result<Arc<SocketInfo>> {
        if let Some(info) = self.connections.get(&peer) {
            if !info.is_closed() {
                return Ok(Arc::clone(info));
            }
            // Receive task died and its prune has not run yet.
            self.teardown(peer);
        }

        let socket = bind_ephemeral(peer.addr())?;
        let dispatcher = Dispatcher::start(socket, prune_peer(shared, peer))?;
        let info = Arc::new(SocketInfo::new(peer, dispatcher));
        self.connections.insert(peer, Arc::clone(&info));
        self.udp_count += 1;
        debug!(%peer, local = %info.local_addr(), udp_count = self.udp_count, "pooled socket created");
        Ok(info)
    }

    fn teardown(&mut self, peer: PeerKey) {
        if let Some(info) = self.connections.remove(&peer) {
            info.dispatcher.close();
            self.udp_count -= 1;
            debug!(%peer, udp_count = self.udp_count, "pooled socket closed");
        }
    }

    /// Forget the peer socket driven by dispatcher `id`, if still registered.
    fn forget_peer(&mut self, peer: PeerKey, id: u64) {
        let current = self
            .connections
            .get(&peer)
            .is_some_and(|info| info.dispatcher.id() == id);
        if current {
            self.teardown(peer);
            warn!(%peer, udp_count = self.udp_count, "pooled socket failed, dropped from pool");
        }
    }

    /// Forget the bound socket driven by dispatcher `id`, if still registered.
    fn forget_bound(&mut self, local_addr: SocketAddr, id: u64) {
        let current = self
            .bound
            .get(&local_addr)
            .is_some_and(|bound| bound.dispatcher.id() == id);
        if current {
            self.bound.remove(&local_addr);
            self.udp_count -= 1;
            warn!(%local_addr, udp_count = self.udp_count, "listening socket failed, dropped from pool");
        }
    }
}

fn prune_peer(
    shared: Weak<Mutex<PoolState>>,
    peer: PeerKey,
) -> impl FnOnce(u64) + Send + 'static {
    move |id| {
        if let Some(state) = shared.upgrade() {
            lock(&state).forget_peer(peer, id);
        }
    }
}

fn prune_bound(
    shared: Weak<Mutex<PoolState>>,
    local_addr: SocketAddr,
) -> impl FnOnce(u64) + Send + 'static {
    move |id| {
        if let Some(state) = shared.upgrade() {
            lock(&state).forget_bound(local_addr, id);
        }
    }
}

/// The socket pool.
///
/// Construct one per tunnel endpoint and share it by reference (or `Arc`).
/// Socket-creating methods must run inside a Tokio runtime.
pub struct Pool {
    config: PoolConfig,
    mtu: usize,
    envelope: Option<Envelope>,
    state: SharedState,
}

impl Pool {
    /// Build a pool from `config`.
    ///
    /// Fails if the configuration names an algorithm without a password.
    pub fn new(config: PoolConfig) -> PoolResult<Self> {
        config.validate()?;
        let envelope = Envelope::from_config(&config)?;
        let mtu = config.mtu();
        debug!(algorithm = ?config.algorithm, mtu, "socket pool created");

        Ok(Self {
            config,
            mtu,
            envelope,
            state: Arc::new(Mutex::new(PoolState::default())),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Payload size available to the transport once the envelope is added.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Number of live UDP sockets owned by the pool.
    pub fn udp_count(&self) -> usize {
        lock(&self.state).udp_count
    }

    /// Number of peers with a pooled socket.
    pub fn connection_count(&self) -> usize {
        lock(&self.state).connections.len()
    }

    /// Check whether a pooled socket exists for the peer.
    pub fn contains_peer(&self, port: u16, address: IpAddr) -> bool {
        lock(&self.state)
            .connections
            .contains_key(&get_id(port, address))
    }

    /// Get the pooled socket for the peer, if any.
    pub fn socket_info(&self, port: u16, address: IpAddr) -> Option<Arc<SocketInfo>> {
        lock(&self.state)
            .connections
            .get(&get_id(port, address))
            .cloned()
    }

    // -------------------------------------------------------------------------
    // Conversation ids
    // -------------------------------------------------------------------------

    /// Allocate the smallest free conv for the peer.
    pub fn new_conv(&self, port: u16, address: IpAddr) -> u32 {
        let peer = get_id(port, address);
        let conv = lock(&self.state).convs.allocate(peer);
        debug!(%peer, conv, "conv allocated");
        conv
    }

    /// Free a conv for the peer. Unknown convs are ignored.
    pub fn delete_conv(&self, port: u16, address: IpAddr, conv: u32) {
        lock(&self.state)
            .convs
            .release(get_id(port, address), conv);
    }

    /// Mark a conv occupied out of band; later allocations skip it.
    pub fn mark_conv(&self, port: u16, address: IpAddr, conv: u32) {
        lock(&self.state).convs.mark(get_id(port, address), conv);
    }

    /// Check whether a conv is occupied for the peer.
    pub fn is_conv_occupied(&self, port: u16, address: IpAddr, conv: u32) -> bool {
        lock(&self.state)
            .convs
            .is_occupied(get_id(port, address), conv)
    }

    // -------------------------------------------------------------------------
    // Sockets
    // -------------------------------------------------------------------------

    /// Send `buf` to the peer over its pooled socket.
    ///
    /// The first send to a peer creates the socket and takes the outbound
    /// binding; later sends reuse it. The socket is returned so the caller
    /// can compare it or register listeners against the same peer.
    pub async fn send(
        &self,
        buf: &[u8],
        port: u16,
        address: IpAddr,
    ) -> PoolResult<Arc<SocketInfo>> {
        let info = {
            let mut state = lock(&self.state);
            let peer = get_id(port, address);
            let info = state.get_or_create(Arc::downgrade(&self.state), peer)?;
            info.outbound.store(true, Ordering::SeqCst);
            info
        };
        info.send(buf).await?;
        Ok(info)
    }

    /// Drop the outbound binding taken by [`Pool::send`].
    ///
    /// The socket is closed if no listener is registered on it.
    pub fn release(&self, port: u16, address: IpAddr) {
        let peer = get_id(port, address);
        let mut state = lock(&self.state);
        let Some(info) = state.connections.get(&peer) else {
            return;
        };
        if info.outbound.swap(false, Ordering::SeqCst) && info.using_count() == 0 {
            state.teardown(peer);
        }
    }

    /// Bind a socket on `local_port` (0 for any free port) on all IPv4
    /// interfaces.
    ///
    /// Every datagram it receives goes to `on_message`; `on_listening` is
    /// called with the bound address once the socket is ready. Use
    /// [`Pool::listen_on`] to pick the address, e.g. an IPv6 one.
    pub async fn listen<F>(
        &self,
        local_port: u16,
        on_message: Listener,
        on_listening: F,
    ) -> PoolResult<Arc<BoundSocket>>
    where
        F: FnOnce(SocketAddr),
    {
        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), local_port);
        self.listen_on(local, on_message, on_listening).await
    }

    /// Bind a socket on `local` and dispatch its datagrams to `on_message`.
    ///
    /// Behaves like [`Pool::listen`] for any local address and family.
    pub async fn listen_on<F>(
        &self,
        local: SocketAddr,
        on_message: Listener,
        on_listening: F,
    ) -> PoolResult<Arc<BoundSocket>>
    where
        F: FnOnce(SocketAddr),
    {
        let socket = UdpSocket::bind(local).await?;
        let local_addr = socket.local_addr()?;

        let bound = {
            let mut state = lock(&self.state);
            let on_failure = prune_bound(Arc::downgrade(&self.state), local_addr);
            let dispatcher = Dispatcher::start(socket, on_failure)?;
            dispatcher.add(on_message);
            let bound = Arc::new(BoundSocket { dispatcher });
            state.bound.insert(local_addr, Arc::clone(&bound));
            state.udp_count += 1;
            debug!(%local_addr, udp_count = state.udp_count, "listening");
            bound
        };

        on_listening(local_addr);
        Ok(bound)
    }

    /// Close a socket opened by [`Pool::listen`]. Closing twice is a no-op.
    pub fn unlisten(&self, bound: &BoundSocket) {
        let local_addr = bound.local_addr();
        let mut state = lock(&self.state);
        let owned = state
            .bound
            .get(&local_addr)
            .is_some_and(|b| std::ptr::eq(Arc::as_ptr(b), bound));
        if owned {
            state.bound.remove(&local_addr);
            bound.dispatcher.close();
            state.udp_count -= 1;
            debug!(%local_addr, udp_count = state.udp_count, "stopped listening");
        }
    }

    /// Register `listener` for datagrams arriving on the peer's socket.
    ///
    /// Every caller for the same peer gets the same [`SocketInfo`]. Each new
    /// listener raises [`SocketInfo::using_count`]; registering one that is
    /// already present changes nothing.
    pub fn listen_remote(
        &self,
        port: u16,
        address: IpAddr,
        listener: Listener,
    ) -> PoolResult<Arc<SocketInfo>> {
        let mut state = lock(&self.state);
        let peer = get_id(port, address);
        let info = state.get_or_create(Arc::downgrade(&self.state), peer)?;
        if info.dispatcher.add(listener) {
            info.using_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(info)
    }

    /// Unregister `listener` from the peer's socket.
    ///
    /// The socket is closed and forgotten when this drops the last
    /// reference. Unknown peers and listeners are ignored.
    pub fn remove_listener(&self, port: u16, address: IpAddr, listener: &Listener) {
        let peer = get_id(port, address);
        let mut state = lock(&self.state);
        let Some(info) = state.connections.get(&peer) else {
            return;
        };
        if !info.dispatcher.remove(listener) {
            return;
        }
        let remaining = info.using_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && !info.is_outbound() {
            state.teardown(peer);
        }
    }

    // -------------------------------------------------------------------------
    // Envelope
    // -------------------------------------------------------------------------

    /// Apply the pool's envelope to an outbound datagram.
    pub fn encode(&self, data: Bytes) -> CryptoResult<Bytes> {
        match &self.envelope {
            Some(envelope) => envelope.seal(&data).map(Bytes::from),
            None => Ok(data),
        }
    }

    /// Remove the pool's envelope from an inbound datagram.
    pub fn decode(&self, data: Bytes) -> CryptoResult<Bytes> {
        match &self.envelope {
            Some(envelope) => envelope.open(&data).map(Bytes::from),
            None => Ok(data),
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("mtu", &self.mtu)
            .field("udp_count", &state.udp_count)
            .field("connections", &state.connections.len())
            .finish_non_exhaustive()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let state = lock(&self.state);
        for info in state.connections.values() {
            info.dispatcher.close();
        }
        for bound in state.bound.values() {
            bound.dispatcher.close();
        }
    }
}

/// Register `listener` on the pooled socket for a peer.
///
/// See [`Pool::listen_remote`].
pub fn listen_remote(
    pool: &Pool,
    port: u16,
    address: IpAddr,
    listener: Listener,
) -> PoolResult<Arc<SocketInfo>> {
    pool.listen_remote(port, address, listener)
}

/// Unregister `listener` from the pooled socket for a peer.
///
/// See [`Pool::remove_listener`].
pub fn remove_listener(pool: &Pool, port: u16, address: IpAddr, listener: &Listener) {
    pool.remove_listener(port, address, listener)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::core::{BASE_MTU, ConfigError, PoolError};
    use crate::crypto::Algorithm;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    type Inbox = mpsc::UnboundedReceiver<(Bytes, SocketAddr)>;

    fn channel_listener() -> (Listener, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Listener::new(move |data, from| {
            let _ = tx.send((data, from));
        });
        (listener, rx)
    }

    async fn next(rx: &mut Inbox) -> (Bytes, SocketAddr) {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("datagram not received in time")
            .expect("listener channel closed")
    }

    /// Spawn a loopback echo server and return its port.
    async fn echo_server() -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..len], from).await;
            }
        });
        port
    }

    fn encrypted_config() -> PoolConfig {
        PoolConfig::builder()
            .algorithm(Algorithm::Aes256Gcm)
            .password("tunnel secret")
            .build()
    }

    #[test]
    fn test_mtu_plaintext() {
        let pool = Pool::new(PoolConfig::default()).unwrap();
        assert_eq!(pool.mtu(), BASE_MTU);
        assert_eq!(pool.mtu(), 1400);
    }

    #[test]
    fn test_mtu_encrypted_is_smaller() {
        let pool = Pool::new(encrypted_config()).unwrap();
        assert!(pool.mtu() < BASE_MTU);
        assert_eq!(pool.mtu(), 1400 - Algorithm::Aes256Gcm.overhead());
    }

    #[test]
    fn test_new_rejects_missing_password() {
        let config = PoolConfig::builder().algorithm(Algorithm::Aes128Gcm).build();
        let err = Pool::new(config).unwrap_err();
        assert!(matches!(
            err,
            PoolError::Config(ConfigError::MissingPassword(_))
        ));
    }

    #[test]
    fn test_conv_allocation_respects_marks() {
        let pool = Pool::new(PoolConfig::default()).unwrap();
        assert_eq!(pool.new_conv(4000, LOCALHOST), 0);
        assert_eq!(pool.new_conv(4000, LOCALHOST), 1);

        pool.mark_conv(4000, LOCALHOST, 3);
        assert_eq!(pool.new_conv(4000, LOCALHOST), 2);
        assert_eq!(pool.new_conv(4000, LOCALHOST), 4);
    }

    #[test]
    fn test_delete_conv_frees_only_that_slot() {
        let pool = Pool::new(PoolConfig::default()).unwrap();
        for expected in 0..3 {
            assert_eq!(pool.new_conv(4000, LOCALHOST), expected);
        }

        pool.delete_conv(4000, LOCALHOST, 1);
        assert!(!pool.is_conv_occupied(4000, LOCALHOST, 1));
        assert!(pool.is_conv_occupied(4000, LOCALHOST, 0));
        assert!(pool.is_conv_occupied(4000, LOCALHOST, 2));

        // Unknown peer and out-of-range conv are silent no-ops.
        pool.delete_conv(4001, LOCALHOST, 0);
        pool.delete_conv(4000, LOCALHOST, 99);

        assert_eq!(pool.new_conv(4000, LOCALHOST), 1);
    }

    #[test]
    fn test_conv_spaces_per_peer() {
        let pool = Pool::new(PoolConfig::default()).unwrap();
        assert_eq!(pool.new_conv(4000, LOCALHOST), 0);
        assert_eq!(pool.new_conv(4001, LOCALHOST), 0);
        assert_eq!(pool.new_conv(4000, "127.0.0.2".parse().unwrap()), 0);
        assert_eq!(pool.new_conv(4000, LOCALHOST), 1);
    }

    #[tokio::test]
    async fn test_send_reuses_socket_and_echoes() {
        let pool = Pool::new(PoolConfig::default()).unwrap();
        let port = echo_server().await;
        let (listener, mut inbox) = channel_listener();

        let info = pool.listen_remote(port, LOCALHOST, listener).unwrap();
        assert_eq!(pool.udp_count(), 1);

        let first = pool.send(b"ping 1", port, LOCALHOST).await.unwrap();
        let second = pool.send(b"ping 2", port, LOCALHOST).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &info));
        assert_eq!(pool.udp_count(), 1);

        let (data, from) = next(&mut inbox).await;
        assert_eq!(&data[..], b"ping 1");
        assert_eq!(from, SocketAddr::new(LOCALHOST, port));
        let (data, _) = next(&mut inbox).await;
        assert_eq!(&data[..], b"ping 2");
    }

    #[tokio::test]
    async fn test_send_only_creates_one_socket() {
        let pool = Pool::new(PoolConfig::default()).unwrap();
        let port = echo_server().await;

        for _ in 0..5 {
            pool.send(b"data", port, LOCALHOST).await.unwrap();
        }
        assert_eq!(pool.udp_count(), 1);
        assert_eq!(pool.connection_count(), 1);

        let info = pool.socket_info(port, LOCALHOST).unwrap();
        assert!(info.is_outbound());
        assert_eq!(info.using_count(), 0);

        pool.release(port, LOCALHOST);
        assert!(!pool.contains_peer(port, LOCALHOST));
        assert_eq!(pool.udp_count(), 0);
        assert!(info.is_closed());

        // Releasing again is harmless.
        pool.release(port, LOCALHOST);
        assert_eq!(pool.udp_count(), 0);
    }

    #[tokio::test]
    async fn test_outbound_binding_outlives_listeners() {
        let pool = Pool::new(PoolConfig::default()).unwrap();
        let port = echo_server().await;
        let (listener, _inbox) = channel_listener();

        pool.listen_remote(port, LOCALHOST, listener.clone()).unwrap();
        pool.send(b"hello", port, LOCALHOST).await.unwrap();

        pool.remove_listener(port, LOCALHOST, &listener);
        assert!(pool.contains_peer(port, LOCALHOST));
        assert_eq!(pool.udp_count(), 1);

        pool.release(port, LOCALHOST);
        assert!(!pool.contains_peer(port, LOCALHOST));
        assert_eq!(pool.udp_count(), 0);
    }

    #[tokio::test]
    async fn test_listen_receives_external_datagram() {
        let pool = Pool::new(PoolConfig::default()).unwrap();
        let (listener, mut inbox) = channel_listener();

        let mut announced = None;
        let bound = pool
            .listen(0, listener, |addr| announced = Some(addr))
            .await
            .unwrap();
        assert_eq!(announced, Some(bound.local_addr()));
        assert_eq!(pool.udp_count(), 1);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = SocketAddr::new(LOCALHOST, bound.local_addr().port());
        sender.send_to(b"hello server", target).await.unwrap();

        let (data, from) = next(&mut inbox).await;
        assert_eq!(&data[..], b"hello server");
        assert_eq!(from, sender.local_addr().unwrap());

        pool.unlisten(&bound);
        assert!(bound.is_closed());
        assert_eq!(pool.udp_count(), 0);
        pool.unlisten(&bound);
        assert_eq!(pool.udp_count(), 0);
    }

    #[tokio::test]
    async fn test_listen_remote_reference_counting() {
        let pool = Pool::new(PoolConfig::default()).unwrap();
        let (a, _a_inbox) = channel_listener();
        let (b, _b_inbox) = channel_listener();

        let first = listen_remote(&pool, 5555, LOCALHOST, a.clone()).unwrap();
        let second = listen_remote(&pool, 5555, LOCALHOST, b.clone()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.using_count(), 2);
        assert_eq!(pool.udp_count(), 1);
        assert!(first.has_listener(&a) && first.has_listener(&b));

        remove_listener(&pool, 5555, LOCALHOST, &a);
        assert_eq!(first.using_count(), 1);
        assert!(pool.contains_peer(5555, LOCALHOST));

        remove_listener(&pool, 5555, LOCALHOST, &b);
        assert_eq!(first.using_count(), 0);
        assert!(!pool.contains_peer(5555, LOCALHOST));
        assert_eq!(pool.udp_count(), 0);
        assert!(first.is_closed());
    }

    #[tokio::test]
    async fn test_remove_listener_noops() {
        let pool = Pool::new(PoolConfig::default()).unwrap();
        let (registered, _inbox) = channel_listener();
        let stranger = Listener::new(|_, _| {});

        // No socket for the peer at all.
        remove_listener(&pool, 6000, LOCALHOST, &stranger);
        assert_eq!(pool.udp_count(), 0);

        let info = listen_remote(&pool, 6000, LOCALHOST, registered.clone()).unwrap();
        remove_listener(&pool, 6000, LOCALHOST, &stranger);
        assert_eq!(info.using_count(), 1);

        // Duplicate registration does not inflate the count.
        listen_remote(&pool, 6000, LOCALHOST, registered.clone()).unwrap();
        assert_eq!(info.using_count(), 1);

        remove_listener(&pool, 6000, LOCALHOST, &registered);
        remove_listener(&pool, 6000, LOCALHOST, &registered);
        assert_eq!(info.using_count(), 0);
        assert_eq!(pool.udp_count(), 0);
    }

    #[tokio::test]
    async fn test_new_socket_after_teardown() {
        let pool = Pool::new(PoolConfig::default()).unwrap();
        let listener = Listener::new(|_, _| {});

        let old = listen_remote(&pool, 7000, LOCALHOST, listener.clone()).unwrap();
        remove_listener(&pool, 7000, LOCALHOST, &listener);
        let new = listen_remote(&pool, 7000, LOCALHOST, listener).unwrap();

        assert!(!Arc::ptr_eq(&old, &new));
        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert_eq!(pool.udp_count(), 1);
    }

    #[tokio::test]
    async fn test_encrypted_pools_talk() {
        let server = Pool::new(encrypted_config()).unwrap();
        let client = Pool::new(encrypted_config()).unwrap();
        let (listener, mut inbox) = channel_listener();
        let bound = server.listen(0, listener, |_| {}).await.unwrap();

        let payload = Bytes::from(vec![0x5a; client.mtu()]);
        let wire = client.encode(payload.clone()).unwrap();
        assert_eq!(wire.len(), BASE_MTU);

        client
            .send(&wire, bound.local_addr().port(), LOCALHOST)
            .await
            .unwrap();

        let (data, _) = next(&mut inbox).await;
        assert_eq!(server.decode(data).unwrap(), payload);
    }

    #[test]
    fn test_plaintext_pool_codec_passthrough() {
        let pool = Pool::new(PoolConfig::default()).unwrap();
        let data = Bytes::from_static(b"kcp segment");
        let encoded = pool.encode(data.clone()).unwrap();
        assert_eq!(encoded.as_ptr(), data.as_ptr());
        assert_eq!(pool.decode(encoded).unwrap(), data);
    }

    #[tokio::test]
    async fn test_remove_listener_frees_local_port() {
        let pool = Pool::new(PoolConfig::default()).unwrap();
        let listener = Listener::new(|_, _| {});

        let info = listen_remote(&pool, 7100, LOCALHOST, listener.clone()).unwrap();
        let local = info.local_addr();
        remove_listener(&pool, 7100, LOCALHOST, &listener);

        // The handle outlives the teardown but no longer owns the port.
        assert!(std::net::UdpSocket::bind(local).is_ok());
        let err = info.send(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_unlisten_frees_local_port() {
        let pool = Pool::new(PoolConfig::default()).unwrap();
        let local = SocketAddr::new(LOCALHOST, 0);
        let bound = pool
            .listen_on(local, Listener::new(|_, _| {}), |_| {})
            .await
            .unwrap();
        let addr = bound.local_addr();
        assert_eq!(addr.ip(), LOCALHOST);

        pool.unlisten(&bound);
        let err = bound.send_to(b"late", addr).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        let again = pool
            .listen_on(addr, Listener::new(|_, _| {}), |_| {})
            .await
            .unwrap();
        assert_eq!(again.local_addr(), addr);
        assert_eq!(pool.udp_count(), 1);
    }

    #[tokio::test]
    async fn test_bound_socket_replies() {
        let pool = Pool::new(PoolConfig::default()).unwrap();
        let (listener, mut inbox) = channel_listener();
        let bound = pool
            .listen_on(SocketAddr::new(LOCALHOST, 0), listener, |_| {})
            .await
            .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", bound.local_addr()).await.unwrap();
        let (_, from) = next(&mut inbox).await;

        bound.send_to(b"welcome", from).await.unwrap();
        let mut buf = [0u8; 64];
        let reply = client.recv_from(&mut buf);
        let (len, reply_from) = tokio::time::timeout(Duration::from_secs(2), reply)
            .await
            .expect("reply not received in time")
            .unwrap();
        assert_eq!(&buf[..len], b"welcome");
        assert_eq!(reply_from, bound.local_addr());
    }

    #[tokio::test]
    async fn test_listen_on_ipv6_loopback() {
        // Hosts without IPv6 loopback cannot run this.
        if std::net::UdpSocket::bind("[::1]:0").is_err() {
            return;
        }
        let pool = Pool::new(PoolConfig::default()).unwrap();
        let (listener, mut inbox) = channel_listener();
        let local: SocketAddr = "[::1]:0".parse().unwrap();
        let bound = pool.listen_on(local, listener, |_| {}).await.unwrap();
        assert!(bound.local_addr().is_ipv6());

        let sender = UdpSocket::bind("[::1]:0").await.unwrap();
        sender.send_to(b"v6", bound.local_addr()).await.unwrap();
        let (data, _) = next(&mut inbox).await;
        assert_eq!(&data[..], b"v6");
    }

    #[tokio::test]
    async fn test_panicking_listener_keeps_peer_socket() {
        let pool = Pool::new(PoolConfig::default()).unwrap();
        let faulty = Listener::new(|_, _| panic!("listener bug"));
        let (healthy, mut inbox) = channel_listener();

        let info = listen_remote(&pool, 7200, LOCALHOST, faulty).unwrap();
        listen_remote(&pool, 7200, LOCALHOST, healthy).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = SocketAddr::new(LOCALHOST, info.local_addr().port());
        sender.send_to(b"first", target).await.unwrap();
        assert_eq!(&next(&mut inbox).await.0[..], b"first");
        sender.send_to(b"second", target).await.unwrap();
        assert_eq!(&next(&mut inbox).await.0[..], b"second");

        assert!(!info.is_closed());
        assert_eq!(info.using_count(), 2);
        assert_eq!(pool.udp_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_socket_is_pruned() {
        let pool = Pool::new(PoolConfig::default()).unwrap();
        let listener = Listener::new(|_, _| {});
        let peer = get_id(7300, LOCALHOST);

        let old = listen_remote(&pool, 7300, LOCALHOST, listener.clone()).unwrap();
        let stale_id = old.dispatcher.id();

        // A failure report for some other dispatcher leaves the entry alone.
        prune_peer(Arc::downgrade(&pool.state), peer)(stale_id + 1_000_000);
        assert!(pool.contains_peer(7300, LOCALHOST));

        old.dispatcher.close();
        prune_peer(Arc::downgrade(&pool.state), peer)(stale_id);
        assert!(!pool.contains_peer(7300, LOCALHOST));
        assert_eq!(pool.udp_count(), 0);

        // A late report for the old socket must not touch its replacement.
        let new = listen_remote(&pool, 7300, LOCALHOST, listener).unwrap();
        prune_peer(Arc::downgrade(&pool.state), peer)(stale_id);
        assert!(pool.contains_peer(7300, LOCALHOST));
        assert!(!new.is_closed());
        assert_eq!(pool.udp_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_socket_is_replaced() {
        let pool = Pool::new(PoolConfig::default()).unwrap();
        let listener = Listener::new(|_, _| {});

        let old = listen_remote(&pool, 7400, LOCALHOST, listener.clone()).unwrap();
        old.dispatcher.close();

        let new = listen_remote(&pool, 7400, LOCALHOST, listener).unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(!new.is_closed());
        assert_eq!(new.using_count(), 1);
        assert_eq!(pool.udp_count(), 1);
    }
}
