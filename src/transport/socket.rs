//! Pooled UDP sockets and inbound dispatch.
//!
//! Every socket the pool owns gets a [`Dispatcher`]: a receive task that
//! hands each inbound datagram to the registered listeners in arrival order.
//! A listener removed while a datagram is being dispatched is not called for
//! it, unless its call for that datagram has already started.

use std::fmt;
use std::future::poll_fn;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::Poll;

use bytes::Bytes;
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::core::RECV_BUFFER_SIZE;

/// Lock a registry mutex, recovering the data if a holder panicked.
///
/// Guarded sections never call listeners or other user code, and every
/// update inside them completes before the guard drops, so the data behind
/// a poisoned lock is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Callback invoked for each inbound datagram with its payload and sender.
pub type MessageFn = dyn Fn(Bytes, SocketAddr) + Send + Sync;

/// A registered inbound-message callback.
///
/// Listeners are compared by identity: clones of one listener are equal,
/// two listeners built from identical closures are not.
#[derive(Clone)]
pub struct Listener {
    id: u64,
    callback: Arc<MessageFn>,
}

impl Listener {
    /// Wrap a callback in a new listener identity.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(Bytes, SocketAddr) + Send + Sync + 'static,
    {
        Self {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            callback: Arc::new(callback),
        }
    }

    /// Get the listener's identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Invoke the callback.
    pub fn call(&self, data: Bytes, from: SocketAddr) {
        (self.callback)(data, from)
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Listener {}

impl std::hash::Hash for Listener {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Listener").field(&self.id).finish()
    }
}

/// Bind a socket for talking to `remote` on an ephemeral local port.
///
/// The bind is synchronous so the registry can create and record a socket
/// in one step.
///
/// # Panics
/// Panics when called outside a Tokio runtime.
pub(crate) fn bind_ephemeral(remote: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = match remote {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = std::net::UdpSocket::bind(local)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

type SocketSlot = Arc<Mutex<Option<Arc<UdpSocket>>>>;

/// A socket plus the task dispatching its inbound datagrams.
///
/// The dispatcher holds the only long-lived reference to the socket, so
/// [`Dispatcher::close`] releases the OS socket immediately. An in-flight
/// send keeps it open until that send completes.
pub(crate) struct Dispatcher {
    id: u64,
    socket: SocketSlot,
    local_addr: SocketAddr,
    listeners: Arc<Mutex<Vec<Listener>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Take ownership of `socket` and start dispatching.
    ///
    /// `on_failure` runs with the dispatcher id if receiving fails for good;
    /// the socket is already closed by then. It does not run after
    /// [`Dispatcher::close`].
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime.
    pub(crate) fn start<F>(socket: UdpSocket, on_failure: F) -> io::Result<Self>
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let id = NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed);
        let local_addr = socket.local_addr()?;
        let socket: SocketSlot = Arc::new(Mutex::new(Some(Arc::new(socket))));
        let listeners = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(recv_loop(
            id,
            Arc::clone(&socket),
            Arc::clone(&listeners),
            on_failure,
        ));

        Ok(Self {
            id,
            socket,
            local_addr,
            listeners,
            task: Mutex::new(Some(task)),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Get the socket, or `NotConnected` once closed.
    pub(crate) fn socket(&self) -> io::Result<Arc<UdpSocket>> {
        lock(&self.socket)
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "pooled socket closed"))
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register a listener. Returns `false` if it was already registered.
    pub(crate) fn add(&self, listener: Listener) -> bool {
        let mut listeners = lock(&self.listeners);
        if listeners.contains(&listener) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Unregister a listener. Returns `false` if it was not registered.
    pub(crate) fn remove(&self, listener: &Listener) -> bool {
        let mut listeners = lock(&self.listeners);
        match listeners.iter().position(|l| l == listener) {
            Some(index) => {
                listeners.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn contains(&self, listener: &Listener) -> bool {
        lock(&self.listeners).contains(listener)
    }

    pub(crate) fn listeners(&self) -> Vec<Listener> {
        lock(&self.listeners).clone()
    }

    /// Stop dispatching, drop every listener and close the socket.
    pub(crate) fn close(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        lock(&self.listeners).clear();
        lock(&self.socket).take();
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.socket).is_none()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Receive one datagram into `buf`.
///
/// The socket is borrowed from `slot` only for the duration of each poll,
/// so closing the slot closes the socket even while a receive is pending.
/// Returns `None` once the slot is empty.
async fn recv_once(slot: &SocketSlot, buf: &mut [u8]) -> Option<io::Result<(usize, SocketAddr)>> {
    poll_fn(|cx| {
        let Some(socket) = lock(slot).clone() else {
            return Poll::Ready(None);
        };
        let mut read = ReadBuf::new(buf);
        socket
            .poll_recv_from(cx, &mut read)
            .map(|res| Some(res.map(|from| (read.filled().len(), from))))
    })
    .await
}

async fn recv_loop<F>(
    id: u64,
    slot: SocketSlot,
    listeners: Arc<Mutex<Vec<Listener>>>,
    on_failure: F,
) where
    F: FnOnce(u64),
{
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        match recv_once(&slot, &mut buf).await {
            None => return,
            Some(Ok((len, from))) => {
                // Snapshot so callbacks may (un)register listeners themselves.
                let current = lock(&listeners).clone();
                if current.is_empty() {
                    trace!(%from, len, "no listener, datagram dropped");
                    continue;
                }
                let data = Bytes::copy_from_slice(&buf[..len]);
                for listener in &current {
                    // Skip listeners removed by an earlier callback or a
                    // concurrent `remove_listener`.
                    if !lock(&listeners).contains(listener) {
                        continue;
                    }
                    let call = AssertUnwindSafe(|| listener.call(data.clone(), from));
                    if panic::catch_unwind(call).is_err() {
                        warn!(%from, listener = listener.id(), "listener panicked, datagram skipped for it");
                    }
                }
            }
            // ICMP unreachable feedback from an earlier send; keep receiving.
            Some(Err(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                ) =>
            {
                trace!(error = %e, "ignoring ICMP error on pooled socket");
            }
            Some(Err(e)) => {
                warn!(error = %e, "pooled socket receive failed, socket closed");
                lock(&listeners).clear();
                lock(&slot).take();
                on_failure(id);
                return;
            }
        }
    }
}
