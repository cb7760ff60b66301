//! Process-wide listener sharing.
//!
//! Several gateways may declare the same bind address, but the OS allows one
//! listening socket per address. The manager opens each canonical bind once,
//! runs its accept loop, and lets every subscriber pull from the shared
//! accept channel. The socket closes when the last subscriber goes away.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::infrared::{
    net,
    raknet::{RaknetAcceptor, raknet_listeners},
};

const ACCEPT_BACKLOG: usize = 256;

/// A listening socket that yields connections.
#[async_trait]
pub trait Acceptor: Send + Sized + 'static {
    type Stream: Send + 'static;

    async fn bind(addr: SocketAddr) -> io::Result<Self>;
    async fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Acceptor for TcpListener {
    type Stream = tokio::net::TcpStream;

    async fn bind(addr: SocketAddr) -> io::Result<Self> {
        TcpListener::bind(addr).await
    }

    async fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

#[derive(Debug)]
pub struct Accepted<S> {
    pub stream: S,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// Errors that leave the listening socket usable.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || is_resource_exhaustion(err)
}

fn is_resource_exhaustion(err: &io::Error) -> bool {
    // ENOMEM, ENFILE, EMFILE, ENOBUFS
    matches!(err.raw_os_error(), Some(12 | 23 | 24 | 105))
}

struct Managed<S> {
    refs: usize,
    local_addr: SocketAddr,
    rx: flume::Receiver<Accepted<S>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

type Registry<S> = Arc<Mutex<HashMap<SocketAddr, Managed<S>>>>;

pub struct ListenerManager<A: Acceptor> {
    inner: Registry<A::Stream>,
}

impl<A: Acceptor> Default for ListenerManager<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Acceptor> Clone for ListenerManager<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Acceptor> ListenerManager<A> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of open underlying listeners.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribers(&self, bind: &str) -> usize {
        let Ok(key) = net::canonical_bind(bind) else {
            return 0;
        };
        self.inner
            .lock()
            .ok()
            .and_then(|m| m.get(&key).map(|e| e.refs))
            .unwrap_or(0)
    }

    fn attach(&self, key: SocketAddr) -> Option<Subscription<A::Stream>> {
        let mut map = self.inner.lock().ok()?;
        let entry = map.get_mut(&key)?;
        entry.refs += 1;
        Some(Subscription {
            key,
            local_addr: entry.local_addr,
            rx: entry.rx.clone(),
            registry: Arc::clone(&self.inner),
        })
    }

    /// Subscribes to `bind`, opening the socket on first use.
    pub async fn subscribe(&self, bind: &str) -> io::Result<Subscription<A::Stream>> {
        let key = net::canonical_bind(bind)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{bind}: {e}")))?;

        if let Some(sub) = self.attach(key) {
            return Ok(sub);
        }

        let listener = A::bind(key).await?;
        let local_addr = listener.local_addr()?;

        let mut map = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("listener registry poisoned"))?;
        if let Some(entry) = map.get_mut(&key) {
            // Lost a race with a concurrent subscriber; drop our socket.
            entry.refs += 1;
            return Ok(Subscription {
                key,
                local_addr: entry.local_addr,
                rx: entry.rx.clone(),
                registry: Arc::clone(&self.inner),
            });
        }

        let (tx, rx) = flume::bounded(ACCEPT_BACKLOG);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, local_addr, tx, cancel.clone()));
        tracing::info!(bind = %local_addr, "listener: bound");

        map.insert(
            key,
            Managed {
                refs: 1,
                local_addr,
                rx: rx.clone(),
                cancel,
                task,
            },
        );
        Ok(Subscription {
            key,
            local_addr,
            rx,
            registry: Arc::clone(&self.inner),
        })
    }
}

async fn accept_loop<A: Acceptor>(
    mut listener: A,
    local_addr: SocketAddr,
    tx: flume::Sender<Accepted<A::Stream>>,
    cancel: CancellationToken,
) {
    loop {
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = listener.accept() => res,
        };
        match res {
            Ok((stream, remote_addr)) => {
                let item = Accepted {
                    stream,
                    remote_addr,
                    local_addr,
                };
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    r = tx.send_async(item) => r,
                };
                if sent.is_err() {
                    break;
                }
            }
            Err(err) if is_transient(&err) => {
                tracing::debug!(bind = %local_addr, err = %err, "listener: accept error");
                if is_resource_exhaustion(&err) {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
            Err(err) => {
                tracing::warn!(bind = %local_addr, err = %err, "listener: accept failed; closing");
                break;
            }
        }
    }
    tracing::info!(bind = %local_addr, "listener: closed");
}

/// One logical listener on a shared socket. Dropping it unsubscribes.
pub struct Subscription<S> {
    key: SocketAddr,
    local_addr: SocketAddr,
    rx: flume::Receiver<Accepted<S>>,
    registry: Registry<S>,
}

impl<S> Subscription<S> {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next accepted connection; `None` once the underlying listener closed.
    pub async fn accept(&self) -> Option<Accepted<S>> {
        self.rx.recv_async().await.ok()
    }
}

impl<S> Drop for Subscription<S> {
    fn drop(&mut self) {
        let Ok(mut map) = self.registry.lock() else {
            return;
        };
        let Some(entry) = map.get_mut(&self.key) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0
            && let Some(entry) = map.remove(&self.key)
        {
            entry.cancel.cancel();
            // The loop exits on cancel; the handle is only kept to abort a stuck accept.
            entry.task.abort();
        }
    }
}

pub fn tcp_listeners() -> &'static ListenerManager<TcpListener> {
    static MANAGER: OnceLock<ListenerManager<TcpListener>> = OnceLock::new();
    MANAGER.get_or_init(ListenerManager::new)
}

/// Listener managers for both transports.
#[derive(Clone)]
pub struct Listeners {
    pub tcp: ListenerManager<TcpListener>,
    pub raknet: ListenerManager<RaknetAcceptor>,
}

impl Listeners {
    /// The process-wide managers.
    pub fn global() -> Self {
        Self {
            tcp: tcp_listeners().clone(),
            raknet: raknet_listeners().clone(),
        }
    }

    /// Fresh managers that share nothing with the rest of the process.
    pub fn isolated() -> Self {
        Self {
            tcp: ListenerManager::new(),
            raknet: ListenerManager::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{io::AsyncWriteExt, net::TcpStream};

    #[tokio::test]
    async fn shared_bind_opens_one_socket() {
        let mgr: ListenerManager<TcpListener> = ListenerManager::new();
        let a = mgr.subscribe("127.0.0.1:0").await.unwrap();
        let b = mgr.subscribe(" 127.0.0.1:0 ").await.unwrap();
        assert_eq!(mgr.len(), 1);
        assert_eq!(mgr.subscribers("127.0.0.1:0"), 2);
        assert_eq!(a.local_addr(), b.local_addr());

        let mut c = TcpStream::connect(a.local_addr()).await.unwrap();
        c.write_all(b"x").await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::select! {
                x = a.accept() => x,
                x = b.accept() => x,
            }
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(got.local_addr, a.local_addr());

        drop(a);
        assert_eq!(mgr.len(), 1);
        drop(b);
        assert!(mgr.is_empty());
    }

    #[tokio::test]
    async fn last_unsubscribe_closes_the_socket() {
        let mgr: ListenerManager<TcpListener> = ListenerManager::new();
        let sub = mgr.subscribe("127.0.0.1:0").await.unwrap();
        let addr = sub.local_addr();
        drop(sub);

        let mut refused = false;
        for _ in 0..50 {
            if TcpStream::connect(addr).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(refused);

        // The address can be opened again.
        let again = mgr.subscribe(&addr.to_string()).await.unwrap();
        assert_eq!(again.local_addr(), addr);
    }

    #[tokio::test]
    async fn bad_bind_is_rejected() {
        let mgr: ListenerManager<TcpListener> = ListenerManager::new();
        let err = mgr.subscribe("not-an-address").await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
