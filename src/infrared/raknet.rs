//! RakNet transport for the Bedrock edition.

use std::{io, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time;
use tokio_raknet::{
    protocol::reliability::Reliability,
    transport::{Message, RaknetListener, RaknetStream},
};

use crate::infrared::listener::{Acceptor, ListenerManager};

/// A reliable, message-oriented connection. Each message is one Bedrock batch.
#[async_trait]
pub trait MessageLink: Send {
    /// `None` once the peer is gone.
    async fn recv(&mut self) -> Option<io::Result<Bytes>>;
    async fn send(&mut self, buf: Bytes) -> io::Result<()>;
    fn peer_addr(&self) -> SocketAddr;
    fn local_addr(&self) -> SocketAddr;
}

pub type BoxedLink = Box<dyn MessageLink>;

pub struct RaknetLink {
    stream: RaknetStream,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl RaknetLink {
    pub fn new(stream: RaknetStream, local_addr: SocketAddr) -> Self {
        let peer_addr = stream.peer_addr();
        Self {
            stream,
            peer_addr,
            local_addr,
        }
    }

    pub async fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let stream = time::timeout(timeout, RaknetStream::connect(addr))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))?
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, format!("{e:?}")))?;
        let local_addr = if addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        Ok(Self {
            stream,
            peer_addr: addr,
            local_addr,
        })
    }
}

#[async_trait]
impl MessageLink for RaknetLink {
    async fn recv(&mut self) -> Option<io::Result<Bytes>> {
        match self.stream.recv_msg().await? {
            Ok(msg) => Some(Ok(msg.buffer)),
            Err(err) => Some(Err(io::Error::other(format!("raknet recv: {err:?}")))),
        }
    }

    async fn send(&mut self, buf: Bytes) -> io::Result<()> {
        let msg = Message::new(buf).reliability(Reliability::ReliableOrdered);
        self.stream
            .send(msg)
            .await
            .map_err(|err| io::Error::other(format!("raknet send: {err:?}")))
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

pub struct RaknetAcceptor {
    listener: RaknetListener,
    local_addr: SocketAddr,
}

#[async_trait]
impl Acceptor for RaknetAcceptor {
    type Stream = BoxedLink;

    async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = RaknetListener::bind(addr)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::AddrInUse, format!("{e:?}")))?;
        Ok(Self {
            listener,
            local_addr: addr,
        })
    }

    async fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)> {
        let Some(stream) = self.listener.accept().await else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "raknet listener closed",
            ));
        };
        let link = RaknetLink::new(stream, self.local_addr);
        let peer = link.peer_addr();
        Ok((Box::new(link), peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

pub fn raknet_listeners() -> &'static ListenerManager<RaknetAcceptor> {
    static MANAGER: std::sync::OnceLock<ListenerManager<RaknetAcceptor>> =
        std::sync::OnceLock::new();
    MANAGER.get_or_init(ListenerManager::new)
}

/// In-process link pair.
#[cfg(test)]
pub struct MemoryLink {
    tx: flume::Sender<Bytes>,
    rx: flume::Receiver<Bytes>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

#[cfg(test)]
impl MemoryLink {
    pub fn pair(a: SocketAddr, b: SocketAddr) -> (Self, Self) {
        let (tx_ab, rx_ab) = flume::unbounded();
        let (tx_ba, rx_ba) = flume::unbounded();
        (
            Self {
                tx: tx_ab,
                rx: rx_ba,
                peer_addr: b,
                local_addr: a,
            },
            Self {
                tx: tx_ba,
                rx: rx_ab,
                peer_addr: a,
                local_addr: b,
            },
        )
    }
}

#[cfg(test)]
#[async_trait]
impl MessageLink for MemoryLink {
    async fn recv(&mut self) -> Option<io::Result<Bytes>> {
        self.rx.recv_async().await.ok().map(Ok)
    }

    async fn send(&mut self, buf: Bytes) -> io::Result<()> {
        self.tx
            .send_async(buf)
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_links_carry_messages_both_ways() {
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();
        let (mut x, mut y) = MemoryLink::pair(a, b);
        assert_eq!(x.peer_addr(), b);
        assert_eq!(y.local_addr(), b);

        x.send(Bytes::from_static(b"\xfe\x01")).await.unwrap();
        assert_eq!(&y.recv().await.unwrap().unwrap()[..], b"\xfe\x01");
        y.send(Bytes::from_static(b"\xfe\x02")).await.unwrap();
        assert_eq!(&x.recv().await.unwrap().unwrap()[..], b"\xfe\x02");

        drop(y);
        assert!(x.recv().await.is_none());
        assert!(x.send(Bytes::new()).await.is_err());
    }
}
