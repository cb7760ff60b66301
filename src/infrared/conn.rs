//! Java client/backend connection with peek, packet I/O and deadlines.

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::{Buf, Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf},
    net::TcpStream,
    time::{self, Instant},
};

use crate::infrared::codec::{CodecError, Packet, packet};

async fn with_deadline<T, F>(deadline: Option<Instant>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(at) => time::timeout_at(at, fut)
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))?,
        None => fut.await,
    }
}

/// A TCP connection whose reads may be peeked before they are consumed.
///
/// Bytes pulled in by [`Conn::peek`] stay buffered and are served first by
/// every later read, so sniffing a preface never loses data.
#[derive(Debug)]
pub struct Conn {
    stream: TcpStream,
    buf: BytesMut,
    deadline: Option<Instant>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl Conn {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        Ok(Self {
            stream,
            buf: BytesMut::new(),
            deadline: None,
            peer_addr,
            local_addr,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Applies to every following read and write until changed.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    /// Returns up to `n` buffered bytes without consuming them, reading from
    /// the socket until `n` are available or the peer stops sending.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buf.len() < n {
            self.buf.reserve(n - self.buf.len());
            let read = with_deadline(self.deadline, self.stream.read_buf(&mut self.buf)).await?;
            if read == 0 {
                break;
            }
        }
        let len = self.buf.len().min(n);
        Ok(&self.buf[..len])
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Drops `n` already peeked bytes.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
    }

    pub async fn read_packet(&mut self, max_len: usize) -> Result<Packet, CodecError> {
        let deadline = self.deadline;
        match deadline {
            Some(at) => time::timeout_at(at, packet::read_packet(self, max_len))
                .await
                .map_err(|_| CodecError::Io(io::ErrorKind::TimedOut.into()))?,
            None => packet::read_packet(self, max_len).await,
        }
    }

    pub async fn write_packet(&mut self, p: &Packet) -> Result<(), CodecError> {
        self.write_all(&p.encode()).await?;
        Ok(())
    }

    pub async fn write_packets(&mut self, packets: &[Packet]) -> Result<(), CodecError> {
        let mut out = Vec::new();
        for p in packets {
            p.encode_into(&mut out);
        }
        self.write_all(&out).await?;
        Ok(())
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let deadline = self.deadline;
        let stream = &mut self.stream;
        with_deadline(deadline, async move {
            stream.write_all(data).await?;
            stream.flush().await
        })
        .await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    /// Hands over the socket together with any bytes read but not consumed.
    pub fn into_parts(self) -> (TcpStream, Bytes) {
        (self.stream, self.buf.freeze())
    }

    /// Closes with a reset instead of a FIN.
    pub fn force_close(self) {
        force_close(self.stream);
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            out.put_slice(&self.buf[..n]);
            self.buf.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, out)
    }
}

/// Sets linger to zero and drops the socket, so the peer sees RST.
pub fn force_close(stream: TcpStream) {
    let sock = socket2::SockRef::from(&stream);
    if let Err(err) = sock.set_linger(Some(Duration::ZERO)) {
        tracing::debug!(err = %err, "conn: set_linger failed");
    }
    drop(stream);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (Conn, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Conn::new(server).unwrap(), client)
    }

    #[tokio::test]
    async fn peeked_bytes_are_read_again() {
        let (mut conn, mut client) = pair().await;
        let hs = Packet::new(0x00, vec![1, 2, 3]);
        client.write_all(&hs.encode()).await.unwrap();

        let peeked = conn.peek(2).await.unwrap().to_vec();
        assert_eq!(peeked, hs.encode()[..2].to_vec());

        let got = conn.read_packet(64).await.unwrap();
        assert_eq!(got, hs);
    }

    #[tokio::test]
    async fn consume_skips_a_preface() {
        let (mut conn, mut client) = pair().await;
        client.write_all(b"XYZ").await.unwrap();
        client.write_all(&Packet::new(1, vec![9]).encode()).await.unwrap();

        assert_eq!(conn.peek(3).await.unwrap(), b"XYZ");
        conn.consume(3);
        let got = conn.read_packet(64).await.unwrap();
        assert_eq!(got.id, 1);
    }

    #[tokio::test]
    async fn deadline_turns_into_timeout() {
        let (mut conn, _client) = pair().await;
        conn.set_timeout(Duration::from_millis(50));
        let start = std::time::Instant::now();
        let err = conn.read_packet(64).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn force_close_resets_the_peer() {
        let (conn, mut client) = pair().await;
        conn.force_close();
        let mut buf = [0u8; 8];
        let r = client.read(&mut buf).await;
        assert!(matches!(r, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn into_parts_returns_unconsumed_bytes() {
        let (mut conn, mut client) = pair().await;
        client.write_all(b"abcdef").await.unwrap();
        conn.peek(6).await.unwrap();
        conn.consume(2);
        let (_stream, rest) = conn.into_parts();
        assert_eq!(&rest[..], b"cdef");
    }
}
