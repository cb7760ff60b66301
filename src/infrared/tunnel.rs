//! Live tunnels: the byte relay between a client and its backend.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::infrared::{
    conn::{self, Conn},
    event::{EventPayload, Topic},
    gateway::Edition,
    proxy::Shared,
    raknet::{BoxedLink, MessageLink},
    session::Session,
    telemetry::{self, ActiveTunnelGuard},
};

const COPY_BUF_LEN: usize = 32 * 1024;

pub enum TunnelLink {
    Java { client: Conn, backend: TcpStream },
    Bedrock { client: BoxedLink, backend: BoxedLink },
}

pub struct TunnelRequest {
    pub session: Arc<Session>,
    pub link: TunnelLink,
}

impl TunnelRequest {
    pub fn close(self) {
        if let TunnelLink::Java { client, backend } = self.link {
            client.force_close();
            conn::force_close(backend);
        }
    }
}

fn session_payload(s: &Session) -> EventPayload {
    EventPayload {
        edition: Some(s.edition.name()),
        gateway_id: Some(s.gateway_id.clone()),
        remote_addr: Some(s.remote_addr.to_string()),
        local_addr: Some(s.local_addr.to_string()),
        requested_host: Some(s.requested_addr.clone()),
        username: Some(s.username.clone()),
        protocol_version: Some(s.protocol_version),
        backend_id: Some(s.backend_id.clone()),
        matched_domain: Some(s.matched_domain.clone()),
        is_login_request: Some(true),
        ..Default::default()
    }
}

/// Registers the session, relays until either side is done, then
/// unregisters it and reports the final byte counts.
pub async fn run(req: TunnelRequest, shared: Arc<Shared>) {
    let session = req.session;
    let keep_alive = shared.settings.load().keep_alive_timeout;

    shared.sessions.add(Arc::clone(&session));
    shared.bus.push(Topic::PlayerJoin, session_payload(&session));
    let guard = ActiveTunnelGuard::new(session.edition);
    tracing::info!(
        edition = %session.edition,
        username = %session.username,
        remote = %session.remote_addr,
        server = %session.backend_id,
        "tunnel: opened"
    );

    let res = match req.link {
        TunnelLink::Java { client, backend } => splice(client, backend, &session, keep_alive).await,
        TunnelLink::Bedrock { client, backend } => relay(client, backend, &session, keep_alive).await,
    };
    drop(guard);

    shared.sessions.remove(&session.remote_addr);
    let bytes_in = session.bytes_in.load(Ordering::Relaxed);
    let bytes_out = session.bytes_out.load(Ordering::Relaxed);
    match res {
        Ok(()) => tracing::info!(
            username = %session.username,
            remote = %session.remote_addr,
            bytes_in,
            bytes_out,
            "tunnel: closed"
        ),
        Err(err) => tracing::debug!(
            username = %session.username,
            remote = %session.remote_addr,
            bytes_in,
            bytes_out,
            err = %err,
            "tunnel: closed with error"
        ),
    }

    let mut payload = session_payload(&session);
    payload.bytes_in = Some(bytes_in);
    payload.bytes_out = Some(bytes_out);
    shared.bus.push(Topic::PlayerLeave, payload);
}

async fn with_idle<T>(
    idle: Duration,
    fut: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    if idle.is_zero() {
        return fut.await;
    }
    time::timeout(idle, fut)
        .await
        .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))?
}

struct Direction<'a> {
    counter: &'a AtomicU64,
    edition: Edition,
    label: &'static str,
}

impl Direction<'_> {
    fn add(&self, n: usize) {
        self.counter.fetch_add(n as u64, Ordering::Relaxed);
        telemetry::bytes_forwarded(self.edition, self.label, n as u64);
    }
}

/// Copies until EOF, error, idle timeout or `stop`. The deadline slides with
/// every successful read and write. The writer is half-closed only on a clean
/// finish that was not `abort`ed.
async fn copy_half<R, W>(
    r: &mut R,
    w: &mut W,
    idle: Duration,
    dir: Direction<'_>,
    stop: &CancellationToken,
    abort: &CancellationToken,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_LEN];
    let res = async {
        loop {
            let n = tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(()),
                n = with_idle(idle, r.read(&mut buf)) => n?,
            };
            if n == 0 {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(()),
                res = with_idle(idle, w.write_all(&buf[..n])) => res?,
            }
            dir.add(n);
        }
    }
    .await;
    if res.is_ok() && !abort.is_cancelled() {
        let _ = w.shutdown().await;
    }
    res
}

fn reset_halves(halves: [(OwnedReadHalf, OwnedWriteHalf); 2]) {
    for (r, w) in halves {
        if let Ok(stream) = r.reunite(w) {
            conn::force_close(stream);
        }
    }
}

async fn splice(
    client: Conn,
    backend: TcpStream,
    session: &Session,
    idle: Duration,
) -> io::Result<()> {
    let (client, leftover) = client.into_parts();
    let (mut cr, mut cw) = client.into_split();
    let (mut br, mut bw) = backend.into_split();
    // Disconnects, proxy shutdown and errors cancel `abort` and reset both
    // sockets. A clean EOF on one side only stops the other half.
    let abort = session.cancel_token().clone();
    let stop = abort.child_token();
    let upstream = Direction {
        counter: &session.bytes_in,
        edition: session.edition,
        label: "in",
    };
    let downstream = Direction {
        counter: &session.bytes_out,
        edition: session.edition,
        label: "out",
    };

    if !leftover.is_empty() {
        if let Err(err) = with_idle(idle, bw.write_all(&leftover)).await {
            abort.cancel();
            reset_halves([(cr, cw), (br, bw)]);
            return Err(err);
        }
        upstream.add(leftover.len());
    }

    let finish = |res: &io::Result<()>| match res {
        Ok(()) => stop.cancel(),
        Err(_) => abort.cancel(),
    };
    let c2b = async {
        let res = copy_half(&mut cr, &mut bw, idle, upstream, &stop, &abort).await;
        finish(&res);
        res
    };
    let b2c = async {
        let res = copy_half(&mut br, &mut cw, idle, downstream, &stop, &abort).await;
        finish(&res);
        res
    };
    let (a, b) = tokio::join!(c2b, b2c);
    if abort.is_cancelled() {
        reset_halves([(cr, cw), (br, bw)]);
    }
    a.and(b)
}

/// Relays RakNet messages verbatim in both directions.
async fn relay(
    mut client: BoxedLink,
    mut backend: BoxedLink,
    session: &Session,
    idle: Duration,
) -> io::Result<()> {
    let stop = session.cancel_token().clone();
    let upstream = Direction {
        counter: &session.bytes_in,
        edition: session.edition,
        label: "in",
    };
    let downstream = Direction {
        counter: &session.bytes_out,
        edition: session.edition,
        label: "out",
    };
    let idle_at = |now: Instant| (!idle.is_zero()).then(|| now + idle);
    let mut deadline = idle_at(Instant::now());

    let res = loop {
        let sleep = async {
            match deadline {
                Some(at) => time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = stop.cancelled() => break Ok(()),
            _ = sleep => break Err(io::Error::from(io::ErrorKind::TimedOut)),
            msg = client.recv() => match msg {
                Some(Ok(msg)) => {
                    let n = msg.len();
                    if let Err(err) = backend.send(msg).await {
                        break Err(err);
                    }
                    upstream.add(n);
                }
                Some(Err(err)) => break Err(err),
                None => break Ok(()),
            },
            msg = backend.recv() => match msg {
                Some(Ok(msg)) => {
                    let n = msg.len();
                    if let Err(err) = client.send(msg).await {
                        break Err(err);
                    }
                    downstream.add(n);
                }
                Some(Err(err)) => break Err(err),
                None => break Ok(()),
            },
        }
        deadline = idle_at(Instant::now());
    };
    stop.cancel();
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrared::raknet::MemoryLink;
    use bytes::Bytes;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn session(edition: Edition, remote: SocketAddr) -> Arc<Session> {
        Arc::new(Session::new(
            edition,
            "Notch".into(),
            remote,
            "127.0.0.1:25565".parse().unwrap(),
            "default".into(),
            "lobby".into(),
            "*".into(),
            "mc.example.com".into(),
            763,
            CancellationToken::new(),
        ))
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let a = TcpStream::connect(l.local_addr().unwrap()).await.unwrap();
        let (b, _) = l.accept().await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn splice_counts_bytes_and_closes_both_sides() {
        let (mut client, client_side) = tcp_pair().await;
        let (backend_side, mut backend) = tcp_pair().await;
        let s = session(Edition::Java, client_side.peer_addr().unwrap());
        let conn = Conn::new(client_side).unwrap();

        let relay = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { splice(conn, backend_side, &s, Duration::from_secs(5)).await })
        };

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        backend.write_all(b"welcome!").await.unwrap();
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"welcome!");

        drop(backend);
        time::timeout(Duration::from_millis(500), relay)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(s.bytes_in.load(Ordering::Relaxed), 5);
        assert_eq!(s.bytes_out.load(Ordering::Relaxed), 8);

        let mut rest = Vec::new();
        let n = client.read_to_end(&mut rest).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn disconnect_resets_both_sides() {
        let (mut client, client_side) = tcp_pair().await;
        let (backend_side, mut backend) = tcp_pair().await;
        let s = session(Edition::Java, client_side.peer_addr().unwrap());
        let conn = Conn::new(client_side).unwrap();
        let relay = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { splice(conn, backend_side, &s, Duration::ZERO).await })
        };
        tokio::task::yield_now().await;
        s.disconnect();
        time::timeout(Duration::from_millis(500), relay)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let mut buf = [0u8; 8];
        for side in [&mut client, &mut backend] {
            let err = time::timeout(Duration::from_secs(1), side.read(&mut buf))
                .await
                .unwrap()
                .unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        }
    }

    #[tokio::test]
    async fn relay_forwards_messages_and_times_out() {
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();
        let (mut player, proxy_client) = MemoryLink::pair(a, b);
        let (proxy_backend, mut server) = MemoryLink::pair(b, a);
        let s = session(Edition::Bedrock, a);

        let handle = {
            let s = Arc::clone(&s);
            tokio::spawn(async move {
                relay(
                    Box::new(proxy_client),
                    Box::new(proxy_backend),
                    &s,
                    Duration::from_millis(200),
                )
                .await
            })
        };

        player.send(Bytes::from_static(b"\xfeping")).await.unwrap();
        let got = server.recv().await.unwrap().unwrap();
        assert_eq!(&got[..], b"\xfeping");
        server.send(Bytes::from_static(b"\xfepong!")).await.unwrap();
        let got = player.recv().await.unwrap().unwrap();
        assert_eq!(&got[..], b"\xfepong!");

        let err = time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(s.bytes_in.load(Ordering::Relaxed), 5);
        assert_eq!(s.bytes_out.load(Ordering::Relaxed), 6);
    }
}
