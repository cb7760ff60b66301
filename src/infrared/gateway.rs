//! Gateways: named listener groups with their own admission policy.
//!
//! A gateway subscribes to each of its binds through the listener manager and
//! feeds every accepted connection into the processing stage.

use std::{
    fmt, io,
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Instant,
};

use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::infrared::{
    config::GatewayConfig,
    conn,
    event::{EventBus, EventPayload, Topic},
    filter::{FilterChain, ProxyProtocolFilter, RateLimiter},
    listener::{Acceptor, ListenerManager, Listeners, Subscription},
    proxy::Stage,
    raknet::BoxedLink,
    status::StatusResponse,
    telemetry,
    template::{self, TemplateVars},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Edition {
    Java,
    Bedrock,
}

impl Edition {
    pub fn name(self) -> &'static str {
        match self {
            Edition::Java => "java",
            Edition::Bedrock => "bedrock",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "java" => Some(Edition::Java),
            "bedrock" => Some(Edition::Bedrock),
            _ => None,
        }
    }
}

impl fmt::Display for Edition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable gateway policy. A reload builds a new one.
#[derive(Debug)]
pub struct Gateway {
    pub id: String,
    pub edition: Edition,
    pub binds: Vec<String>,
    pub filters: FilterChain,
    pub receive_real_ip: bool,
    pub not_found_message: String,
    pub not_found_status: Option<StatusResponse>,
    not_found_status_json: OnceLock<String>,
}

impl Gateway {
    pub fn from_config(edition: Edition, cfg: &GatewayConfig) -> Self {
        let proxy_protocol = match edition {
            Edition::Bedrock if cfg.receive_proxy_protocol => {
                tracing::warn!(gateway = %cfg.id, "gateway: PROXY protocol is not supported over RakNet, ignoring");
                None
            }
            _ => cfg
                .receive_proxy_protocol
                .then(|| ProxyProtocolFilter::new(cfg.trusted_proxies.clone())),
        };
        let rate_limit = cfg
            .rate_limit
            .as_ref()
            .map(|rl| Arc::new(RateLimiter::new(rl.request_limit, rl.window)));
        Self {
            id: cfg.id.clone(),
            edition,
            binds: cfg.binds.clone(),
            filters: FilterChain {
                proxy_protocol,
                rate_limit,
            },
            receive_real_ip: cfg.receive_real_ip,
            not_found_message: cfg.server_not_found_message.clone(),
            not_found_status: cfg.server_not_found_status.clone(),
            not_found_status_json: OnceLock::new(),
        }
    }

    /// The not-found status body, rendered on first use.
    pub fn not_found_status_json(&self) -> Option<&str> {
        let status = self.not_found_status.as_ref()?;
        let json = self.not_found_status_json.get_or_init(|| {
            let vars = TemplateVars::new().set(template::GATEWAY_ID, self.id.clone());
            status.render(&vars)
        });
        Some(json.as_str())
    }
}

pub enum Transport {
    Tcp(TcpStream),
    Raknet(BoxedLink),
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp(s) => f.debug_tuple("Tcp").field(s).finish(),
            Transport::Raknet(l) => f.debug_tuple("Raknet").field(&l.peer_addr()).finish(),
        }
    }
}

/// A freshly accepted connection on its way to a processing worker.
#[derive(Debug)]
pub struct IncomingConn {
    pub gateway: Arc<Gateway>,
    pub transport: Transport,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub accepted_at: Instant,
}

impl IncomingConn {
    pub fn event_payload(&self) -> EventPayload {
        EventPayload {
            edition: Some(self.gateway.edition.name()),
            gateway_id: Some(self.gateway.id.clone()),
            remote_addr: Some(self.remote_addr.to_string()),
            local_addr: Some(self.local_addr.to_string()),
            ..Default::default()
        }
    }

    /// Closes without any protocol goodbye.
    pub fn reject(self) {
        match self.transport {
            Transport::Tcp(stream) => conn::force_close(stream),
            Transport::Raknet(link) => drop(link),
        }
    }
}

/// Running accept loops of one gateway. Dropping the handle stops them and
/// releases the gateway's listener subscriptions.
pub struct GatewayHandle {
    pub gateway: Arc<Gateway>,
    pub local_addrs: Vec<SocketAddr>,
    cancel: CancellationToken,
}

impl GatewayHandle {
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for GatewayHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Subscribes to every bind of `gateway` and starts feeding `out`.
///
/// All binds are subscribed before any accept loop starts, so a bind error
/// leaves nothing running.
pub async fn listen(
    gateway: Arc<Gateway>,
    listeners: &Listeners,
    out: Arc<Stage<IncomingConn>>,
    bus: Arc<EventBus>,
    tracker: &TaskTracker,
    parent: &CancellationToken,
) -> io::Result<GatewayHandle> {
    let cancel = parent.child_token();
    let mut local_addrs = Vec::with_capacity(gateway.binds.len());

    match gateway.edition {
        Edition::Java => {
            let subs = subscribe_all(&listeners.tcp, &gateway.binds).await?;
            for sub in subs {
                local_addrs.push(sub.local_addr());
                tracker.spawn(accept_loop(
                    sub,
                    Transport::Tcp,
                    Arc::clone(&gateway),
                    Arc::clone(&out),
                    Arc::clone(&bus),
                    cancel.clone(),
                ));
            }
        }
        Edition::Bedrock => {
            let subs = subscribe_all(&listeners.raknet, &gateway.binds).await?;
            for sub in subs {
                local_addrs.push(sub.local_addr());
                tracker.spawn(accept_loop(
                    sub,
                    Transport::Raknet,
                    Arc::clone(&gateway),
                    Arc::clone(&out),
                    Arc::clone(&bus),
                    cancel.clone(),
                ));
            }
        }
    }

    tracing::info!(
        edition = %gateway.edition,
        gateway = %gateway.id,
        binds = ?local_addrs,
        "gateway: listening"
    );
    Ok(GatewayHandle {
        gateway,
        local_addrs,
        cancel,
    })
}

async fn subscribe_all<A: Acceptor>(
    manager: &ListenerManager<A>,
    binds: &[String],
) -> io::Result<Vec<Subscription<A::Stream>>> {
    let mut subs = Vec::with_capacity(binds.len());
    for bind in binds {
        let sub = manager
            .subscribe(bind)
            .await
            .map_err(|e| io::Error::new(e.kind(), format!("bind {bind}: {e}")))?;
        subs.push(sub);
    }
    Ok(subs)
}

async fn accept_loop<S: Send + 'static>(
    sub: Subscription<S>,
    wrap: fn(S) -> Transport,
    gateway: Arc<Gateway>,
    out: Arc<Stage<IncomingConn>>,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            a = sub.accept() => match a {
                Some(a) => a,
                None => break,
            },
        };

        let incoming = IncomingConn {
            gateway: Arc::clone(&gateway),
            transport: wrap(accepted.stream),
            remote_addr: accepted.remote_addr,
            local_addr: accepted.local_addr,
            accepted_at: Instant::now(),
        };
        telemetry::connection_accepted(gateway.edition);

        // Without a PROXY header the peer address is final, so the limiter
        // can drop floods before they cost a worker slot.
        if gateway.filters.proxy_protocol.is_none()
            && let Err(err) = gateway.filters.check_rate(incoming.remote_addr)
        {
            tracing::debug!(gateway = %gateway.id, err = %err, "gateway: rejected");
            incoming.reject();
            continue;
        }

        bus.push(Topic::AcceptedConn, incoming.event_payload());

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = out.send(incoming) => r,
        };
        if let Err(rejected) = sent {
            rejected.reject();
            break;
        }
    }
    tracing::debug!(gateway = %gateway.id, bind = %sub.local_addr(), "gateway: accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrared::config::RateLimitConfig;
    use std::time::Duration;

    fn gateway_config(id: &str) -> GatewayConfig {
        GatewayConfig {
            id: id.into(),
            binds: vec!["127.0.0.1:0".into()],
            receive_proxy_protocol: false,
            trusted_proxies: Vec::new(),
            receive_real_ip: false,
            server_not_found_message: "nope".into(),
            server_not_found_status: Some(StatusResponse {
                version_name: "Infrared".into(),
                motd: "no server on {{gatewayId}}".into(),
                ..Default::default()
            }),
            rate_limit: None,
        }
    }

    #[test]
    fn editions_parse_and_print() {
        assert_eq!(Edition::parse(" Java "), Some(Edition::Java));
        assert_eq!(Edition::parse("bedrock"), Some(Edition::Bedrock));
        assert_eq!(Edition::parse("pocket"), None);
        assert_eq!(Edition::Bedrock.to_string(), "bedrock");
        assert_eq!(serde_json::to_value(Edition::Java).unwrap(), "java");
    }

    #[test]
    fn not_found_status_is_rendered_once() {
        let gw = Gateway::from_config(Edition::Java, &gateway_config("lobby-gw"));
        let first = gw.not_found_status_json().unwrap();
        let v: serde_json::Value = serde_json::from_str(first).unwrap();
        assert_eq!(v["description"]["text"], "no server on lobby-gw");
        assert!(std::ptr::eq(first, gw.not_found_status_json().unwrap()));
    }

    #[tokio::test]
    async fn accepted_conns_reach_the_stage() {
        let listeners = Listeners::isolated();
        let stage = Arc::new(Stage::new(4));
        let bus = Arc::new(EventBus::new());
        let mut events = bus.subscribe();
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();

        let gw = Arc::new(Gateway::from_config(Edition::Java, &gateway_config("default")));
        let handle = listen(gw, &listeners, stage.clone(), bus, &tracker, &cancel)
            .await
            .unwrap();
        let addr = handle.local_addrs[0];

        let client = TcpStream::connect(addr).await.unwrap();
        let incoming = tokio::time::timeout(Duration::from_secs(2), stage.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(incoming.remote_addr, client.local_addr().unwrap());
        assert_eq!(incoming.gateway.id, "default");

        let ev = events.recv().await.unwrap();
        assert_eq!(ev.topic, Topic::AcceptedConn);
        assert_eq!(ev.payload.gateway_id.as_deref(), Some("default"));

        drop(handle);
        for _ in 0..50 {
            if listeners.tcp.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(listeners.tcp.is_empty());
    }

    #[tokio::test]
    async fn rate_limited_conns_never_reach_the_stage() {
        let listeners = Listeners::isolated();
        let stage = Arc::new(Stage::new(8));
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();

        let mut cfg = gateway_config("limited");
        cfg.rate_limit = Some(RateLimitConfig {
            request_limit: 2,
            window: Duration::from_secs(60),
        });
        let gw = Arc::new(Gateway::from_config(Edition::Java, &cfg));
        let handle = listen(
            gw,
            &listeners,
            stage.clone(),
            Arc::new(EventBus::new()),
            &tracker,
            &cancel,
        )
        .await
        .unwrap();
        let addr = handle.local_addrs[0];

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(addr).await.unwrap());
        }
        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(2), stage.recv())
                .await
                .unwrap()
                .unwrap();
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(200), stage.recv())
                .await
                .is_err()
        );
    }
}
