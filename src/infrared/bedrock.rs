//! Bedrock edition: network settings negotiation, login parsing and the
//! backend handshake replay.

use std::{net::SocketAddr, sync::Arc, time::SystemTime};

use bytes::Bytes;
use tokio::time::{self, Instant};

use crate::infrared::{
    codec::{
        CodecError,
        bedrock::{
            BatchCodec, BedrockPacket, Compression, Disconnect, Login, NetworkSettings,
            PacketData, RequestNetworkSettings,
        },
        bedrock_login,
    },
    cpn::ProcessError,
    event::{EventPayload, Topic},
    gateway::{Edition, Gateway},
    net,
    proxy::Shared,
    raknet::{BoxedLink, MessageLink},
    router::Match,
    session::Session,
    template::{self, TemplateVars},
    tunnel::{TunnelLink, TunnelRequest},
};

/// A Bedrock client that finished network settings and sent its login.
pub struct BedrockConn {
    pub link: BoxedLink,
    /// Client-side codec, compression enabled.
    pub codec: BatchCodec,
    pub gateway: Arc<Gateway>,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub protocol_version: i32,
    pub compression: Compression,
    /// Raw packets replayed to the backend.
    pub request_network_settings: Bytes,
    pub login: Bytes,
    pub username: String,
    pub server_address: String,
}

impl BedrockConn {
    pub fn routing_key(&self) -> String {
        net::strip_port(self.server_address.trim_matches('.'))
            .trim_end_matches('.')
            .to_ascii_lowercase()
    }

    pub fn event_payload(&self) -> EventPayload {
        EventPayload {
            edition: Some(Edition::Bedrock.name()),
            gateway_id: Some(self.gateway.id.clone()),
            remote_addr: Some(self.remote_addr.to_string()),
            local_addr: Some(self.local_addr.to_string()),
            requested_host: Some(self.routing_key()),
            username: Some(self.username.clone()),
            protocol_version: Some(self.protocol_version),
            is_login_request: Some(true),
            ..Default::default()
        }
    }

    pub fn template_vars(&self) -> TemplateVars {
        TemplateVars::new()
            .set(template::USERNAME, self.username.clone())
            .set(template::SERVER_DOMAIN, self.routing_key())
            .set(template::GATEWAY_ID, self.gateway.id.clone())
            .set(template::REMOTE_ADDRESS, self.remote_addr.to_string())
            .set(template::LOCAL_ADDRESS, self.local_addr.to_string())
            .set(template::REQUESTED_ADDRESS, self.server_address.clone())
            .set(template::PROTOCOL_NUMBER, self.protocol_version.to_string())
            .with_time(SystemTime::now())
    }

    async fn send(&mut self, packet: &[u8]) -> Result<(), CodecError> {
        let batch = self.codec.encode(&[packet])?;
        self.link.send(Bytes::from(batch)).await?;
        Ok(())
    }

    /// Sends a disconnect screen. Errors are ignored, the link is dropped.
    async fn disconnect(mut self, message: &str) {
        let packet = Disconnect::with_message(message).to_bytes();
        if let Err(err) = self.send(&packet).await {
            tracing::debug!(remote = %self.remote_addr, err = %err, "bedrock: disconnect not delivered");
        }
    }
}

async fn recv_batch(link: &mut BoxedLink, codec: &BatchCodec) -> Result<Vec<Bytes>, CodecError> {
    match link.recv().await {
        Some(Ok(msg)) => codec.decode(&msg),
        Some(Err(err)) => Err(err.into()),
        None => Err(CodecError::MalformedFrame("stream ended early".into())),
    }
}

async fn recv_first(link: &mut BoxedLink, codec: &BatchCodec) -> Result<PacketData, CodecError> {
    let packets = recv_batch(link, codec).await?;
    let first = packets
        .into_iter()
        .next()
        .ok_or_else(|| CodecError::MalformedFrame("empty batch".into()))?;
    PacketData::parse(first)
}

/// Negotiates network settings and reads the login. Both steps share
/// `deadline`.
pub async fn process(
    mut link: BoxedLink,
    gateway: Arc<Gateway>,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    compression: Compression,
    deadline: Option<Instant>,
) -> Result<BedrockConn, ProcessError> {
    let mut codec = BatchCodec::new();
    let handshake = async {
        let rns = recv_first(&mut link, &codec).await?;
        let request: RequestNetworkSettings = rns.decode()?;

        let settings = NetworkSettings::new(compression).to_bytes();
        link.send(Bytes::from(codec.encode(&[settings])?)).await?;
        codec.enable_compression(compression, request.client_protocol);

        let login_data = recv_first(&mut link, &codec).await?;
        let login: Login = login_data.decode()?;
        let (identity, client) = bedrock_login::parse(&login.connection_request)?;
        Ok::<_, CodecError>((request, rns.full, login_data.full, identity, client))
    };

    let res = match deadline {
        Some(at) => time::timeout_at(at, handshake)
            .await
            .map_err(|_| ProcessError::Timeout)?,
        None => handshake.await,
    };
    let (request, rns, login, identity, client) = res?;

    Ok(BedrockConn {
        link,
        codec,
        gateway,
        remote_addr,
        local_addr,
        protocol_version: request.client_protocol,
        compression,
        request_network_settings: rns,
        login,
        username: identity.display_name,
        server_address: client.server_address,
    })
}

/// Routes a processed Bedrock connection.
pub async fn serve(bc: BedrockConn, shared: &Shared) {
    let key = bc.routing_key();
    let Some(found) = shared.router.resolve(&bc.gateway.id, &key) else {
        tracing::info!(
            gateway = %bc.gateway.id,
            remote = %bc.remote_addr,
            host = %key,
            "bedrock: server not found"
        );
        let msg = bc.template_vars().render(&bc.gateway.not_found_message);
        bc.disconnect(&msg).await;
        return;
    };

    let mut payload = bc.event_payload();
    payload.backend_id = Some(found.backend.id.clone());
    payload.matched_domain = Some(found.matched_domain.clone());
    if let Err(err) = shared.bus.request(Topic::PrePlayerJoin, payload.clone()).await {
        tracing::debug!(remote = %bc.remote_addr, err = %err, "bedrock: join vetoed");
        return;
    }

    let backend = Arc::clone(&found.backend);
    if backend.send_proxy_protocol {
        tracing::debug!(server = %backend.id, "bedrock: PROXY header not sent over RakNet");
    }
    let link: BoxedLink = match backend.dial_raknet().await {
        Ok(link) => Box::new(link),
        Err(err) => {
            tracing::info!(
                server = %backend.id,
                remote = %bc.remote_addr,
                err = %err,
                "bedrock: backend unreachable"
            );
            let msg = vars_for(&bc, &found).render(&backend.dial_timeout_message);
            bc.disconnect(&msg).await;
            payload.error = Some(err.to_string());
            shared.bus.push(Topic::ConnError, payload);
            return;
        }
    };

    let timeout = shared.settings.load().client_timeout;
    connect(bc, link, found, payload, shared, timeout).await;
}

fn vars_for(bc: &BedrockConn, found: &Match) -> TemplateVars {
    bc.template_vars()
        .set(template::MATCHED_ADDRESS, found.matched_domain.clone())
        .set(template::SERVER_ID, found.backend.id.clone())
}

async fn connect(
    mut bc: BedrockConn,
    mut upstream: BoxedLink,
    found: Match,
    mut payload: EventPayload,
    shared: &Shared,
    timeout: std::time::Duration,
) {
    let replay = replay_handshake(&mut bc, &mut upstream);
    let res = if timeout.is_zero() {
        replay.await
    } else {
        time::timeout(timeout, replay)
            .await
            .unwrap_or_else(|_| Err(std::io::Error::from(std::io::ErrorKind::TimedOut).into()))
    };
    if let Err(err) = res {
        tracing::debug!(server = %found.backend.id, err = %err, "bedrock: backend handshake failed");
        payload.error = Some(err.to_string());
        shared.bus.push(Topic::ConnError, payload);
        return;
    }

    let session = Arc::new(Session::new(
        Edition::Bedrock,
        bc.username.clone(),
        bc.remote_addr,
        bc.local_addr,
        bc.gateway.id.clone(),
        found.backend.id.clone(),
        found.matched_domain.clone(),
        bc.server_address.clone(),
        bc.protocol_version,
        shared.cancel.child_token(),
    ));
    let req = TunnelRequest {
        session,
        link: TunnelLink::Bedrock {
            client: bc.link,
            backend: upstream,
        },
    };
    if let Err(req) = shared.conn_pool.send(req).await {
        req.close();
    }
}

/// Replays the client's network settings request and login to the backend.
/// The backend must agree on the compression the client was given; any
/// packets batched after its NetworkSettings are passed on to the client.
async fn replay_handshake(bc: &mut BedrockConn, upstream: &mut BoxedLink) -> Result<(), CodecError> {
    let mut codec = BatchCodec::new().without_packet_limit();
    let rns = codec.encode(&[&bc.request_network_settings])?;
    upstream.send(Bytes::from(rns)).await?;

    let mut packets = recv_batch(upstream, &codec).await?.into_iter();
    let first = packets
        .next()
        .ok_or_else(|| CodecError::MalformedFrame("empty batch".into()))?;
    let settings: NetworkSettings = PacketData::parse(first)?.decode()?;
    if settings.compression != bc.compression {
        return Err(CodecError::Compression(format!(
            "backend chose {}, client uses {}",
            settings.compression.name(),
            bc.compression.name()
        )));
    }
    codec.enable_compression(settings.compression, bc.protocol_version);

    for packet in packets {
        bc.send(&packet).await?;
    }

    let login = codec.encode(&[&bc.login])?;
    upstream.send(Bytes::from(login)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrared::{
        codec::bedrock::ID_DISCONNECT, codec::bedrock_login::tests::connection_request,
        config::GatewayConfig, raknet::MemoryLink, server::tests::backend,
    };
    use std::time::Duration;

    const PROTOCOL: i32 = 671;

    fn gateway() -> Arc<Gateway> {
        Arc::new(Gateway::from_config(
            Edition::Bedrock,
            &GatewayConfig {
                id: "default".into(),
                binds: vec!["127.0.0.1:0".into()],
                receive_proxy_protocol: false,
                trusted_proxies: Vec::new(),
                receive_real_ip: false,
                server_not_found_message: "no {{serverDomain}} here".into(),
                server_not_found_status: None,
                rate_limit: None,
            },
        ))
    }

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:19132".parse().unwrap(),
        )
    }

    /// Plays the client side of the handshake on `player`.
    async fn client_login(player: &mut MemoryLink, name: &str, addr: &str) -> BatchCodec {
        let mut codec = BatchCodec::new();
        let rns = RequestNetworkSettings {
            client_protocol: PROTOCOL,
        }
        .to_bytes();
        player.send(Bytes::from(codec.encode(&[rns]).unwrap())).await.unwrap();

        let batch = player.recv().await.unwrap().unwrap();
        let settings: NetworkSettings = PacketData::parse(codec.decode(&batch).unwrap().remove(0))
            .unwrap()
            .decode()
            .unwrap();
        codec.enable_compression(settings.compression, PROTOCOL);

        let login = Login {
            client_protocol: PROTOCOL,
            connection_request: Bytes::from(connection_request(name, addr)),
        }
        .to_bytes();
        player.send(Bytes::from(codec.encode(&[login]).unwrap())).await.unwrap();
        codec
    }

    async fn processed(name: &str, addr: &str) -> (BedrockConn, MemoryLink, BatchCodec) {
        let (remote, local) = addrs();
        let (mut player, proxy_side) = MemoryLink::pair(remote, local);
        let process = tokio::spawn(process(
            Box::new(proxy_side),
            gateway(),
            remote,
            local,
            Compression::Flate,
            Some(Instant::now() + Duration::from_secs(2)),
        ));
        let codec = client_login(&mut player, name, addr).await;
        let bc = process.await.unwrap().unwrap();
        (bc, player, codec)
    }

    #[tokio::test]
    async fn process_negotiates_and_reads_login() {
        let (bc, _player, _) = processed("Steve", "Play.Example.com.:19132").await;
        assert_eq!(bc.username, "Steve");
        assert_eq!(bc.protocol_version, PROTOCOL);
        assert_eq!(bc.routing_key(), "play.example.com");
        assert_eq!(bc.codec.compression(), Some(Compression::Flate));
        let login: Login = PacketData::parse(bc.login.clone()).unwrap().decode().unwrap();
        assert_eq!(login.client_protocol, PROTOCOL);
    }

    #[tokio::test]
    async fn silent_client_times_out() {
        let (remote, local) = addrs();
        let (_player, proxy_side) = MemoryLink::pair(remote, local);
        let started = std::time::Instant::now();
        let err = process(
            Box::new(proxy_side),
            gateway(),
            remote,
            local,
            Compression::Flate,
            Some(Instant::now() + Duration::from_millis(200)),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ProcessError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn wrong_first_packet_is_rejected() {
        let (remote, local) = addrs();
        let (mut player, proxy_side) = MemoryLink::pair(remote, local);
        let login = Login {
            client_protocol: PROTOCOL,
            connection_request: Bytes::new(),
        }
        .to_bytes();
        player
            .send(Bytes::from(BatchCodec::new().encode(&[login]).unwrap()))
            .await
            .unwrap();
        let err = process(Box::new(proxy_side), gateway(), remote, local, Compression::Flate, None)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "unexpected_packet_id");
    }

    #[tokio::test]
    async fn disconnect_carries_the_rendered_message() {
        let (bc, mut player, codec) = processed("Steve", "nowhere.net").await;
        let msg = bc.template_vars().render(&bc.gateway.not_found_message);
        bc.disconnect(&msg).await;

        let batch = player.recv().await.unwrap().unwrap();
        let packet = PacketData::parse(codec.decode(&batch).unwrap().remove(0)).unwrap();
        assert_eq!(packet.id(), ID_DISCONNECT);
        let d: Disconnect = packet.decode().unwrap();
        assert_eq!(d.message, "no nowhere.net here");
    }

    #[tokio::test]
    async fn handshake_is_replayed_to_the_backend() {
        let (mut bc, mut player, client_codec) = processed("Alex", "mc.example.com").await;
        let (proxy_side, mut server): (BoxedLink, MemoryLink) = {
            let (a, b) = MemoryLink::pair(bc.local_addr, "127.0.0.1:19133".parse().unwrap());
            (Box::new(a), b)
        };
        let mut upstream = proxy_side;

        let fake_backend = tokio::spawn(async move {
            let mut codec = BatchCodec::new();
            let batch = server.recv().await.unwrap().unwrap();
            let rns = PacketData::parse(codec.decode(&batch).unwrap().remove(0)).unwrap();
            assert!(rns.decode::<RequestNetworkSettings>().is_ok());

            let settings = NetworkSettings::new(Compression::Flate).to_bytes();
            let extra = Disconnect::with_message("extra").to_bytes();
            server
                .send(Bytes::from(codec.encode(&[settings, extra]).unwrap()))
                .await
                .unwrap();
            codec.enable_compression(Compression::Flate, PROTOCOL);

            let batch = server.recv().await.unwrap().unwrap();
            let login: Login = PacketData::parse(codec.decode(&batch).unwrap().remove(0))
                .unwrap()
                .decode()
                .unwrap();
            login.client_protocol
        });

        replay_handshake(&mut bc, &mut upstream).await.unwrap();
        assert_eq!(fake_backend.await.unwrap(), PROTOCOL);

        let batch = player.recv().await.unwrap().unwrap();
        let forwarded: Disconnect = PacketData::parse(client_codec.decode(&batch).unwrap().remove(0))
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(forwarded.message, "extra");
    }

    #[tokio::test]
    async fn compression_mismatch_fails_the_replay() {
        let (mut bc, _player, _) = processed("Alex", "mc.example.com").await;
        let (a, mut server) = MemoryLink::pair(bc.local_addr, "127.0.0.1:19133".parse().unwrap());
        let mut upstream: BoxedLink = Box::new(a);

        tokio::spawn(async move {
            let _ = server.recv().await;
            let settings = NetworkSettings::new(Compression::Snappy).to_bytes();
            let _ = server
                .send(Bytes::from(BatchCodec::new().encode(&[settings]).unwrap()))
                .await;
        });

        let err = replay_handshake(&mut bc, &mut upstream).await.unwrap_err();
        assert_eq!(err.kind(), "compression");
    }

    #[test]
    fn vars_include_backend() {
        let found = Match {
            backend: Arc::new(backend("lobby", &["*"], "127.0.0.1:19133")),
            matched_domain: "*".into(),
        };
        let (remote, local) = addrs();
        let (_, link) = MemoryLink::pair(remote, local);
        let bc = BedrockConn {
            link: Box::new(link),
            codec: BatchCodec::new(),
            gateway: gateway(),
            remote_addr: remote,
            local_addr: local,
            protocol_version: PROTOCOL,
            compression: Compression::Flate,
            request_network_settings: Bytes::new(),
            login: Bytes::new(),
            username: "Steve".into(),
            server_address: "mc.example.com:19132".into(),
        };
        let vars = vars_for(&bc, &found);
        assert_eq!(vars.get(template::SERVER_ID), Some("lobby"));
        assert_eq!(vars.get(template::REQUESTED_ADDRESS), Some("mc.example.com:19132"));
        assert_eq!(vars.get(template::SERVER_DOMAIN), Some("mc.example.com"));
    }
}
