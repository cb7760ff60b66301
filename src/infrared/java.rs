//! Java edition: handshake processing and the status/login routing paths.

use std::{net::SocketAddr, sync::Arc, time::SystemTime};

use tokio::{io::AsyncWriteExt, net::TcpStream, time::Instant};

use crate::infrared::{
    codec::{
        CodecError, Packet,
        java::{self, Handshake, LoginStart},
    },
    conn::{self, Conn},
    cpn::ProcessError,
    event::{EventPayload, Topic},
    gateway::{Edition, Gateway},
    proxy::{Settings, Shared},
    router::Match,
    session::Session,
    status::{StatusCacheKey, StatusOverride, StatusResponse},
    template::{self, TemplateVars},
    tunnel::{TunnelLink, TunnelRequest},
};

/// A Java client after its handshake and first request were read.
#[derive(Debug)]
pub struct JavaConn {
    pub conn: Conn,
    pub gateway: Arc<Gateway>,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub handshake: Handshake,
    /// The handshake and the packet after it, exactly as received.
    pub packets: [Packet; 2],
    pub login: Option<LoginStart>,
}

impl JavaConn {
    pub fn routing_key(&self) -> String {
        self.handshake.routing_key()
    }

    pub fn username(&self) -> &str {
        self.login.as_ref().map(|l| l.name.as_str()).unwrap_or_default()
    }

    pub fn is_login(&self) -> bool {
        self.handshake.is_login_request()
    }

    pub fn event_payload(&self) -> EventPayload {
        EventPayload {
            edition: Some(Edition::Java.name()),
            gateway_id: Some(self.gateway.id.clone()),
            remote_addr: Some(self.remote_addr.to_string()),
            local_addr: Some(self.local_addr.to_string()),
            requested_host: Some(self.routing_key()),
            username: self.login.as_ref().map(|l| l.name.clone()),
            protocol_version: Some(self.handshake.protocol_version),
            is_login_request: Some(self.is_login()),
            ..Default::default()
        }
    }

    pub fn template_vars(&self) -> TemplateVars {
        TemplateVars::new()
            .set(template::USERNAME, self.username())
            .set(template::SERVER_DOMAIN, self.routing_key())
            .set(template::GATEWAY_ID, self.gateway.id.clone())
            .set(template::REMOTE_ADDRESS, self.remote_addr.to_string())
            .set(template::LOCAL_ADDRESS, self.local_addr.to_string())
            .set(
                template::REQUESTED_ADDRESS,
                self.handshake.parse_server_address(),
            )
            .set(
                template::PROTOCOL_NUMBER,
                self.handshake.protocol_version.to_string(),
            )
            .with_time(SystemTime::now())
    }
}

struct Preamble {
    remote_addr: SocketAddr,
    handshake: Handshake,
    packets: [Packet; 2],
    login: Option<LoginStart>,
}

/// Reads the handshake and the status request or LoginStart. On failure the
/// connection is reset.
pub async fn process(
    stream: TcpStream,
    gateway: Arc<Gateway>,
    remote_addr: SocketAddr,
    deadline: Option<Instant>,
) -> Result<JavaConn, ProcessError> {
    let mut conn = Conn::new(stream).map_err(CodecError::from)?;
    conn.set_deadline(deadline);
    match read_preamble(&mut conn, &gateway, remote_addr).await {
        Ok(p) => {
            let local_addr = conn.local_addr();
            Ok(JavaConn {
                conn,
                gateway,
                remote_addr: p.remote_addr,
                local_addr,
                handshake: p.handshake,
                packets: p.packets,
                login: p.login,
            })
        }
        Err(err) => {
            conn.force_close();
            Err(err)
        }
    }
}

async fn read_preamble(
    conn: &mut Conn,
    gateway: &Gateway,
    mut remote_addr: SocketAddr,
) -> Result<Preamble, ProcessError> {
    if gateway.filters.proxy_protocol.is_some() {
        remote_addr = gateway.filters.apply(conn).await?;
    }

    let cap = if gateway.receive_real_ip {
        java::MAX_REAL_IP_HANDSHAKE_LEN
    } else {
        java::MAX_HANDSHAKE_LEN
    };
    let hs_packet = conn.read_packet(cap).await?;
    let handshake = Handshake::decode(&hs_packet)?;
    if gateway.receive_real_ip && handshake.is_real_ip_address() {
        remote_addr = handshake.parse_real_ip()?;
    }

    if handshake.is_status_request() {
        let request = conn.read_packet(java::MAX_STATUS_REQUEST_LEN).await?;
        java::decode_status_request(&request)?;
        return Ok(Preamble {
            remote_addr,
            handshake,
            packets: [hs_packet, request],
            login: None,
        });
    }
    if !handshake.is_login_request() {
        return Err(CodecError::MalformedFrame(format!(
            "unknown next state {}",
            handshake.next_state
        ))
        .into());
    }

    let login_packet = conn.read_packet(java::MAX_LOGIN_START_LEN).await?;
    let login = LoginStart::decode(&login_packet, handshake.protocol_version)?;
    Ok(Preamble {
        remote_addr,
        handshake,
        packets: [hs_packet, login_packet],
        login: Some(login),
    })
}

/// Routes a processed Java connection.
pub async fn serve(mut jc: JavaConn, shared: &Shared) {
    let settings = shared.settings.load_full();
    jc.conn.set_deadline(
        (!settings.client_timeout.is_zero()).then(|| Instant::now() + settings.client_timeout),
    );

    let key = jc.routing_key();
    let Some(found) = shared.router.resolve(&jc.gateway.id, &key) else {
        tracing::info!(
            gateway = %jc.gateway.id,
            remote = %jc.remote_addr,
            host = %key,
            "java: server not found"
        );
        not_found(jc).await;
        return;
    };

    let mut payload = jc.event_payload();
    payload.backend_id = Some(found.backend.id.clone());
    payload.matched_domain = Some(found.matched_domain.clone());
    if let Err(err) = shared.bus.request(Topic::PrePlayerJoin, payload.clone()).await {
        tracing::debug!(remote = %jc.remote_addr, err = %err, "java: join vetoed");
        jc.conn.force_close();
        return;
    }

    if jc.is_login() {
        login(jc, found, payload, shared, &settings).await;
    } else {
        status(jc, found, payload, shared, &settings).await;
    }
}

async fn not_found(mut jc: JavaConn) {
    let gateway = Arc::clone(&jc.gateway);
    if jc.is_login() {
        let msg = jc.template_vars().render(&gateway.not_found_message);
        let _ = jc
            .conn
            .write_packet(&java::login_disconnect(&java::text_component(&msg)))
            .await;
        let _ = jc.conn.shutdown().await;
        return;
    }

    let json = match gateway.not_found_status_json() {
        Some(json) => json.to_string(),
        None => StatusResponse {
            version_name: "Infrared".into(),
            protocol_number: jc.handshake.protocol_version,
            motd: gateway.not_found_message.clone(),
            ..Default::default()
        }
        .render(&jc.template_vars()),
    };
    if jc
        .conn
        .write_packet(&java::status_response(&json))
        .await
        .is_ok()
    {
        echo_ping(&mut jc.conn).await;
    }
    let _ = jc.conn.shutdown().await;
}

/// Answers the client's ping with the same payload.
async fn echo_ping(conn: &mut Conn) {
    let Ok(packet) = conn.read_packet(java::MAX_PING_LEN).await else {
        return;
    };
    if let Ok(payload) = java::decode_ping(&packet) {
        let _ = conn.write_packet(&java::ping(payload)).await;
    }
}

async fn status(
    mut jc: JavaConn,
    found: Match,
    mut payload: EventPayload,
    shared: &Shared,
    settings: &Settings,
) {
    let backend = &found.backend;
    let key = StatusCacheKey {
        backend_id: backend.id.clone(),
        protocol_version: jc.handshake.protocol_version,
    };
    let (client, local) = (jc.remote_addr, jc.local_addr);
    let handshake = jc.handshake.clone();
    let loaded = shared
        .status_cache
        .get_or_load(key, backend.status_cache_ttl, || async {
            backend
                .fetch_status(client, local, &handshake, settings.client_timeout)
                .await
        })
        .await;

    let vars = jc
        .template_vars()
        .set(template::MATCHED_ADDRESS, found.matched_domain.clone())
        .set(template::SERVER_ID, backend.id.clone());

    let frame = match loaded {
        Ok(frame) => overlay(&frame, backend.override_status.as_ref(), &vars),
        Err(err) => {
            tracing::debug!(server = %backend.id, err = %err, "java: status dial failed");
            payload.error = Some(err.to_string());
            shared.bus.push(Topic::ConnError, payload);
            match &backend.dial_timeout_status {
                Some(st) => java::status_response(&st.render(&vars)).encode(),
                None => {
                    jc.conn.force_close();
                    return;
                }
            }
        }
    };

    if jc.conn.write_all(&frame).await.is_ok() {
        echo_ping(&mut jc.conn).await;
    }
    let _ = jc.conn.shutdown().await;
}

/// Applies the status override to a raw response frame. Frames that cannot
/// be decoded are passed on unchanged.
fn overlay(
    frame: &[u8],
    ovr: Option<&StatusOverride>,
    vars: &TemplateVars,
) -> Vec<u8> {
    let Some(ovr) = ovr else {
        return frame.to_vec();
    };
    let Ok(Some((packet, _))) = Packet::decode_frame(frame, java::MAX_STATUS_RESPONSE_LEN) else {
        return frame.to_vec();
    };
    let Ok(json) = java::decode_status_response(&packet) else {
        return frame.to_vec();
    };
    match ovr.apply_to_raw(&json, vars) {
        Ok(json) => java::status_response(&json).encode(),
        Err(err) => {
            tracing::debug!(err = %err, "java: backend status is not valid JSON");
            frame.to_vec()
        }
    }
}

async fn login(
    mut jc: JavaConn,
    found: Match,
    mut payload: EventPayload,
    shared: &Shared,
    settings: &Settings,
) {
    let backend = Arc::clone(&found.backend);
    let mut upstream = match backend.connect_java(jc.remote_addr, jc.local_addr).await {
        Ok(s) => s,
        Err(err) => {
            tracing::info!(
                server = %backend.id,
                remote = %jc.remote_addr,
                err = %err,
                "java: backend unreachable"
            );
            let msg = jc
                .template_vars()
                .set(template::MATCHED_ADDRESS, found.matched_domain.clone())
                .set(template::SERVER_ID, backend.id.clone())
                .render(&backend.dial_timeout_message);
            let _ = jc
                .conn
                .write_packet(&java::login_disconnect(&java::text_component(&msg)))
                .await;
            let _ = jc.conn.shutdown().await;
            payload.error = Some(err.to_string());
            shared.bus.push(Topic::ConnError, payload);
            return;
        }
    };

    let handshake = backend.forwarded_handshake(&jc.handshake, jc.remote_addr);
    let mut preface = handshake.encode().encode();
    jc.packets[1].encode_into(&mut preface);
    let write = upstream.write_all(&preface);
    let written = if settings.client_timeout.is_zero() {
        write.await
    } else {
        tokio::time::timeout(settings.client_timeout, write)
            .await
            .unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into()))
    };
    if let Err(err) = written {
        tracing::debug!(server = %backend.id, err = %err, "java: writing handshake to backend failed");
        conn::force_close(upstream);
        jc.conn.force_close();
        payload.error = Some(err.to_string());
        shared.bus.push(Topic::ConnError, payload);
        return;
    }

    jc.conn.set_deadline(None);
    let session = Arc::new(Session::new(
        Edition::Java,
        jc.username().to_string(),
        jc.remote_addr,
        jc.local_addr,
        jc.gateway.id.clone(),
        backend.id.clone(),
        found.matched_domain.clone(),
        jc.handshake.parse_server_address().to_string(),
        jc.handshake.protocol_version,
        shared.cancel.child_token(),
    ));
    let req = TunnelRequest {
        session,
        link: TunnelLink::Java {
            client: jc.conn,
            backend: upstream,
        },
    };
    if let Err(req) = shared.conn_pool.send(req).await {
        req.close();
    }
}
