//! Backends and the dialer.

use std::{io, net::SocketAddr, time::Duration};

use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    time,
};

use crate::infrared::{
    codec::{
        CodecError,
        java::{self, Handshake},
        packet::{Packet, read_packet},
    },
    config::{DEFAULT_BEDROCK_PORT, DEFAULT_JAVA_PORT, ServerConfig},
    filter::proxy_protocol::{self, Version},
    gateway::Edition,
    net,
    raknet::RaknetLink,
    status::{StatusOverride, StatusResponse},
    telemetry,
};

#[derive(Debug, Error)]
pub enum DialError {
    #[error("dial {addr}: timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
    #[error("dial {addr}: {source}")]
    Refused {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("backend {addr}: {source}")]
    Protocol {
        addr: String,
        #[source]
        source: CodecError,
    },
}

impl DialError {
    pub fn kind(&self) -> &'static str {
        match self {
            DialError::Timeout { .. } => "dial_timeout",
            DialError::Refused { .. } => "dial_refused",
            DialError::Protocol { .. } => "backend_protocol",
        }
    }
}

/// A routable backend. Immutable; a reload builds fresh ones.
#[derive(Debug, Clone)]
pub struct Backend {
    pub id: String,
    pub edition: Edition,
    pub domains: Vec<String>,
    /// Gateways this backend is reachable from. Empty means every gateway.
    pub gateways: Vec<String>,
    /// `host:port`, port defaulted per edition.
    pub address: String,
    pub send_proxy_protocol: bool,
    pub send_real_ip: bool,
    pub override_address: bool,
    pub dial_timeout: Duration,
    pub dial_timeout_message: String,
    pub dial_timeout_status: Option<StatusResponse>,
    pub override_status: Option<StatusOverride>,
    pub status_cache_ttl: Duration,
}

impl Backend {
    pub fn from_config(edition: Edition, cfg: &ServerConfig) -> Self {
        let default_port = match edition {
            Edition::Java => DEFAULT_JAVA_PORT,
            Edition::Bedrock => DEFAULT_BEDROCK_PORT,
        };
        Self {
            id: cfg.id.clone(),
            edition,
            domains: cfg.domains.clone(),
            gateways: cfg.gateways.clone(),
            address: net::with_default_port(&cfg.address, default_port),
            send_proxy_protocol: cfg.send_proxy_protocol,
            send_real_ip: cfg.send_real_ip,
            override_address: cfg.override_address,
            dial_timeout: cfg.dial_timeout,
            dial_timeout_message: cfg.dial_timeout_message.clone(),
            dial_timeout_status: cfg.dial_timeout_status.clone(),
            override_status: cfg.override_status.clone(),
            status_cache_ttl: cfg.status_cache_ttl,
        }
    }

    pub fn serves_gateway(&self, gateway_id: &str) -> bool {
        self.gateways.is_empty() || self.gateways.iter().any(|g| g == gateway_id)
    }

    pub fn host(&self) -> &str {
        net::strip_port(&self.address)
    }

    pub fn port(&self) -> u16 {
        net::split_host_port(&self.address).1.unwrap_or(match self.edition {
            Edition::Java => DEFAULT_JAVA_PORT,
            Edition::Bedrock => DEFAULT_BEDROCK_PORT,
        })
    }

    pub async fn dial_tcp(&self) -> Result<TcpStream, DialError> {
        let connect = TcpStream::connect(self.address.as_str());
        let res = if self.dial_timeout > Duration::ZERO {
            time::timeout(self.dial_timeout, connect)
                .await
                .map_err(|_| DialError::Timeout {
                    addr: self.address.clone(),
                    timeout: self.dial_timeout,
                })?
        } else {
            connect.await
        };
        let stream = res.map_err(|source| DialError::Refused {
            addr: self.address.clone(),
            source,
        })?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    pub async fn dial_raknet(&self) -> Result<RaknetLink, DialError> {
        let refused = |source: io::Error| DialError::Refused {
            addr: self.address.clone(),
            source,
        };
        let addr = tokio::net::lookup_host(self.address.as_str())
            .await
            .map_err(refused)?
            .next()
            .ok_or_else(|| refused(io::Error::new(io::ErrorKind::NotFound, "no address")))?;
        RaknetLink::connect(addr, self.dial_timeout)
            .await
            .map_err(|err| match err.kind() {
                io::ErrorKind::TimedOut => DialError::Timeout {
                    addr: self.address.clone(),
                    timeout: self.dial_timeout,
                },
                _ => refused(err),
            })
    }

    /// The handshake as the backend should see it.
    pub fn forwarded_handshake(&self, hs: &Handshake, client: SocketAddr) -> Handshake {
        let mut hs = hs.clone();
        if self.override_address {
            hs.set_server_address(self.host());
            hs.server_port = self.port();
        }
        if self.send_real_ip {
            hs.upgrade_to_real_ip(client, telemetry::now_unix_secs());
        }
        hs
    }

    /// Dials and writes the optional PROXY header describing `client`.
    pub async fn connect_java(
        &self,
        client: SocketAddr,
        proxy_local: SocketAddr,
    ) -> Result<TcpStream, DialError> {
        let mut stream = self.dial_tcp().await?;
        if self.send_proxy_protocol {
            let dst = stream.peer_addr().unwrap_or(proxy_local);
            proxy_protocol::write_header(&mut stream, Version::V2, client, dst)
                .await
                .map_err(|source| DialError::Refused {
                    addr: self.address.clone(),
                    source,
                })?;
        }
        Ok(stream)
    }

    /// Asks the backend for its status and returns the raw response frame.
    pub async fn fetch_status(
        &self,
        client: SocketAddr,
        proxy_local: SocketAddr,
        handshake: &Handshake,
        read_timeout: Duration,
    ) -> Result<Vec<u8>, DialError> {
        let mut stream = self.connect_java(client, proxy_local).await?;
        let protocol = |source: CodecError| DialError::Protocol {
            addr: self.address.clone(),
            source,
        };

        let hs = self.forwarded_handshake(handshake, client);
        let mut out = hs.encode().encode();
        java::status_request().encode_into(&mut out);
        stream
            .write_all(&out)
            .await
            .map_err(|e| protocol(e.into()))?;

        let read = read_packet(&mut stream, java::MAX_STATUS_RESPONSE_LEN);
        let packet: Packet = if read_timeout > Duration::ZERO {
            time::timeout(read_timeout, read)
                .await
                .map_err(|_| DialError::Timeout {
                    addr: self.address.clone(),
                    timeout: read_timeout,
                })?
                .map_err(protocol)?
        } else {
            read.await.map_err(protocol)?
        };
        java::decode_status_response(&packet).map_err(protocol)?;
        let _ = stream.shutdown().await;
        Ok(packet.encode())
    }
}
