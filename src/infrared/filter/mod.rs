//! Gates run on every accepted connection before its handshake is read.

pub mod proxy_protocol;
pub mod rate_limit;

use std::{net::SocketAddr, sync::Arc};

use thiserror::Error;

use crate::infrared::conn::Conn;

pub use proxy_protocol::ProxyProtocolFilter;
pub use rate_limit::RateLimiter;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("rate limit exceeded for {0}")]
    RateLimitExceeded(SocketAddr),
    #[error("untrusted peer {0} sent a PROXY header")]
    UntrustedProxyHeader(SocketAddr),
    #[error("PROXY header required from {0}")]
    ProxyHeaderRequired(SocketAddr),
    #[error("invalid PROXY header: {0}")]
    InvalidProxyHeader(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FilterError {
    pub fn kind(&self) -> &'static str {
        match self {
            FilterError::RateLimitExceeded(_) => "rate_limited",
            FilterError::UntrustedProxyHeader(_) => "untrusted_proxy_header",
            FilterError::ProxyHeaderRequired(_) => "proxy_header_required",
            FilterError::InvalidProxyHeader(_) => "invalid_proxy_header",
            FilterError::Io(err) if err.kind() == std::io::ErrorKind::TimedOut => "timeout",
            FilterError::Io(_) => "io",
        }
    }
}

/// Per-gateway filter chain: PROXY header first so the limiter sees the real
/// client address, then the rate limiter.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    pub proxy_protocol: Option<ProxyProtocolFilter>,
    pub rate_limit: Option<Arc<RateLimiter>>,
}

impl FilterChain {
    pub fn is_empty(&self) -> bool {
        self.proxy_protocol.is_none() && self.rate_limit.is_none()
    }

    /// Runs both gates on a TCP connection and returns the client address.
    pub async fn apply(&self, conn: &mut Conn) -> Result<SocketAddr, FilterError> {
        let remote = match &self.proxy_protocol {
            Some(pp) => pp.apply(conn).await?,
            None => conn.peer_addr(),
        };
        self.check_rate(remote)?;
        Ok(remote)
    }

    /// Rate limiting alone, for transports without a byte-stream preface.
    pub fn check_rate(&self, remote: SocketAddr) -> Result<(), FilterError> {
        if let Some(rl) = &self.rate_limit
            && !rl.check(remote.ip())
        {
            metrics::counter!("infrared_rate_limited_total").increment(1);
            return Err(FilterError::RateLimitExceeded(remote));
        }
        Ok(())
    }
}
