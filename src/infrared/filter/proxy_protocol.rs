//! PROXY protocol v1/v2 parsing and generation, plus the trusted-peer policy.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use ipnetwork::IpNetwork;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::FilterError;
use crate::infrared::conn::Conn;

/// Signature: "\r\n\r\n\0\r\nQUIT\n"
pub const V2_SIGNATURE: [u8; 12] = [13, 10, 13, 10, 0, 13, 10, 81, 85, 73, 84, 10];
const V1_PREFIX: &[u8] = b"PROXY ";
const V1_MAX_LEN: usize = 107;
const V2_HEADER_LEN: usize = 16;
const V2_MAX_ADDR_LEN: usize = 216 + 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    V1,
    #[default]
    V2,
}

/// Addresses carried by a PROXY header. `None` for LOCAL/UNKNOWN headers,
/// which keep the observed peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    pub version: Version,
    pub addrs: Option<(SocketAddr, SocketAddr)>,
}

impl ProxyHeader {
    pub fn source(&self) -> Option<SocketAddr> {
        self.addrs.map(|(src, _)| src)
    }
}

/// Parses a v2 header from the front of `buf`. `Ok(None)` means more bytes
/// are needed.
pub fn parse_v2(buf: &[u8]) -> Result<Option<(ProxyHeader, usize)>, FilterError> {
    if buf.len() < V2_HEADER_LEN {
        if !V2_SIGNATURE.starts_with(&buf[..buf.len().min(V2_SIGNATURE.len())]) {
            return Err(FilterError::InvalidProxyHeader("bad v2 signature".into()));
        }
        return Ok(None);
    }
    if buf[..12] != V2_SIGNATURE {
        return Err(FilterError::InvalidProxyHeader("bad v2 signature".into()));
    }
    let ver_cmd = buf[12];
    if ver_cmd >> 4 != 0x2 {
        return Err(FilterError::InvalidProxyHeader(format!(
            "unsupported version {:#x}",
            ver_cmd >> 4
        )));
    }
    let fam = buf[13];
    let len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    if len > V2_MAX_ADDR_LEN {
        return Err(FilterError::InvalidProxyHeader(format!(
            "address block of {len} bytes"
        )));
    }
    let total = V2_HEADER_LEN + len;
    if buf.len() < total {
        return Ok(None);
    }
    let body = &buf[V2_HEADER_LEN..total];

    let addrs = match ver_cmd & 0x0F {
        // LOCAL: health checks from the proxy itself.
        0x0 => None,
        0x1 => match fam >> 4 {
            0x1 => {
                if body.len() < 12 {
                    return Err(FilterError::InvalidProxyHeader("short inet block".into()));
                }
                let src = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                let dst = Ipv4Addr::new(body[4], body[5], body[6], body[7]);
                let sport = u16::from_be_bytes([body[8], body[9]]);
                let dport = u16::from_be_bytes([body[10], body[11]]);
                Some((
                    SocketAddr::new(IpAddr::V4(src), sport),
                    SocketAddr::new(IpAddr::V4(dst), dport),
                ))
            }
            0x2 => {
                if body.len() < 36 {
                    return Err(FilterError::InvalidProxyHeader("short inet6 block".into()));
                }
                let mut src = [0u8; 16];
                let mut dst = [0u8; 16];
                src.copy_from_slice(&body[0..16]);
                dst.copy_from_slice(&body[16..32]);
                let sport = u16::from_be_bytes([body[32], body[33]]);
                let dport = u16::from_be_bytes([body[34], body[35]]);
                Some((
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), sport),
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst)), dport),
                ))
            }
            _ => None,
        },
        cmd => {
            return Err(FilterError::InvalidProxyHeader(format!(
                "unknown command {cmd:#x}"
            )));
        }
    };

    Ok(Some((
        ProxyHeader {
            version: Version::V2,
            addrs,
        },
        total,
    )))
}

/// Parses a v1 text header (`PROXY TCP4 src dst sport dport\r\n`).
pub fn parse_v1(buf: &[u8]) -> Result<Option<(ProxyHeader, usize)>, FilterError> {
    let Some(end) = buf.windows(2).position(|w| w == b"\r\n") else {
        if buf.len() >= V1_MAX_LEN {
            return Err(FilterError::InvalidProxyHeader("v1 line too long".into()));
        }
        return Ok(None);
    };
    if end + 2 > V1_MAX_LEN {
        return Err(FilterError::InvalidProxyHeader("v1 line too long".into()));
    }
    let line = std::str::from_utf8(&buf[..end])
        .map_err(|_| FilterError::InvalidProxyHeader("v1 header is not ascii".into()))?;
    let mut parts = line.split(' ');
    if parts.next() != Some("PROXY") {
        return Err(FilterError::InvalidProxyHeader("missing PROXY keyword".into()));
    }
    let proto = parts.next().unwrap_or_default();
    let addrs = match proto {
        "UNKNOWN" => None,
        "TCP4" | "TCP6" => {
            let fields: Vec<&str> = parts.collect();
            let [src, dst, sport, dport] = fields.as_slice() else {
                return Err(FilterError::InvalidProxyHeader(format!(
                    "v1 header has {} address fields",
                    fields.len()
                )));
            };
            let bad = |what: &str| FilterError::InvalidProxyHeader(format!("v1 {what}"));
            let src: IpAddr = src.parse().map_err(|_| bad("source address"))?;
            let dst: IpAddr = dst.parse().map_err(|_| bad("destination address"))?;
            let sport: u16 = sport.parse().map_err(|_| bad("source port"))?;
            let dport: u16 = dport.parse().map_err(|_| bad("destination port"))?;
            if (proto == "TCP4") != src.is_ipv4() || src.is_ipv4() != dst.is_ipv4() {
                return Err(bad("address family"));
            }
            Some((SocketAddr::new(src, sport), SocketAddr::new(dst, dport)))
        }
        other => {
            return Err(FilterError::InvalidProxyHeader(format!(
                "v1 protocol {other:?}"
            )));
        }
    };
    Ok(Some((
        ProxyHeader {
            version: Version::V1,
            addrs,
        },
        end + 2,
    )))
}

pub fn encode_v2(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(V2_HEADER_LEN + 36);
    out.extend_from_slice(&V2_SIGNATURE);

    // ver=2 | cmd=PROXY
    out.push(0x21);

    match (to_canonical(src.ip()), to_canonical(dst.ip())) {
        (IpAddr::V4(sip), IpAddr::V4(dip)) => {
            // INET | STREAM
            out.push(0x11);
            out.extend_from_slice(&12u16.to_be_bytes());
            out.extend_from_slice(&sip.octets());
            out.extend_from_slice(&dip.octets());
        }
        (sip, dip) => {
            // INET6 | STREAM
            out.push(0x21);
            out.extend_from_slice(&36u16.to_be_bytes());
            out.extend_from_slice(&to_v6(sip).octets());
            out.extend_from_slice(&to_v6(dip).octets());
        }
    }
    out.extend_from_slice(&src.port().to_be_bytes());
    out.extend_from_slice(&dst.port().to_be_bytes());
    out
}

pub fn encode_v1(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    let (src_ip, dst_ip) = (to_canonical(src.ip()), to_canonical(dst.ip()));
    let (proto, src_ip, dst_ip) = match (src_ip, dst_ip) {
        (IpAddr::V4(_), IpAddr::V4(_)) => ("TCP4", src_ip, dst_ip),
        _ => (
            "TCP6",
            IpAddr::V6(to_v6(src_ip)),
            IpAddr::V6(to_v6(dst_ip)),
        ),
    };
    format!(
        "PROXY {proto} {src_ip} {dst_ip} {} {}\r\n",
        src.port(),
        dst.port()
    )
    .into_bytes()
}

pub fn encode(version: Version, src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    match version {
        Version::V1 => encode_v1(src, dst),
        Version::V2 => encode_v2(src, dst),
    }
}

pub async fn write_header<W>(
    w: &mut W,
    version: Version,
    src: SocketAddr,
    dst: SocketAddr,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    w.write_all(&encode(version, src, dst)).await?;
    w.flush().await
}

fn to_canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

fn to_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Matches `buf` against `prefix`, reading just enough to decide.
async fn sniff(conn: &mut Conn, prefix: &[u8]) -> std::io::Result<bool> {
    for i in 1..=prefix.len() {
        let got = conn.peek(i).await?;
        if got.len() < i || got[i - 1] != prefix[i - 1] {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Reads and consumes a PROXY header if the connection starts with one.
pub async fn read_header(conn: &mut Conn) -> Result<Option<ProxyHeader>, FilterError> {
    let parse: fn(&[u8]) -> Result<Option<(ProxyHeader, usize)>, FilterError> =
        if sniff(conn, &V2_SIGNATURE).await? {
            parse_v2
        } else if sniff(conn, V1_PREFIX).await? {
            parse_v1
        } else {
            return Ok(None);
        };

    let mut want = V2_HEADER_LEN;
    loop {
        let buf = conn.peek(want).await?;
        let got = buf.len();
        match parse(buf)? {
            Some((header, used)) => {
                conn.consume(used);
                return Ok(Some(header));
            }
            None if got < want => {
                return Err(FilterError::InvalidProxyHeader(
                    "connection closed inside header".into(),
                ));
            }
            None => {
                // v2 tells us the full length, v1 grows to the line limit.
                want = if conn.buffered().starts_with(&V2_SIGNATURE) && got >= V2_HEADER_LEN {
                    let b = conn.buffered();
                    V2_HEADER_LEN + u16::from_be_bytes([b[14], b[15]]) as usize
                } else {
                    (want + 16).min(V1_MAX_LEN)
                };
            }
        }
    }
}

/// Receive-side policy for one gateway.
///
/// Trusted peers must open with a header; untrusted peers must not send one.
/// An empty trust list trusts every peer.
#[derive(Debug, Clone, Default)]
pub struct ProxyProtocolFilter {
    trusted: Vec<IpNetwork>,
}

impl ProxyProtocolFilter {
    pub fn new(trusted: Vec<IpNetwork>) -> Self {
        Self { trusted }
    }

    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        let ip = to_canonical(ip);
        self.trusted.is_empty() || self.trusted.iter().any(|net| net.contains(ip))
    }

    /// Returns the client address declared by the header, or the observed
    /// peer address when the header carries none.
    pub async fn apply(&self, conn: &mut Conn) -> Result<SocketAddr, FilterError> {
        let peer = conn.peer_addr();
        let header = read_header(conn).await?;
        if !self.is_trusted(peer.ip()) {
            if header.is_some() {
                return Err(FilterError::UntrustedProxyHeader(peer));
            }
            return Ok(peer);
        }
        match header {
            Some(h) => Ok(h.source().unwrap_or(peer)),
            None => Err(FilterError::ProxyHeaderRequired(peer)),
        }
    }
}
