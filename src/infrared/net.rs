use std::{borrow::Cow, net::SocketAddr};

/// Normalize a bind/listen address.
///
/// Configs commonly use the shorthand `":PORT"` to mean "bind on all
/// interfaces". `SocketAddr` parsing does not accept it, so it becomes
/// `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Canonical form used as the listener-manager key, so that `:25565`,
/// `0.0.0.0:25565` and ` 0.0.0.0:25565 ` share one socket.
pub fn canonical_bind(addr: &str) -> Result<SocketAddr, std::net::AddrParseError> {
    normalize_bind_addr(addr).parse::<SocketAddr>()
}

/// Splits `host[:port]`, understanding `[v6]:port`. Bare IPv6 literals are
/// returned whole.
pub fn split_host_port(addr: &str) -> (&str, Option<u16>) {
    let s = addr.trim();
    if let Some(rest) = s.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
        return (s, None);
    }
    match s.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(p) => (host, Some(p)),
            Err(_) => (host, None),
        },
        _ => (s, None),
    }
}

pub fn strip_port(addr: &str) -> &str {
    split_host_port(addr).0
}

pub fn upstream_needs_port(addr: &str) -> bool {
    // No ':' after the last ']' means no port.
    let s = addr.trim();
    if s.is_empty() {
        return false;
    }
    let after = if let Some(pos) = s.rfind(']') {
        &s[pos + 1..]
    } else {
        s
    };
    !after.contains(':')
}

/// Appends `default_port` when `addr` has none.
pub fn with_default_port(addr: &str, default_port: u16) -> String {
    let addr = addr.trim();
    if upstream_needs_port(addr) {
        format!("{addr}:{default_port}")
    } else {
        addr.to_string()
    }
}
