//! Live tunnel registry and player snapshots.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::infrared::gateway::Edition;

/// One live tunnel. Byte counters are updated by the copy tasks.
#[derive(Debug)]
pub struct Session {
    pub edition: Edition,
    pub username: String,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub gateway_id: String,
    pub backend_id: String,
    pub matched_domain: String,
    pub requested_addr: String,
    pub protocol_version: i32,
    pub started_at_unix_ms: u64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    cancel: CancellationToken,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        edition: Edition,
        username: String,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        gateway_id: String,
        backend_id: String,
        matched_domain: String,
        requested_addr: String,
        protocol_version: i32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            edition,
            username,
            remote_addr,
            local_addr,
            gateway_id,
            backend_id,
            matched_domain,
            requested_addr,
            protocol_version,
            started_at_unix_ms: crate::infrared::telemetry::now_unix_ms(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            cancel,
        }
    }

    /// Closes both sides of the tunnel.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            edition: self.edition,
            username: self.username.clone(),
            remote_addr: self.remote_addr.to_string(),
            local_addr: self.local_addr.to_string(),
            gateway_id: self.gateway_id.clone(),
            backend_id: self.backend_id.clone(),
            matched_domain: self.matched_domain.clone(),
            requested_addr: self.requested_addr.clone(),
            protocol_version: self.protocol_version,
            started_at_unix_ms: self.started_at_unix_ms,
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of a player for the management API.
#[derive(Debug, Clone, Serialize)]
pub struct PlayerInfo {
    pub edition: Edition,
    pub username: String,
    pub remote_addr: String,
    pub local_addr: String,
    pub gateway_id: String,
    pub backend_id: String,
    pub matched_domain: String,
    pub requested_addr: String,
    pub protocol_version: i32,
    pub started_at_unix_ms: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Tunnels keyed by client address.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SocketAddr, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, s: Arc<Session>) {
        self.sessions.insert(s.remote_addr, s);
    }

    pub fn remove(&self, remote_addr: &SocketAddr) -> Option<Arc<Session>> {
        self.sessions.remove(remote_addr).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<PlayerInfo> {
        let mut out: Vec<PlayerInfo> = self.sessions.iter().map(|s| s.info()).collect();
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }

    /// Players whose username matches `pattern`.
    pub fn matching(&self, pattern: &Regex) -> Vec<PlayerInfo> {
        let mut out: Vec<PlayerInfo> = self
            .sessions
            .iter()
            .filter(|s| pattern.is_match(&s.username))
            .map(|s| s.info())
            .collect();
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }

    /// Usernames compare case-insensitively.
    pub fn by_username(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions
            .iter()
            .find(|s| s.username.eq_ignore_ascii_case(name))
            .map(|s| Arc::clone(s.value()))
    }

    /// Cancels every tunnel; their tasks remove themselves.
    pub fn disconnect_all(&self) {
        for s in self.sessions.iter() {
            s.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(name: &str, port: u16) -> Arc<Session> {
        Arc::new(Session::new(
            Edition::Java,
            name.into(),
            SocketAddr::from(([127, 0, 0, 1], port)),
            SocketAddr::from(([127, 0, 0, 1], 25565)),
            "default".into(),
            "lobby".into(),
            "*.example.com".into(),
            "mc.example.com".into(),
            754,
            CancellationToken::new(),
        ))
    }

    #[test]
    fn lookup_by_name_and_pattern() {
        let reg = SessionRegistry::new();
        reg.add(session("Notch", 1000));
        reg.add(session("jeb_", 1001));
        reg.add(session("Dinnerbone", 1002));

        assert_eq!(reg.len(), 3);
        assert_eq!(reg.by_username("notch").unwrap().remote_addr.port(), 1000);
        assert!(reg.by_username("nobody").is_none());

        let re = Regex::new("^(Notch|jeb_)$").unwrap();
        let mut names: Vec<String> = reg.matching(&re).into_iter().map(|p| p.username).collect();
        names.sort();
        assert_eq!(names, vec!["Notch".to_string(), "jeb_".to_string()]);
    }

    #[test]
    fn disconnect_cancels_and_remove_prunes() {
        let reg = SessionRegistry::new();
        let s = session("Notch", 1000);
        reg.add(Arc::clone(&s));
        reg.by_username("Notch").unwrap().disconnect();
        assert!(s.cancel_token().is_cancelled());
        assert!(reg.remove(&s.remote_addr).is_some());
        assert!(reg.is_empty());
    }

    #[test]
    fn info_reads_live_counters() {
        let s = session("Notch", 1000);
        s.bytes_in.fetch_add(10, Ordering::Relaxed);
        s.bytes_out.fetch_add(20, Ordering::Relaxed);
        let info = s.info();
        assert_eq!((info.bytes_in, info.bytes_out), (10, 20));
    }
}
