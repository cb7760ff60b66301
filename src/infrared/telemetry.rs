use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::infrared::gateway::Edition;

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn now_unix_secs() -> u64 {
    now_unix_ms() / 1000
}

#[derive(Debug, Clone, Default)]
pub struct ReloadSignal {
    // Monotonic counter; increment indicates a reload request.
    pub seq: u64,
}

impl ReloadSignal {
    pub fn new() -> Self {
        Self { seq: 0 }
    }

    pub fn next(&mut self) {
        self.seq = self.seq.wrapping_add(1);
    }
}

pub fn connection_accepted(edition: Edition) {
    metrics::counter!("infrared_connections_total", "edition" => edition.name()).increment(1);
}

pub fn processing_failed(kind: &'static str) {
    metrics::counter!("infrared_processing_failures_total", "kind" => kind).increment(1);
}

pub fn status_cache_hit() {
    metrics::counter!("infrared_status_cache_hits_total").increment(1);
}

pub fn status_cache_miss() {
    metrics::counter!("infrared_status_cache_misses_total").increment(1);
}

pub fn bytes_forwarded(edition: Edition, direction: &'static str, n: u64) {
    metrics::counter!(
        "infrared_bytes_total",
        "edition" => edition.name(),
        "direction" => direction
    )
    .increment(n);
}

/// Holds `infrared_active_tunnels` up while alive.
pub struct ActiveTunnelGuard {
    edition: Edition,
}

impl ActiveTunnelGuard {
    pub fn new(edition: Edition) -> Self {
        metrics::gauge!("infrared_active_tunnels", "edition" => edition.name()).increment(1.0);
        Self { edition }
    }
}

impl Drop for ActiveTunnelGuard {
    fn drop(&mut self) {
        metrics::gauge!("infrared_active_tunnels", "edition" => self.edition.name())
            .decrement(1.0);
    }
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reload_signal_counts_up() {
        let mut sig = ReloadSignal::new();
        sig.next();
        sig.next();
        assert_eq!(sig.seq, 2);
    }

    #[test]
    fn clock_is_past_2024() {
        assert!(now_unix_secs() > 1_704_067_200);
    }
}
