//! Sliding-window connection rate limiter keyed by client IP.

use std::{
    net::IpAddr,
    sync::Mutex,
    time::{Duration, Instant},
};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
struct Count {
    value: u32,
    updated_at: Instant,
}

/// Admits at most `request_limit` new connections per key and window.
///
/// The rate for the current window is interpolated from the previous one:
/// `prev * (W - elapsed) / W + curr`.
#[derive(Debug)]
pub struct RateLimiter {
    request_limit: u32,
    window: Duration,
    epoch: Instant,
    counters: DashMap<(String, u64), Count>,
    last_evict: Mutex<Instant>,
}

/// IPv4 addresses are keyed as-is, IPv6 addresses by their /64 prefix.
pub fn key_by_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => {
                let masked = u128::from(v6) & (u128::MAX << 64);
                std::net::Ipv6Addr::from(masked).to_string()
            }
        },
    }
}

impl RateLimiter {
    pub fn new(request_limit: u32, window: Duration) -> Self {
        let now = Instant::now();
        Self {
            request_limit,
            window: window.max(Duration::from_millis(1)),
            epoch: now,
            counters: DashMap::new(),
            last_evict: Mutex::new(now),
        }
    }

    pub fn request_limit(&self) -> u32 {
        self.request_limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn check(&self, ip: IpAddr) -> bool {
        self.check_at(&key_by_ip(ip), Instant::now())
    }

    /// Returns `true` and counts the connection if it is admitted.
    pub fn check_at(&self, key: &str, now: Instant) -> bool {
        self.evict(now);

        let elapsed = now.saturating_duration_since(self.epoch);
        let window_ns = self.window.as_nanos();
        let current = (elapsed.as_nanos() / window_ns) as u64;
        let diff = elapsed.as_nanos() - current as u128 * window_ns;

        let curr = self.get(key, current);
        let prev = match current.checked_sub(1) {
            Some(w) => self.get(key, w),
            None => 0,
        };
        let rate = prev as f64 * (window_ns - diff) as f64 / window_ns as f64 + curr as f64;
        if rate.round() as u64 >= self.request_limit as u64 {
            return false;
        }

        let mut entry = self
            .counters
            .entry((key.to_string(), current))
            .or_insert(Count {
                value: 0,
                updated_at: now,
            });
        entry.value += 1;
        entry.updated_at = now;
        true
    }

    fn get(&self, key: &str, window: u64) -> u32 {
        self.counters
            .get(&(key.to_string(), window))
            .map(|c| c.value)
            .unwrap_or(0)
    }

    fn evict(&self, now: Instant) {
        let ttl = self.window * 3;
        {
            let Ok(mut last) = self.last_evict.lock() else {
                return;
            };
            if now.saturating_duration_since(*last) < ttl {
                return;
            }
            *last = now;
        }
        self.counters
            .retain(|_, c| now.saturating_duration_since(c.updated_at) < ttl);
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}
