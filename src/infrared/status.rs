//! Status responses: configured replacements, backend overlays and the
//! per-(backend, protocol) response cache.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::time::Instant;

use crate::infrared::{
    codec::java::{self, PlayerSample, StatusJson, StatusPlayers, StatusVersion},
    telemetry,
    template::TemplateVars,
};

/// A complete status served without asking a backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusResponse {
    pub version_name: String,
    pub protocol_number: i32,
    pub max_player_count: i32,
    pub player_count: i32,
    pub player_sample: Vec<PlayerSample>,
    pub motd: String,
    pub favicon: Option<String>,
}

impl StatusResponse {
    pub fn to_json(&self, vars: &TemplateVars) -> StatusJson {
        StatusJson {
            version: StatusVersion {
                name: self.version_name.clone(),
                protocol: self.protocol_number,
            },
            players: StatusPlayers {
                max: self.max_player_count,
                online: self.player_count,
                sample: (!self.player_sample.is_empty()).then(|| self.player_sample.clone()),
            },
            description: description(&vars.render(&self.motd)),
            favicon: self.favicon.clone(),
            extra: Default::default(),
        }
    }

    pub fn render(&self, vars: &TemplateVars) -> String {
        serde_json::to_string(&self.to_json(vars)).unwrap_or_default()
    }
}

/// Fields replaced in a backend's live status. `None` leaves the backend value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusOverride {
    pub version_name: Option<String>,
    pub protocol_number: Option<i32>,
    pub max_player_count: Option<i32>,
    pub player_count: Option<i32>,
    pub player_sample: Option<Vec<PlayerSample>>,
    pub motd: Option<String>,
    pub favicon: Option<String>,
}

impl StatusOverride {
    pub fn apply(&self, status: &mut StatusJson, vars: &TemplateVars) {
        if let Some(v) = &self.version_name {
            status.version.name = v.clone();
        }
        if let Some(v) = self.protocol_number {
            status.version.protocol = v;
        }
        if let Some(v) = self.max_player_count {
            status.players.max = v;
        }
        if let Some(v) = self.player_count {
            status.players.online = v;
        }
        if let Some(v) = &self.player_sample {
            status.players.sample = Some(v.clone());
        }
        if let Some(v) = &self.motd {
            status.description = description(&vars.render(v));
        }
        if let Some(v) = &self.favicon {
            status.favicon = Some(v.clone());
        }
    }

    /// Decodes a raw status response body, overlays it and re-encodes it.
    pub fn apply_to_raw(
        &self,
        raw_json: &str,
        vars: &TemplateVars,
    ) -> Result<String, serde_json::Error> {
        let mut status: StatusJson = serde_json::from_str(raw_json)?;
        self.apply(&mut status, vars);
        serde_json::to_string(&status)
    }
}

fn description(msg: &str) -> serde_json::Value {
    serde_json::from_str(&java::text_component(msg))
        .unwrap_or_else(|_| serde_json::json!({ "text": msg }))
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct StatusCacheKey {
    pub backend_id: String,
    pub protocol_version: i32,
}

#[derive(Debug, Clone)]
struct StatusCacheItem {
    expires_at: Instant,
    data: Arc<Vec<u8>>,
}

type LoadResult<E> = Result<Arc<Vec<u8>>, Arc<E>>;

struct InFlight<E> {
    done: AtomicBool,
    notify: tokio::sync::Notify,
    // Ok(data) is cached; Err is not cached, but is shared with concurrent waiters.
    result: tokio::sync::Mutex<Option<LoadResult<E>>>,
}

impl<E> InFlight<E> {
    fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
            result: tokio::sync::Mutex::new(None),
        }
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn finish(&self) {
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Caches raw status response frames per backend and client protocol version.
///
/// Expiry is lazy. Concurrent misses for one key share a single load, and
/// failed loads are not cached.
pub struct StatusCache<E> {
    items: tokio::sync::Mutex<HashMap<StatusCacheKey, StatusCacheItem>>,
    inflight: std::sync::Mutex<HashMap<StatusCacheKey, Arc<InFlight<E>>>>,
}

impl<E> Default for StatusCache<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases waiters even when the loading task is dropped mid-load.
struct LoadGuard<'a, E> {
    inflight: &'a std::sync::Mutex<HashMap<StatusCacheKey, Arc<InFlight<E>>>>,
    key: &'a StatusCacheKey,
    flight: Arc<InFlight<E>>,
}

impl<E> Drop for LoadGuard<'_, E> {
    fn drop(&mut self) {
        if let Ok(mut m) = self.inflight.lock() {
            m.remove(self.key);
        }
        self.flight.finish();
    }
}

impl<E> StatusCache<E> {
    pub fn new() -> Self {
        Self {
            items: tokio::sync::Mutex::new(HashMap::new()),
            inflight: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &StatusCacheKey) -> Option<Arc<Vec<u8>>> {
        let mut items = self.items.lock().await;
        let it = items.get(key)?.clone();
        if Instant::now() >= it.expires_at {
            items.remove(key);
            return None;
        }
        Some(it.data)
    }

    pub async fn set(&self, key: StatusCacheKey, data: Arc<Vec<u8>>, ttl: Duration) {
        if ttl.is_zero() || data.is_empty() {
            return;
        }
        let mut items = self.items.lock().await;
        items.insert(
            key,
            StatusCacheItem {
                expires_at: Instant::now() + ttl,
                data,
            },
        );
    }

    /// Drops every expired entry.
    pub async fn sweep(&self) {
        let now = Instant::now();
        self.items.lock().await.retain(|_, it| it.expires_at > now);
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    fn join_or_lead(&self, key: &StatusCacheKey) -> (Arc<InFlight<E>>, bool) {
        let Ok(mut inflight) = self.inflight.lock() else {
            return (Arc::new(InFlight::new()), true);
        };
        if let Some(existing) = inflight.get(key) {
            return (existing.clone(), false);
        }
        let f = Arc::new(InFlight::new());
        inflight.insert(key.clone(), f.clone());
        (f, true)
    }

    pub async fn get_or_load<F, Fut>(
        &self,
        key: StatusCacheKey,
        ttl: Duration,
        load: F,
    ) -> LoadResult<E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
    {
        if ttl.is_zero() {
            return load().await.map(Arc::new).map_err(Arc::new);
        }
        if let Some(v) = self.get(&key).await {
            telemetry::status_cache_hit();
            return Ok(v);
        }
        telemetry::status_cache_miss();

        let (flight, leader) = self.join_or_lead(&key);
        if !leader {
            let notified = flight.notify.notified();
            if !flight.is_done() {
                notified.await;
            }
            if let Some(r) = flight.result.lock().await.clone() {
                return r;
            }
            // The loader was dropped before it finished; load on our own.
            return load().await.map(Arc::new).map_err(Arc::new);
        }

        let guard = LoadGuard {
            inflight: &self.inflight,
            key: &key,
            flight,
        };
        let out = match load().await {
            Ok(v) => {
                let data = Arc::new(v);
                self.set(key.clone(), data.clone(), ttl).await;
                Ok(data)
            }
            Err(err) => Err(Arc::new(err)),
        };
        *guard.flight.result.lock().await = Some(out.clone());
        drop(guard);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn key(id: &str, protocol: i32) -> StatusCacheKey {
        StatusCacheKey {
            backend_id: id.into(),
            protocol_version: protocol,
        }
    }

    fn backend_status() -> StatusJson {
        serde_json::from_str(
            r#"{"version":{"name":"1.16.5","protocol":754},"players":{"max":20,"online":3,"sample":[{"name":"Notch","id":"069a79f4-44e9-4726-a5be-fca90e38aaf5"}]},"description":{"text":"hi"},"enforcesSecureChat":true}"#,
        )
        .unwrap()
    }

    #[test]
    fn empty_override_changes_nothing() {
        let mut status = backend_status();
        StatusOverride::default().apply(&mut status, &TemplateVars::new());
        assert_eq!(status, backend_status());
    }

    #[test]
    fn set_fields_replace_backend_values() {
        let ov = StatusOverride {
            max_player_count: Some(100),
            motd: Some("welcome to {{serverId}}".into()),
            player_sample: Some(Vec::new()),
            ..Default::default()
        };
        let mut status = backend_status();
        let vars = TemplateVars::new().set(crate::infrared::template::SERVER_ID, "lobby");
        ov.apply(&mut status, &vars);

        assert_eq!(status.players.max, 100);
        assert_eq!(status.players.online, 3);
        assert_eq!(status.players.sample, Some(Vec::new()));
        assert_eq!(status.version, backend_status().version);
        assert_eq!(status.description, serde_json::json!({"text": "welcome to lobby"}));
        assert_eq!(status.extra["enforcesSecureChat"], serde_json::json!(true));
    }

    #[test]
    fn configured_status_renders_json() {
        let st = StatusResponse {
            version_name: "Infrared".into(),
            protocol_number: 0,
            max_player_count: 0,
            player_count: 0,
            player_sample: Vec::new(),
            motd: "{{serverDomain}} is offline".into(),
            favicon: None,
        };
        let vars = TemplateVars::new().set(crate::infrared::template::SERVER_DOMAIN, "mc.example.com");
        let v: serde_json::Value = serde_json::from_str(&st.render(&vars)).unwrap();
        assert_eq!(v["description"]["text"], "mc.example.com is offline");
        assert_eq!(v["version"]["name"], "Infrared");
        assert!(v["players"].get("sample").is_none());
        assert!(v.get("favicon").is_none());
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        tokio::time::pause();
        let cache: StatusCache<String> = StatusCache::new();
        let counter = AtomicUsize::new(0);
        let loads = &counter;
        let load = move || async move {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(vec![1, 2, 3])
        };

        let ttl = Duration::from_secs(30);
        cache.get_or_load(key("a", 754), ttl, load).await.unwrap();
        tokio::time::advance(Duration::from_secs(15)).await;
        cache.get_or_load(key("a", 754), ttl, load).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        // Other protocol versions are separate entries.
        cache.get_or_load(key("a", 758), ttl, load).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(16)).await;
        cache.get_or_load(key("a", 754), ttl, load).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache: StatusCache<String> = StatusCache::new();
        let ttl = Duration::from_secs(30);
        let err = cache
            .get_or_load(key("a", 1), ttl, || async { Err::<Vec<u8>, _>("down".to_string()) })
            .await
            .unwrap_err();
        assert_eq!(err.as_str(), "down");
        assert_eq!(cache.len().await, 0);

        let ok = cache
            .get_or_load(key("a", 1), ttl, || async { Ok::<_, String>(vec![9]) })
            .await
            .unwrap();
        assert_eq!(*ok, vec![9]);
    }

    #[tokio::test]
    async fn zero_ttl_always_loads() {
        let cache: StatusCache<String> = StatusCache::new();
        for _ in 0..2 {
            cache
                .get_or_load(key("a", 1), Duration::ZERO, || async { Ok::<_, String>(vec![1]) })
                .await
                .unwrap();
        }
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn sweep_removes_expired() {
        tokio::time::pause();
        let cache: StatusCache<String> = StatusCache::new();
        cache
            .set(key("a", 1), Arc::new(vec![1]), Duration::from_secs(1))
            .await;
        cache
            .set(key("b", 1), Arc::new(vec![1]), Duration::from_secs(60))
            .await;
        tokio::time::advance(Duration::from_secs(2)).await;
        cache.sweep().await;
        assert_eq!(cache.len().await, 1);
    }
}
