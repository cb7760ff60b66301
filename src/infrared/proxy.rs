//! The per-edition supervisor: owns the stage channels, the worker pool and
//! the gateways, and swaps configuration without touching live tunnels.

use std::{
    collections::HashSet,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use arc_swap::ArcSwap;
use regex::Regex;
use thiserror::Error;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::infrared::{
    bedrock,
    codec::bedrock::Compression,
    config::EditionConfig,
    cpn::{ConnProcessorPool, ProcessedConn},
    event::EventBus,
    gateway::{self, Edition, Gateway, GatewayHandle, IncomingConn},
    java,
    listener::Listeners,
    router::Router,
    server::{Backend, DialError},
    session::{PlayerInfo, SessionRegistry},
    status::StatusCache,
    tunnel::{self, TunnelRequest},
};

const STATUS_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("gateway {gateway}: {source}")]
    Bind {
        gateway: String,
        #[source]
        source: io::Error,
    },
    #[error("config: {0}")]
    Config(String),
    #[error("proxy closed")]
    Closed,
}

/// A bounded channel between two pipeline stages whose capacity can change
/// while producers and consumers are running.
///
/// Resizing swaps in a new channel and forwards whatever was queued in the
/// old one. Consumers still parked on the old receiver keep draining it and
/// move over once its last sender is gone.
pub struct Stage<T> {
    tx: ArcSwap<flume::Sender<T>>,
    rx: ArcSwap<flume::Receiver<T>>,
    closed: CancellationToken,
}

impl<T> Stage<T> {
    pub fn new(cap: usize) -> Self {
        let (tx, rx) = flume::bounded(cap.max(1));
        Self {
            tx: ArcSwap::from_pointee(tx),
            rx: ArcSwap::from_pointee(rx),
            closed: CancellationToken::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.tx.load().capacity().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.rx.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Waits for room. Hands the item back once the stage is closed.
    pub async fn send(&self, item: T) -> Result<(), T> {
        let mut item = item;
        loop {
            if self.closed.is_cancelled() {
                return Err(item);
            }
            let tx = self.tx.load_full();
            match tx.send_async(item).await {
                Ok(()) => return Ok(()),
                Err(flume::SendError(back)) => {
                    if self.closed.is_cancelled() || Arc::ptr_eq(&tx, &*self.tx.load()) {
                        return Err(back);
                    }
                    item = back;
                }
            }
        }
    }

    /// Next item; `None` once the stage is closed.
    pub async fn recv(&self) -> Option<T> {
        loop {
            if self.closed.is_cancelled() {
                return None;
            }
            let rx = self.rx.load_full();
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return None,
                r = rx.recv_async() => match r {
                    Ok(item) => return Some(item),
                    Err(_) if Arc::ptr_eq(&rx, &*self.rx.load()) => return None,
                    Err(_) => continue,
                },
            }
        }
    }

    pub async fn resize(&self, cap: usize) {
        if self.closed.is_cancelled() || self.capacity() == cap.max(1) {
            return;
        }
        let (tx, rx) = flume::bounded(cap.max(1));
        let old_rx = self.rx.swap(Arc::new(rx));
        drop(self.tx.swap(Arc::new(tx.clone())));

        let queued: Vec<T> = old_rx.drain().collect();
        for item in queued {
            if tx.send_async(item).await.is_err() {
                break;
            }
        }
    }

    /// Closes the stage. Queued items are dropped; blocked senders get
    /// their items back.
    pub fn close(&self) {
        self.closed.cancel();
        let (dead_tx, _) = flume::bounded(1);
        let (_, dead_rx) = flume::bounded(1);
        drop(self.tx.swap(Arc::new(dead_tx)));
        // Draining here would hand parked senders a free slot.
        drop(self.rx.swap(Arc::new(dead_rx)));
    }
}

/// Knobs read per connection; replaced as a whole on reload.
#[derive(Debug, Clone)]
pub struct Settings {
    pub client_timeout: Duration,
    pub keep_alive_timeout: Duration,
    pub compression: Compression,
    pub processing_count: usize,
}

impl Settings {
    fn from_config(cfg: &EditionConfig) -> Self {
        Self {
            client_timeout: cfg.processing.client_timeout,
            keep_alive_timeout: cfg.keep_alive_timeout,
            compression: cfg.compression,
            processing_count: cfg.processing.count.max(1),
        }
    }
}

/// State shared by every stage of one proxy.
pub struct Shared {
    pub edition: Edition,
    pub bus: Arc<EventBus>,
    pub router: Router,
    pub settings: ArcSwap<Settings>,
    pub sessions: SessionRegistry,
    pub status_cache: StatusCache<DialError>,
    pub conn_processor: Arc<Stage<IncomingConn>>,
    pub server: Stage<ProcessedConn>,
    pub conn_pool: Stage<TunnelRequest>,
    pub tracker: TaskTracker,
    pub cancel: CancellationToken,
}

struct Pipeline {
    settings: Settings,
    gateways: Vec<Arc<Gateway>>,
    backends: Vec<Arc<Backend>>,
}

fn build_pipeline(edition: Edition, cfg: &EditionConfig) -> Result<Pipeline, ProxyError> {
    let mut gateway_ids = HashSet::new();
    let mut gateways = Vec::with_capacity(cfg.gateways.len());
    for gw in &cfg.gateways {
        if gw.id.trim().is_empty() {
            return Err(ProxyError::Config("gateway with empty id".into()));
        }
        if !gateway_ids.insert(gw.id.as_str()) {
            return Err(ProxyError::Config(format!("duplicate gateway id {:?}", gw.id)));
        }
        if gw.binds.is_empty() {
            return Err(ProxyError::Config(format!("gateway {:?} has no binds", gw.id)));
        }
        gateways.push(Arc::new(Gateway::from_config(edition, gw)));
    }

    let mut server_ids = HashSet::new();
    let mut backends = Vec::with_capacity(cfg.servers.len());
    for srv in &cfg.servers {
        if !server_ids.insert(srv.id.as_str()) {
            return Err(ProxyError::Config(format!("duplicate server id {:?}", srv.id)));
        }
        if srv.domains.is_empty() {
            return Err(ProxyError::Config(format!("server {:?} has no domains", srv.id)));
        }
        if srv.address.trim().is_empty() {
            return Err(ProxyError::Config(format!("server {:?} has no address", srv.id)));
        }
        if let Some(unknown) = srv
            .gateways
            .iter()
            .find(|g| !gateway_ids.contains(g.as_str()))
        {
            return Err(ProxyError::Config(format!(
                "server {:?} references unknown gateway {unknown:?}",
                srv.id
            )));
        }
        backends.push(Arc::new(Backend::from_config(edition, srv)));
    }

    Ok(Pipeline {
        settings: Settings::from_config(cfg),
        gateways,
        backends,
    })
}

pub struct Proxy {
    shared: Arc<Shared>,
    listeners: Listeners,
    pool: ConnProcessorPool,
    gateways: Mutex<Vec<GatewayHandle>>,
    initial_gateways: Mutex<Vec<Arc<Gateway>>>,
}

impl Proxy {
    pub fn new(
        edition: Edition,
        cfg: &EditionConfig,
        bus: Arc<EventBus>,
        listeners: Listeners,
    ) -> Result<Self, ProxyError> {
        let pipeline = build_pipeline(edition, cfg)?;
        let caps = &cfg.chan_caps;
        let shared = Arc::new(Shared {
            edition,
            bus,
            router: Router::new(pipeline.backends),
            settings: ArcSwap::from_pointee(pipeline.settings),
            sessions: SessionRegistry::new(),
            status_cache: StatusCache::new(),
            conn_processor: Arc::new(Stage::new(caps.conn_processor)),
            server: Stage::new(caps.server),
            conn_pool: Stage::new(caps.conn_pool),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        });
        Ok(Self {
            pool: ConnProcessorPool::new(Arc::clone(&shared)),
            shared,
            listeners,
            gateways: Mutex::new(Vec::new()),
            initial_gateways: Mutex::new(pipeline.gateways),
        })
    }

    pub fn edition(&self) -> Edition {
        self.shared.edition
    }

    /// Starts the stage workers and opens every gateway. A bind failure
    /// closes whatever was opened and is returned.
    pub async fn start(&self) -> Result<(), ProxyError> {
        if self.shared.cancel.is_cancelled() {
            return Err(ProxyError::Closed);
        }
        let gateways = match self.initial_gateways.lock() {
            Ok(mut g) => std::mem::take(&mut *g),
            Err(_) => Vec::new(),
        };
        let handles = self.open_gateways(&gateways).await?;
        if let Ok(mut g) = self.gateways.lock() {
            *g = handles;
        }

        let shared = &self.shared;
        shared.tracker.spawn(server_loop(Arc::clone(shared)));
        shared.tracker.spawn(tunnel_loop(Arc::clone(shared)));
        shared.tracker.spawn(sweep_loop(Arc::clone(shared)));
        self.pool
            .set_size(shared.settings.load().processing_count);

        tracing::info!(
            edition = %shared.edition,
            gateways = gateways.len(),
            servers = shared.router.backends().len(),
            "proxy: started"
        );
        Ok(())
    }

    async fn open_gateways(
        &self,
        gateways: &[Arc<Gateway>],
    ) -> Result<Vec<GatewayHandle>, ProxyError> {
        let mut handles = Vec::with_capacity(gateways.len());
        for gw in gateways {
            let handle = gateway::listen(
                Arc::clone(gw),
                &self.listeners,
                Arc::clone(&self.shared.conn_processor),
                Arc::clone(&self.shared.bus),
                &self.shared.tracker,
                &self.shared.cancel,
            )
            .await
            .map_err(|source| ProxyError::Bind {
                gateway: gw.id.clone(),
                source,
            })?;
            handles.push(handle);
        }
        Ok(handles)
    }

    /// Applies a new configuration. Invalid configuration or a failed bind
    /// leaves the running one untouched. Live tunnels are never affected.
    pub async fn reload(&self, cfg: &EditionConfig) -> Result<(), ProxyError> {
        if self.shared.cancel.is_cancelled() {
            return Err(ProxyError::Closed);
        }
        let pipeline = build_pipeline(self.shared.edition, cfg)?;

        // New subscriptions first so shared binds never drop to zero refs.
        let handles = self.open_gateways(&pipeline.gateways).await?;

        let shared = &self.shared;
        shared.conn_processor.resize(cfg.chan_caps.conn_processor).await;
        shared.server.resize(cfg.chan_caps.server).await;
        shared.conn_pool.resize(cfg.chan_caps.conn_pool).await;

        let count = pipeline.settings.processing_count;
        shared.settings.store(Arc::new(pipeline.settings));
        shared.router.update(pipeline.backends);

        let old = match self.gateways.lock() {
            Ok(mut g) => std::mem::replace(&mut *g, handles),
            Err(_) => Vec::new(),
        };
        drop(old);

        self.pool.set_size(count);
        tracing::info!(
            edition = %shared.edition,
            gateways = pipeline.gateways.len(),
            servers = shared.router.backends().len(),
            "proxy: reloaded"
        );
        Ok(())
    }

    /// Stops accepting, closes every stage and tunnel, and waits for all
    /// tasks to finish.
    pub async fn close(&self) {
        let shared = &self.shared;
        shared.cancel.cancel();
        let handles = match self.gateways.lock() {
            Ok(mut g) => std::mem::take(&mut *g),
            Err(_) => Vec::new(),
        };
        drop(handles);

        shared.conn_processor.close();
        shared.server.close();
        shared.conn_pool.close();
        shared.sessions.disconnect_all();

        shared.tracker.close();
        shared.tracker.wait().await;
        tracing::info!(edition = %shared.edition, "proxy: closed");
    }

    pub fn local_addrs(&self, gateway_id: &str) -> Vec<SocketAddr> {
        self.gateways
            .lock()
            .map(|g| {
                g.iter()
                    .filter(|h| h.gateway.id == gateway_id)
                    .flat_map(|h| h.local_addrs.iter().copied())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn player_count(&self) -> usize {
        self.shared.sessions.len()
    }

    pub fn players(&self, pattern: &Regex) -> Vec<PlayerInfo> {
        self.shared.sessions.matching(pattern)
    }

    pub fn player_by_username(&self, name: &str) -> Option<PlayerInfo> {
        self.shared.sessions.by_username(name).map(|s| s.info())
    }

    /// Closes the tunnel of `name`. Returns false if no such player is online.
    pub fn disconnect(&self, name: &str) -> bool {
        match self.shared.sessions.by_username(name) {
            Some(s) => {
                s.disconnect();
                true
            }
            None => false,
        }
    }
}

async fn server_loop(shared: Arc<Shared>) {
    while let Some(conn) = shared.server.recv().await {
        let s = Arc::clone(&shared);
        shared.tracker.spawn(async move {
            match conn {
                ProcessedConn::Java(c) => java::serve(c, &s).await,
                ProcessedConn::Bedrock(c) => bedrock::serve(*c, &s).await,
            }
        });
    }
}

async fn tunnel_loop(shared: Arc<Shared>) {
    while let Some(req) = shared.conn_pool.recv().await {
        shared
            .tracker
            .spawn(tunnel::run(req, Arc::clone(&shared)));
    }
}

async fn sweep_loop(shared: Arc<Shared>) {
    let mut tick = tokio::time::interval(STATUS_CACHE_SWEEP_INTERVAL);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tick.tick() => shared.status_cache.sweep().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stage_resize_keeps_queued_items() {
        let stage = Stage::new(4);
        for i in 0..3 {
            stage.send(i).await.unwrap();
        }
        stage.resize(8).await;
        assert_eq!(stage.capacity(), 8);
        stage.send(3).await.unwrap();

        let mut got = Vec::new();
        for _ in 0..4 {
            got.push(stage.recv().await.unwrap());
        }
        assert_eq!(got, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn parked_consumer_follows_a_resize() {
        let stage = Arc::new(Stage::<u32>::new(2));
        let consumer = {
            let stage = Arc::clone(&stage);
            tokio::spawn(async move { stage.recv().await })
        };
        tokio::task::yield_now().await;
        stage.resize(16).await;
        stage.send(7).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(7));
    }

    #[tokio::test]
    async fn closed_stage_returns_items_and_ends_consumers() {
        let stage = Arc::new(Stage::new(1));
        stage.send(1).await.unwrap();

        let blocked = {
            let stage = Arc::clone(&stage);
            tokio::spawn(async move { stage.send(2).await })
        };
        tokio::task::yield_now().await;
        stage.close();

        let back = tokio::time::timeout(Duration::from_secs(2), blocked)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(back, Err(2));
        assert_eq!(stage.recv().await, None);
        assert_eq!(stage.send(3).await, Err(3));
    }
}
