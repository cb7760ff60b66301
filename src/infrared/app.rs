use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::infrared::{
    admin,
    config::{self, Config, EditionConfig},
    event,
    gateway::Edition,
    listener::Listeners,
    logging, net,
    proxy::Proxy,
    telemetry,
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;
    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logging = logging::init(&cfg.logging)?;
    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    if !cfg.java.enabled && !cfg.bedrock.enabled {
        anyhow::bail!("config: nothing to run (enable java and/or bedrock)");
    }

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        java = cfg.java.enabled,
        bedrock = cfg.bedrock.enabled,
        admin_addr = %cfg.admin_addr,
        "infrared: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let bus = event::default_bus();
    let listeners = Listeners::global();

    let mut proxies = Vec::new();
    for (edition, ec) in editions(&cfg) {
        if !ec.enabled {
            continue;
        }
        let proxy = Proxy::new(edition, ec, Arc::clone(&bus), listeners.clone())
            .with_context(|| format!("{edition}: build proxy"))?;
        let proxy = Arc::new(proxy);
        if let Err(err) = proxy.start().await {
            close_all(&proxies).await;
            return Err(err).with_context(|| format!("{edition}: start proxy"));
        }
        proxies.push(proxy);
    }

    let (reload_tx, reload_rx) = watch::channel(telemetry::ReloadSignal::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    {
        let reloader = Reloader {
            config_path: resolved.path.clone(),
            proxies: proxies.clone(),
            enabled: cfg.reload.enabled,
            poll_interval: cfg.reload.poll_interval,
        };
        let reload_rx = reload_rx.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            reloader.run(reload_rx, shutdown).await;
            Ok(())
        });
    }

    if !cfg.admin_addr.trim().is_empty() {
        let addr: SocketAddr = net::normalize_bind_addr(&cfg.admin_addr)
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;
        let state = admin::AdminState {
            prom: Arc::clone(&prom),
            proxies: proxies.clone(),
            config_path: resolved.path.clone(),
            reload_tx: reload_tx.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    let mut result = Ok(());
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        Some(res) = tasks.join_next() => {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(err)) => result = Err(err),
                Err(join_err) => result = Err(join_err.into()),
            }
        }
    }
    let _ = shutdown_tx.send(true);

    let drain = async {
        close_all(&proxies).await;
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("shutdown: drain timed out, aborting remaining tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    result
}

fn editions(cfg: &Config) -> [(Edition, &EditionConfig); 2] {
    [(Edition::Java, &cfg.java), (Edition::Bedrock, &cfg.bedrock)]
}

async fn close_all(proxies: &[Arc<Proxy>]) {
    for p in proxies {
        p.close().await;
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Re-reads the config file when it changes on disk or when the admin API
/// asks for it, and hands each edition's section to its proxy.
struct Reloader {
    config_path: PathBuf,
    proxies: Vec<Arc<Proxy>>,
    enabled: bool,
    poll_interval: Duration,
}

impl Reloader {
    async fn run(
        mut self,
        mut reload_rx: watch::Receiver<telemetry::ReloadSignal>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut last_sig = file_sig(&self.config_path).ok();

        loop {
            let sleep_dur = if self.enabled {
                self.poll_interval.max(Duration::from_millis(200))
            } else {
                Duration::from_secs(3600)
            };

            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                res = reload_rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                    self.apply().await;
                    last_sig = file_sig(&self.config_path).ok();
                }
                _ = tokio::time::sleep(sleep_dur) => {
                    if !self.enabled {
                        continue;
                    }
                    let Ok(sig) = file_sig(&self.config_path) else {
                        continue;
                    };
                    if last_sig == Some(sig) {
                        continue;
                    }
                    self.apply().await;
                    last_sig = Some(sig);
                }
            }
        }
    }

    async fn apply(&mut self) {
        let cfg = match config::load_config(&self.config_path) {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(path = %self.config_path.display(), err = %err, "reload: config load failed");
                return;
            }
        };

        for (edition, ec) in editions(&cfg) {
            let proxy = self.proxies.iter().find(|p| p.edition() == edition);
            match (proxy, ec.enabled) {
                (Some(proxy), true) => {
                    if let Err(err) = proxy.reload(ec).await {
                        tracing::warn!(edition = %edition, err = %err, "reload: rejected, keeping previous config");
                    }
                }
                (Some(_), false) | (None, true) => {
                    tracing::warn!(edition = %edition, "reload: enabling or disabling an edition requires a restart");
                }
                (None, false) => {}
            }
        }

        self.enabled = cfg.reload.enabled;
        self.poll_interval = cfg.reload.poll_interval;
        tracing::info!("reload: applied");
    }
}

fn file_sig(path: &Path) -> anyhow::Result<(u64, u64)> {
    let meta = std::fs::metadata(path)?;
    let modified = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    Ok((modified, meta.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrared::event::EventBus;

    fn temp_config(name: &str, body: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("infrared-app-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("infrared.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn file_sig_tracks_length() {
        let path = temp_config("sig", "admin_addr = \"\"\n");
        let a = file_sig(&path).unwrap();
        std::fs::write(&path, "admin_addr = \"\"\n\n").unwrap();
        let b = file_sig(&path).unwrap();
        assert_ne!(a, b);
        assert!(file_sig(&path.with_extension("missing")).is_err());
    }

    #[tokio::test]
    async fn invalid_reload_keeps_the_proxy_running() {
        let path = temp_config("reload", "this is not toml = = =");
        let proxy = Arc::new(
            Proxy::new(
                Edition::Java,
                &EditionConfig::disabled(),
                Arc::new(EventBus::new()),
                Listeners::isolated(),
            )
            .unwrap(),
        );
        let mut reloader = Reloader {
            config_path: path,
            proxies: vec![Arc::clone(&proxy)],
            enabled: true,
            poll_interval: Duration::from_secs(1),
        };
        reloader.apply().await;
        assert!(reloader.enabled);
        assert_eq!(reloader.poll_interval, Duration::from_secs(1));
        assert_eq!(proxy.player_count(), 0);
    }

    #[tokio::test]
    async fn reloader_stops_on_shutdown() {
        let path = temp_config("stop", "admin_addr = \"\"\n");
        let reloader = Reloader {
            config_path: path,
            proxies: Vec::new(),
            enabled: true,
            poll_interval: Duration::from_millis(200),
        };
        let (_reload_tx, reload_rx) = watch::channel(telemetry::ReloadSignal::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(reloader.run(reload_rx, shutdown_rx));
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
