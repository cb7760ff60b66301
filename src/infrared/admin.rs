use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::infrared::{
    gateway::Edition,
    proxy::Proxy,
    session::PlayerInfo,
    telemetry::{self, SharedPrometheusHandle},
};

#[derive(Clone)]
pub struct AdminState {
    pub prom: SharedPrometheusHandle,
    pub proxies: Vec<Arc<Proxy>>,
    pub config_path: PathBuf,
    pub reload_tx: watch::Sender<telemetry::ReloadSignal>,
}

impl AdminState {
    fn proxy(&self, edition: Edition) -> Option<&Arc<Proxy>> {
        self.proxies.iter().find(|p| p.edition() == edition)
    }
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/players", get(players))
        .route(
            "/players/{edition}/{username}",
            get(player).delete(disconnect),
        )
        .route("/reload", post(reload))
        .route("/config", get(config))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(admin_addr = %addr, "admin: listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: msg.into() })).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct PlayersQuery {
    edition: Option<String>,
    name: Option<String>,
}

async fn players(
    State(st): State<Arc<AdminState>>,
    Query(q): Query<PlayersQuery>,
) -> Response {
    let pattern = match Regex::new(q.name.as_deref().unwrap_or(".*")) {
        Ok(re) => re,
        Err(err) => return error(StatusCode::BAD_REQUEST, format!("invalid name pattern: {err}")),
    };
    let edition = match q.edition.as_deref() {
        None | Some("") => None,
        Some(name) => match Edition::parse(name) {
            Some(e) => Some(e),
            None => return error(StatusCode::BAD_REQUEST, format!("unknown edition {name:?}")),
        },
    };

    let mut out: Vec<PlayerInfo> = st
        .proxies
        .iter()
        .filter(|p| edition.is_none_or(|e| p.edition() == e))
        .flat_map(|p| p.players(&pattern))
        .collect();
    out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
    (StatusCode::OK, Json(out)).into_response()
}

fn lookup<'a>(st: &'a AdminState, edition: &str) -> Result<&'a Arc<Proxy>, Response> {
    let Some(edition) = Edition::parse(edition) else {
        return Err(error(StatusCode::NOT_FOUND, format!("unknown edition {edition:?}")));
    };
    st.proxy(edition)
        .ok_or_else(|| error(StatusCode::NOT_FOUND, format!("{edition} is not enabled")))
}

async fn player(
    State(st): State<Arc<AdminState>>,
    Path((edition, username)): Path<(String, String)>,
) -> Response {
    let proxy = match lookup(&st, &edition) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match proxy.player_by_username(&username) {
        Some(info) => (StatusCode::OK, Json(info)).into_response(),
        None => error(StatusCode::NOT_FOUND, format!("{username} is not online")),
    }
}

async fn disconnect(
    State(st): State<Arc<AdminState>>,
    Path((edition, username)): Path<(String, String)>,
) -> Response {
    let proxy = match lookup(&st, &edition) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if proxy.disconnect(&username) {
        tracing::info!(edition = %proxy.edition(), username = %username, "admin: player disconnected");
        StatusCode::NO_CONTENT.into_response()
    } else {
        error(StatusCode::NOT_FOUND, format!("{username} is not online"))
    }
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    seq: u64,
}

async fn reload(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let mut next = st.reload_tx.borrow().clone();
    next.next();
    let seq = next.seq;
    // The reload loop may already be gone during shutdown.
    let _ = st.reload_tx.send(next);
    (StatusCode::OK, Json(ReloadResponse { seq }))
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    path: String,
}

async fn config(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(ConfigResponse {
            path: st.config_path.display().to_string(),
        }),
    )
}
