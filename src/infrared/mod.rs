pub mod admin;
pub mod app;
pub mod bedrock;
pub mod codec;
pub mod config;
pub mod conn;
pub mod cpn;
pub mod event;
pub mod filter;
pub mod gateway;
pub mod java;
pub mod listener;
pub mod logging;
pub mod net;
pub mod proxy;
pub mod raknet;
pub mod router;
pub mod server;
pub mod session;
pub mod status;
pub mod telemetry;
pub mod template;
pub mod tunnel;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
