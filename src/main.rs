mod infrared;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "infrared",
    version,
    about = "Infrared - Minecraft reverse proxy for Java and Bedrock"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses INFRARED_CONFIG; then auto-detects infrared.toml > infrared.yaml > infrared.yml from CWD; then falls back to the OS default path (Linux: /etc/infrared/infrared.toml; others: user config dir).
    #[arg(long, env = "INFRARED_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    infrared::run(cli.config).await
}
