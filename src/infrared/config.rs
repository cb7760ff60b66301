use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use base64::Engine;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use ipnetwork::IpNetwork;
use serde::Deserialize;

use crate::infrared::{
    codec::{bedrock::Compression, java::PlayerSample},
    status::{StatusOverride, StatusResponse},
};

pub const DEFAULT_JAVA_PORT: u16 = 25565;
pub const DEFAULT_BEDROCK_PORT: u16 = 19132;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps INFRARED_CONFIG into the flag already; this covers callers that bypass clap.
    if let Some(p) = std::env::var_os("INFRARED_CONFIG")
        && !p.is_empty()
    {
        let p = normalize_explicit_path(Path::new(&p))?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Env,
        });
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(&p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("infrared.toml"));
        }
        return Ok(p);
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["infrared.toml", "infrared.yaml", "infrared.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p)
            && m.is_file()
        {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no infrared.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/infrared/infrared.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "infrared", "infrared")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("infrared.toml"))
    }
}

/// Writes the default template when `path` does not exist. Returns whether a
/// file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: mkdir {}", parent.display()))?;
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    let base_dir = path.parent().unwrap_or(Path::new("."));
    Config::from_file_config(fc, base_dir)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub admin_addr: String,
    pub reload: ReloadConfig,
    pub java: EditionConfig,
    pub bedrock: EditionConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ReloadConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
}

/// Everything one edition's proxy needs. Replaced as a whole on reload.
#[derive(Debug, Clone)]
pub struct EditionConfig {
    pub enabled: bool,
    pub processing: ProcessingConfig,
    pub keep_alive_timeout: Duration,
    pub chan_caps: ChanCaps,
    pub compression: Compression,
    pub gateways: Vec<GatewayConfig>,
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    pub count: usize,
    pub client_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChanCaps {
    pub conn_processor: usize,
    pub server: usize,
    pub conn_pool: usize,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub request_limit: u32,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub id: String,
    pub binds: Vec<String>,
    pub receive_proxy_protocol: bool,
    pub trusted_proxies: Vec<IpNetwork>,
    pub receive_real_ip: bool,
    pub server_not_found_message: String,
    pub server_not_found_status: Option<StatusResponse>,
    pub rate_limit: Option<RateLimitConfig>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub id: String,
    pub domains: Vec<String>,
    pub address: String,
    /// Gateways this server is reachable through; empty means all of them.
    pub gateways: Vec<String>,
    pub send_proxy_protocol: bool,
    pub send_real_ip: bool,
    pub override_address: bool,
    pub dial_timeout: Duration,
    pub dial_timeout_message: String,
    pub dial_timeout_status: Option<StatusResponse>,
    pub override_status: Option<StatusOverride>,
    pub status_cache_ttl: Duration,
}

const DEFAULT_CLIENT_TIMEOUT_MS: i64 = 10_000;
const DEFAULT_KEEP_ALIVE_TIMEOUT_MS: i64 = 30_000;
const DEFAULT_DIAL_TIMEOUT_MS: i64 = 1_000;
const DEFAULT_CHAN_CAP: i64 = 100;
const DEFAULT_RATE_WINDOW_MS: i64 = 1_000;
const DEFAULT_NOT_FOUND_MESSAGE: &str = "Sorry {{username}}, but {{serverDomain}} was not found.";
const DEFAULT_DIAL_TIMEOUT_MESSAGE: &str =
    "Sorry {{username}}, but the server is currently unreachable.";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
    reload: Option<FileReload>,
    java: Option<FileEdition>,
    bedrock: Option<FileEdition>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileReload {
    #[serde(default)]
    enabled: bool,
    poll_interval_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileEdition {
    enabled: Option<bool>,
    processing: Option<FileProcessing>,
    keep_alive_timeout_ms: Option<i64>,
    chan_caps: Option<FileChanCaps>,
    compression: Option<Compression>,
    #[serde(default)]
    gateways: Vec<FileGateway>,
    #[serde(default)]
    servers: Vec<FileServer>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileProcessing {
    count: Option<i64>,
    client_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileChanCaps {
    conn_processor: Option<i64>,
    server: Option<i64>,
    conn_pool: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileGateway {
    id: String,
    binds: StringOrVec,
    #[serde(default)]
    receive_proxy_protocol: bool,
    #[serde(default)]
    trusted_proxies: Vec<String>,
    #[serde(default)]
    receive_real_ip: bool,
    server_not_found_message: Option<String>,
    server_not_found_status: Option<FileStatus>,
    rate_limit: Option<FileRateLimit>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRateLimit {
    request_limit: u32,
    window_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    id: String,
    domains: StringOrVec,
    address: String,
    #[serde(default)]
    gateways: Vec<String>,
    #[serde(default)]
    send_proxy_protocol: bool,
    #[serde(default)]
    send_real_ip: bool,
    #[serde(default)]
    override_address: bool,
    dial_timeout_ms: Option<i64>,
    dial_timeout_message: Option<String>,
    dial_timeout_status: Option<FileStatus>,
    override_status: Option<FileStatusOverride>,
    #[serde(default)]
    status_cache_ttl_ms: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileStatus {
    #[serde(default)]
    version_name: String,
    #[serde(default)]
    protocol_number: i32,
    #[serde(default)]
    max_player_count: i32,
    #[serde(default)]
    player_count: i32,
    #[serde(default)]
    player_sample: Vec<FilePlayerSample>,
    #[serde(default)]
    motd: String,
    icon: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileStatusOverride {
    version_name: Option<String>,
    protocol_number: Option<i32>,
    max_player_count: Option<i32>,
    player_count: Option<i32>,
    player_sample: Option<Vec<FilePlayerSample>>,
    motd: Option<String>,
    icon: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
struct FilePlayerSample {
    name: String,
    uuid: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrVec {
    One(String),
    Many(Vec<String>),
}

impl StringOrVec {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrVec::One(s) => vec![s],
            StringOrVec::Many(v) => v,
        }
    }
}

fn millis(v: Option<i64>, default: i64) -> Duration {
    Duration::from_millis(v.unwrap_or(default).max(0) as u64)
}

fn cap(v: Option<i64>) -> usize {
    v.unwrap_or(DEFAULT_CHAN_CAP).max(1) as usize
}

fn non_empty(v: Option<String>, default: &str) -> String {
    match v {
        Some(s) if !s.trim().is_empty() => s,
        _ => default.to_string(),
    }
}

fn player_samples(v: Vec<FilePlayerSample>) -> Vec<PlayerSample> {
    v.into_iter()
        .map(|p| PlayerSample {
            name: p.name,
            id: p.uuid,
        })
        .collect()
}

/// Resolves an icon setting into a `data:` URI. Relative paths are taken
/// from the config file's directory.
fn load_icon(icon: &str, base_dir: &Path) -> anyhow::Result<String> {
    let icon = icon.trim();
    if icon.starts_with("data:image/") {
        return Ok(icon.to_string());
    }
    let p = Path::new(icon);
    let p = if p.is_relative() {
        base_dir.join(p)
    } else {
        p.to_path_buf()
    };
    let bytes = fs::read(&p).with_context(|| format!("config: read icon {}", p.display()))?;
    Ok(format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    ))
}

fn status_response(fs: FileStatus, base_dir: &Path) -> anyhow::Result<StatusResponse> {
    let favicon = match fs.icon.as_deref().map(str::trim) {
        Some(icon) if !icon.is_empty() => Some(load_icon(icon, base_dir)?),
        _ => None,
    };
    Ok(StatusResponse {
        version_name: fs.version_name,
        protocol_number: fs.protocol_number,
        max_player_count: fs.max_player_count,
        player_count: fs.player_count,
        player_sample: player_samples(fs.player_sample),
        motd: fs.motd,
        favicon,
    })
}

fn status_override(fs: FileStatusOverride, base_dir: &Path) -> anyhow::Result<StatusOverride> {
    let favicon = match fs.icon.as_deref().map(str::trim) {
        Some(icon) if !icon.is_empty() => Some(load_icon(icon, base_dir)?),
        _ => None,
    };
    Ok(StatusOverride {
        version_name: fs.version_name,
        protocol_number: fs.protocol_number,
        max_player_count: fs.max_player_count,
        player_count: fs.player_count,
        player_sample: fs.player_sample.map(player_samples),
        motd: fs.motd,
        favicon,
    })
}

impl EditionConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            processing: ProcessingConfig {
                count: default_processing_count(),
                client_timeout: millis(None, DEFAULT_CLIENT_TIMEOUT_MS),
            },
            keep_alive_timeout: millis(None, DEFAULT_KEEP_ALIVE_TIMEOUT_MS),
            chan_caps: ChanCaps {
                conn_processor: cap(None),
                server: cap(None),
                conn_pool: cap(None),
            },
            compression: Compression::default(),
            gateways: Vec::new(),
            servers: Vec::new(),
        }
    }

    fn from_file(
        name: &str,
        fe: Option<FileEdition>,
        base_dir: &Path,
    ) -> anyhow::Result<EditionConfig> {
        let Some(fe) = fe else {
            return Ok(EditionConfig::disabled());
        };

        let processing = fe.processing.unwrap_or(FileProcessing {
            count: None,
            client_timeout_ms: None,
        });
        let count = match processing.count {
            Some(n) if n > 0 => n as usize,
            _ => default_processing_count(),
        };
        let caps = fe.chan_caps.unwrap_or(FileChanCaps {
            conn_processor: None,
            server: None,
            conn_pool: None,
        });

        let mut gateways = Vec::with_capacity(fe.gateways.len());
        let mut gateway_ids = HashSet::new();
        for (i, g) in fe.gateways.into_iter().enumerate() {
            let id = g.id.trim().to_string();
            if id.is_empty() {
                anyhow::bail!("config: {name}.gateways[{i}] missing id");
            }
            if !gateway_ids.insert(id.clone()) {
                anyhow::bail!("config: {name}.gateways[{i}] duplicate id {id:?}");
            }

            let binds: Vec<String> = g
                .binds
                .into_vec()
                .into_iter()
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty())
                .collect();
            if binds.is_empty() {
                anyhow::bail!("config: {name}.gateways[{i}] ({id}) needs at least one bind");
            }

            let trusted_proxies = g
                .trusted_proxies
                .iter()
                .map(|c| {
                    c.trim()
                        .parse::<IpNetwork>()
                        .map_err(|e| anyhow::anyhow!("config: {name}.gateways[{i}] ({id}): invalid CIDR {c:?}: {e}"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

            let server_not_found_status = g
                .server_not_found_status
                .map(|s| status_response(s, base_dir))
                .transpose()
                .with_context(|| format!("config: {name}.gateways[{i}] ({id})"))?;

            let rate_limit = match g.rate_limit {
                Some(rl) if rl.request_limit > 0 => Some(RateLimitConfig {
                    request_limit: rl.request_limit,
                    window: millis(rl.window_ms, DEFAULT_RATE_WINDOW_MS)
                        .max(Duration::from_millis(1)),
                }),
                _ => None,
            };

            gateways.push(GatewayConfig {
                id,
                binds,
                receive_proxy_protocol: g.receive_proxy_protocol,
                trusted_proxies,
                receive_real_ip: g.receive_real_ip,
                server_not_found_message: non_empty(
                    g.server_not_found_message,
                    DEFAULT_NOT_FOUND_MESSAGE,
                ),
                server_not_found_status,
                rate_limit,
            });
        }

        let mut servers = Vec::with_capacity(fe.servers.len());
        let mut server_ids = HashSet::new();
        for (i, s) in fe.servers.into_iter().enumerate() {
            let id = s.id.trim().to_string();
            if id.is_empty() {
                anyhow::bail!("config: {name}.servers[{i}] missing id");
            }
            if !server_ids.insert(id.clone()) {
                anyhow::bail!("config: {name}.servers[{i}] duplicate id {id:?}");
            }

            let domains: Vec<String> = s
                .domains
                .into_vec()
                .into_iter()
                .map(|d| d.trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect();
            if domains.is_empty() {
                anyhow::bail!("config: {name}.servers[{i}] ({id}) needs at least one domain");
            }

            let address = s.address.trim().to_string();
            if address.is_empty() {
                anyhow::bail!("config: {name}.servers[{i}] ({id}) missing address");
            }

            let server_gateways: Vec<String> = s
                .gateways
                .into_iter()
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty())
                .collect();
            for g in &server_gateways {
                if !gateway_ids.contains(g) {
                    anyhow::bail!("config: {name}.servers[{i}] ({id}) references unknown gateway {g:?}");
                }
            }

            let dial_timeout_status = s
                .dial_timeout_status
                .map(|st| status_response(st, base_dir))
                .transpose()
                .with_context(|| format!("config: {name}.servers[{i}] ({id})"))?;
            let override_status = s
                .override_status
                .map(|st| status_override(st, base_dir))
                .transpose()
                .with_context(|| format!("config: {name}.servers[{i}] ({id})"))?;

            servers.push(ServerConfig {
                id,
                domains,
                address,
                gateways: server_gateways,
                send_proxy_protocol: s.send_proxy_protocol,
                send_real_ip: s.send_real_ip,
                override_address: s.override_address,
                dial_timeout: millis(s.dial_timeout_ms, DEFAULT_DIAL_TIMEOUT_MS),
                dial_timeout_message: non_empty(
                    s.dial_timeout_message,
                    DEFAULT_DIAL_TIMEOUT_MESSAGE,
                ),
                dial_timeout_status,
                override_status,
                status_cache_ttl: millis(Some(s.status_cache_ttl_ms), 0),
            });
        }

        Ok(EditionConfig {
            enabled: fe.enabled.unwrap_or(true),
            processing: ProcessingConfig {
                count,
                client_timeout: millis(processing.client_timeout_ms, DEFAULT_CLIENT_TIMEOUT_MS),
            },
            keep_alive_timeout: millis(fe.keep_alive_timeout_ms, DEFAULT_KEEP_ALIVE_TIMEOUT_MS),
            chan_caps: ChanCaps {
                conn_processor: cap(caps.conn_processor),
                server: cap(caps.server),
                conn_pool: cap(caps.conn_pool),
            },
            compression: fe.compression.unwrap_or_default(),
            gateways,
            servers,
        })
    }
}

fn default_processing_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Config {
    fn from_file_config(fc: FileConfig, base_dir: &Path) -> anyhow::Result<Config> {
        let mut logging = LoggingConfig {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        };
        if let Some(l) = &fc.logging {
            if let Some(level) = &l.level
                && !level.trim().is_empty()
            {
                logging.level = level.trim().to_string();
            }
            if let Some(fmt) = &l.format
                && !fmt.trim().is_empty()
            {
                logging.format = fmt.trim().to_string();
            }
            if let Some(out) = &l.output
                && !out.trim().is_empty()
            {
                logging.output = out.trim().to_string();
            }
            logging.add_source = l.add_source;
        }

        Ok(Config {
            logging,
            admin_addr: fc.admin_addr.trim().to_string(),
            reload: ReloadConfig {
                enabled: fc.reload.as_ref().map(|r| r.enabled).unwrap_or(true),
                poll_interval: millis(fc.reload.as_ref().and_then(|r| r.poll_interval_ms), 1000),
            },
            java: EditionConfig::from_file("java", fc.java, base_dir)?,
            bedrock: EditionConfig::from_file("bedrock", fc.bedrock, base_dir)?,
        })
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Infrared configuration (auto-generated)
#
# This file was created because Infrared could not find a configuration file at
# the resolved config path. It proxies every Java edition hostname on :25565 to
# a server on localhost:25566.

admin_addr = "127.0.0.1:8080"

[logging]
level = "info"
format = "text"
output = "stderr"
add_source = false

[reload]
enabled = true
poll_interval_ms = 1000

[java]
enabled = true
keep_alive_timeout_ms = 30000

[java.processing]
client_timeout_ms = 10000

[java.chan_caps]
conn_processor = 100
server = 100
conn_pool = 100

[[java.gateways]]
id = "default"
binds = [":25565"]
server_not_found_message = "Sorry {{username}}, but {{serverDomain}} was not found."

[[java.servers]]
id = "default"
domains = ["*"]
address = "localhost:25566"
dial_timeout_ms = 1000
dial_timeout_message = "Sorry {{username}}, but the server is currently unreachable."
status_cache_ttl_ms = 0
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# Infrared configuration (auto-generated)
#
# This file was created because Infrared could not find a configuration file at
# the resolved config path. It proxies every Java edition hostname on :25565 to
# a server on localhost:25566.

admin_addr: "127.0.0.1:8080"

logging:
  level: "info"
  format: "text"
  output: "stderr"
  add_source: false

reload:
  enabled: true
  poll_interval_ms: 1000

java:
  enabled: true
  keep_alive_timeout_ms: 30000
  processing:
    client_timeout_ms: 10000
  chan_caps:
    conn_processor: 100
    server: 100
    conn_pool: 100
  gateways:
    - id: "default"
      binds: [":25565"]
      server_not_found_message: "Sorry {{username}}, but {{serverDomain}} was not found."
  servers:
    - id: "default"
      domains: ["*"]
      address: "localhost:25566"
      dial_timeout_ms: 1000
      dial_timeout_message: "Sorry {{username}}, but the server is currently unreachable."
      status_cache_ttl_ms: 0
"#;
