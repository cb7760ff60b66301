use std::{io, path::Path};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::infrared::config::LoggingConfig;

/// Keeps the background log writer alive.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(cfg: &LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let format = cfg.format.trim().to_ascii_lowercase();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive(&cfg.level)))
        .context("logging: init filter")?;

    let (writer, guard) = make_writer(cfg.output.trim())?;
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(format == "text" && cfg.output.trim() == "stderr")
        .with_target(cfg.add_source)
        .with_file(cfg.add_source)
        .with_line_number(cfg.add_source);
    let layer = match format.as_str() {
        "json" => layer.json().boxed(),
        _ => layer.boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .context("logging: install subscriber")?;

    Ok(LoggingRuntime { _guard: guard })
}

fn directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

fn make_writer(output: &str) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    match output {
        "" | "stderr" => Ok(tracing_appender::non_blocking(io::stderr())),
        "stdout" => Ok(tracing_appender::non_blocking(io::stdout())),
        "discard" => Ok(tracing_appender::non_blocking(io::sink())),
        path => {
            let p = Path::new(path);
            if let Some(parent) = p.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("logging: mkdir {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .with_context(|| format!("logging: open {}", p.display()))?;
            Ok(tracing_appender::non_blocking(file))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_levels_fall_back_to_info() {
        assert_eq!(directive("DEBUG"), "debug");
        assert_eq!(directive(" warning "), "warn");
        assert_eq!(directive("verbose"), "info");
    }

    #[test]
    fn file_output_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("infrared-log-{}", std::process::id()));
        let path = dir.join("nested").join("proxy.log");
        let (_writer, _guard) = make_writer(path.to_str().unwrap()).unwrap();
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(dir);
    }
}
