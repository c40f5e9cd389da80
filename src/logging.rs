use crate::config::LoggingConfig;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILE: &str = "burst-proxy.log";

/// Builds the filter: `RUST_LOG` first, then `burst_proxy=<level>`.
pub fn env_filter(level: &str) -> EnvFilter {
    let base = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    match format!("burst_proxy={level}").parse() {
        Ok(directive) => base.add_directive(directive),
        Err(_) => base,
    }
}

/// Installs the global subscriber. The returned guard flushes the file
/// writer when dropped and must be held for the life of the process.
pub fn init(config: &LoggingConfig, debug: bool) -> Option<WorkerGuard> {
    let level = if debug { "debug" } else { config.level.as_str() };
    let registry = tracing_subscriber::registry().with(env_filter(level));

    match &config.file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(file_appender(path));
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            let layer = if config.json {
                layer.json().boxed()
            } else {
                layer.boxed()
            };
            let _ = registry.with(layer).try_init();
            Some(guard)
        }
        None => {
            let layer = if config.json {
                fmt::layer().json().boxed()
            } else {
                fmt::layer().boxed()
            };
            let _ = registry.with(layer).try_init();
            None
        }
    }
}

fn file_appender(path: &Path) -> RollingFileAppender {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let _ = std::fs::create_dir_all(dir);
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(DEFAULT_LOG_FILE);
    RollingFileAppender::new(Rotation::DAILY, dir, name)
}
