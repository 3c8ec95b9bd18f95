use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

/// This crate at `info`, dependencies (hyper, reqwest, ...) at `warn`.
const DEFAULT_FILTER: &str = "warn,chat_stream=info";
const DEFAULT_LOG_FILE: &str = "chat-stream.logs.jsonl";

/// Where log lines go.
#[derive(Debug, PartialEq, Eq)]
enum LogOutput {
    Console,
    JsonFile { dir: PathBuf, file_name: String },
}

impl LogOutput {
    fn from_path(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|p| !p.is_empty()) else {
            return Self::Console;
        };
        let path = Path::new(raw);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(DEFAULT_LOG_FILE)
            .to_string();
        Self::JsonFile { dir, file_name }
    }
}

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

/// Filter directives from `CHAT_STREAM_LOG_LEVEL`, then `RUST_LOG`.
///
/// A bare level (`debug`) only raises this crate; anything with a target or
/// several directives is used as written.
fn filter_directives(level: Option<&str>, rust_log: Option<&str>) -> String {
    if let Some(level) = level.map(str::trim).filter(|l| !l.is_empty()) {
        if level.contains('=') || level.contains(',') {
            return level.to_string();
        }
        return format!("warn,chat_stream={level}");
    }
    rust_log
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .unwrap_or(DEFAULT_FILTER)
        .to_string()
}

fn env_filter() -> EnvFilter {
    let level = std::env::var("CHAT_STREAM_LOG_LEVEL").ok();
    let rust_log = std::env::var("RUST_LOG").ok();
    EnvFilter::try_new(filter_directives(level.as_deref(), rust_log.as_deref()))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the process-wide `tracing` subscriber once.
///
/// Environment variables:
/// - `CHAT_STREAM_OBSERVABILITY`: enable/disable flag (default enabled).
/// - `CHAT_STREAM_LOG_LEVEL`: a level for this crate (`debug`) or full filter
///   directives, falling back to `RUST_LOG`, then `warn,chat_stream=info`.
/// - `CHAT_STREAM_JSON_LOG_PATH`: when set, logs are written as JSONL to that
///   file instead of the compact console format on stdout.
///
/// Library code only emits events; embedding applications may install their
/// own subscriber instead of calling this.
pub fn init_observability() {
    INIT.get_or_init(|| {
        let enabled = std::env::var("CHAT_STREAM_OBSERVABILITY")
            .ok()
            .and_then(|v| parse_bool_env(&v))
            .unwrap_or(true);
        if !enabled {
            return;
        }

        let json_path = std::env::var("CHAT_STREAM_JSON_LOG_PATH").ok();
        let output = LogOutput::from_path(json_path.as_deref());
        let installed = match &output {
            LogOutput::JsonFile { dir, file_name } => {
                let _ = std::fs::create_dir_all(dir);
                let json_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(tracing_appender::rolling::never(dir, file_name));
                tracing_subscriber::registry()
                    .with(env_filter())
                    .with(json_layer)
                    .try_init()
            }
            LogOutput::Console => tracing_subscriber::registry()
                .with(env_filter())
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_target(false)
                        .with_writer(std::io::stdout),
                )
                .try_init(),
        };
        if installed.is_ok() {
            tracing::debug!(output = ?output, "chat-stream logging initialised");
        }
    });
}
