use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use tracing::Level;
use tracing_subscriber::prelude::*;

const LOG_FORMAT_TEXT: &str = "text";
const LOG_FORMAT_JSON: &str = "json";
const SYSLOG_IDENTIFIER: &str = "containerizerd";

enum LogFormat {
    Text,
    Json,
}

const DEFAULT_LOG_LEVEL: &str = "info";

fn detect_log_format(log_format: Option<&str>) -> Result<LogFormat> {
    match log_format {
        None | Some(LOG_FORMAT_TEXT) => Ok(LogFormat::Text),
        Some(LOG_FORMAT_JSON) => Ok(LogFormat::Json),
        Some(unknown) => bail!("unknown log format: {}", unknown),
    }
}

/// `--log-level` wins over `--debug`.
fn detect_log_level(input: Option<&str>, is_debug: bool) -> Result<Level> {
    let level = match input {
        Some(level) => level,
        None if is_debug => "debug",
        None => DEFAULT_LOG_LEVEL,
    };

    Ok(Level::from_str(level)?)
}

#[derive(Debug, Default)]
pub struct ObservabilityConfig {
    pub log_debug_flag: bool,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub log_format: Option<String>,
    pub systemd_log: bool,
}

impl From<&crate::Opts> for ObservabilityConfig {
    fn from(opts: &crate::Opts) -> Self {
        Self {
            log_debug_flag: opts.global.debug,
            log_level: opts.global.log_level.to_owned(),
            log_file: opts.global.log.to_owned(),
            log_format: opts.global.log_format.to_owned(),
            systemd_log: opts.global.systemd_log,
        }
    }
}

fn open_log_file(path: &PathBuf) -> Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

pub fn init<T>(config: T) -> Result<()>
where
    T: Into<ObservabilityConfig>,
{
    let config = config.into();
    let level = detect_log_level(config.log_level.as_deref(), config.log_debug_flag)
        .context("failed to parse log level")?;
    let log_level_filter = tracing_subscriber::filter::LevelFilter::from(level);
    let log_format =
        detect_log_format(config.log_format.as_deref()).context("failed to detect log format")?;

    let journald = if config.systemd_log {
        match tracing_journald::layer() {
            Ok(layer) => Some(layer.with_syslog_identifier(SYSLOG_IDENTIFIER.to_owned())),
            Err(err) => {
                eprintln!("failed to initialize journald logging: {err:?}");
                None
            }
        }
    } else {
        None
    };
    let subscriber = tracing_subscriber::registry()
        .with(log_level_filter)
        .with(journald);

    // each writer and format pair produces a different layer type
    match (config.log_file.as_ref(), log_format) {
        (None, LogFormat::Text) => subscriber
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        (None, LogFormat::Json) => subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_span_list(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        (Some(path), LogFormat::Text) => subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(open_log_file(path)?),
            )
            .try_init(),
        (Some(path), LogFormat::Json) => subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_span_list(false)
                    .with_writer(open_log_file(path)?),
            )
            .try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to init logger: {}", e))
}
