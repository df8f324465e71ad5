// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging initialization shared by the provisioner's binaries.
//!
//! Binaries flatten [`CliLoggingArgs`] into their clap arguments and call
//! [`CliLoggingArgs::init`]. Output goes to stderr unless a log file or
//! directory is given. `RUST_LOG` overrides the default level.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub use tracing::Level;

/// Output format for log messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable plaintext format
    #[default]
    Plaintext,
    /// Structured JSON format
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Plaintext => write!(f, "plaintext"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CliLogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

/// Logging flags for `#[command(flatten)]`.
#[derive(Clone, Debug, Default, clap::Args, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CliLoggingArgs {
    /// Log verbosity level
    #[arg(long, value_enum, help = "Log verbosity level (default: info)")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<CliLogLevel>,

    /// Log output format
    #[arg(long, value_enum, help = "Log output format (default: plaintext)")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_format: Option<LogFormat>,

    /// Directory for log files
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    /// Log filename, relative to --log-dir when that is given
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl CliLoggingArgs {
    pub fn init(self, component: &str) -> anyhow::Result<()> {
        let level = self.log_level.unwrap_or_default().into();
        let format = self.log_format.unwrap_or_default();
        match self.resolve_log_path(component) {
            Some(path) => init_to_file(component, level, format, &path),
            None => init(component, level, format),
        }
    }

    /// `None` means log to stderr.
    fn resolve_log_path(&self, component: &str) -> Option<PathBuf> {
        match (&self.log_dir, &self.log_file) {
            (_, Some(file)) if file.is_absolute() => Some(file.clone()),
            (Some(dir), Some(file)) => Some(dir.join(file)),
            (None, Some(file)) => Some(file.clone()),
            (Some(dir), None) => Some(dir.join(format!("{}.log", component))),
            (None, None) => None,
        }
    }
}

pub fn init(component: &str, default_level: Level, format: LogFormat) -> anyhow::Result<()> {
    init_with_writer(component, default_level, format, io::stderr)
}

pub fn init_to_file(
    component: &str,
    default_level: Level,
    format: LogFormat,
    log_path: &Path,
) -> anyhow::Result<()> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = std::fs::OpenOptions::new().create(true).append(true).open(log_path)?;
    init_with_writer(component, default_level, format, log_file)
}

pub fn init_with_writer<W>(
    component: &str,
    default_level: Level,
    format: LogFormat,
    writer: W,
) -> anyhow::Result<()>
where
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(component, default_level)));

    match format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).json();
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);

            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer);
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);

            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
    }

    Ok(())
}

/// Crate names use underscores in tracing targets.
fn default_directive(component: &str, level: Level) -> String {
    format!("{},{}={}", level, component.replace('-', "_"), level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_level_conversion() {
        assert_eq!(Level::from(CliLogLevel::Error), Level::ERROR);
        assert_eq!(Level::from(CliLogLevel::Trace), Level::TRACE);
        assert_eq!(CliLogLevel::default(), CliLogLevel::Info);
    }

    #[test]
    fn console_logging_without_file_options() {
        let args = CliLoggingArgs::default();
        assert_eq!(args.resolve_log_path("zp-datasetctl"), None);
    }

    #[test]
    fn log_path_resolution() {
        let args = CliLoggingArgs {
            log_dir: Some(PathBuf::from("/var/log/zp")),
            ..Default::default()
        };
        assert_eq!(
            args.resolve_log_path("zp-datasetctl"),
            Some(PathBuf::from("/var/log/zp/zp-datasetctl.log"))
        );

        let args = CliLoggingArgs {
            log_dir: Some(PathBuf::from("/var/log/zp")),
            log_file: Some(PathBuf::from("ctl.log")),
            ..Default::default()
        };
        assert_eq!(
            args.resolve_log_path("zp-datasetctl"),
            Some(PathBuf::from("/var/log/zp/ctl.log"))
        );

        let args = CliLoggingArgs {
            log_dir: Some(PathBuf::from("/var/log/zp")),
            log_file: Some(PathBuf::from("/tmp/abs.log")),
            ..Default::default()
        };
        assert_eq!(
            args.resolve_log_path("zp-datasetctl"),
            Some(PathBuf::from("/tmp/abs.log"))
        );
    }

    #[test]
    fn default_directive_targets_crate() {
        assert_eq!(
            default_directive("zp-datasetctl", Level::DEBUG),
            "DEBUG,zp_datasetctl=DEBUG"
        );
    }

    #[test]
    fn file_logging_writes_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.log");
        init_to_file("zp-logging", Level::INFO, LogFormat::Json, &path).unwrap();
        tracing::info!(operation = "test", "hello from test");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("hello from test"));
    }
}
