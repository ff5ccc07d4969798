//! Process-wide `tracing` subscriber.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, LogLevel};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to open log file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to install log subscriber: {0}")]
    Install(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub decoration: bool,
}

impl LogLevel {
    /// Filter directive for this level.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Normal => "info",
            LogLevel::Quiet => "warn",
            LogLevel::Silent => "error",
            LogLevel::Disabled => "off",
        }
    }
}

impl LogConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        let output = match (&cli.log_file, cli.log_stderr) {
            (Some(path), _) => LogOutput::File(path.clone()),
            (None, true) => LogOutput::Stderr,
            (None, false) => LogOutput::Stdout,
        };
        Self {
            level: cli.log_level,
            // Files never get escape codes.
            decoration: !cli.disable_log_decoration && !matches!(output, LogOutput::File(_)),
            output,
        }
    }

    /// `RUST_LOG` wins over the configured level.
    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.directive()))
    }

    fn writer(&self) -> Result<BoxMakeWriter, LoggingError> {
        Ok(match &self.output {
            LogOutput::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogOutput::Stderr => BoxMakeWriter::new(std::io::stderr),
            LogOutput::File(path) => {
                let file = File::create(path).map_err(|source| LoggingError::Open {
                    path: path.clone(),
                    source,
                })?;
                BoxMakeWriter::new(Mutex::new(file))
            }
        })
    }

    /// Install the global subscriber. Fails if one is already installed.
    pub fn init(&self) -> Result<(), LoggingError> {
        tracing_subscriber::fmt()
            .with_env_filter(self.filter())
            .with_writer(self.writer()?)
            .with_ansi(self.decoration)
            .with_thread_names(true)
            .with_target(false)
            .try_init()
            .map_err(|err| LoggingError::Install(err.to_string()))
    }
}
