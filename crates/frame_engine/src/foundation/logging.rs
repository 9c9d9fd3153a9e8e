//! Logging setup
//!
//! The crate logs through the `log` facade. [`init`] installs an
//! `env_logger` backend filtered by the configured [`LogSeverity`], writing
//! to stderr or appending to a log file. `RUST_LOG` still overrides the
//! configured level when set.

use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::PathBuf;
use thiserror::Error;

pub use log::{debug, error, info, trace, warn};

use crate::core::config::LoggingConfig;

/// Minimum severity a message needs to be emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum LogSeverity {
    /// Everything, including per-frame tracing
    Verbose,
    /// Lifecycle information
    #[default]
    Info,
    /// Recoverable problems and fallbacks
    Warning,
    /// Failures only
    Error,
    /// Logging disabled
    None,
}

impl LogSeverity {
    /// The matching `log` level filter
    pub fn level_filter(self) -> LevelFilter {
        match self {
            Self::Verbose => LevelFilter::Trace,
            Self::Info => LevelFilter::Info,
            Self::Warning => LevelFilter::Warn,
            Self::Error => LevelFilter::Error,
            Self::None => LevelFilter::Off,
        }
    }
}

/// Logging setup errors
#[derive(Error, Debug)]
pub enum LoggingError {
    /// The log file could not be opened for appending
    #[error("Failed to open log file {path}: {source}")]
    LogFile {
        /// Requested log file
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// A global logger was installed earlier
    #[error("Logger already initialized: {0}")]
    AlreadyInitialized(#[from] log::SetLoggerError),
}

/// Install the global logger
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(config.min_severity.level_filter());
    builder.parse_env("RUST_LOG");

    if let Some(path) = &config.log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| LoggingError::LogFile {
                path: path.clone(),
                source,
            })?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
        builder.write_style(env_logger::WriteStyle::Never);
    }

    builder.try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(LogSeverity::Verbose < LogSeverity::Info);
        assert!(LogSeverity::Error < LogSeverity::None);
    }

    #[test]
    fn test_level_filters() {
        assert_eq!(LogSeverity::Verbose.level_filter(), LevelFilter::Trace);
        assert_eq!(LogSeverity::Warning.level_filter(), LevelFilter::Warn);
        assert_eq!(LogSeverity::None.level_filter(), LevelFilter::Off);
    }

    #[test]
    fn test_unopenable_log_file() {
        let config = LoggingConfig::default().with_log_file("/nonexistent-dir/engine.log");
        assert!(matches!(init(&config), Err(LoggingError::LogFile { .. })));
    }
}
