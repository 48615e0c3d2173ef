use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{DispatchError, Result};

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// The log level to use
    pub level: Level,
    /// Whether to enable JSON formatting on stdout
    pub json: bool,
    /// Whether to include file and line information
    pub file_info: bool,
    /// Whether to log spans
    pub log_spans: bool,
    /// Application name, logged once the subscriber is installed
    pub app_name: String,
    /// Also write plain-text logs to this file
    pub log_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            json: false,
            file_info: false,
            log_spans: false,
            app_name: "callcenter-dispatch".to_string(),
            log_file: None,
        }
    }
}

impl LoggingConfig {
    /// Create a new logging configuration
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        LoggingConfig {
            level,
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Enable JSON formatting
    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    /// Enable file and line information in logs
    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    /// Enable span logging
    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }

    /// Duplicate logs into `path`
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

/// Install the global subscriber
///
/// When a log file is configured the returned guard must be kept alive;
/// buffered lines are flushed when it drops.
pub fn setup_logging(config: LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let span_events = if config.log_spans {
        FmtSpan::ACTIVE
    } else {
        FmtSpan::NONE
    };

    let stdout = if config.json {
        fmt::layer()
            .json()
            .with_span_events(span_events.clone())
            .with_file(config.file_info)
            .with_line_number(config.file_info)
            .with_thread_names(true)
            .boxed()
    } else {
        fmt::layer()
            .with_span_events(span_events.clone())
            .with_file(config.file_info)
            .with_line_number(config.file_info)
            .with_thread_names(true)
            .boxed()
    };

    let (file, guard) = match &config.log_file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(file_appender(path));
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_span_events(span_events)
                .with_thread_names(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdout)
        .with(file)
        .with(filter)
        .try_init()
        .map_err(|e| DispatchError::config(format!("Failed to install logger: {}", e)))?;

    tracing::info!(
        app = %config.app_name,
        level = %config.level,
        "📝 Logging initialized"
    );
    Ok(guard)
}

fn file_appender(path: &Path) -> tracing_appender::rolling::RollingFileAppender {
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "logfile.txt".into());
    tracing_appender::rolling::never(directory, file_name)
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| DispatchError::Config(format!("Invalid log level: {}", level)))
}

/// Log a welcome message with version info
pub fn log_welcome(app_name: &str, version: &str) {
    tracing::info!("Starting {} v{}", app_name, version);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(matches!(
            parse_log_level("chatty"),
            Err(DispatchError::Config(_))
        ));
    }

    #[test]
    fn test_config_builders() {
        let config = LoggingConfig::new(Level::DEBUG, "dispatch")
            .with_json()
            .with_file_info()
            .with_log_file("logs/dispatch.log");
        assert!(config.json);
        assert!(config.file_info);
        assert!(!config.log_spans);
        assert_eq!(config.log_file.as_deref(), Some(Path::new("logs/dispatch.log")));
    }

    #[test]
    #[serial]
    fn test_setup_writes_log_file_and_refuses_second_install() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logfile.txt");

        let guard = setup_logging(LoggingConfig::new(Level::INFO, "dispatch-test").with_log_file(&path))
            .unwrap()
            .unwrap();
        tracing::info!("dispatch logging online");
        drop(guard);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("dispatch logging online"));
        assert!(contents.contains("app=dispatch-test"));

        assert!(setup_logging(LoggingConfig::default()).is_err());
    }
}
