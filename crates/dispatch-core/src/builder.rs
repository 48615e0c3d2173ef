//! Process wiring
//!
//! [`DispatcherBuilder`] assembles the configuration provider, CDR
//! recorders, operator pool and dispatcher, subscribes the dispatcher to
//! configuration changes and starts the file monitor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::config::{ConfigMonitor, ConfigProvider, JsonFileConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, Result};
use crate::pool::{CallPool, WorkerPool};
use crate::recorder::{FileRecorder, Recorder, RecorderSet};

enum ConfigSource {
    File(PathBuf),
    Provider(Arc<dyn ConfigProvider>),
}

/// A wired dispatcher and the objects that must live alongside it
pub struct DispatchSystem {
    pub dispatcher: Arc<Dispatcher>,
    pub recorders: Arc<RecorderSet>,
    /// Present when a file-backed configuration with updates enabled is
    /// being watched
    pub monitor: Option<ConfigMonitor>,
}

/// Builder for a [`DispatchSystem`]
pub struct DispatcherBuilder {
    config: Option<ConfigSource>,
    cdr_file: Option<PathBuf>,
    recorders: Vec<Arc<dyn Recorder>>,
    unit: Duration,
    monitor_interval: Option<Duration>,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self {
            config: None,
            cdr_file: None,
            recorders: Vec::new(),
            unit: Duration::from_secs(1),
            monitor_interval: Some(ConfigMonitor::DEFAULT_INTERVAL),
        }
    }
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read settings from a JSON file
    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = Some(ConfigSource::File(path.into()));
        self
    }

    /// Use an existing provider
    pub fn with_config(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.config = Some(ConfigSource::Provider(provider));
        self
    }

    /// Append CDR lines to `path`
    pub fn with_cdr_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cdr_file = Some(path.into());
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn Recorder>) -> Self {
        self.recorders.push(recorder);
        self
    }

    /// Length of one service unit
    pub fn with_service_unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    /// Poll interval of the configuration file monitor
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = Some(interval);
        self
    }

    /// Do not watch the configuration file
    pub fn without_monitor(mut self) -> Self {
        self.monitor_interval = None;
        self
    }

    /// Assemble the system; the operator pool is left stopped
    pub fn build(self) -> Result<DispatchSystem> {
        let (config, file_config) = match self.config {
            Some(ConfigSource::File(path)) => {
                let file = Arc::new(JsonFileConfig::load(path));
                let provider: Arc<dyn ConfigProvider> = file.clone();
                (provider, Some(file))
            }
            Some(ConfigSource::Provider(provider)) => (provider, None),
            None => {
                error!("Dispatcher built without a configuration source");
                return Err(DispatchError::config("no configuration source"));
            }
        };
        info!("Built config");

        let mut recorders = self.recorders;
        if let Some(path) = &self.cdr_file {
            recorders.push(Arc::new(FileRecorder::open(path)?));
        }
        let recorders = Arc::new(RecorderSet::new(recorders));
        info!("Built {} recorders", recorders.len());

        let settings = config.settings();
        let pool = WorkerPool::new(settings.operators, settings.queue_size)?;
        pool.set_recorders(recorders.clone());
        info!("Built operator pool");

        let dispatcher = Dispatcher::with_unit(config, Arc::new(pool), self.unit);

        let monitor = match (file_config, self.monitor_interval) {
            (Some(file), Some(interval)) => ConfigMonitor::spawn(&file, interval)?,
            _ => None,
        };

        info!("✅ Dispatcher constructed successfully");
        Ok(DispatchSystem {
            dispatcher,
            recorders,
            monitor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdr::CallStatus;
    use crate::config::{DispatchSettings, StaticConfig};
    use crate::recorder::MemoryRecorder;

    #[test]
    fn test_build_requires_config() {
        assert!(matches!(
            DispatcherBuilder::new().build(),
            Err(DispatchError::Config(_))
        ));
    }

    #[test]
    fn test_build_from_file_with_cdr_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("base.json");
        std::fs::write(
            &config_path,
            r#"{"RMin": 4, "RMax": 5, "AmountOfOperators": 3, "SizeOfQueue": 20}"#,
        )
        .unwrap();
        let cdr_path = dir.path().join("cdrFile.txt");

        let system = DispatcherBuilder::new()
            .with_config_file(&config_path)
            .with_cdr_file(&cdr_path)
            .with_service_unit(Duration::from_millis(1))
            .with_monitor_interval(Duration::from_millis(50))
            .build()
            .unwrap();

        assert_eq!(system.dispatcher.pool_size(), 3);
        assert_eq!(system.recorders.len(), 1);
        assert!(system.monitor.is_some());
        assert!(!system.dispatcher.is_running());
        assert!(cdr_path.exists());
    }

    #[test]
    fn test_missing_config_file_builds_defaults_without_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let system = DispatcherBuilder::new()
            .with_config_file(dir.path().join("missing.json"))
            .build()
            .unwrap();
        assert_eq!(system.dispatcher.pool_size(), 2);
        assert!(system.monitor.is_none());
        assert!(!system.dispatcher.request_reconfigure());
    }

    #[test]
    fn test_build_with_provider_and_recorder() {
        let memory = Arc::new(MemoryRecorder::new());
        let config = Arc::new(StaticConfig::new(DispatchSettings {
            r_min: 1,
            r_max: 10,
            operators: 2,
            queue_size: 5,
        }));
        let system = DispatcherBuilder::new()
            .with_config(config)
            .with_recorder(memory.clone())
            .with_service_unit(Duration::from_millis(1))
            .build()
            .unwrap();
        assert!(system.monitor.is_none());

        system.dispatcher.start_thread_pool();
        let (_, future) = system.dispatcher.submit("100").unwrap();
        let result = future.wait().unwrap();
        assert!(matches!(result.status, CallStatus::Completed | CallStatus::Timeout));
        assert!(system.dispatcher.pool().queued() == 0);
    }
}
