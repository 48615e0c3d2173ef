//! Dispatcher configuration
//!
//! The dispatcher reads four values from a [`ConfigProvider`]: the service
//! bounds `RMin`/`RMax`, the number of operators and the queue capacity. A
//! provider announces changes to one subscribed [`ConfigListener`].
//!
//! Two providers ship with the crate:
//!
//! - [`JsonFileConfig`] reads a JSON document such as
//!
//!   ```json
//!   { "RMin": 10, "RMax": 20, "AmountOfOperators": 4, "SizeOfQueue": 50 }
//!   ```
//!
//!   and clamps every value to its documented range. A [`ConfigMonitor`]
//!   can watch the file and reload it when it changes.
//! - [`StaticConfig`] holds values in memory and applies them verbatim.

use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{DispatchError, Result};

const R_MIN_RANGE: RangeInclusive<u32> = 4..=100;
const R_MAX_RANGE: RangeInclusive<u32> = 5..=140;
const OPERATORS_RANGE: RangeInclusive<usize> = 2..=80;
const QUEUE_SIZE_RANGE: RangeInclusive<usize> = 15..=350;

/// Dispatcher settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Lower service bound, in service units
    #[serde(rename = "RMin")]
    pub r_min: u32,

    /// Upper service bound and wait limit, in service units
    #[serde(rename = "RMax")]
    pub r_max: u32,

    /// Number of operator threads
    #[serde(rename = "AmountOfOperators")]
    pub operators: usize,

    /// Queue capacity
    #[serde(rename = "SizeOfQueue")]
    pub queue_size: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            r_min: 10,
            r_max: 15,
            operators: 2,
            queue_size: 15,
        }
    }
}

impl DispatchSettings {
    /// Clamp every value to its allowed range and order the bounds
    pub fn normalized(self) -> Self {
        let mut r_min = clamp(self.r_min, &R_MIN_RANGE);
        let mut r_max = clamp(self.r_max, &R_MAX_RANGE);
        if r_min > r_max {
            std::mem::swap(&mut r_min, &mut r_max);
        }
        let normalized = Self {
            r_min,
            r_max,
            operators: clamp(self.operators, &OPERATORS_RANGE),
            queue_size: clamp(self.queue_size, &QUEUE_SIZE_RANGE),
        };
        if normalized != self {
            debug!(original = ?self, normalized = ?normalized, "Configuration values clamped");
        }
        normalized
    }

    /// Parse a JSON document
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

fn clamp<T: PartialOrd + Copy>(value: T, range: &RangeInclusive<T>) -> T {
    if value < *range.start() {
        *range.start()
    } else if value > *range.end() {
        *range.end()
    } else {
        value
    }
}

/// Receiver of configuration change notifications
pub trait ConfigListener: Send + Sync {
    fn on_config_changed(&self);
}

/// Source of dispatcher settings
pub trait ConfigProvider: Send + Sync {
    /// Current settings
    fn settings(&self) -> DispatchSettings;

    /// `(RMin, RMax)`
    fn min_max(&self) -> (u32, u32) {
        let settings = self.settings();
        (settings.r_min, settings.r_max)
    }

    fn amount_of_operators(&self) -> usize {
        self.settings().operators
    }

    fn size_of_queue(&self) -> usize {
        self.settings().queue_size
    }

    /// Re-read the settings from the source
    ///
    /// Sets the updated flag on success; the current settings are kept on
    /// failure.
    fn reload(&self) -> Result<()>;

    /// Whether a reload succeeded since the last call; clears the flag
    fn is_updated(&self) -> bool;

    /// Register the listener notified after reloads
    ///
    /// Held weakly; a later call replaces the earlier listener.
    fn subscribe(&self, listener: Weak<dyn ConfigListener>);

    /// Reload and notify the listener
    fn update_with_request(&self) -> Result<()>;
}

/// Weakly held listener shared by the providers
#[derive(Default)]
struct ListenerSlot {
    listener: Mutex<Option<Weak<dyn ConfigListener>>>,
}

impl ListenerSlot {
    fn set(&self, listener: Weak<dyn ConfigListener>) {
        *self.listener.lock() = Some(listener);
    }

    fn notify(&self) {
        let listener = self.listener.lock().as_ref().and_then(Weak::upgrade);
        match listener {
            Some(listener) => {
                info!("🔔 Notifying dispatcher about configuration update");
                listener.on_config_changed();
            }
            None => warn!("No listener subscribed, configuration update not propagated"),
        }
    }
}

/// Configuration read from a JSON file
///
/// If the file cannot be read when the provider is created, defaults are
/// used and every later reload is refused until the process is restarted
/// with a readable file.
pub struct JsonFileConfig {
    path: PathBuf,
    settings: RwLock<DispatchSettings>,
    updated: AtomicBool,
    updates_disabled: bool,
    listener: ListenerSlot,
}

impl JsonFileConfig {
    /// Load settings from `path`; relative paths are resolved against the
    /// current directory
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = resolve_path(path.as_ref());
        let (settings, updates_disabled) = match read_settings(&path) {
            Ok(settings) => {
                info!("⚙️ Configuration loaded from {}", path.display());
                (settings, false)
            }
            Err(e) => {
                error!(
                    path = %path.display(),
                    error = %e,
                    "Failed to load configuration, using defaults and disabling updates"
                );
                (DispatchSettings::default(), true)
            }
        };

        Self {
            path,
            settings: RwLock::new(settings),
            updated: AtomicBool::new(false),
            updates_disabled,
            listener: ListenerSlot::default(),
        }
    }

    /// Absolute location of the configuration file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `false` when the file was unreadable at startup
    pub fn updates_enabled(&self) -> bool {
        !self.updates_disabled
    }
}

impl ConfigProvider for JsonFileConfig {
    fn settings(&self) -> DispatchSettings {
        *self.settings.read()
    }

    fn reload(&self) -> Result<()> {
        if self.updates_disabled {
            info!("Configuration updates are disabled, reload skipped");
            return Err(DispatchError::config(format!(
                "updates disabled: {} was unreadable at startup",
                self.path.display()
            )));
        }

        let mut settings = self.settings.write();
        match read_settings(&self.path) {
            Ok(fresh) => {
                info!(?fresh, "⚙️ Configuration updated from {}", self.path.display());
                *settings = fresh;
                self.updated.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Error updating configuration");
                Err(e)
            }
        }
    }

    fn is_updated(&self) -> bool {
        let updated = self.updated.swap(false, Ordering::AcqRel);
        debug!("Checking if the configuration is updated: {}", updated);
        updated
    }

    fn subscribe(&self, listener: Weak<dyn ConfigListener>) {
        self.listener.set(listener);
    }

    fn update_with_request(&self) -> Result<()> {
        self.reload()?;
        self.listener.notify();
        Ok(())
    }
}

fn resolve_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

fn read_settings(path: &Path) -> Result<DispatchSettings> {
    let text = fs::read_to_string(path)?;
    Ok(DispatchSettings::from_json(&text)?.normalized())
}

/// In-memory configuration
///
/// Values are applied as given, without clamping. [`StaticConfig::set`]
/// stages new values that take effect on the next reload.
pub struct StaticConfig {
    staged: Mutex<DispatchSettings>,
    settings: RwLock<DispatchSettings>,
    updated: AtomicBool,
    updates_disabled: bool,
    listener: ListenerSlot,
}

impl StaticConfig {
    pub fn new(settings: DispatchSettings) -> Self {
        Self {
            staged: Mutex::new(settings),
            settings: RwLock::new(settings),
            updated: AtomicBool::new(false),
            updates_disabled: false,
            listener: ListenerSlot::default(),
        }
    }

    /// Provider whose reloads always fail
    pub fn read_only(settings: DispatchSettings) -> Self {
        Self {
            updates_disabled: true,
            ..Self::new(settings)
        }
    }

    /// Stage values for the next reload
    pub fn set(&self, settings: DispatchSettings) {
        *self.staged.lock() = settings;
    }
}

impl ConfigProvider for StaticConfig {
    fn settings(&self) -> DispatchSettings {
        *self.settings.read()
    }

    fn reload(&self) -> Result<()> {
        if self.updates_disabled {
            return Err(DispatchError::config("updates disabled"));
        }
        *self.settings.write() = *self.staged.lock();
        self.updated.store(true, Ordering::Release);
        Ok(())
    }

    fn is_updated(&self) -> bool {
        self.updated.swap(false, Ordering::AcqRel)
    }

    fn subscribe(&self, listener: Weak<dyn ConfigListener>) {
        self.listener.set(listener);
    }

    fn update_with_request(&self) -> Result<()> {
        self.reload()?;
        self.listener.notify();
        Ok(())
    }
}

/// Background watcher reloading a [`JsonFileConfig`] when its file changes
///
/// The file's modification time is polled every `interval`. The thread
/// stops when the monitor is dropped or the config itself goes away.
pub struct ConfigMonitor {
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl ConfigMonitor {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

    /// Start watching; `None` when the config has updates disabled
    pub fn spawn(config: &Arc<JsonFileConfig>, interval: Duration) -> Result<Option<Self>> {
        if !config.updates_enabled() {
            info!("Could not run update thread because updates are disabled");
            return Ok(None);
        }

        let shutdown = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = shutdown.clone();
        let weak = Arc::downgrade(config);
        let path = config.path().to_path_buf();
        let last_write = modified(&path);

        info!("👀 Starting configuration monitor for {}", path.display());
        let handle = thread::Builder::new()
            .name("config-monitor".to_string())
            .spawn(move || watch(weak, path, last_write, interval, signal))?;

        Ok(Some(Self {
            shutdown,
            handle: Some(handle),
        }))
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for ConfigMonitor {
    fn drop(&mut self) {
        {
            let (stopped, wake) = &*self.shutdown;
            *stopped.lock() = true;
            wake.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Configuration monitor thread panicked");
            }
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn watch(
    config: Weak<JsonFileConfig>,
    path: PathBuf,
    mut last_write: Option<SystemTime>,
    interval: Duration,
    shutdown: Arc<(Mutex<bool>, Condvar)>,
) {
    let (stopped, wake) = &*shutdown;

    loop {
        {
            let mut stopped = stopped.lock();
            if !*stopped {
                wake.wait_for(&mut stopped, interval);
            }
            if *stopped {
                break;
            }
        }

        let current = modified(&path);
        if current <= last_write {
            continue;
        }
        let Some(config) = config.upgrade() else {
            break;
        };

        debug!("Configuration file changed, reloading");
        if let Err(e) = config.update_with_request() {
            warn!(error = %e, "Configuration reload after file change failed");
        }
        last_write = current;
    }
    debug!("Configuration monitor stopped");
}
