//! Call dispatcher
//!
//! The [`Dispatcher`] is the entry point for callers. It holds the live
//! configuration and operator pool behind a reader-writer lock:
//!
//! - [`Dispatcher::submit`] takes the read lock, so any number of callers
//!   can admit calls concurrently.
//! - [`Dispatcher::update`] takes the write lock to apply new settings. A
//!   changed operator count builds a fresh pool and hands the waiting
//!   calls over to it; see [`Dispatcher::set_new_thread_pool`].
//!
//! The replaced pool is joined on a background thread, because an operator
//! may still be holding a call for up to `RMax` units.

use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use chrono::Local;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::cdr::CallId;
use crate::config::{ConfigListener, ConfigProvider};
use crate::error::Result;
use crate::pool::{CallPool, WorkerPool};
use crate::task::{CallFuture, ServiceBounds, Task};

struct DispatcherState {
    bounds: ServiceBounds,
    config: Arc<dyn ConfigProvider>,
    pool: Arc<dyn CallPool>,
    running: bool,
}

/// Routes incoming calls to the live operator pool
pub struct Dispatcher {
    state: RwLock<DispatcherState>,
    unit: Duration,
    me: Weak<Dispatcher>,
}

impl Dispatcher {
    /// Create a dispatcher counting service bounds in seconds
    ///
    /// The dispatcher subscribes itself to `config`. The pool is left
    /// stopped; call [`Dispatcher::start_thread_pool`] to begin servicing.
    pub fn new(config: Arc<dyn ConfigProvider>, pool: Arc<dyn CallPool>) -> Arc<Self> {
        Self::with_unit(config, pool, Duration::from_secs(1))
    }

    /// Create a dispatcher with a custom service unit
    pub fn with_unit(
        config: Arc<dyn ConfigProvider>,
        pool: Arc<dyn CallPool>,
        unit: Duration,
    ) -> Arc<Self> {
        let (r_min, r_max) = config.min_max();
        info!(
            r_min,
            r_max,
            operators = pool.size(),
            "🚀 Creating call dispatcher"
        );

        Arc::new_cyclic(|me: &Weak<Dispatcher>| {
            let listener: Weak<dyn ConfigListener> = me.clone();
            config.subscribe(listener);
            Self {
                state: RwLock::new(DispatcherState {
                    bounds: ServiceBounds::new(r_min, r_max).with_unit(unit),
                    config,
                    pool,
                    running: false,
                }),
                unit,
                me: me.clone(),
            }
        })
    }

    /// Admit a call from `number`
    ///
    /// The task is built with the bounds in effect right now. The returned
    /// future resolves once the call is serviced, timed out or rejected.
    pub fn submit(&self, number: &str) -> Result<(CallId, CallFuture)> {
        let state = self.state.read();
        let task = Task::new(state.bounds, Arc::from(number), Local::now());
        let (call_id, future) = state.pool.add_task(task)?;
        debug!(call_id, number, "Call submitted");
        Ok((call_id, future))
    }

    /// Apply the provider's current settings
    ///
    /// New bounds apply to calls admitted from now on. The queue capacity
    /// is changed in place. A different operator count swaps in a new pool.
    pub fn update(&self) -> Result<()> {
        // Operator threads are spawned before the write lock is taken.
        let (config, live_size) = {
            let state = self.state.read();
            (state.config.clone(), state.pool.size())
        };
        let wanted = config.settings();
        let mut replacement = if wanted.operators != live_size {
            Some(WorkerPool::new(wanted.operators, wanted.queue_size)?)
        } else {
            None
        };

        let retired = {
            let mut state = self.state.write();
            let settings = state.config.settings();

            state.bounds = ServiceBounds::new(settings.r_min, settings.r_max).with_unit(self.unit);
            info!(
                r_min = settings.r_min,
                r_max = settings.r_max,
                "🔄 Applying configuration"
            );

            if let Some(queue) = state.pool.task_queue() {
                queue.lock().update(settings.queue_size);
            }

            if settings.operators != state.pool.size() {
                info!(
                    "👥 Operator count changed: {} -> {}",
                    state.pool.size(),
                    settings.operators
                );
                let pool = match replacement.take() {
                    Some(pool) if pool.size() == settings.operators => pool,
                    // settings changed between the two reads
                    _ => WorkerPool::new(settings.operators, settings.queue_size)?,
                };
                Some(Self::swap_pool(&mut state, Arc::new(pool)))
            } else {
                None
            }
        };

        if let Some(old) = retired {
            retire(old);
        }
        if let Some(unused) = replacement {
            debug!("Discarding unused operator pool ({} operators)", unused.size());
        }
        Ok(())
    }

    /// Re-read the configuration source and apply it
    ///
    /// Returns whether the source reported a successful update.
    pub fn request_reconfigure(&self) -> bool {
        let config = self.state.read().config.clone();
        if let Err(e) = config.reload() {
            warn!(error = %e, "Reconfiguration request refused by configuration source");
            return false;
        }
        if let Err(e) = self.update() {
            error!(error = %e, "Failed to apply configuration");
            return false;
        }
        config.is_updated()
    }

    pub fn start_thread_pool(&self) {
        let mut state = self.state.write();
        state.running = true;
        state.pool.start();
    }

    pub fn stop_thread_pool(&self) {
        let mut state = self.state.write();
        state.running = false;
        state.pool.stop();
    }

    /// Replace the configuration provider and subscribe to it
    ///
    /// Settings from the new provider take effect on the next update.
    pub fn set_new_config(&self, config: Arc<dyn ConfigProvider>) {
        let listener: Weak<dyn ConfigListener> = self.me.clone();
        config.subscribe(listener);
        self.state.write().config = config;
        info!("⚙️ Configuration provider replaced");
    }

    /// Hand the live queue, recorders and id source to `pool` and make it
    /// the live pool
    ///
    /// The old pool is stopped first and started pools stay started: the
    /// new pool runs if the dispatcher was running.
    pub fn set_new_thread_pool(&self, pool: Arc<dyn CallPool>) {
        let old = {
            let mut state = self.state.write();
            Self::swap_pool(&mut state, pool)
        };
        retire(old);
    }

    fn swap_pool(state: &mut DispatcherState, pool: Arc<dyn CallPool>) -> Arc<dyn CallPool> {
        state.pool.stop();
        pool.transfer_objects(state.pool.as_ref());
        if state.running {
            pool.start();
        }
        info!("🔀 Operator pool replaced ({} operators)", pool.size());
        std::mem::replace(&mut state.pool, pool)
    }

    /// Operator count of the live pool
    pub fn pool_size(&self) -> usize {
        self.state.read().pool.size()
    }

    /// Calls waiting in the live queue
    pub fn queued(&self) -> usize {
        self.state.read().pool.queued()
    }

    /// Bounds applied to newly admitted calls
    pub fn bounds(&self) -> ServiceBounds {
        self.state.read().bounds
    }

    pub fn is_running(&self) -> bool {
        self.state.read().running
    }

    /// The live pool
    pub fn pool(&self) -> Arc<dyn CallPool> {
        self.state.read().pool.clone()
    }
}

impl ConfigListener for Dispatcher {
    fn on_config_changed(&self) {
        if let Err(e) = self.update() {
            error!(error = %e, "Failed to apply configuration change");
        }
    }
}

/// Drop a replaced pool off the caller's thread
fn retire(pool: Arc<dyn CallPool>) {
    let spawned = thread::Builder::new()
        .name("pool-reaper".to_string())
        .spawn(move || {
            drop(pool);
            debug!("Retired operator pool released");
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Could not spawn pool reaper, old pool released on this thread");
    }
}
