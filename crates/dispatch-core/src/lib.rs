//! # Call Center Dispatch Core
//!
//! Bounded-concurrency dispatch of simulated phone calls to a fixed pool of
//! operator threads.
//!
//! ## Features
//!
//! - **Admission control**: a bounded FIFO queue that rejects calls when
//!   full and collapses repeated calls from the same number
//! - **Operator pool**: blocking operator threads pulling from the queue,
//!   with drain-and-swap reconfiguration while calls are in flight
//! - **Exactly-once results**: every submitted call resolves its future
//!   once, whatever path it takes
//! - **Call detail records**: one CDR per call handed to pluggable sinks
//!
//! ## Architecture
//!
//! - [`task`]: a single call, its service bounds and its result future
//! - [`queue`]: the admission-controlled call queue
//! - [`pool`]: operator threads and pool hand-off
//! - [`dispatcher`]: the entry point callers submit through
//! - [`config`]: settings providers and change notification
//! - [`recorder`]: CDR sinks
//! - [`builder`]: wiring of a complete system
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use callcenter_dispatch_core::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let system = DispatcherBuilder::new()
//!         .with_config_file("base.json")
//!         .with_cdr_file("cdrFile.txt")
//!         .build()?;
//!     system.dispatcher.start_thread_pool();
//!
//!     let (call_id, future) = system.dispatcher.submit("89161234567")?;
//!     let result = future.wait()?;
//!     println!("call {} finished: {}", call_id, result.status);
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod cdr;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod pool;
pub mod queue;
pub mod recorder;
pub mod task;

pub use builder::{DispatchSystem, DispatcherBuilder};
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, Result};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::builder::{DispatchSystem, DispatcherBuilder};
    pub use crate::cdr::{CallDetailRecord, CallId, CallResult, CallStatus};
    pub use crate::config::{
        ConfigListener, ConfigMonitor, ConfigProvider, DispatchSettings, JsonFileConfig,
        StaticConfig,
    };
    pub use crate::dispatcher::Dispatcher;
    pub use crate::error::{DispatchError, Result};
    pub use crate::pool::{CallPool, WorkerPool};
    pub use crate::queue::{CallQueue, TaskQueue};
    pub use crate::recorder::{FileRecorder, MemoryRecorder, Recorder, RecorderSet};
    pub use crate::task::{CallFuture, ResultPromise, ServiceBounds, Task};
}
