//! # Taskline
//!
//! Chained background work with results delivered on a foreground lane.
//!
//! Taskline runs expensive computations off the caller's thread and hands
//! their results back on a single serialized foreground lane, with support
//! for:
//!
//! - **Stage chains**: transform, consume and filter steps, each on its own
//!   execution context
//! - **Cancellation**: per-pipeline tokens, non-cancellable sections and a
//!   registry for bulk cancellation
//! - **Merges**: fan-in of independent computations into one result
//! - **Channels**: long-lived consumers with exclusive or pooled delivery
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use taskline::prelude::*;
//!
//! let engine = Engine::new(EngineConfig::default())?;
//!
//! let handle = engine
//!     .create(|| 1000)
//!     .transform(|x| x + 100)
//!     .on_success(|value| println!("got {value}"))
//!     .on_error(|err| eprintln!("failed: {err}"))
//!     .start();
//!
//! assert_eq!(handle.get()?, 1100);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod observability;
pub mod pipeline;
pub mod stream;
pub mod testing;

pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use errors::{Result, TasklineError};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CancellationToken, LifecycleRegistry, ManagedWork};
    pub use crate::config::EngineConfig;
    pub use crate::dispatch::{
        Executor, ExecutionContext, FaultSink, ForegroundDispatcher, LoggingFaultSink,
    };
    pub use crate::engine::{Engine, EngineBuilder};
    pub use crate::errors::{Result, TasklineError};
    pub use crate::pipeline::{PipelineBuilder, PipelineHandle, WorkStarter};
    pub use crate::stream::{DeliveryPolicy, StreamChannel};
}
