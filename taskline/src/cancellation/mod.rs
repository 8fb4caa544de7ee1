//! Cooperative cancellation and lifecycle tracking.
//!
//! This module provides:
//! - CancellationToken, the monotonic cancel flag shared by a pipeline's stages
//! - LifecycleRegistry for bulk cancellation of started handles

mod registry;
mod token;

pub use registry::{FinishHook, LifecycleRegistry, ManagedWork};
pub use token::{CancelCallback, CancellationToken};
