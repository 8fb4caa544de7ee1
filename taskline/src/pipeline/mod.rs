//! Pipeline building and execution.
//!
//! This module provides:
//! - The fluent builder and its terminal-callback stage
//! - Continuation-passing execution of stage chains
//! - Handles with cancellation and blocking retrieval
//! - Typed and homogeneous merges

mod builder;
pub(crate) mod handle;
pub(crate) mod merge;
pub(crate) mod run;
pub(crate) mod stage;


pub use builder::{PipelineBuilder, Single, WorkStarter};
pub use handle::PipelineHandle;
pub use merge::{MergeAll, MergeWorks2, MergeWorks3, MergeWorks4};
pub use stage::{Stage, StageKind};
