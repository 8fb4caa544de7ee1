//! Testing utilities for taskline pipelines.
//!
//! This module provides:
//! - CallbackProbe, which records what terminal callbacks received
//! - ManualForeground, a foreground lane driven by the test
//! - Assertions for callbacks and `get()` results

mod assertions;
mod foreground;
mod probe;

pub use assertions::{
    assert_cancelled, assert_eventually, assert_no_callbacks, assert_single_success,
    assert_stage_failed,
};
pub use foreground::ManualForeground;
pub use probe::CallbackProbe;
