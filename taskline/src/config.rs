//! Engine configuration.
//!
//! An [`EngineConfig`] is built once at process start and handed to
//! [`Engine::new`](crate::Engine::new). Values come from defaults, a JSON
//! file, environment overrides, or the `with_*` builder methods.

use crate::dispatch::ExecutionContext;
use crate::errors::{Result, TasklineError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Environment variable overriding [`EngineConfig::background_threads`].
pub const ENV_BACKGROUND_THREADS: &str = "TASKLINE_BACKGROUND_THREADS";

/// Environment variable overriding [`EngineConfig::pool_consumers`].
pub const ENV_POOL_CONSUMERS: &str = "TASKLINE_POOL_CONSUMERS";

fn default_background_threads() -> usize {
    3
}

fn default_pool_consumers() -> usize {
    3
}

fn default_thread_name_prefix() -> String {
    "taskline".to_string()
}

fn default_callback_context() -> ExecutionContext {
    ExecutionContext::Foreground
}

/// Pool sizes, thread naming and default contexts for an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of background workers.
    #[serde(default = "default_background_threads")]
    pub background_threads: usize,

    /// Concurrency of channels built with `consume_by_pool`.
    #[serde(default = "default_pool_consumers")]
    pub pool_consumers: usize,

    /// Prefix for every thread the engine spawns.
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,

    /// Context of stages added without an explicit context.
    #[serde(default)]
    pub default_stage_context: ExecutionContext,

    /// Context of `on_success` callbacks added without an explicit context.
    #[serde(default = "default_callback_context")]
    pub default_success_context: ExecutionContext,

    /// Context of `on_error` callbacks added without an explicit context.
    #[serde(default = "default_callback_context")]
    pub default_error_context: ExecutionContext,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            background_threads: default_background_threads(),
            pool_consumers: default_pool_consumers(),
            thread_name_prefix: default_thread_name_prefix(),
            default_stage_context: ExecutionContext::Background,
            default_success_context: default_callback_context(),
            default_error_context: default_callback_context(),
        }
    }
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the background worker count.
    #[must_use]
    pub fn with_background_threads(mut self, threads: usize) -> Self {
        self.background_threads = threads;
        self
    }

    /// Sets the pooled channel concurrency.
    #[must_use]
    pub fn with_pool_consumers(mut self, consumers: usize) -> Self {
        self.pool_consumers = consumers;
        self
    }

    /// Sets the thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Sets the default stage context.
    #[must_use]
    pub fn with_default_stage_context(mut self, context: ExecutionContext) -> Self {
        self.default_stage_context = context;
        self
    }

    /// Sets the default success callback context.
    #[must_use]
    pub fn with_default_success_context(mut self, context: ExecutionContext) -> Self {
        self.default_success_context = context;
        self
    }

    /// Sets the default error callback context.
    #[must_use]
    pub fn with_default_error_context(mut self, context: ExecutionContext) -> Self {
        self.default_error_context = context;
        self
    }

    /// Checks that the configuration can build an engine.
    pub fn validate(&self) -> Result<()> {
        if self.background_threads == 0 {
            return Err(TasklineError::InvalidConfig(
                "background_threads must be at least 1".to_string(),
            ));
        }
        if self.pool_consumers == 0 {
            return Err(TasklineError::InvalidConfig(
                "pool_consumers must be at least 1".to_string(),
            ));
        }
        if self.thread_name_prefix.trim().is_empty() {
            return Err(TasklineError::InvalidConfig(
                "thread_name_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Defaults with overrides from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup` (usually the environment).
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(threads) = parse_count(&lookup, ENV_BACKGROUND_THREADS)? {
            self.background_threads = threads;
        }
        if let Some(consumers) = parse_count(&lookup, ENV_POOL_CONSUMERS)? {
            self.pool_consumers = consumers;
        }
        Ok(self)
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| TasklineError::InvalidConfig(format!("malformed config: {e}")))
    }

    /// Loads a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            warn!("Failed to read config at {:?}: {}", path, e);
            TasklineError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&content)
    }
}

fn parse_count<F>(lookup: &F, key: &str) -> Result<Option<usize>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| TasklineError::InvalidConfig(format!("{key} must be a count, got {raw:?}"))),
    }
}
