use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Bounds on template expansion, guarding against runaway context variation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveLimits {
    /// Longest chain of requirements followed from a root.
    pub max_depth: usize,
    /// Most distinct tasks a single resolution may produce.
    pub max_tasks: usize,
}

impl Default for ResolveLimits {
    fn default() -> Self {
        Self {
            max_depth: 256,
            max_tasks: 100_000,
        }
    }
}

/// Settings of a [`Dispatcher`](crate::Dispatcher).
///
/// Can be assembled in code with the builder methods or deserialized:
///
/// ```rust
/// use taskdispatch::DispatchConfig;
///
/// let config = DispatchConfig::from_json(r#"{ "parallel": true, "limits": { "max_depth": 32 } }"#).unwrap();
/// assert!(config.parallel);
/// assert_eq!(config.limits.max_depth, 32);
/// assert_eq!(config.limits.max_tasks, 100_000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Run independent branches on the rayon thread pool.
    pub parallel: bool,
    /// Run followed-by tasks after the tasks they follow.
    pub post_tasks: bool,
    /// Show a progress bar for the dispatch span.
    pub progress: bool,
    pub limits: ResolveLimits,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            post_tasks: true,
            progress: false,
            limits: ResolveLimits::default(),
        }
    }
}

impl DispatchConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_depth == 0 {
            return Err(ConfigError::Invalid("limits.max_depth must be at least 1".into()));
        }
        if self.limits.max_tasks == 0 {
            return Err(ConfigError::Invalid("limits.max_tasks must be at least 1".into()));
        }
        Ok(())
    }

    pub fn parallel(mut self, value: bool) -> Self {
        self.parallel = value;
        self
    }

    pub fn post_tasks(mut self, value: bool) -> Self {
        self.post_tasks = value;
        self
    }

    pub fn progress(mut self, value: bool) -> Self {
        self.progress = value;
        self
    }

    pub fn limits(mut self, limits: ResolveLimits) -> Self {
        self.limits = limits;
        self
    }
}
