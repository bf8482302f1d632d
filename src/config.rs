use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Settings for an [`Executor`].
///
/// Every field is optional. An unset pool size means "as many workers as the
/// host offers", an unset timeout means tasks may run for as long as they
/// like. The struct deserializes from JSON such as
/// `{"pool_size": 4, "task_timeout_ms": 2000}`.
///
/// [`Executor`]: crate::Executor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Upper bound on the number of workers per level.
    pub pool_size: Option<usize>,
    /// Per-task limit, measured from the moment a worker picks the task up.
    pub task_timeout_ms: Option<u64>,
}

impl ExecutorConfig {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// The configured pool size, or the host's available parallelism.
    pub fn resolved_pool_size(&self) -> Result<usize, ConfigError> {
        match self.pool_size {
            Some(0) => Err(ConfigError::ZeroPoolSize),
            Some(size) => Ok(size),
            None => Ok(std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)),
        }
    }

    pub fn task_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        match self.task_timeout_ms {
            Some(0) => Err(ConfigError::ZeroTimeout),
            Some(ms) => Ok(Some(Duration::from_millis(ms))),
            None => Ok(None),
        }
    }
}
