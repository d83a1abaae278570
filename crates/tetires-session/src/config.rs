//! Session configuration

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Records per scan; reaching it starts processing without a STOP
pub const DEFAULT_BATCH_CAPACITY: usize = 1110;

/// Lines kept in the passthrough log
pub const DEFAULT_LOG_CAPACITY: usize = 2000;

/// Acquisition settings, the `[session]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_batch_capacity")]
    pub batch_capacity: usize,

    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

fn default_batch_capacity() -> usize {
    DEFAULT_BATCH_CAPACITY
}

fn default_log_capacity() -> usize {
    DEFAULT_LOG_CAPACITY
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            batch_capacity: default_batch_capacity(),
            log_capacity: default_log_capacity(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionConfigError {
    #[error("session.batch_capacity must be greater than zero")]
    ZeroBatchCapacity,

    #[error("session.log_capacity must be greater than zero")]
    ZeroLogCapacity,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionConfigError> {
        if self.batch_capacity == 0 {
            return Err(SessionConfigError::ZeroBatchCapacity);
        }
        if self.log_capacity == 0 {
            return Err(SessionConfigError::ZeroLogCapacity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.batch_capacity, 1110);
        assert_eq!(config.log_capacity, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = SessionConfig {
            batch_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(SessionConfigError::ZeroBatchCapacity));

        let config = SessionConfig {
            log_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(SessionConfigError::ZeroLogCapacity));
    }
}
