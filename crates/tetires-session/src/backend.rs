//! Collaborators the session hands work to
//!
//! The groove-depth algorithm and the inspection database live outside this
//! crate. The session only sees these two traits.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tetires_core::{TirePosition, TireScanResult};
use thiserror::Error;

use crate::processing::Measurement;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// Reported by the processing collaborator itself; shown verbatim
    #[error("{0}")]
    Failed(String),

    #[error("Invalid processing response: {0}")]
    InvalidResponse(String),

    #[error("Processing backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("{0}")]
    Storage(String),

    #[error("Unknown check {0}")]
    UnknownCheck(i64),
}

/// Turns the raw sample lines of one scan into a measurement
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessingBackend: Send + Sync {
    async fn process(&self, samples: Vec<String>) -> Result<Measurement, ProcessingError>;
}

/// Per-check worn verdicts written after all positions are saved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSummary {
    pub bus_id: i64,
    pub check_id: i64,
    pub worn: BTreeMap<TirePosition, bool>,
}

impl CheckSummary {
    pub fn status(&self, position: TirePosition) -> Option<bool> {
        self.worn.get(&position).copied()
    }
}

/// Stores inspection results
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Insert or overwrite the result for one position of a check
    async fn save_position(
        &self,
        check_id: i64,
        result: TireScanResult,
    ) -> Result<(), PersistenceError>;

    async fn finalize_check(&self, summary: CheckSummary) -> Result<(), PersistenceError>;
}
