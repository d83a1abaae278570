//! Session errors

use tetires_core::{FailureKind, ScanState};
use tetires_link::LinkError;
use thiserror::Error;

use crate::backend::{PersistenceError, ProcessingError};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("Session is not running")]
    SessionClosed,

    #[error("Not in inspection mode")]
    NotInInspection,

    #[error("Device not connected")]
    NotConnected,

    #[error("Select a tire position first")]
    NoPosition,

    #[error("Invalid state: {0}")]
    InvalidState(ScanState),

    #[error("Waiting for {0} to finish")]
    Busy(&'static str),

    #[error("No data to process")]
    NoData,

    #[error("No results to save yet")]
    NothingToSave,

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl SessionError {
    /// Classification for the errors that come from outside the session
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            SessionError::NotConnected => Some(FailureKind::NotAvailable),
            SessionError::Link(e) => Some(e.kind()),
            SessionError::Processing(_) | SessionError::NoData => {
                Some(FailureKind::ProcessingFailure)
            }
            SessionError::Persistence(_) => Some(FailureKind::PersistenceFailure),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
