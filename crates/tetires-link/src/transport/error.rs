//! Transport layer errors

use std::io;

use tetires_core::FailureKind;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Device not available: {0}")]
    NotAvailable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O failure: {0}")]
    IoFailure(String),
}

impl TransportError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransportError::NotAvailable(_) => FailureKind::NotAvailable,
            TransportError::PermissionDenied(_) => FailureKind::PermissionDenied,
            TransportError::IoFailure(_) => FailureKind::IoFailure,
        }
    }

    /// Classify an I/O error raised while touching `what`
    pub fn from_io(what: &str, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => {
                TransportError::PermissionDenied(format!("{}: {}", what, err))
            }
            io::ErrorKind::NotFound => TransportError::NotAvailable(format!("{}: {}", what, err)),
            _ => TransportError::IoFailure(format!("{}: {}", what, err)),
        }
    }
}

impl From<serialport::Error> for TransportError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::NoDevice => TransportError::NotAvailable(err.description),
            serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
                TransportError::PermissionDenied(err.description)
            }
            serialport::ErrorKind::Io(io::ErrorKind::NotFound) => {
                TransportError::NotAvailable(err.description)
            }
            _ => TransportError::IoFailure(err.description),
        }
    }
}
