//! Errors returned through a connection handle

use tetires_core::FailureKind;
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Connection manager is not running")]
    ManagerUnavailable,

    #[error("No active transport")]
    NoActiveTransport,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl LinkError {
    pub fn kind(&self) -> FailureKind {
        match self {
            LinkError::ManagerUnavailable | LinkError::NoActiveTransport => {
                FailureKind::NotAvailable
            }
            LinkError::Transport(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
