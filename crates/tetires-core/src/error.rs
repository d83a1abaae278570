//! Failure taxonomy shared across layers
//!
//! Each layer has its own `thiserror` enum; all of them classify into a
//! [`FailureKind`], which carries the recovery policy.

use serde::{Deserialize, Serialize};

use crate::models::DeviceType;

/// Classification of every failure the acquisition stack can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No device present or paired
    NotAvailable,
    /// Platform authorization withheld
    PermissionDenied,
    /// Open, handshake, read or write error
    IoFailure,
    /// Framer buffer ceiling exceeded without a delimiter
    ProtocolOverflow,
    /// Processing collaborator reported a failure
    ProcessingFailure,
    /// Persistence collaborator reported a failure
    PersistenceFailure,
}

impl FailureKind {
    /// Whether the connection manager retries automatically after this
    /// failure on the given link.
    ///
    /// Only transient I/O failures on Bluetooth are retried; USB needs a
    /// replug and permission problems need the user.
    pub fn auto_retry(self, device: DeviceType) -> bool {
        matches!(
            (self, device),
            (FailureKind::IoFailure, DeviceType::Bluetooth)
        )
    }

    /// Whether this failure ends the current connectivity attempt
    pub fn affects_connectivity(self) -> bool {
        matches!(
            self,
            FailureKind::NotAvailable | FailureKind::PermissionDenied | FailureKind::IoFailure
        )
    }

    /// Whether the failure terminates the operation that raised it
    ///
    /// Overflow is reported but the record stream keeps going.
    pub fn is_terminal_for_operation(self) -> bool {
        !matches!(self, FailureKind::ProtocolOverflow)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::NotAvailable => "not_available",
            FailureKind::PermissionDenied => "permission_denied",
            FailureKind::IoFailure => "io_failure",
            FailureKind::ProtocolOverflow => "protocol_overflow",
            FailureKind::ProcessingFailure => "processing_failure",
            FailureKind::PersistenceFailure => "persistence_failure",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_bluetooth_io_failures_retry() {
        assert!(FailureKind::IoFailure.auto_retry(DeviceType::Bluetooth));
        assert!(!FailureKind::IoFailure.auto_retry(DeviceType::Usb));
        assert!(!FailureKind::PermissionDenied.auto_retry(DeviceType::Bluetooth));
        assert!(!FailureKind::NotAvailable.auto_retry(DeviceType::Bluetooth));
    }

    #[test]
    fn test_overflow_is_not_terminal() {
        assert!(!FailureKind::ProtocolOverflow.is_terminal_for_operation());
        assert!(FailureKind::ProcessingFailure.is_terminal_for_operation());
        assert!(!FailureKind::ProcessingFailure.affects_connectivity());
    }
}
