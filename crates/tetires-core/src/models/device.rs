//! Connectivity models (device type, connection state, link events)

use serde::{Deserialize, Serialize};

use super::RawRecord;

/// Which transport is authoritative
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    None,
    Usb,
    Bluetooth,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceType::None => "none",
            DeviceType::Usb => "usb",
            DeviceType::Bluetooth => "bluetooth",
        };
        f.write_str(s)
    }
}

/// Observable connectivity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Authoritative connection state published by the connection manager
///
/// `is_connected()` is derived from `state`, so the boolean and the state
/// can never disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub device_type: DeviceType,
    pub state: ConnectionState,
    /// Human-readable device descriptor (e.g. "USB: FTDI FT232R")
    pub descriptor: String,
    /// Last human-readable status line
    pub status: String,
}

impl ConnectionSnapshot {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            device_type: DeviceType::None,
            state: ConnectionState::Disconnected,
            descriptor: "No device connected".to_string(),
            status: "Idle".to_string(),
        }
    }
}

/// Ordered output of the connection manager
///
/// Records and status changes share one stream so a status change is
/// never observed out of order with the records it brackets.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A record from the active transport
    Record(RawRecord),
    /// The connection snapshot changed
    Status(ConnectionSnapshot),
    /// Human-readable notice (arbitration decisions, retries, sends)
    Notice(String),
    /// This many transport events were dropped before reaching the manager
    Gap(u64),
}

/// Host-level USB attach/detach notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    Attached { port: Option<String> },
    Detached { port: Option<String> },
}

impl HotplugEvent {
    pub fn port(&self) -> Option<&str> {
        match self {
            HotplugEvent::Attached { port } | HotplugEvent::Detached { port } => port.as_deref(),
        }
    }
}
