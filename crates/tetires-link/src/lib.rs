//! tetires-link - Device links for the tire-wear sensor
//!
//! This crate owns everything between the serial byte stream and the
//! records the acquisition session consumes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  ConnectionManager task                   │
//! │  arbitration (USB > Bluetooth), hot-plug, BT reconnect    │
//! │                                                           │
//! │        ┌──────────────┐        ┌────────────────────┐     │
//! │        │ UsbTransport │   or   │ BluetoothTransport │     │
//! │        └──────┬───────┘        └─────────┬──────────┘     │
//! │               └──────── SerialLink ──────┘                │
//! │                reader task → LineFramer                   │
//! └──────────────────────────┬───────────────────────────────┘
//!                            │ LinkEvent (records, status, notices, gaps)
//!                            ▼
//!                  ConnectionHandle subscribers
//! ```
//!
//! Physical access goes through [`transport::UsbProbe`] and
//! [`transport::BluetoothProbe`]; [`transport::mock`] replaces both in tests.

pub mod config;
pub mod error;
pub mod gauge;
pub mod hotplug;
pub mod manager;
pub mod transport;

pub use config::{LinkConfig, LinkConfigError};
pub use error::LinkError;
pub use hotplug::spawn_usb_watcher;
pub use manager::{ConnectionHandle, ConnectionManager, Diagnostics};
pub use transport::{Probes, Transport, TransportError, TransportEvent};
