//! Transports to the measurement device
//!
//! Both links are serial byte streams underneath:
//! - [`UsbTransport`] opens a USB-serial adapter through a [`UsbProbe`]
//! - [`BluetoothTransport`] opens an RFCOMM serial channel through a
//!   [`BluetoothProbe`]
//! - [`mock`] provides simulated probes and devices for tests and demos
//!
//! A transport owns exactly one reader task while open. Its events
//! (`Connected`, records, `Disconnected`) come out of one broadcast channel
//! in the order they happened; subscribe before calling `connect`.

use std::io::{Read, Write};
use std::sync::Arc;

use async_trait::async_trait;
use tetires_core::{DeviceType, FramerStats, RawRecord};
use tokio::sync::broadcast;

pub mod bluetooth;
pub mod error;
pub mod mock;
mod reader;
mod serial;
pub mod usb;

pub use bluetooth::{BluetoothProbe, BluetoothTransport, PairedDevice, RfcommProbe};
pub use error::TransportError;
pub use usb::{ChipFamily, SerialPortProbe, UsbDeviceInfo, UsbProbe, UsbTransport};

use crate::config::{BluetoothBackend, LinkConfig, UsbBackend};

/// Why a link went down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Explicit disconnect
    Requested,
    /// Closed to make way for another transport
    Superseded,
    /// Host reported the USB device detached
    Detached,
    /// Read failure or end of stream
    Io(String),
    /// The reader task panicked
    ReaderPanicked,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Requested => f.write_str("disconnect requested"),
            DisconnectReason::Superseded => f.write_str("superseded by another transport"),
            DisconnectReason::Detached => f.write_str("device detached"),
            DisconnectReason::Io(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ReaderPanicked => f.write_str("reader task panicked"),
        }
    }
}

/// Event published by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Record(RawRecord),
    /// The framer discarded undelimited data; the stream continues
    Overflow(FramerStats),
    Disconnected(DisconnectReason),
}

/// The two halves of an opened byte stream
pub struct LinkIo {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

/// Capability shared by both device links
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> DeviceType;

    /// Human-readable descriptor, e.g. "USB: FTDI FT232R USB UART"
    fn descriptor(&self) -> String;

    /// Port name or device address of the open link
    fn endpoint(&self) -> Option<String>;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Open the link and start its reader
    ///
    /// Fails with `NotAvailable`, `PermissionDenied` or `IoFailure`.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Stop the reader, release the link and report `reason`
    ///
    /// Once this returns the reader has exited and publishes nothing more.
    /// Closing a link that is not open does nothing.
    async fn close(&mut self, reason: DisconnectReason);

    /// Idempotent explicit disconnect
    async fn disconnect(&mut self) {
        self.close(DisconnectReason::Requested).await
    }

    /// Write `line` followed by `\n`, bounded by the write timeout
    async fn send(&self, line: &str) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}

/// Platform probes a connection manager opens transports through
#[derive(Clone)]
pub struct Probes {
    pub usb: Arc<dyn UsbProbe>,
    pub bluetooth: Arc<dyn BluetoothProbe>,
}

impl Probes {
    /// Host probes, or mocks when a backend is set to `mock`
    ///
    /// Mock backends get a demo device that streams `demo_samples` lines
    /// after `START`.
    pub fn from_config(config: &LinkConfig, demo_samples: usize) -> Self {
        let usb: Arc<dyn UsbProbe> = match config.usb.backend {
            UsbBackend::Serial => Arc::new(SerialPortProbe::new()),
            UsbBackend::Mock => {
                let probe = mock::MockUsbProbe::new();
                probe
                    .add_device(mock::MockUsbProbe::ftdi_info("/dev/ttyMOCK0"))
                    .respond_to_start(demo_samples);
                Arc::new(probe)
            }
        };
        let bluetooth: Arc<dyn BluetoothProbe> = match config.bluetooth.backend {
            BluetoothBackend::Rfcomm => Arc::new(RfcommProbe::from_config(&config.bluetooth)),
            BluetoothBackend::Mock => {
                let probe = mock::MockBluetoothProbe::new();
                probe
                    .add_device(PairedDevice::new("HC-05", "98:D3:31:F5:2A:10"))
                    .respond_to_start(demo_samples);
                Arc::new(probe)
            }
        };
        Self { usb, bluetooth }
    }
}
