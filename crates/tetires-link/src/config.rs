//! Link layer configuration
//!
//! Every field has a default so an empty `[usb]`/`[bluetooth]`/... table (or
//! none at all) gives the stock HC-05 / USB-serial setup.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for transports, arbitration timing and framing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default)]
    pub usb: UsbConfig,
    #[serde(default)]
    pub bluetooth: BluetoothConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub hotplug: HotplugConfig,
    #[serde(default)]
    pub framing: FramingConfig,
}

/// A link setting outside what the serial layer can express
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("usb.data_bits {0} is not in 5..=8")]
    DataBits(u8),

    #[error("usb.stop_bits {0} must be 1 or 2")]
    StopBits(u8),
}

impl LinkConfig {
    /// Reject settings the serial layer cannot express
    pub fn validate(&self) -> Result<(), LinkConfigError> {
        if self.framing.max_line_len == 0 {
            return Err(LinkConfigError::Zero("framing.max_line_len"));
        }
        if self.framing.event_capacity == 0 {
            return Err(LinkConfigError::Zero("framing.event_capacity"));
        }
        if !(5..=8).contains(&self.usb.data_bits) {
            return Err(LinkConfigError::DataBits(self.usb.data_bits));
        }
        if !matches!(self.usb.stop_bits, 1 | 2) {
            return Err(LinkConfigError::StopBits(self.usb.stop_bits));
        }
        if self.usb.baud_rate == 0 {
            return Err(LinkConfigError::Zero("usb.baud_rate"));
        }
        if self.reconnect.bluetooth_retry_interval_ms == 0 {
            return Err(LinkConfigError::Zero(
                "reconnect.bluetooth_retry_interval_ms",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Serial Parameters
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Fixed line settings handed to a probe when opening a port
#[derive(Debug, Clone, PartialEq)]
pub struct SerialParams {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    /// Upper bound for one blocking read; also the reader's cancellation latency
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

// =============================================================================
// USB Configuration
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsbBackend {
    /// Host serial ports
    #[default]
    Serial,
    /// In-process simulated device
    Mock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbConfig {
    #[serde(default)]
    pub backend: UsbBackend,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Chip families in preference order, matched against port and
    /// product names or the family's vendor ID
    #[serde(default = "default_chip_priority")]
    pub chip_priority: Vec<String>,
}

impl UsbConfig {
    pub fn serial_params(&self) -> SerialParams {
        SerialParams {
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: self.parity,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            backend: UsbBackend::default(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::None,
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            chip_priority: default_chip_priority(),
        }
    }
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_read_timeout_ms() -> u64 {
    100
}

fn default_write_timeout_ms() -> u64 {
    1000
}

fn default_chip_priority() -> Vec<String> {
    ["CH34", "FTDI", "CP210", "PL2303"]
        .into_iter()
        .map(String::from)
        .collect()
}

// =============================================================================
// Bluetooth Configuration
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BluetoothBackend {
    /// BlueZ pairing store plus a bound RFCOMM tty
    #[default]
    Rfcomm,
    /// In-process simulated device
    Mock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BluetoothConfig {
    #[serde(default)]
    pub backend: BluetoothBackend,
    /// Substring of the paired device name
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Exact device address; takes precedence over the name when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Serial Port Profile service
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_rfcomm_device")]
    pub rfcomm_device: String,
    #[serde(default = "default_bluez_storage")]
    pub bluez_storage: PathBuf,
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
    /// Where the kernel publishes the peer address of `rfcomm_device`
    #[serde(default = "default_tty_class_root")]
    pub tty_class_root: PathBuf,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl BluetoothConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// RFCOMM ttys ignore line settings; the values only satisfy the port API
    pub fn serial_params(&self) -> SerialParams {
        SerialParams {
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::None,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            backend: BluetoothBackend::default(),
            device_name: default_device_name(),
            address: None,
            service_uuid: default_service_uuid(),
            rfcomm_device: default_rfcomm_device(),
            bluez_storage: default_bluez_storage(),
            sysfs_root: default_sysfs_root(),
            tty_class_root: default_tty_class_root(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

fn default_device_name() -> String {
    "HC-05".to_string()
}

fn default_service_uuid() -> String {
    "00001101-0000-1000-8000-00805F9B34FB".to_string()
}

fn default_rfcomm_device() -> String {
    "/dev/rfcomm0".to_string()
}

fn default_bluez_storage() -> PathBuf {
    PathBuf::from("/var/lib/bluetooth")
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys/class/bluetooth")
}

fn default_tty_class_root() -> PathBuf {
    PathBuf::from("/sys/class/tty")
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

// =============================================================================
// Timing
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay between Bluetooth reconnect attempts (no attempt limit)
    #[serde(default = "default_retry_interval_ms")]
    pub bluetooth_retry_interval_ms: u64,
}

impl ReconnectConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.bluetooth_retry_interval_ms)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            bluetooth_retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

fn default_retry_interval_ms() -> u64 {
    3000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotplugConfig {
    /// Wait after an attach before arbitrating (driver enumeration)
    #[serde(default = "default_attach_settle_ms")]
    pub attach_settle_ms: u64,
    /// Wait after detaching the active device before arbitrating
    #[serde(default = "default_short_settle_ms")]
    pub detach_settle_ms: u64,
    /// Wait after a USB link failure before falling back to Bluetooth
    #[serde(default = "default_short_settle_ms")]
    pub usb_fallback_settle_ms: u64,
    /// Wait between the disconnect and the arbitration of a manual connect
    #[serde(default = "default_short_settle_ms")]
    pub manual_connect_settle_ms: u64,
    /// USB enumeration polling period for the hot-plug watcher
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl HotplugConfig {
    pub fn attach_settle(&self) -> Duration {
        Duration::from_millis(self.attach_settle_ms)
    }

    pub fn detach_settle(&self) -> Duration {
        Duration::from_millis(self.detach_settle_ms)
    }

    pub fn usb_fallback_settle(&self) -> Duration {
        Duration::from_millis(self.usb_fallback_settle_ms)
    }

    pub fn manual_connect_settle(&self) -> Duration {
        Duration::from_millis(self.manual_connect_settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for HotplugConfig {
    fn default() -> Self {
        Self {
            attach_settle_ms: default_attach_settle_ms(),
            detach_settle_ms: default_short_settle_ms(),
            usb_fallback_settle_ms: default_short_settle_ms(),
            manual_connect_settle_ms: default_short_settle_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_attach_settle_ms() -> u64 {
    1000
}

fn default_short_settle_ms() -> u64 {
    500
}

fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramingConfig {
    /// Bytes tolerated without a delimiter before the buffer is discarded
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,
    /// Events a transport buffers for the manager; older ones are dropped
    /// and reported as a gap once the manager falls this far behind
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_line_len: default_max_line_len(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_max_line_len() -> usize {
    tetires_core::DEFAULT_MAX_LINE_LEN
}

fn default_event_capacity() -> usize {
    4096
}
